use nom::{
    IResult, Parser,
    bytes::complete::take,
    character::complete::{char, digit1},
    combinator::{opt, recognize},
    sequence::{pair, preceded, terminated},
};
use std::{collections::HashMap, ops::Range};

use crate::bencode_parser::errors::DecodeError;

type Step<'a, O> = IResult<&'a [u8], O, nom::error::Error<&'a [u8]>>;
type Decoded<'a> = Result<(&'a [u8], Value), DecodeError>;

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<Value>),
    Dictionary(HashMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&HashMap<Vec<u8>, Value>> {
        match self {
            Value::Dictionary(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up `key` when `self` is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dictionary().and_then(|entries| entries.get(key))
    }
}

/// A decoded value together with the byte range of the located key's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub span: Range<usize>,
    pub value: Value,
}

/// Single-pass decoder. The cursor is the remaining input slice; offsets are
/// recovered from its length relative to `source`.
struct Decoder<'a> {
    source: &'a [u8],
    locate: Option<&'a [u8]>,
    claimed: bool,
    span: Option<Range<usize>>,
}

impl<'a> Decoder<'a> {
    fn new(source: &'a [u8], locate: Option<&'a [u8]>) -> Self {
        Self {
            source,
            locate,
            claimed: false,
            span: None,
        }
    }

    fn offset(&self, rest: &[u8]) -> usize {
        self.source.len() - rest.len()
    }

    fn run(&mut self) -> Result<Value, DecodeError> {
        let (rest, value) = self.value(self.source, 0)?;
        if !rest.is_empty() {
            return Err(DecodeError::TrailingData {
                offset: self.offset(rest),
            });
        }
        Ok(value)
    }

    fn value(&mut self, input: &'a [u8], depth: usize) -> Decoded<'a> {
        let at = self.offset(input);
        if depth > MAX_DEPTH {
            return Err(DecodeError::NestingTooDeep {
                limit: MAX_DEPTH,
                offset: at,
            });
        }

        match input.first() {
            None => Err(DecodeError::UnexpectedEof { offset: at }),
            Some(b'0'..=b'9') => {
                let (rest, bytes) = self.byte_string(input)?;
                Ok((rest, Value::Bytes(bytes.to_vec())))
            }
            Some(b'i') => self.integer(input),
            Some(b'l') => self.list(input, depth),
            Some(b'd') => self.dictionary(input, depth),
            Some(&tag) => Err(DecodeError::UnknownTag { tag, offset: at }),
        }
    }

    fn integer(&self, input: &'a [u8]) -> Decoded<'a> {
        let at = self.offset(input);

        let digits: Step<'a, &'a [u8]> =
            preceded(char('i'), recognize(pair(opt(char('-')), digit1))).parse(input);
        let (rest, digits) = digits.map_err(|_| DecodeError::MalformedInteger { offset: at })?;

        let closing: Step<'a, char> = char('e').parse(rest);
        let (rest, _) = closing.map_err(|_| DecodeError::MissingTerminator { offset: at })?;

        // `digit1` only admits ASCII digits, so the slice is valid UTF-8.
        let text = std::str::from_utf8(digits)
            .map_err(|_| DecodeError::MalformedInteger { offset: at })?;
        if text.starts_with("-0") || (text.starts_with('0') && text.len() > 1) {
            return Err(DecodeError::MalformedInteger { offset: at });
        }

        let value: i64 = text
            .parse()
            .map_err(|_| DecodeError::MalformedInteger { offset: at })?;
        Ok((rest, Value::Integer(value)))
    }

    fn byte_string(&self, input: &'a [u8]) -> Result<(&'a [u8], &'a [u8]), DecodeError> {
        let at = self.offset(input);

        let header: Step<'a, &'a [u8]> = terminated(digit1, char(':')).parse(input);
        let (rest, digits) = header.map_err(|_| DecodeError::MalformedLength { offset: at })?;

        let declared: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or(DecodeError::MalformedLength { offset: at })?;

        let overrun = DecodeError::LengthOverrun {
            offset: at,
            declared,
            remaining: rest.len(),
        };
        if declared > rest.len() {
            return Err(overrun);
        }

        let body: Step<'a, &'a [u8]> = take(declared).parse(rest);
        body.map_err(|_| overrun)
    }

    fn list(&mut self, input: &'a [u8], depth: usize) -> Decoded<'a> {
        let at = self.offset(input);
        let mut rest = &input[1..];
        let mut items = Vec::new();

        loop {
            match rest.first() {
                None => return Err(DecodeError::MissingTerminator { offset: at }),
                Some(b'e') => return Ok((&rest[1..], Value::List(items))),
                Some(_) => {
                    let (next, item) = self.value(rest, depth + 1)?;
                    items.push(item);
                    rest = next;
                }
            }
        }
    }

    fn dictionary(&mut self, input: &'a [u8], depth: usize) -> Decoded<'a> {
        let at = self.offset(input);
        let mut rest = &input[1..];
        let mut entries = HashMap::new();

        loop {
            match rest.first() {
                None => return Err(DecodeError::MissingTerminator { offset: at }),
                Some(b'e') => return Ok((&rest[1..], Value::Dictionary(entries))),
                Some(b'0'..=b'9') => {
                    let key_at = self.offset(rest);
                    let (after_key, key) = self.byte_string(rest)?;

                    // Claim before descending so an outer occurrence wins
                    // over one nested inside its own value.
                    let tracked = !self.claimed && self.locate == Some(key);
                    if tracked {
                        self.claimed = true;
                    }

                    let start = self.offset(after_key);
                    let (next, value) = self.value(after_key, depth + 1)?;
                    if tracked {
                        self.span = Some(start..self.offset(next));
                    }

                    if entries.insert(key.to_vec(), value).is_some() {
                        return Err(DecodeError::DuplicateKey { offset: key_at });
                    }
                    rest = next;
                }
                Some(_) => {
                    return Err(DecodeError::NonStringKey {
                        offset: self.offset(rest),
                    });
                }
            }
        }
    }
}

/// Decodes exactly one bencoded value spanning the whole of `source`.
///
/// # Errors
/// Returns a [`DecodeError`] describing the first malformed byte.
pub fn decode(source: &[u8]) -> Result<Value, DecodeError> {
    Decoder::new(source, None).run()
}

/// Decodes `source` and reports where the value of the first occurrence of
/// `key` starts and ends. Slicing `source` with the span and decoding again
/// yields that value.
///
/// # Errors
/// Any [`decode`] error, or [`DecodeError::KeyNotFound`] if `key` never appears
/// as a dictionary key.
pub fn decode_with_span(source: &[u8], key: &[u8]) -> Result<Located, DecodeError> {
    let mut decoder = Decoder::new(source, Some(key));
    let value = decoder.run()?;
    let span = decoder
        .span
        .ok_or_else(|| DecodeError::KeyNotFound(String::from_utf8_lossy(key).into_owned()))?;
    Ok(Located { span, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i-17e").unwrap(), Value::Integer(-17));
        assert_eq!(decode(b"i0e").unwrap(), Value::Integer(0));
        assert_eq!(decode(b"4:spam").unwrap(), bytes("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(vec![]));
    }

    #[test]
    fn test_decode_nested() {
        let value = decode(b"d3:cow3:moo4:spaml1:ai7eee").unwrap();
        assert_eq!(value.get(b"cow"), Some(&bytes("moo")));
        assert_eq!(
            value.get(b"spam"),
            Some(&Value::List(vec![bytes("a"), Value::Integer(7)]))
        );
    }

    #[test]
    fn test_unsorted_keys_are_accepted() {
        let value = decode(b"d4:spami1e3:cowi2ee").unwrap();
        assert_eq!(value.get(b"cow"), Some(&Value::Integer(2)));
        assert_eq!(value.get(b"spam"), Some(&Value::Integer(1)));
    }

    #[test]
    fn test_binary_string_content() {
        let value = decode(b"3:\x00\xff:").unwrap();
        assert_eq!(value, Value::Bytes(vec![0x00, 0xff, b':']));
    }

    #[test]
    fn test_decode_errors() {
        assert_matches!(
            decode(b"x"),
            Err(DecodeError::UnknownTag { tag: b'x', offset: 0 })
        );
        assert_matches!(
            decode(b"10:abc"),
            Err(DecodeError::LengthOverrun {
                declared: 10,
                remaining: 3,
                ..
            })
        );
        assert_matches!(decode(b"li1e"), Err(DecodeError::MissingTerminator { offset: 0 }));
        assert_matches!(decode(b"d1:ai1e"), Err(DecodeError::MissingTerminator { .. }));
        assert_matches!(decode(b"i12"), Err(DecodeError::MissingTerminator { .. }));
        assert_matches!(decode(b"ie"), Err(DecodeError::MalformedInteger { .. }));
        assert_matches!(decode(b"i"), Err(DecodeError::MalformedInteger { .. }));
        assert_matches!(decode(b"i03e"), Err(DecodeError::MalformedInteger { .. }));
        assert_matches!(decode(b"i-0e"), Err(DecodeError::MalformedInteger { .. }));
        assert_matches!(decode(b"4spam"), Err(DecodeError::MalformedLength { .. }));
        assert_matches!(decode(b""), Err(DecodeError::UnexpectedEof { offset: 0 }));
    }

    #[test]
    fn test_dictionary_key_rules() {
        assert_matches!(
            decode(b"di1ei2ee"),
            Err(DecodeError::NonStringKey { offset: 1 })
        );
        assert_matches!(
            decode(b"d1:ai1e1:ai2ee"),
            Err(DecodeError::DuplicateKey { offset: 7 })
        );
    }

    #[test]
    fn test_trailing_data_rejected() {
        assert_matches!(
            decode(b"i1ei2e"),
            Err(DecodeError::TrailingData { offset: 3 })
        );
    }

    #[test]
    fn test_nesting_limit() {
        let mut deep = vec![b'l'; MAX_DEPTH + 2];
        deep.extend(vec![b'e'; MAX_DEPTH + 2]);
        assert_matches!(decode(&deep), Err(DecodeError::NestingTooDeep { .. }));
    }

    #[test]
    fn test_span_slices_back_to_value() {
        let data = b"d8:announce3:url4:infod4:name1:x6:lengthi10eee";
        let located = decode_with_span(data, b"info").unwrap();

        let slice = &data[located.span.clone()];
        assert_eq!(slice, b"d4:name1:x6:lengthi10ee");
        let info = decode(slice).unwrap();
        assert_eq!(Some(&info), located.value.get(b"info"));
    }

    #[test]
    fn test_span_of_byte_string_value() {
        let data = b"d1:ai1e3:key5:hello1:zli1eee";
        let located = decode_with_span(data, b"key").unwrap();
        assert_eq!(&data[located.span.clone()], b"5:hello");
        assert_eq!(decode(&data[located.span]).unwrap(), bytes("hello"));
    }

    #[test]
    fn test_span_takes_first_occurrence() {
        // The outer `info` is read first, even though an inner one completes
        // earlier.
        let data = b"d4:infod4:infoi1eee";
        let located = decode_with_span(data, b"info").unwrap();
        assert_eq!(&data[located.span], b"d4:infoi1ee");
    }

    #[test]
    fn test_span_missing_key() {
        assert_matches!(
            decode_with_span(b"d1:ai1ee", b"info"),
            Err(DecodeError::KeyNotFound(key)) if key == "info"
        );
    }

    #[test]
    fn test_redecode_is_idempotent() {
        let data = b"d4:listl1:a1:bi3ee4:dictd1:k1:vee";
        assert_eq!(decode(data).unwrap(), decode(data).unwrap());
    }
}
