use std::{
    ops::Range,
    path::{Path, PathBuf},
};

use crate::torrent::{FileLayout, Manifest};

/// A destination file placed in the concatenated content stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFile {
    pub path: PathBuf,
    pub length: u64,
    /// Absolute offset of the file's first byte in the content stream.
    pub start: u64,
}

impl TargetFile {
    pub fn byte_range(&self) -> Range<u64> {
        self.start..self.start + self.length
    }
}

/// Part of a write that lands in one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    /// Slice of the source buffer that belongs in this file.
    pub data_range: Range<usize>,
}

/// Files laid out back to back in manifest order.
#[derive(Debug, Clone)]
pub struct Layout {
    files: Vec<TargetFile>,
}

impl Layout {
    pub fn resolve(manifest: &Manifest, download_dir: &Path) -> Self {
        let files = match manifest.layout() {
            FileLayout::Single { length } => vec![TargetFile {
                path: download_dir.join(manifest.name()),
                length: *length,
                start: 0,
            }],
            FileLayout::Multi { files } => {
                let root = download_dir.join(manifest.name());
                let mut start = 0;
                files
                    .iter()
                    .map(|entry| {
                        let target = TargetFile {
                            path: root.join(&entry.path),
                            length: entry.length,
                            start,
                        };
                        start += entry.length;
                        target
                    })
                    .collect()
            }
        };
        Layout { files }
    }

    pub fn files(&self) -> &[TargetFile] {
        &self.files
    }

    /// Splits the absolute range `[start, start + len)` into per-file writes:
    /// the overlap of the range with each file's range, in file order.
    pub fn spans(&self, start: u64, len: usize) -> Vec<FileSpan> {
        let end = start + len as u64;
        let mut spans = Vec::new();

        for (file_index, file) in self.files.iter().enumerate() {
            let range = file.byte_range();
            if range.start >= end {
                break;
            }
            let lo = start.max(range.start);
            let hi = end.min(range.end);
            if lo < hi {
                spans.push(FileSpan {
                    file_index,
                    file_offset: lo - range.start,
                    data_range: (lo - start) as usize..(hi - start) as usize,
                });
            }
        }
        spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::fixtures::manifest;

    fn two_file_layout() -> Layout {
        let m = manifest("set", &[0u8; 8], 4, &[("a", 5), ("b", 3)]);
        Layout::resolve(&m, Path::new("/downloads"))
    }

    #[test]
    fn test_resolve_multi_file_paths() {
        let layout = two_file_layout();
        assert_eq!(layout.files()[0].path, PathBuf::from("/downloads/set/a"));
        assert_eq!(layout.files()[1].path, PathBuf::from("/downloads/set/b"));
        assert_eq!(layout.files()[1].start, 5);
    }

    #[test]
    fn test_resolve_single_file_path() {
        let m = manifest("one.iso", &[0u8; 10], 10, &[]);
        let layout = Layout::resolve(&m, Path::new("/downloads"));
        assert_eq!(
            layout.files(),
            &[TargetFile {
                path: PathBuf::from("/downloads/one.iso"),
                length: 10,
                start: 0
            }]
        );
    }

    #[test]
    fn test_range_straddling_two_files() {
        let spans = two_file_layout().spans(3, 5);
        assert_eq!(
            spans,
            vec![
                FileSpan {
                    file_index: 0,
                    file_offset: 3,
                    data_range: 0..2
                },
                FileSpan {
                    file_index: 1,
                    file_offset: 0,
                    data_range: 2..5
                },
            ]
        );
    }

    #[test]
    fn test_range_inside_one_file() {
        let spans = two_file_layout().spans(5, 2);
        assert_eq!(
            spans,
            vec![FileSpan {
                file_index: 1,
                file_offset: 0,
                data_range: 0..2
            }]
        );
    }

    #[test]
    fn test_zero_length_files_are_skipped() {
        let m = manifest("set", &[0u8; 6], 6, &[("a", 2), ("empty", 0), ("b", 4)]);
        let layout = Layout::resolve(&m, Path::new("d"));
        let spans = layout.spans(0, 6);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].file_index, 2);
        assert_eq!(spans[1].data_range, 2..6);
    }
}
