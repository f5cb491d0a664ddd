pub mod bencode_parser;
pub mod bitfield;
pub mod config;
pub mod peer;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;

// Re-export commonly used types and functions for easier access
pub use bencode_parser::{Value, decode, encode};
pub use config::ClientConfig;
pub use session::{Session, SessionError, SessionState, SessionStatus};
pub use torrent::{Manifest, ManifestError};
pub use tracker::{Discovery, TrackerDiscovery};
