pub mod config;
pub mod error;
pub mod types;

pub use config::{VaultConfig, VeilConfig};
pub use error::{VeilError, VeilResult};
pub use types::{DirEntry, FileAttrs, FileKind, PosixAttrs};
