//! veil-fs: the encrypting overlay file stack.
//!
//! Plaintext file and directory operations are translated into encrypted
//! operations on an underlying storage directory. Content is encrypted per
//! fixed-size block, names per path component:
//!
//! ```text
//! read(plain_path, off, len)
//!   └─ DirNode: plain path → ciphertext path (per-component AES-SIV)
//!        └─ FileNode (one mutex per open file)
//!             └─ MacFileIo   [mac ‖ rand ‖ data] per block, verify on read
//!                  └─ CipherFileIo   8-byte fileIV header, block ^ fileIV tweak
//!                       └─ RawFile   positional I/O on the host adapter
//! ```
//!
//! The MAC layer is optional; the rest of the stack is always present.
//! Everything above `RawFile` is host-agnostic: the bottom speaks through
//! the [`hostfs::HostFs`] adapter contract, with [`localfs::LocalFs`] as
//! the local-disk implementation.

mod blockio;
pub mod cipherio;
pub mod context;
pub mod dirnode;
pub mod fileio;
pub mod filenode;
pub mod hostfs;
pub mod localfs;
pub mod macio;
pub mod vault;

#[cfg(test)]
pub(crate) mod memfile;

pub use context::Context;
pub use dirnode::{DirNode, DirTraverse};
pub use filenode::FileNode;
pub use hostfs::{DirIter, HostFile, HostFs};
pub use localfs::LocalFs;
pub use vault::Vault;
