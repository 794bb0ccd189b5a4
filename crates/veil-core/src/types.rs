use serde::{Deserialize, Serialize};

/// Kind of a host-FS object, as far as the vault cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Unknown,
}

/// File attributes as reported through the stack.
///
/// `size` is transformed by each encrypting layer (header subtraction,
/// MAC-block remapping) so that the value a caller sees is the plaintext
/// length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttrs {
    pub kind: FileKind,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    pub file_id: u64,
    pub posix: Option<PosixAttrs>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosixAttrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl FileAttrs {
    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}

/// One directory entry from the host adapter (`.` and `..` excluded).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub file_id: u64,
    /// `None` when the adapter cannot tell without an extra stat.
    pub kind: Option<FileKind>,
}
