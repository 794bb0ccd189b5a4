//! Single-process registry of open plaintext paths.
//!
//! The map holds weak references only: a `FileNode` is strong-owned by
//! whoever opened it, and its `Drop` removes the entry. The root anchor is
//! the one strong edge of the `Context`↔`DirNode` cycle; teardown breaks
//! it with [`Context::take_root`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use crate::dirnode::DirNode;
use crate::filenode::FileNode;

#[derive(Default)]
pub struct Context {
    open_files: Mutex<HashMap<PathBuf, Weak<FileNode>>>,
    root: Mutex<Option<Arc<DirNode>>>,
}

impl Context {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_root(&self, root: Arc<DirNode>) {
        *self.root.lock().unwrap() = Some(root);
    }

    pub fn root(&self) -> Option<Arc<DirNode>> {
        self.root.lock().unwrap().clone()
    }

    /// Drop the strong root edge; called at unmount to let the graph
    /// unwind.
    pub fn take_root(&self) -> Option<Arc<DirNode>> {
        self.root.lock().unwrap().take()
    }

    pub fn is_mounted(&self) -> bool {
        self.root.lock().unwrap().is_some()
    }

    pub fn open_file_count(&self) -> usize {
        self.open_files.lock().unwrap().len()
    }

    /// Resolve a plaintext path to its live node, if any.
    pub fn lookup_node(&self, path: &Path) -> Option<Arc<FileNode>> {
        self.open_files
            .lock()
            .unwrap()
            .get(path)
            .and_then(Weak::upgrade)
    }

    /// Register a fresh node. Any prior entry must be dead (its owner may
    /// not have finished dropping yet).
    pub fn track_node(&self, path: &Path, node: &Arc<FileNode>) {
        let prior = self
            .open_files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), Arc::downgrade(node));
        debug_assert!(
            prior.map_or(true, |w| w.upgrade().is_none()),
            "tracking over a live node"
        );
    }

    /// Move an entry to a new key; the node is keyed by plaintext name, so
    /// a rename means the key must change.
    pub fn rename_node(&self, from: &Path, to: &Path) {
        let mut map = self.open_files.lock().unwrap();
        debug_assert!(!map.contains_key(to), "rename target key in use");
        if let Some(entry) = map.remove(from) {
            map.insert(to.to_path_buf(), entry);
        } else {
            debug_assert!(false, "rename source key missing");
        }
    }

    /// Called from `FileNode::drop`.
    pub(crate) fn erase_node(&self, path: &Path) {
        self.open_files.lock().unwrap().remove(path);
    }
}
