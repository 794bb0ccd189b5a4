//! Plaintext ⇄ ciphertext path mapping and everything that has to stay
//! coherent across it: the open-node registry, recursive rename under
//! chained name IVs, and attribute correction.
//!
//! One mutex serializes all mutating and inspection methods; no operation
//! holds it across more than a single host call at a time, except rename,
//! which must appear atomic to other operations on this node.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};
use veil_core::{DirEntry, FileAttrs, VeilError, VeilResult};
use veil_crypto::NameCoder;

use crate::cipherio::CipherFileIo;
use crate::context::Context;
use crate::filenode::FileNode;
use crate::macio::MacFileIo;
use crate::vault::FsRuntime;

pub struct DirNode {
    lock: Mutex<()>,
    ctx: Arc<Context>,
    runtime: FsRuntime,
    /// Ciphertext root on the host file system.
    root_dir: PathBuf,
}

/// Lazy directory listing: ciphertext entries are decoded on the fly,
/// seeded with the IV of the parent path. Entries that fail to decode are
/// skipped (see [`DirNode::invalid_entries`] for the diagnostic view).
pub struct DirTraverse {
    iter: Box<dyn crate::hostfs::DirIter>,
    iv: u64,
    naming: Arc<dyn NameCoder>,
}

impl Iterator for DirTraverse {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        loop {
            let entry = match self.iter.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("readdir failed: {err}");
                    return None;
                }
            };
            let mut local_iv = self.iv;
            match self.naming.decode_name(&entry.name, &mut local_iv) {
                Ok(name) => {
                    return Some(DirEntry {
                        name,
                        file_id: entry.file_id,
                        kind: entry.kind,
                    })
                }
                Err(err) => {
                    debug!(name = %entry.name, "skipping undecodable entry: {err}");
                }
            }
        }
    }
}

/// One step of a recursive rename, in ciphertext and plaintext terms.
/// `new_cname` is an intermediate name: the re-encoded child still under
/// its old parent, which the top-level rename then carries over.
struct RenameEl {
    old_cname: PathBuf,
    new_cname: PathBuf,
    old_pname: PathBuf,
    new_pname: PathBuf,
}

/// A generated rename list plus the high-water mark of applied entries,
/// so a failed apply can be unwound back to front.
struct RenameOp {
    list: Vec<RenameEl>,
    applied: usize,
}

impl DirNode {
    pub(crate) fn new(ctx: Arc<Context>, runtime: FsRuntime, root_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(()),
            ctx,
            runtime,
            root_dir,
        })
    }

    pub fn root_directory(&self) -> &Path {
        &self.root_dir
    }

    /// Whether renaming a directory invalidates descendant names.
    pub fn has_directory_name_dependency(&self) -> bool {
        self.runtime.naming.chained_iv()
    }

    /// Split a plaintext path (absolute in the mounted namespace) into
    /// components. `..` never crosses the vault boundary.
    fn split_components(plain: &Path) -> VeilResult<Vec<String>> {
        if !plain.is_absolute() {
            return Err(VeilError::InvalidArgument(format!(
                "plaintext path must be absolute: {}",
                plain.display()
            )));
        }
        let mut out = Vec::new();
        for comp in plain.components() {
            match comp {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| {
                        VeilError::InvalidArgument("path is not valid UTF-8".into())
                    })?;
                    out.push(name.to_string());
                }
                _ => {
                    return Err(VeilError::InvalidArgument(format!(
                        "path escapes the vault root: {}",
                        plain.display()
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Encode a plaintext path against the ciphertext root, folding the
    /// name IV through `iv`.
    fn cipher_path(&self, plain: &Path, iv: &mut u64) -> VeilResult<PathBuf> {
        let components = Self::split_components(plain)?;
        let encoded = self
            .runtime
            .naming
            .encode_path(&components, iv)
            .map_err(|e| VeilError::NameCoding(e.to_string()))?;

        let mut out = self.root_dir.clone();
        for name in encoded {
            out.push(name);
        }
        Ok(out)
    }

    pub fn api_to_internal(&self, plain: &Path) -> VeilResult<PathBuf> {
        let mut iv = 0;
        self.cipher_path(plain, &mut iv)
    }

    // ── symlink target coding ────────────────────────────────────────────

    /// Encode a symlink target. Targets are paths in the plaintext
    /// namespace; an absolute one is marked with a `+` prefix so decoding
    /// can restore it.
    fn encode_link(&self, target: &str) -> VeilResult<String> {
        let absolute = target.starts_with('/');
        let components: Vec<String> = target
            .split('/')
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        let mut iv = 0;
        let encoded = self
            .runtime
            .naming
            .encode_path(&components, &mut iv)
            .map_err(|e| VeilError::NameCoding(e.to_string()))?;

        let joined = encoded.join("/");
        Ok(if absolute { format!("+{joined}") } else { joined })
    }

    /// Inverse of [`Self::encode_link`]; accepts both the relative and the
    /// `+`-prefixed absolute form.
    fn decode_link(&self, encoded: &str) -> VeilResult<String> {
        let (absolute, body) = match encoded.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, encoded),
        };
        let components: Vec<String> = body
            .split('/')
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        let mut iv = 0;
        let decoded = self
            .runtime
            .naming
            .decode_path(&components, &mut iv)
            .map_err(|e| VeilError::NameCoding(e.to_string()))?;

        let joined = decoded.join("/");
        Ok(if absolute { format!("/{joined}") } else { joined })
    }

    // ── directory listing ────────────────────────────────────────────────

    pub fn open_dir(&self, plain: &Path) -> VeilResult<DirTraverse> {
        let mut iv = 0;
        let cname = self.cipher_path(plain, &mut iv)?;
        let iter = self.runtime.host.open_dir(&cname)?;
        Ok(DirTraverse {
            iter,
            iv,
            naming: self.runtime.naming.clone(),
        })
    }

    /// Ciphertext names under `plain` that do not decode: foreign files,
    /// corruption, or entries written under a different key. Diagnostic
    /// tooling only; the normal listing silently skips these.
    pub fn invalid_entries(&self, plain: &Path) -> VeilResult<Vec<String>> {
        let mut iv = 0;
        let cname = self.cipher_path(plain, &mut iv)?;
        let iter = self.runtime.host.open_dir(&cname)?;

        let mut invalid = Vec::new();
        for entry in iter {
            let entry = entry?;
            let mut local_iv = iv;
            if self
                .runtime
                .naming
                .decode_name(&entry.name, &mut local_iv)
                .is_err()
            {
                invalid.push(entry.name);
            }
        }
        Ok(invalid)
    }

    // ── attributes ───────────────────────────────────────────────────────

    /// Pipe host attributes through the size transforms of the configured
    /// stack.
    fn correct_attrs(&self, attrs: FileAttrs) -> FileAttrs {
        let attrs = CipherFileIo::wrap_attrs_config(&self.runtime.config, attrs);
        if self.runtime.config.mac_enabled() {
            MacFileIo::wrap_attrs_config(&self.runtime.config, attrs)
        } else {
            attrs
        }
    }

    pub fn get_attrs(&self, plain: &Path) -> VeilResult<FileAttrs> {
        let _guard = self.lock.lock().unwrap();

        let cname = self.api_to_internal(plain)?;
        let mut attrs = self.correct_attrs(self.runtime.host.get_attrs(&cname)?);

        if attrs.is_symlink() {
            // a symlink's size is the length of its (decrypted) target
            let target = self.runtime.host.readlink(&cname)?;
            attrs.size = self.decode_link(&target)?.len() as u64;
        }
        Ok(attrs)
    }

    // ── node registry ────────────────────────────────────────────────────

    fn find_or_create(&self, plain: &Path) -> VeilResult<Arc<FileNode>> {
        if let Some(node) = self.ctx.lookup_node(plain) {
            return Ok(node);
        }

        let mut iv = 0;
        let cname = self.cipher_path(plain, &mut iv)?;
        let node = Arc::new(FileNode::new(
            self.ctx.clone(),
            self.runtime.clone(),
            plain.to_path_buf(),
            cname,
        ));
        // pre-set the IV; with externalIV off this never touches disk
        node.set_name(None, None, iv, true)?;
        self.ctx.track_node(plain, &node);
        debug!(cname = %node.cipher_name().display(), "created file node");
        Ok(node)
    }

    pub fn lookup_node(&self, plain: &Path) -> VeilResult<Arc<FileNode>> {
        let _guard = self.lock.lock().unwrap();
        self.find_or_create(plain)
    }

    /// Look up and open in one step, so no one can observe a node between
    /// creation and open.
    pub fn open_node(
        &self,
        plain: &Path,
        request_write: bool,
        create: bool,
    ) -> VeilResult<Arc<FileNode>> {
        let _guard = self.lock.lock().unwrap();
        let node = self.find_or_create(plain)?;
        node.open(request_write, create)?;
        Ok(node)
    }

    // ── creation / removal ───────────────────────────────────────────────

    pub fn mkdir(&self, plain: &Path) -> VeilResult<()> {
        let _guard = self.lock.lock().unwrap();
        let cname = self.api_to_internal(plain)?;
        debug!(cname = %cname.display(), "mkdir");
        self.runtime.host.mkdir(&cname)
    }

    pub fn rmdir(&self, plain: &Path) -> VeilResult<()> {
        let _guard = self.lock.lock().unwrap();
        let cname = self.api_to_internal(plain)?;
        self.runtime.host.rmdir(&cname)
    }

    pub fn unlink(&self, plain: &Path) -> VeilResult<()> {
        let _guard = self.lock.lock().unwrap();
        let cname = self.api_to_internal(plain)?;
        debug!(cname = %cname.display(), "unlink");

        if self.ctx.lookup_node(plain).is_some() {
            // the host does not hide open files for us
            warn!(cname = %cname.display(), "refusing to unlink open file");
            return Err(VeilError::Busy("file is open".into()));
        }
        self.runtime.host.unlink(&cname)
    }

    pub fn set_times(&self, plain: &Path, atime: Option<i64>, mtime: Option<i64>) -> VeilResult<()> {
        let _guard = self.lock.lock().unwrap();
        let cname = self.api_to_internal(plain)?;
        self.runtime.host.set_times(&cname, atime, mtime)
    }

    pub fn symlink(&self, plain_link: &Path, target: &str) -> VeilResult<()> {
        let _guard = self.lock.lock().unwrap();
        let link_c = self.api_to_internal(plain_link)?;
        let target_c = self.encode_link(target)?;
        debug!(link = %link_c.display(), "symlink");
        self.runtime.host.symlink(&target_c, &link_c)
    }

    pub fn readlink(&self, plain: &Path) -> VeilResult<String> {
        let _guard = self.lock.lock().unwrap();
        let cname = self.api_to_internal(plain)?;
        let target = self.runtime.host.readlink(&cname)?;
        self.decode_link(&target)
    }

    pub fn link(&self, from: &Path, to: &Path) -> VeilResult<()> {
        let _guard = self.lock.lock().unwrap();
        if self.runtime.config.external_iv {
            // one inode cannot carry two distinct per-path IVs
            debug!("hard links not supported with external IV chaining");
            return Err(VeilError::NotPermitted(
                "hard links not supported with external IV chaining".into(),
            ));
        }
        let from_c = self.api_to_internal(from)?;
        let to_c = self.api_to_internal(to)?;
        self.runtime.host.link(&from_c, &to_c)
    }

    pub fn mknod(&self, plain: &Path, mode: u32, dev: u64) -> VeilResult<()> {
        let _guard = self.lock.lock().unwrap();
        let cname = self.api_to_internal(plain)?;
        self.runtime.host.mknod(&cname, mode, dev)
    }

    pub fn chmod(&self, plain: &Path, mode: u32) -> VeilResult<()> {
        let _guard = self.lock.lock().unwrap();
        let cname = self.api_to_internal(plain)?;
        self.runtime.host.chmod(&cname, mode)
    }

    // ── rename ───────────────────────────────────────────────────────────

    /// Rekey the open node for `from` (creating a transient one if none is
    /// open) to its new names and IV. Refuses to rename over an open
    /// destination.
    fn rename_node(&self, from: &Path, to: &Path, forward: bool) -> VeilResult<()> {
        if self.ctx.lookup_node(to).is_some() {
            warn!("refusing to rename over open file");
            return Err(VeilError::Busy("rename target is open".into()));
        }

        let node = self.find_or_create(from)?;
        let mut iv = 0;
        let cname = self.cipher_path(to, &mut iv)?;
        debug!(
            old = %node.cipher_name().display(),
            new = %cname.display(),
            "renaming internal node"
        );
        node.set_name(Some(to), Some(&cname), iv, forward)
    }

    /// Walk `from_p` recursively, recording the re-encoding of every
    /// descendant under the destination IV chain. Directories are pushed
    /// after their contents so apply can run front to back.
    ///
    /// A child that cannot be decoded aborts the whole rename: refusing is
    /// safer than orphaning it under an unreachable name.
    fn gen_rename_list(
        &self,
        list: &mut Vec<RenameEl>,
        from_p: &Path,
        to_p: &Path,
    ) -> VeilResult<()> {
        let mut from_iv = 0;
        let mut to_iv = 0;
        let source_c = self.cipher_path(from_p, &mut from_iv)?;
        self.cipher_path(to_p, &mut to_iv)?;

        if from_iv == to_iv {
            return Ok(());
        }

        debug!(dir = %source_c.display(), "scanning for recursive rename");
        let iter = self.runtime.host.open_dir(&source_c)?;

        for entry in iter {
            let entry = entry?;

            let mut local_iv = from_iv;
            let plain_name = self
                .runtime
                .naming
                .decode_name(&entry.name, &mut local_iv)
                .map_err(|err| {
                    warn!(
                        name = %entry.name,
                        dir = %source_c.display(),
                        "aborting rename, undecodable child: {err}"
                    );
                    VeilError::NameCoding(err.to_string())
                })?;

            let mut enc_iv = to_iv;
            let new_name = self
                .runtime
                .naming
                .encode_name(&plain_name, &mut enc_iv)
                .map_err(|e| VeilError::NameCoding(e.to_string()))?;

            let el = RenameEl {
                old_cname: source_c.join(&entry.name),
                new_cname: source_c.join(&new_name),
                old_pname: from_p.join(&plain_name),
                new_pname: to_p.join(&plain_name),
            };

            let is_directory = match entry.kind {
                Some(kind) => kind == veil_core::FileKind::Directory,
                None => self.runtime.host.get_attrs(&el.old_cname)?.is_dir(),
            };
            if is_directory {
                self.gen_rename_list(list, &el.old_pname, &el.new_pname)?;
            }

            debug!(file = %el.old_cname.display(), "adding to rename list");
            list.push(el);
        }

        Ok(())
    }

    /// Run the rename list front to back, tracking how far we got. Each
    /// step preserves the child's mtime best-effort.
    fn apply_rename(&self, op: &mut RenameOp) -> VeilResult<()> {
        while op.applied < op.list.len() {
            let el = &op.list[op.applied];
            debug!(
                from = %el.old_cname.display(),
                to = %el.new_cname.display(),
                "renaming"
            );

            let old_mtime = self
                .runtime
                .host
                .get_attrs(&el.old_cname)
                .ok()
                .map(|a| a.mtime);

            self.rename_node(&el.old_pname, &el.new_pname, true)?;

            if let Err(err) = self.runtime.host.rename(&el.old_cname, &el.new_cname) {
                warn!(name = %el.old_cname.display(), "rename failed: {err}");
                // put the internal rename back
                if let Err(undo_err) = self.rename_node(&el.new_pname, &el.old_pname, false) {
                    warn!("internal rename undo failed: {undo_err}");
                }
                return Err(err);
            }

            if let Some(mtime) = old_mtime {
                let _ = self.runtime.host.set_times(&el.new_cname, None, Some(mtime));
            }
            op.applied += 1;
        }
        Ok(())
    }

    /// Unwind an applied prefix back to front (directory contents before
    /// the directory itself would be the wrong order). Host errors are
    /// logged and skipped: undo is best-effort.
    fn undo_rename(&self, op: &RenameOp) {
        if op.applied == 0 {
            return;
        }
        debug!(count = op.applied, "undoing rename");

        let mut error_count = 0;
        for el in op.list[..op.applied].iter().rev() {
            debug!(
                from = %el.new_cname.display(),
                to = %el.old_cname.display(),
                "undo rename"
            );
            if let Err(err) = self.runtime.host.rename(&el.new_cname, &el.old_cname) {
                warn!("error in rename undo: {err}");
            }
            if let Err(err) = self.rename_node(&el.new_pname, &el.old_pname, false) {
                error_count += 1;
                if error_count == 1 {
                    warn!("error in rename undo: {err}");
                }
            }
        }
        warn!(count = op.applied, "rename undo finished");
    }

    pub fn rename(&self, from: &Path, to: &Path) -> VeilResult<()> {
        let _guard = self.lock.lock().unwrap();

        let from_c = self.api_to_internal(from)?;
        let to_c = self.api_to_internal(to)?;
        debug!(from = %from_c.display(), to = %to_c.display(), "rename");

        // stage one: with chained naming, every descendant of a directory
        // re-encodes under the new IV chain
        let mut op = None;
        let from_is_dir = self
            .runtime
            .host
            .get_attrs(&from_c)
            .map(|a| a.is_dir())
            .unwrap_or(false);

        if self.has_directory_name_dependency() && from_is_dir {
            debug!("recursive rename begin");
            let mut list = Vec::new();
            let generated = self.gen_rename_list(&mut list, from, to);
            let mut rename_op = RenameOp { list, applied: 0 };

            let applied = generated.and_then(|()| self.apply_rename(&mut rename_op));
            if let Err(err) = applied {
                self.undo_rename(&rename_op);
                warn!("rename aborted: {err}");
                return Err(VeilError::PermissionDenied("rename aborted".into()));
            }
            debug!("recursive rename end");
            op = Some(rename_op);
        }

        // stage two: the top-level rename itself
        let old_mtime = self
            .runtime
            .host
            .get_attrs(&from_c)
            .ok()
            .map(|a| a.mtime);

        if let Err(err) = self.rename_node(from, to, true) {
            if let Some(op) = &op {
                self.undo_rename(op);
            }
            return Err(err);
        }

        if let Err(err) = self.runtime.host.rename(&from_c, &to_c) {
            if let Err(undo_err) = self.rename_node(to, from, false) {
                warn!("internal rename undo failed: {undo_err}");
            }
            if let Some(op) = &op {
                self.undo_rename(op);
            }
            return Err(err);
        }

        if let Some(mtime) = old_mtime {
            let _ = self.runtime.host.set_times(&to_c, None, Some(mtime));
        }
        Ok(())
    }
}
