//! Vault assembly: wires the config snapshot, the crypto capabilities, the
//! host adapter and the coordination layer into one mounted view.
//!
//! Every public operation returns `VeilResult`; the errno contract at the
//! mount boundary is `-err.errno()`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::SecretString;
use veil_core::{FileAttrs, VaultConfig, VeilConfig, VeilResult};
use veil_crypto::{Aes256Ctr, Argon2Cost, ContentCipher, MasterKey, NameCoder, SivNameCoder};

use crate::context::Context;
use crate::dirnode::{DirNode, DirTraverse};
use crate::filenode::FileNode;
use crate::hostfs::HostFs;

/// Everything the stack shares, frozen at mount time.
#[derive(Clone)]
pub struct FsRuntime {
    pub config: Arc<VaultConfig>,
    pub cipher: Arc<dyn ContentCipher>,
    pub naming: Arc<dyn NameCoder>,
    pub host: Arc<dyn HostFs>,
}

pub struct Vault {
    ctx: Arc<Context>,
    root: Arc<DirNode>,
}

impl Vault {
    /// Build a vault from a master key, deriving the content cipher and
    /// the name codec from it.
    pub fn new(
        config: VaultConfig,
        master: &MasterKey,
        host: Arc<dyn HostFs>,
        root_dir: PathBuf,
    ) -> VeilResult<Self> {
        config.validate()?;

        let cipher: Arc<dyn ContentCipher> = Arc::new(Aes256Ctr::new(&master.content_key()?)?);
        let naming: Arc<dyn NameCoder> =
            Arc::new(SivNameCoder::new(&master.name_key()?, config.chained_name_iv)?);

        Self::with_capabilities(config, cipher, naming, host, root_dir)
    }

    /// Derive the master key from a passphrase first (see `veil-crypto`'s
    /// KDF); the salt lives next to the vault configuration.
    pub fn from_passphrase(
        config: &VeilConfig,
        passphrase: &SecretString,
        salt: &[u8; 16],
        host: Arc<dyn HostFs>,
        root_dir: PathBuf,
    ) -> VeilResult<Self> {
        let cost = Argon2Cost {
            mem_cost_kib: config.kdf.mem_cost_kib,
            time_cost: config.kdf.time_cost,
            parallelism: config.kdf.parallelism,
        };
        let master = MasterKey::unlock(passphrase, salt, &cost)?;
        Self::new(config.vault.clone(), &master, host, root_dir)
    }

    /// Build a vault from explicit capability implementations.
    pub fn with_capabilities(
        config: VaultConfig,
        cipher: Arc<dyn ContentCipher>,
        naming: Arc<dyn NameCoder>,
        host: Arc<dyn HostFs>,
        root_dir: PathBuf,
    ) -> VeilResult<Self> {
        config.validate()?;

        let runtime = FsRuntime {
            config: Arc::new(config),
            cipher,
            naming,
            host,
        };
        let ctx = Context::new();
        let root = DirNode::new(ctx.clone(), runtime, root_dir);
        ctx.set_root(root.clone());
        Ok(Self { ctx, root })
    }

    pub fn root(&self) -> &Arc<DirNode> {
        &self.root
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Open (optionally creating) a file and return its node. The node is
    /// the unit of I/O: `read`/`write`/`truncate`/`sync` live on it, and
    /// dropping the last handle closes the file.
    pub fn open(&self, plain: &Path, write: bool, create: bool) -> VeilResult<Arc<FileNode>> {
        self.root.open_node(plain, write, create)
    }

    pub fn get_attrs(&self, plain: &Path) -> VeilResult<FileAttrs> {
        self.root.get_attrs(plain)
    }

    pub fn list(&self, plain: &Path) -> VeilResult<DirTraverse> {
        self.root.open_dir(plain)
    }

    pub fn mkdir(&self, plain: &Path) -> VeilResult<()> {
        self.root.mkdir(plain)
    }

    pub fn rmdir(&self, plain: &Path) -> VeilResult<()> {
        self.root.rmdir(plain)
    }

    pub fn unlink(&self, plain: &Path) -> VeilResult<()> {
        self.root.unlink(plain)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> VeilResult<()> {
        self.root.rename(from, to)
    }

    pub fn symlink(&self, link: &Path, target: &str) -> VeilResult<()> {
        self.root.symlink(link, target)
    }

    pub fn readlink(&self, plain: &Path) -> VeilResult<String> {
        self.root.readlink(plain)
    }

    pub fn link(&self, from: &Path, to: &Path) -> VeilResult<()> {
        self.root.link(from, to)
    }

    pub fn set_times(&self, plain: &Path, atime: Option<i64>, mtime: Option<i64>) -> VeilResult<()> {
        self.root.set_times(plain, atime, mtime)
    }

    pub fn mknod(&self, plain: &Path, mode: u32, dev: u64) -> VeilResult<()> {
        self.root.mknod(plain, mode, dev)
    }

    pub fn chmod(&self, plain: &Path, mode: u32) -> VeilResult<()> {
        self.root.chmod(plain, mode)
    }

    /// Break the `Context`↔`DirNode` cycle. Also runs on drop.
    pub fn shutdown(&self) {
        self.ctx.take_root();
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        self.ctx.take_root();
    }
}
