use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{VeilError, VeilResult};

/// Top-level configuration (loaded from veil.toml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    pub vault: VaultConfig,
    pub kdf: KdfConfig,
    pub log: LogConfig,
}

/// Frozen per-vault settings.
///
/// Immutable after mount; the whole stack shares one snapshot behind an
/// `Arc`. Geometry and mode flags here decide the on-disk layout, so
/// changing them on an existing vault makes its files unreadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// On-disk cipher block length, including the MAC/rand prefix when
    /// configured.
    pub block_size: usize,
    /// Store a random 8-byte IV at the head of every file.
    pub per_file_iv: bool,
    /// Chain the filename-encryption IV across path components.
    pub chained_name_iv: bool,
    /// Feed the per-path chain IV into the file header encryption.
    /// Requires `per_file_iv` and `chained_name_iv`.
    pub external_iv: bool,
    /// Per-block MAC length in bytes (0..=8; 0 disables verification).
    pub mac_bytes: usize,
    /// Per-block random salt length in bytes.
    pub rand_bytes: usize,
    /// Represent unwritten regions as holes instead of zero-filled blocks.
    pub allow_holes: bool,
    /// Reverse mode: the plaintext view is the raw underlying file and the
    /// encrypted view is the derived one.
    pub reverse: bool,
    /// Log MAC mismatches instead of failing the read.
    pub force_decode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub parallelism: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            per_file_iv: true,
            chained_name_iv: true,
            external_iv: false,
            mac_bytes: 0,
            rand_bytes: 0,
            allow_holes: false,
            reverse: false,
            force_decode: false,
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl VaultConfig {
    /// User-visible block length (block minus the MAC/rand prefix).
    pub fn data_block_size(&self) -> usize {
        self.block_size - self.mac_bytes - self.rand_bytes
    }

    pub fn mac_enabled(&self) -> bool {
        self.mac_bytes > 0 || self.rand_bytes > 0
    }

    pub fn validate(&self) -> VeilResult<()> {
        if self.block_size < 2 {
            return Err(VeilError::Config(format!(
                "block_size must be at least 2, got {}",
                self.block_size
            )));
        }
        if self.mac_bytes > 8 {
            return Err(VeilError::Config(format!(
                "mac_bytes must be 0..=8, got {}",
                self.mac_bytes
            )));
        }
        if self.mac_bytes + self.rand_bytes >= self.block_size {
            return Err(VeilError::Config(format!(
                "mac_bytes + rand_bytes ({}) must leave room for data in a {}-byte block",
                self.mac_bytes + self.rand_bytes,
                self.block_size
            )));
        }
        if self.external_iv && !(self.per_file_iv && self.chained_name_iv) {
            return Err(VeilError::Config(
                "external_iv requires per_file_iv and chained_name_iv".into(),
            ));
        }
        Ok(())
    }
}

impl VeilConfig {
    pub fn load(path: &Path) -> VeilResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: VeilConfig = toml::from_str(&text)
            .map_err(|e| VeilError::Config(format!("{}: {e}", path.display())))?;
        config.vault.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[vault]
block_size = 4096
per_file_iv = true
chained_name_iv = true
external_iv = true
mac_bytes = 8
rand_bytes = 8
allow_holes = true
force_decode = false

[kdf]
mem_cost_kib = 131072
time_cost = 4
parallelism = 8

[log]
level = "debug"
format = "json"
"#;
        let config: VeilConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.vault.block_size, 4096);
        assert!(config.vault.external_iv);
        assert_eq!(config.vault.mac_bytes, 8);
        assert_eq!(config.vault.data_block_size(), 4096 - 16);
        assert!(config.vault.allow_holes);
        assert_eq!(config.kdf.mem_cost_kib, 131072);
        assert_eq!(config.log.level, "debug");
        config.vault.validate().unwrap();
    }

    #[test]
    fn test_parse_defaults() {
        let config: VeilConfig = toml::from_str("").unwrap();

        assert_eq!(config.vault.block_size, 1024);
        assert!(config.vault.per_file_iv);
        assert!(config.vault.chained_name_iv);
        assert!(!config.vault.external_iv);
        assert_eq!(config.vault.mac_bytes, 0);
        assert!(!config.vault.mac_enabled());
        assert!(!config.vault.allow_holes);
        assert_eq!(config.kdf.mem_cost_kib, 65536);
        assert_eq!(config.log.level, "info");
        config.vault.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[vault]
mac_bytes = 4
"#;
        let config: VeilConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.vault.mac_bytes, 4);
        assert!(config.vault.mac_enabled());
        // Defaults
        assert_eq!(config.vault.block_size, 1024);
        assert_eq!(config.vault.data_block_size(), 1020);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let mut vault = VaultConfig::default();
        vault.block_size = 1;
        assert!(vault.validate().is_err());

        let mut vault = VaultConfig::default();
        vault.mac_bytes = 9;
        assert!(vault.validate().is_err());

        let vault = VaultConfig {
            block_size: 16,
            mac_bytes: 8,
            rand_bytes: 8,
            ..Default::default()
        };
        assert!(vault.validate().is_err());
    }

    #[test]
    fn test_validate_external_iv_dependencies() {
        let vault = VaultConfig {
            external_iv: true,
            chained_name_iv: false,
            ..Default::default()
        };
        assert!(vault.validate().is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = VeilConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: VeilConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.vault.block_size, config.vault.block_size);
        assert_eq!(parsed.vault.per_file_iv, config.vault.per_file_iv);
        assert_eq!(parsed.kdf.time_cost, config.kdf.time_cost);
    }
}
