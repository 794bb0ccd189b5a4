//! Key derivation.
//!
//! A vault has exactly one root secret, the 256-bit master key. It is
//! never used to encrypt anything directly: every consumer pulls a
//! labeled subkey out of it via HKDF-SHA256, so the content cipher, the
//! name codec and any future role are cryptographically independent.
//!
//! The master key itself is either supplied raw (tests, key files) or
//! unlocked from a passphrase with Argon2id; the cost settings travel in
//! [`Argon2Cost`] and the 16-byte salt lives next to the vault config.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// HKDF domain of the content-encryption subkey.
const CONTENT_DOMAIN: &[u8] = b"veil-content";
/// HKDF domain of the filename-encryption subkey.
const NAMES_DOMAIN: &[u8] = b"veil-names";

/// Argon2id cost settings for passphrase unlocking.
///
/// Defaults are 64 MiB / 3 passes / 4 lanes; tests dial these down.
#[derive(Debug, Clone)]
pub struct Argon2Cost {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for Argon2Cost {
    fn default() -> Self {
        Self {
            mem_cost_kib: 64 * 1024,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// The vault's root secret. Scrubbed from memory on drop; subkeys are
/// handed out via [`MasterKey::subkey`], never the raw bytes by accident
/// (`Debug` prints nothing useful).
#[derive(Clone)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Unlock the master key from a passphrase: Argon2id over
    /// `(passphrase, salt)` at the given cost.
    pub fn unlock(
        passphrase: &SecretString,
        salt: &[u8; 16],
        cost: &Argon2Cost,
    ) -> anyhow::Result<Self> {
        let params = Params::new(
            cost.mem_cost_kib,
            cost.time_cost,
            cost.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| anyhow::anyhow!("argon2 rejected the cost settings: {e}"))?;

        let mut key = [0u8; KEY_SIZE];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
            .map_err(|e| anyhow::anyhow!("passphrase unlock failed: {e}"))?;

        Ok(Self(key))
    }

    /// Expand a labeled subkey. Same master + same domain always yields
    /// the same subkey; distinct domains are independent.
    pub fn subkey(&self, domain: &[u8]) -> anyhow::Result<[u8; KEY_SIZE]> {
        hkdf_derive(&self.0, domain)
    }

    /// Subkey feeding the content cipher.
    pub fn content_key(&self) -> anyhow::Result<[u8; KEY_SIZE]> {
        self.subkey(CONTENT_DOMAIN)
    }

    /// Subkey feeding the filename codec.
    pub fn name_key(&self) -> anyhow::Result<[u8; KEY_SIZE]> {
        self.subkey(NAMES_DOMAIN)
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// HKDF-SHA256 expansion shared by the whole crate (the cipher and the
/// name codec split their own role subkeys with it too).
pub(crate) fn hkdf_derive(ikm: &[u8], info: &[u8]) -> anyhow::Result<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_cost() -> Argon2Cost {
        Argon2Cost {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_unlock_deterministic() {
        let passphrase = SecretString::from("correct horse battery staple");
        let salt = [7u8; 16];

        let key1 = MasterKey::unlock(&passphrase, &salt, &cheap_cost()).unwrap();
        let key2 = MasterKey::unlock(&passphrase, &salt, &cheap_cost()).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_unlock_salt_sensitivity() {
        let passphrase = SecretString::from("same-passphrase");

        let key1 = MasterKey::unlock(&passphrase, &[1u8; 16], &cheap_cost()).unwrap();
        let key2 = MasterKey::unlock(&passphrase, &[2u8; 16], &cheap_cost()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_subkey_domains_are_independent() {
        let master = MasterKey::from_bytes([42u8; KEY_SIZE]);

        let content = master.content_key().unwrap();
        let names = master.name_key().unwrap();

        assert_ne!(content, names);
        assert_eq!(content, master.subkey(b"veil-content").unwrap());
    }

    #[test]
    fn test_debug_reveals_nothing() {
        let master = MasterKey::from_bytes([0xAB; KEY_SIZE]);
        assert_eq!(format!("{master:?}"), "MasterKey(..)");
    }
}
