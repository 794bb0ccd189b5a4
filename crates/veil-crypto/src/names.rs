//! Filename encryption: deterministic AES-SIV per path component.
//!
//! Deterministic encryption (same name + same chain IV = same ciphertext)
//! is required so that a plaintext path can be re-encoded at any time to
//! find its ciphertext location. AES-SIV provides this with
//! authentication; the current chain IV is bound as associated data, so a
//! component moved under a different parent no longer decodes.
//!
//! When chaining is enabled, encoding a component advances the IV to the
//! first 8 bytes of the SIV tag. A path `/a/b/c` is thus encoded as
//! `[E(a, 0), E(b, iv_a), E(c, iv_ab)]`, and renaming a directory changes
//! the encoding of every descendant.
//!
//! Encoded names are URL-safe unpadded base64, so the ciphertext directory
//! remains a valid file tree with parent-child structure preserved.

use aes_siv::{
    aead::{Aead, KeyInit, Payload},
    Aes256SivAead, Nonce,
};
use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine};
use zeroize::Zeroize;

use crate::kdf::hkdf_derive;
use crate::KEY_SIZE;

/// Path component codec consumed by the directory layer.
///
/// Unlike the content transforms, encoding here must be a pure function of
/// `(name, iv)`: the directory layer re-derives ciphertext paths from
/// scratch on every translation.
pub trait NameCoder: Send + Sync {
    /// Whether encoding advances the IV across components.
    fn chained_iv(&self) -> bool;

    /// Encode one component under the current chain IV, advancing it when
    /// chaining is enabled.
    fn encode_name(&self, name: &str, iv: &mut u64) -> anyhow::Result<String>;

    /// Inverse of `encode_name`; fails on tampered or foreign names.
    fn decode_name(&self, name: &str, iv: &mut u64) -> anyhow::Result<String>;

    /// Encode a component sequence, folding the IV left to right.
    fn encode_path(&self, components: &[String], iv: &mut u64) -> anyhow::Result<Vec<String>> {
        components.iter().map(|c| self.encode_name(c, iv)).collect()
    }

    /// Decode a component sequence, folding the IV left to right.
    fn decode_path(&self, components: &[String], iv: &mut u64) -> anyhow::Result<Vec<String>> {
        components.iter().map(|c| self.decode_name(c, iv)).collect()
    }
}

/// AES-256-SIV implementation of [`NameCoder`].
pub struct SivNameCoder {
    key: [u8; 64],
    chained: bool,
}

impl SivNameCoder {
    /// Build the codec from the vault's name key.
    ///
    /// AES-256-SIV needs a 64-byte key (two 32-byte sub-keys), expanded
    /// from the 32-byte name key via HKDF.
    pub fn new(name_key: &[u8; KEY_SIZE], chained: bool) -> anyhow::Result<Self> {
        let half_a = hkdf_derive(name_key, b"veil-name-siv-a")?;
        let half_b = hkdf_derive(name_key, b"veil-name-siv-b")?;
        let mut key = [0u8; 64];
        key[..KEY_SIZE].copy_from_slice(&half_a);
        key[KEY_SIZE..].copy_from_slice(&half_b);
        Ok(Self { key, chained })
    }

    fn cipher(&self) -> Aes256SivAead {
        Aes256SivAead::new((&self.key).into())
    }

    /// The chain advances to the head of the SIV tag, a PRF of
    /// `(name, iv)`, so it is deterministic and parent-dependent.
    fn next_iv(sealed: &[u8]) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&sealed[..8]);
        u64::from_be_bytes(head)
    }
}

impl Drop for SivNameCoder {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl NameCoder for SivNameCoder {
    fn chained_iv(&self) -> bool {
        self.chained
    }

    fn encode_name(&self, name: &str, iv: &mut u64) -> anyhow::Result<String> {
        if name.is_empty() || name.contains('/') {
            anyhow::bail!("invalid path component: {name:?}");
        }

        let aad = iv.to_be_bytes();
        // AES-SIV with a fixed nonce is deterministic, which is intentional
        let sealed = self
            .cipher()
            .encrypt(
                &Nonce::default(),
                Payload {
                    msg: name.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| anyhow::anyhow!("name encryption failed: {e}"))?;

        if self.chained {
            *iv = Self::next_iv(&sealed);
        }
        Ok(BASE64_URL_SAFE_NO_PAD.encode(&sealed))
    }

    fn decode_name(&self, name: &str, iv: &mut u64) -> anyhow::Result<String> {
        let sealed = BASE64_URL_SAFE_NO_PAD
            .decode(name)
            .map_err(|e| anyhow::anyhow!("not an encoded name: {e}"))?;
        if sealed.len() < 16 {
            anyhow::bail!("encoded name too short: {} bytes", sealed.len());
        }

        let aad = iv.to_be_bytes();
        let plain = self
            .cipher()
            .decrypt(
                &Nonce::default(),
                Payload {
                    msg: sealed.as_ref(),
                    aad: &aad,
                },
            )
            .map_err(|_| anyhow::anyhow!("name decryption failed: wrong key or wrong parent IV"))?;

        if self.chained {
            *iv = Self::next_iv(&sealed);
        }
        String::from_utf8(plain).map_err(|e| anyhow::anyhow!("decoded name is not UTF-8: {e}"))
    }
}
