//! Content cipher capability: per-block transforms keyed by a 64-bit tweak.
//!
//! The file stack hands every block to the cipher together with a tweak
//! (`block_index ^ file_iv`), and picks the block or the stream primitive
//! by the measured block length. Both primitives here are AES-256-CTR with
//! role-separated subkeys, so a full block and a tail block never share a
//! keystream even for the same tweak.
//!
//! CTR mode enables random-access decryption (any block without processing
//! preceding bytes), which is what an overlay file system needs.
//!
//! SECURITY NOTE: CTR does NOT provide authentication. Integrity is the
//! MAC layer's job when `mac_bytes` is configured.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::kdf::hkdf_derive;
use crate::KEY_SIZE;

/// AES-256-CTR with a 64-bit big-endian counter.
type Aes256Ctr64BE = ctr::Ctr64BE<Aes256>;

type HmacSha256 = Hmac<Sha256>;

/// Capability interface consumed by the encrypting file layers.
///
/// All transforms work in place. `encode` produces ciphertext, `decode`
/// recovers plaintext; reverse-mode vaults swap the two at the call site.
pub trait ContentCipher: Send + Sync {
    /// Transform one full cipher block.
    fn block_encode(&self, buf: &mut [u8], iv: u64) -> anyhow::Result<()>;
    fn block_decode(&self, buf: &mut [u8], iv: u64) -> anyhow::Result<()>;

    /// Transform a partial (tail) block or a header.
    fn stream_encode(&self, buf: &mut [u8], iv: u64) -> anyhow::Result<()>;
    fn stream_decode(&self, buf: &mut [u8], iv: u64) -> anyhow::Result<()>;

    /// 64-bit keyed MAC over `data`; callers store the low `mac_bytes`
    /// bytes in little-endian order.
    fn mac64(&self, data: &[u8]) -> u64;

    /// Fill `buf` with pseudo-random bytes.
    fn randomize(&self, buf: &mut [u8]);
}

/// AES-256-CTR implementation of [`ContentCipher`].
pub struct Aes256Ctr {
    block_key: [u8; KEY_SIZE],
    stream_key: [u8; KEY_SIZE],
    mac_key: [u8; KEY_SIZE],
}

impl Aes256Ctr {
    /// Build the cipher from the vault's content key, expanding one subkey
    /// per role.
    pub fn new(content_key: &[u8; KEY_SIZE]) -> anyhow::Result<Self> {
        Ok(Self {
            block_key: hkdf_derive(content_key, b"veil-block")?,
            stream_key: hkdf_derive(content_key, b"veil-stream")?,
            mac_key: hkdf_derive(content_key, b"veil-mac")?,
        })
    }

    /// CTR transform under `key` with the tweak as the IV prefix.
    ///
    /// IV layout: `[8 bytes tweak BE][8 bytes counter, starts at 0]`.
    /// Distinct tweaks therefore never share a keystream; the counter
    /// covers 2^64 * 16 bytes within one block, far beyond any block size.
    fn apply(key: &[u8; KEY_SIZE], buf: &mut [u8], tweak: u64) {
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&tweak.to_be_bytes());
        let mut cipher = Aes256Ctr64BE::new(key.into(), (&iv).into());
        cipher.apply_keystream(buf);
    }
}

impl Drop for Aes256Ctr {
    fn drop(&mut self) {
        self.block_key.zeroize();
        self.stream_key.zeroize();
        self.mac_key.zeroize();
    }
}

impl std::fmt::Debug for Aes256Ctr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aes256Ctr").finish_non_exhaustive()
    }
}

impl ContentCipher for Aes256Ctr {
    fn block_encode(&self, buf: &mut [u8], iv: u64) -> anyhow::Result<()> {
        Self::apply(&self.block_key, buf, iv);
        Ok(())
    }

    fn block_decode(&self, buf: &mut [u8], iv: u64) -> anyhow::Result<()> {
        // CTR decrypt is identical to encrypt (XOR is symmetric)
        Self::apply(&self.block_key, buf, iv);
        Ok(())
    }

    fn stream_encode(&self, buf: &mut [u8], iv: u64) -> anyhow::Result<()> {
        Self::apply(&self.stream_key, buf, iv);
        Ok(())
    }

    fn stream_decode(&self, buf: &mut [u8], iv: u64) -> anyhow::Result<()> {
        Self::apply(&self.stream_key, buf, iv);
        Ok(())
    }

    fn mac64(&self, data: &[u8]) -> u64 {
        let mut mac =
            HmacSha256::new_from_slice(&self.mac_key).expect("HMAC accepts any key length");
        mac.update(data);
        let tag = mac.finalize().into_bytes();
        u64::from_le_bytes(tag[..8].try_into().expect("tag is 32 bytes"))
    }

    fn randomize(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> Aes256Ctr {
        Aes256Ctr::new(&[0x5Au8; KEY_SIZE]).unwrap()
    }

    #[test]
    fn test_block_roundtrip() {
        let cipher = test_cipher();
        let plain = vec![0xABu8; 1024];

        let mut buf = plain.clone();
        cipher.block_encode(&mut buf, 42).unwrap();
        assert_ne!(buf, plain);
        cipher.block_decode(&mut buf, 42).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_stream_roundtrip_partial() {
        let cipher = test_cipher();
        let plain = b"short tail".to_vec();

        let mut buf = plain.clone();
        cipher.stream_encode(&mut buf, 7).unwrap();
        cipher.stream_decode(&mut buf, 7).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_tweak_changes_keystream() {
        let cipher = test_cipher();

        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        cipher.block_encode(&mut a, 1).unwrap();
        cipher.block_encode(&mut b, 2).unwrap();

        assert_ne!(a, b, "different tweaks must produce different ciphertext");
    }

    #[test]
    fn test_block_and_stream_roles_differ() {
        let cipher = test_cipher();

        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        cipher.block_encode(&mut a, 5).unwrap();
        cipher.stream_encode(&mut b, 5).unwrap();

        assert_ne!(a, b, "role subkeys must separate block and stream output");
    }

    #[test]
    fn test_mac64_keyed_and_stable() {
        let cipher = test_cipher();
        let other = Aes256Ctr::new(&[0x11u8; KEY_SIZE]).unwrap();

        let mac1 = cipher.mac64(b"some block contents");
        let mac2 = cipher.mac64(b"some block contents");
        let mac3 = cipher.mac64(b"some block content!");

        assert_eq!(mac1, mac2);
        assert_ne!(mac1, mac3);
        assert_ne!(mac1, other.mac64(b"some block contents"));
    }

    #[test]
    fn test_randomize_fills() {
        let cipher = test_cipher();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        cipher.randomize(&mut a);
        cipher.randomize(&mut b);
        assert_ne!(a, b, "two PRNG fills must differ");
    }
}
