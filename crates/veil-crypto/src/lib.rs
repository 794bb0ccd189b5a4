//! veil-crypto: key hierarchy and cipher capabilities for veilfs
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, Argon2id from passphrase)
//!   ├── Content Key (HKDF, domain="veil-content")
//!   │     ├── block-role subkey  (HKDF, "veil-block")   → AES-256-CTR
//!   │     ├── stream-role subkey (HKDF, "veil-stream")  → AES-256-CTR
//!   │     └── mac-role subkey    (HKDF, "veil-mac")     → HMAC-SHA256/64
//!   └── Name Key (HKDF, domain="veil-names") → AES-256-SIV, chained IV
//! ```
//!
//! Content transforms are keyed by a 64-bit tweak supplied per block by the
//! file stack (`block_index ^ file_iv`). Filename encryption is
//! deterministic on `(name, chain IV)` so the same plaintext path always
//! maps to the same ciphertext path.

pub mod cipher;
pub mod kdf;
pub mod names;

pub use cipher::{Aes256Ctr, ContentCipher};
pub use kdf::{Argon2Cost, MasterKey};
pub use names::{NameCoder, SivNameCoder};

/// Size of a derived key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the per-file IV header written by the file stack
pub const FILE_IV_SIZE: usize = 8;
