//! Cryptographic composition for the storage overlay
//!
//! Defines how the primitives are combined: SHA-256d identifiers, the
//! per-replica RSA/AES key material, and the hybrid block transform used
//! by the replica builder. Primitive implementations come from the
//! RustCrypto crates.

pub mod cipher;
pub mod hashing;
pub mod keys;

pub use cipher::{decrypt_block, encrypt_block, PLAIN_BLOCK_SIZE};
pub use hashing::Hash256;
pub use keys::{AesKey, CryptoError, DecryptionKeys, ReplicaKeyPair, AES_KEY_SIZE};
