//! Replica key material
//!
//! Every replica is encrypted under a freshly generated RSA keypair and a
//! fresh 16-byte AES key. The keypair's public half (PKCS#1 PEM) travels
//! with the replica inside [`DecryptionKeys`] and is what a keeper later
//! uses to recover plaintext blocks.

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::RSA_BLOCK_SIZE;

/// AES key length in bytes (AES-128)
pub const AES_KEY_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(rsa::Error),
    #[error("invalid RSA public key: {0}")]
    InvalidPublicKey(String),
    #[error("ciphertext block out of range for modulus")]
    BlockOutOfRange,
    #[error("plaintext block overflows {0} bytes")]
    BlockOverflow(usize),
}

/// A 16-byte AES-128 key
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesKey([u8; AES_KEY_SIZE]);

impl AesKey {
    /// Generate a fresh key from the system CSPRNG
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; AES_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log key material
        write!(f, "AesKey(..)")
    }
}

/// The material a keeper needs to decrypt a stored replica
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecryptionKeys {
    /// PKCS#1 PEM encoding of the replica's RSA public key
    pub rsa_public_key: Vec<u8>,
    /// AES-128 key whitening each block before the RSA transform
    pub aes_key: AesKey,
}

impl DecryptionKeys {
    /// Parse the PEM public key back into an [`RsaPublicKey`]
    pub fn public_key(&self) -> Result<RsaPublicKey, CryptoError> {
        let pem = std::str::from_utf8(&self.rsa_public_key)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }
}

/// Smallest acceptable modulus: every `RSA_BLOCK_SIZE - 2` byte plaintext
/// block must be strictly below the modulus so the block transform never
/// overflows.
pub fn min_modulus() -> BigUint {
    BigUint::from_bytes_be(&[0xff; RSA_BLOCK_SIZE - 2])
}

/// A freshly generated RSA keypair for one replica
pub struct ReplicaKeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl ReplicaKeyPair {
    /// Generate a keypair whose modulus exceeds [`min_modulus`].
    ///
    /// Generation is retried until the bound holds, matching the protocol
    /// requirement that each plaintext block encrypts to exactly
    /// `RSA_BLOCK_SIZE` bytes.
    pub fn generate() -> Result<Self, CryptoError> {
        let floor = min_modulus();
        loop {
            let private = RsaPrivateKey::new(&mut OsRng, RSA_BLOCK_SIZE * 8)
                .map_err(CryptoError::KeyGeneration)?;
            if private.n() > &floor {
                let public = private.to_public_key();
                return Ok(Self { private, public });
            }
        }
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    /// PKCS#1 PEM encoding of the public half
    pub fn public_key_pem(&self) -> Result<Vec<u8>, CryptoError> {
        let pem = self
            .public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(pem.into_bytes())
    }

    /// Bundle the public half with a fresh AES key
    pub fn decryption_keys(&self, aes_key: AesKey) -> Result<DecryptionKeys, CryptoError> {
        Ok(DecryptionKeys {
            rsa_public_key: self.public_key_pem()?,
            aes_key,
        })
    }
}
