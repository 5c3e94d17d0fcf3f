//! Hybrid block transform for replica encryption
//!
//! Each plaintext block of `RSA_BLOCK_SIZE - 2` bytes is whitened with
//! AES-128-CTR (keyed per replica, nonce derived from the block index) and
//! then raised to the RSA *private* exponent, producing exactly
//! `RSA_BLOCK_SIZE` bytes of ciphertext. Recovery applies the *public*
//! exponent from the PEM key shipped in `DecryptionKeys`, then strips the
//! CTR keystream. The minimum-modulus bound on key generation guarantees
//! the exponentiation never overflows.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};

use super::keys::{AesKey, CryptoError};
use crate::protocol::RSA_BLOCK_SIZE;

/// Plaintext bytes consumed per ciphertext block
pub const PLAIN_BLOCK_SIZE: usize = RSA_BLOCK_SIZE - 2;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// XOR the CTR keystream for block `index` over `buf`
fn apply_keystream(key: &AesKey, index: u64, buf: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&index.to_be_bytes());
    let mut cipher = Aes128Ctr::new(key.as_bytes().into(), &iv.into());
    cipher.apply_keystream(buf);
}

/// Left-pad the big-endian bytes of `value` to exactly `len` bytes
fn to_fixed_be(value: &BigUint, len: usize) -> Result<Vec<u8>, CryptoError> {
    let bytes = value.to_bytes_be();
    if bytes.len() > len {
        return Err(CryptoError::BlockOverflow(len));
    }
    let mut out = vec![0u8; len];
    out[len - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// Encrypt one `PLAIN_BLOCK_SIZE` byte block into `RSA_BLOCK_SIZE` bytes
pub fn encrypt_block(
    plain: &[u8],
    index: u64,
    aes: &AesKey,
    rsa: &RsaPrivateKey,
) -> Result<Vec<u8>, CryptoError> {
    debug_assert_eq!(plain.len(), PLAIN_BLOCK_SIZE);
    let mut buf = plain.to_vec();
    apply_keystream(aes, index, &mut buf);
    let m = BigUint::from_bytes_be(&buf);
    let c = m.modpow(rsa.d(), rsa.n());
    to_fixed_be(&c, RSA_BLOCK_SIZE)
}

/// Recover one `PLAIN_BLOCK_SIZE` byte block from `RSA_BLOCK_SIZE` bytes
pub fn decrypt_block(
    cipher: &[u8],
    index: u64,
    aes: &AesKey,
    rsa: &RsaPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    debug_assert_eq!(cipher.len(), RSA_BLOCK_SIZE);
    let c = BigUint::from_bytes_be(cipher);
    if &c >= rsa.n() {
        return Err(CryptoError::BlockOutOfRange);
    }
    let m = c.modpow(rsa.e(), rsa.n());
    let mut buf = to_fixed_be(&m, PLAIN_BLOCK_SIZE)?;
    apply_keystream(aes, index, &mut buf);
    Ok(buf)
}
