//! Replica builder
//!
//! Turns a plaintext file into its encrypted, block-aligned replica and
//! back. The replica is a sequence of `RSA_BLOCK_SIZE` byte ciphertext
//! blocks, one per `RSA_BLOCK_SIZE - 2` bytes of plaintext; the final
//! block is implicitly zero-padded. Decryption stops after the plaintext
//! size recorded in the order, so padding never leaks into output.

pub mod merkle;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use thiserror::Error;

use crate::crypto::{
    cipher, keys::ReplicaKeyPair, CryptoError, DecryptionKeys, PLAIN_BLOCK_SIZE,
};
use crate::protocol::RSA_BLOCK_SIZE;
use merkle::read_full;

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("source is {actual} bytes, order says {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Ciphertext size of a replica for a plaintext of `file_size` bytes:
/// `ceil(file_size / (B - 2)) * B` with `B = RSA_BLOCK_SIZE`.
pub fn crypto_replica_size(file_size: u64) -> u64 {
    file_size.div_ceil(PLAIN_BLOCK_SIZE as u64) * RSA_BLOCK_SIZE as u64
}

/// Encrypt `source` (which must be exactly `file_size` bytes) into the
/// pre-allocated replica file at `dest`.
pub fn encrypt_replica(
    source: &Path,
    dest: &Path,
    file_size: u64,
    keys: &DecryptionKeys,
    rsa: &ReplicaKeyPair,
) -> Result<(), ReplicaError> {
    let actual = std::fs::metadata(source)?.len();
    if actual != file_size {
        return Err(ReplicaError::SizeMismatch {
            expected: file_size,
            actual,
        });
    }

    let mut reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(dest)?);

    let mut block = [0u8; PLAIN_BLOCK_SIZE];
    let mut index = 0u64;
    loop {
        let n = read_full(&mut reader, &mut block)?;
        if n == 0 {
            break;
        }
        // implicit zero padding of the final block
        block[n..].fill(0);
        let cipher = cipher::encrypt_block(&block, index, &keys.aes_key, rsa.private_key())?;
        writer.write_all(&cipher)?;
        index += 1;
    }
    writer.flush()?;
    Ok(())
}

/// Decrypt the replica at `source` back into `file_size` plaintext bytes
/// at `dest`, using the keys stored with the allocation.
pub fn decrypt_replica(
    source: &Path,
    dest: &Path,
    file_size: u64,
    keys: &DecryptionKeys,
) -> Result<(), ReplicaError> {
    let public = keys.public_key()?;
    let mut reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(dest)?);

    let mut block = [0u8; RSA_BLOCK_SIZE];
    let mut remaining = file_size;
    let mut index = 0u64;
    while remaining > 0 {
        reader.read_exact(&mut block)?;
        let plain = cipher::decrypt_block(&block, index, &keys.aes_key, &public)?;
        let take = remaining.min(PLAIN_BLOCK_SIZE as u64) as usize;
        writer.write_all(&plain[..take])?;
        remaining -= take as u64;
        index += 1;
    }
    writer.flush()?;
    Ok(())
}
