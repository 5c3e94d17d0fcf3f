//! Canonical wire codec
//!
//! Little-endian, length-prefixed serialization with a cursor-based
//! reader and writer. The encoding is canonical: a value has exactly one
//! byte representation, which lets order and proposal hashes be computed
//! over the same bytes that travel on the wire.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use thiserror::Error;

use crate::crypto::Hash256;

/// Longest admissible var-bytes field; larger prefixes are rejected
/// before any allocation happens.
pub const MAX_VAR_BYTES: usize = 16 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("buffer underflow: need {needed} bytes, have {available}")]
    BufferUnderflow { needed: usize, available: usize },
    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type CodecResult<T> = Result<T, CodecError>;

/// A value with a canonical byte encoding
pub trait Encodable {
    fn encode(&self, w: &mut Writer);

    /// Encode into a fresh buffer
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_inner()
    }
}

/// A value decodable from its canonical encoding
pub trait Decodable: Sized {
    fn decode(r: &mut Reader<'_>) -> CodecResult<Self>;

    /// Decode from a slice, requiring every byte to be consumed
    fn decode_from_slice(data: &[u8]) -> CodecResult<Self> {
        let mut r = Reader::new(data);
        let value = Self::decode(&mut r)?;
        if r.remaining() != 0 {
            return Err(CodecError::InvalidData(format!(
                "{} trailing bytes",
                r.remaining()
            )));
        }
        Ok(value)
    }
}

/// Growable output cursor
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// u32 length prefix followed by the raw bytes
    pub fn put_var_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_bytes(bytes);
    }

    pub fn put_hash(&mut self, hash: &Hash256) {
        self.put_bytes(hash.as_bytes());
    }

    /// Address as a v6-mapped 16-byte IP followed by the port
    pub fn put_socket_addr(&mut self, addr: &SocketAddr) {
        let v6 = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        self.put_bytes(&v6.octets());
        self.put_u16(addr.port());
    }
}

/// Borrowing input cursor
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::BufferUnderflow {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> CodecResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> CodecResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> CodecResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_bytes(&mut self, n: usize) -> CodecResult<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn get_var_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        if len > MAX_VAR_BYTES {
            return Err(CodecError::InvalidData(format!(
                "var bytes length {len} exceeds maximum"
            )));
        }
        self.get_bytes(len)
    }

    pub fn get_hash(&mut self) -> CodecResult<Hash256> {
        let bytes: [u8; 32] = self.take(32)?.try_into().unwrap();
        Ok(Hash256::from_bytes(bytes))
    }

    pub fn get_socket_addr(&mut self) -> CodecResult<SocketAddr> {
        let octets: [u8; 16] = self.take(16)?.try_into().unwrap();
        let port = self.get_u16()?;
        let v6 = Ipv6Addr::from(octets);
        let ip = match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        };
        Ok(SocketAddr::new(ip, port))
    }

    pub fn get_string(&mut self) -> CodecResult<String> {
        let bytes = self.get_var_bytes()?;
        String::from_utf8(bytes).map_err(|e| CodecError::InvalidData(e.to_string()))
    }
}
