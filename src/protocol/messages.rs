//! Message types exchanged by the storage overlay

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::codec::{CodecError, CodecResult, Decodable, Encodable, Reader, Writer};
use super::{
    CMD_ANNOUNCE, CMD_HANDSHAKE, CMD_PING, CMD_PONG, CMD_PROPOSAL, CMD_READY, CMD_RESERVED,
    CMD_SEND, MSG_STORAGE_ORDER_ANNOUNCE, REPLICA_CHUNK_SIZE,
};
use crate::crypto::keys::AES_KEY_SIZE;
use crate::crypto::{AesKey, DecryptionKeys, Hash256};

/// An offer published by a customer: pay up to `max_rate` for keeping a
/// file of `file_size` bytes, refreshed at least every `max_gap` blocks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageOrder {
    /// Creation time, seconds since epoch
    pub time: u64,
    /// Opaque 32-byte identifier of the logical file
    pub file_uri: Hash256,
    /// Display name
    pub filename: String,
    /// Plaintext size in bytes
    pub file_size: u64,
    /// Maximum rate the customer will pay
    pub max_rate: u64,
    /// Freshness bound in blocks
    pub max_gap: u64,
    /// Customer peer address
    pub address: SocketAddr,
}

impl StorageOrder {
    /// SHA-256d over the canonical serialization
    pub fn hash(&self) -> Hash256 {
        Hash256::from_data(&self.encode_to_vec())
    }
}

impl Encodable for StorageOrder {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.time);
        w.put_hash(&self.file_uri);
        w.put_var_bytes(self.filename.as_bytes());
        w.put_u64(self.file_size);
        w.put_u64(self.max_rate);
        w.put_u64(self.max_gap);
        w.put_socket_addr(&self.address);
    }
}

impl Decodable for StorageOrder {
    fn decode(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            time: r.get_u64()?,
            file_uri: r.get_hash()?,
            filename: r.get_string()?,
            file_size: r.get_u64()?,
            max_rate: r.get_u64()?,
            max_gap: r.get_u64()?,
            address: r.get_socket_addr()?,
        })
    }
}

/// A keeper's bid against an order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProposal {
    pub time: u64,
    pub order_hash: Hash256,
    /// Rate the keeper charges
    pub rate: u64,
    /// Keeper peer address
    pub address: SocketAddr,
}

impl StorageProposal {
    /// SHA-256d over the canonical serialization
    pub fn hash(&self) -> Hash256 {
        Hash256::from_data(&self.encode_to_vec())
    }
}

impl Encodable for StorageProposal {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.time);
        w.put_hash(&self.order_hash);
        w.put_u64(self.rate);
        w.put_socket_addr(&self.address);
    }
}

impl Decodable for StorageProposal {
    fn decode(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            time: r.get_u64()?,
            order_hash: r.get_hash()?,
            rate: r.get_u64()?,
            address: r.get_socket_addr()?,
        })
    }
}

/// Per-transfer token exchanged once a proposal is selected
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageHandshake {
    pub time: u64,
    pub order_hash: Hash256,
    pub proposal_hash: Hash256,
    /// Port the sender accepts the transfer on
    pub port: u16,
}

impl Encodable for StorageHandshake {
    fn encode(&self, w: &mut Writer) {
        w.put_u64(self.time);
        w.put_hash(&self.order_hash);
        w.put_hash(&self.proposal_hash);
        w.put_u16(self.port);
    }
}

impl Decodable for StorageHandshake {
    fn decode(r: &mut Reader<'_>) -> CodecResult<Self> {
        Ok(Self {
            time: r.get_u64()?,
            order_hash: r.get_hash()?,
            proposal_hash: r.get_hash()?,
            port: r.get_u16()?,
        })
    }
}

/// An inventory object relayed to peers at or above the active protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inventory {
    pub kind: u32,
    pub hash: Hash256,
}

impl Inventory {
    /// Inventory for a storage order announcement
    pub fn order(hash: Hash256) -> Self {
        Self {
            kind: MSG_STORAGE_ORDER_ANNOUNCE,
            hash,
        }
    }
}

/// The encrypted replica in transit, with everything a keeper needs to
/// verify and later decrypt it.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaStream {
    pub order_hash: Hash256,
    pub merkle_root: Hash256,
    pub keys: DecryptionKeys,
    /// Ciphertext, exactly `crypto_replica_size(order.file_size)` bytes
    pub payload: Vec<u8>,
}

impl Encodable for ReplicaStream {
    fn encode(&self, w: &mut Writer) {
        w.put_hash(&self.order_hash);
        w.put_hash(&self.merkle_root);
        w.put_var_bytes(&self.keys.rsa_public_key);
        w.put_bytes(self.keys.aes_key.as_bytes());
        for chunk in self.payload.chunks(REPLICA_CHUNK_SIZE) {
            w.put_var_bytes(chunk);
        }
    }
}

impl Decodable for ReplicaStream {
    fn decode(r: &mut Reader<'_>) -> CodecResult<Self> {
        let order_hash = r.get_hash()?;
        let merkle_root = r.get_hash()?;
        let rsa_public_key = r.get_var_bytes()?;
        let aes: [u8; AES_KEY_SIZE] = r.get_bytes(AES_KEY_SIZE)?.try_into().unwrap();
        let mut payload = Vec::new();
        while r.remaining() > 0 {
            payload.extend_from_slice(&r.get_var_bytes()?);
        }
        Ok(Self {
            order_hash,
            merkle_root,
            keys: DecryptionKeys {
                rsa_public_key,
                aes_key: AesKey::from_bytes(aes),
            },
            payload,
        })
    }
}

/// A typed storage command plus payload, ready for the wire
#[derive(Clone, Debug, PartialEq)]
pub enum StorageMessage {
    Announce(StorageOrder),
    Proposal(StorageProposal),
    Handshake(StorageHandshake),
    ReadyToReceive(StorageHandshake),
    Send(ReplicaStream),
    Reserved(Hash256),
    Ping,
    Pong(SocketAddr),
}

impl StorageMessage {
    /// The wire command string
    pub fn command(&self) -> &'static str {
        match self {
            StorageMessage::Announce(_) => CMD_ANNOUNCE,
            StorageMessage::Proposal(_) => CMD_PROPOSAL,
            StorageMessage::Handshake(_) => CMD_HANDSHAKE,
            StorageMessage::ReadyToReceive(_) => CMD_READY,
            StorageMessage::Send(_) => CMD_SEND,
            StorageMessage::Reserved(_) => CMD_RESERVED,
            StorageMessage::Ping => CMD_PING,
            StorageMessage::Pong(_) => CMD_PONG,
        }
    }

    /// Canonical payload bytes
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            StorageMessage::Announce(order) => order.encode(&mut w),
            StorageMessage::Proposal(proposal) => proposal.encode(&mut w),
            StorageMessage::Handshake(handshake) | StorageMessage::ReadyToReceive(handshake) => {
                handshake.encode(&mut w)
            }
            StorageMessage::Send(stream) => stream.encode(&mut w),
            StorageMessage::Reserved(hash) => w.put_hash(hash),
            StorageMessage::Ping => {}
            StorageMessage::Pong(addr) => w.put_socket_addr(addr),
        }
        w.into_inner()
    }

    /// Decode a command/payload pair. `Ok(None)` means the command does
    /// not belong to the storage overlay.
    pub fn decode(command: &str, payload: &[u8]) -> CodecResult<Option<Self>> {
        let message = match command {
            CMD_ANNOUNCE => StorageMessage::Announce(StorageOrder::decode_from_slice(payload)?),
            CMD_PROPOSAL => {
                StorageMessage::Proposal(StorageProposal::decode_from_slice(payload)?)
            }
            CMD_HANDSHAKE => {
                StorageMessage::Handshake(StorageHandshake::decode_from_slice(payload)?)
            }
            CMD_READY => {
                StorageMessage::ReadyToReceive(StorageHandshake::decode_from_slice(payload)?)
            }
            CMD_SEND => StorageMessage::Send(ReplicaStream::decode_from_slice(payload)?),
            CMD_RESERVED => {
                let mut r = Reader::new(payload);
                let hash = r.get_hash()?;
                if r.remaining() != 0 {
                    return Err(CodecError::InvalidData("trailing bytes".into()));
                }
                StorageMessage::Reserved(hash)
            }
            CMD_PING => StorageMessage::Ping,
            CMD_PONG => {
                let mut r = Reader::new(payload);
                let addr = r.get_socket_addr()?;
                if r.remaining() != 0 {
                    return Err(CodecError::InvalidData("trailing bytes".into()));
                }
                StorageMessage::Pong(addr)
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}
