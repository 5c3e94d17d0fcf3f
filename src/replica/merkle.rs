//! Merkle summary of a replica
//!
//! Leaves are SHA-256d hashes of fixed `RSA_BLOCK_SIZE` byte blocks of
//! the replica file. Levels are built by hashing `left || right`; an odd
//! level duplicates its last node. The whole tree is materialized into a
//! scratch file, level by level, and the root is returned. An empty
//! replica has the all-zero root.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::crypto::{hashing::hash_nodes, Hash256};
use crate::protocol::RSA_BLOCK_SIZE;

/// Number of leaf blocks in a replica of the given size
pub fn leaf_count(replica_size: u64) -> u64 {
    replica_size.div_ceil(RSA_BLOCK_SIZE as u64)
}

/// Total node count of the tree over `leaves` leaf blocks
pub fn node_count(leaves: u64) -> u64 {
    if leaves == 0 {
        return 0;
    }
    let mut total = leaves;
    let mut width = leaves;
    while width > 1 {
        width = width.div_ceil(2);
        total += width;
    }
    total
}

/// On-disk size of the materialized tree for a replica of `replica_size`
pub fn tree_size(replica_size: u64) -> u64 {
    node_count(leaf_count(replica_size)) * 32
}

/// Build the tree for `replica` into `tree_out` and return the root
pub fn build_tree(replica: &Path, tree_out: &Path) -> std::io::Result<Hash256> {
    let mut reader = BufReader::new(File::open(replica)?);
    let mut writer = BufWriter::new(File::create(tree_out)?);

    let mut level: Vec<Hash256> = Vec::new();
    let mut block = vec![0u8; RSA_BLOCK_SIZE];
    loop {
        let n = read_full(&mut reader, &mut block)?;
        if n == 0 {
            break;
        }
        let leaf = Hash256::from_data(&block[..n]);
        writer.write_all(leaf.as_bytes())?;
        level.push(leaf);
    }

    if level.is_empty() {
        writer.flush()?;
        return Ok(Hash256::ZERO);
    }

    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let right = pair.get(1).unwrap_or(&pair[0]);
            let parent = hash_nodes(&pair[0], right);
            writer.write_all(parent.as_bytes())?;
            next.push(parent);
        }
        level = next;
    }

    writer.flush()?;
    Ok(level[0])
}

/// Read until `buf` is full or EOF; returns the bytes read
pub(crate) fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
