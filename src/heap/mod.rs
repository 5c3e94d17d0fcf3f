//! Local storage heap
//!
//! A heap is an ordered sequence of chunks; each chunk is a directory
//! with a fixed byte capacity. Allocations are single files named by
//! their URI (hex), or `<seconds>.luxfs` for scratch files. Decryption
//! keys attached to an allocation are persisted in a per-chunk sidecar
//! index so replicas stay decryptable across restarts.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::crypto::{DecryptionKeys, Hash256};
use crate::protocol::unix_time;

/// Sidecar file holding the chunk's uri -> keys index
const KEY_INDEX_FILE: &str = "keys.idx";

/// Extension of scratch files named from wall-clock time
const SCRATCH_EXT: &str = "luxfs";

#[derive(Error, Debug)]
pub enum HeapError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no chunk can fit {requested} bytes")]
    CapacityExhausted { requested: u64 },
    #[error("no allocation for uri {0}")]
    NotFound(Hash256),
    #[error("no allocation at path {}", .0.display())]
    NotFoundPath(PathBuf),
    #[error("uri {0} is already allocated")]
    AlreadyAllocated(Hash256),
    #[error("no chunk at index {0}")]
    UnknownChunk(usize),
    #[error("key index corrupt: {0}")]
    Index(String),
}

/// A reservation inside a chunk
#[derive(Clone, Debug)]
pub struct AllocatedFile {
    /// File URI; all-zero for scratch files
    pub uri: Hash256,
    /// On-disk path of the backing file
    pub fullpath: PathBuf,
    /// Reserved size in bytes
    pub size: u64,
    /// Decryption keys, once attached
    pub keys: Option<DecryptionKeys>,
}

/// A directory-rooted region with a fixed capacity
#[derive(Clone, Debug)]
pub struct StorageChunk {
    path: PathBuf,
    capacity: u64,
    free_space: u64,
    files: Vec<AllocatedFile>,
}

impl StorageChunk {
    /// Open a chunk directory, creating it if missing and rebuilding the
    /// allocation table from its current contents.
    fn open(path: PathBuf, capacity: u64) -> Result<Self, HeapError> {
        fs::create_dir_all(&path)?;
        let mut chunk = Self {
            path,
            capacity,
            free_space: capacity,
            files: Vec::new(),
        };
        chunk.scan_existing()?;
        Ok(chunk)
    }

    fn scan_existing(&mut self) -> Result<(), HeapError> {
        let index = self.load_index()?;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == KEY_INDEX_FILE || !entry.file_type()?.is_file() {
                continue;
            }
            let uri = if name.ends_with(&format!(".{SCRATCH_EXT}")) {
                Hash256::ZERO
            } else {
                match Hash256::from_hex(&name) {
                    Ok(uri) => uri,
                    Err(_) => {
                        warn!(file = %name, "skipping unrecognized file in chunk");
                        continue;
                    }
                }
            };
            let size = entry.metadata()?.len();
            self.free_space = self.free_space.saturating_sub(size);
            self.files.push(AllocatedFile {
                uri,
                fullpath: entry.path(),
                size,
                keys: index.get(&uri.to_hex()).cloned(),
            });
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn free_space(&self) -> u64 {
        self.free_space
    }

    pub fn files(&self) -> &[AllocatedFile] {
        &self.files
    }

    /// Pick an unused filename for the allocation
    fn filename_for(&self, uri: &Hash256) -> String {
        if !uri.is_zero() {
            return uri.to_hex();
        }
        let stem = unix_time();
        let mut name = format!("{stem}.{SCRATCH_EXT}");
        let mut n = 0u32;
        while self.files.iter().any(|f| f.fullpath.ends_with(&name)) {
            n += 1;
            name = format!("{stem}-{n}.{SCRATCH_EXT}");
        }
        name
    }

    fn allocate(&mut self, uri: Hash256, size: u64) -> Result<AllocatedFile, HeapError> {
        debug_assert!(self.free_space >= size);
        let fullpath = self.path.join(self.filename_for(&uri));
        let file = fs::File::create(&fullpath)?;
        file.set_len(size)?;
        let allocated = AllocatedFile {
            uri,
            fullpath,
            size,
            keys: None,
        };
        self.free_space -= size;
        self.files.push(allocated.clone());
        debug!(uri = %uri, size, chunk = %self.path.display(), "allocated file");
        Ok(allocated)
    }

    fn release_at(&mut self, position: usize) -> Result<(), HeapError> {
        let removed = self.files.remove(position);
        self.free_space += removed.size;
        if let Err(e) = fs::remove_file(&removed.fullpath) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        if removed.keys.is_some() {
            self.save_index()?;
        }
        Ok(())
    }

    fn set_keys(&mut self, uri: &Hash256, keys: DecryptionKeys) -> Result<(), HeapError> {
        let file = self
            .files
            .iter_mut()
            .find(|f| f.uri == *uri)
            .ok_or(HeapError::NotFound(*uri))?;
        file.keys = Some(keys);
        self.save_index()
    }

    fn load_index(&self) -> Result<HashMap<String, DecryptionKeys>, HeapError> {
        let path = self.path.join(KEY_INDEX_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = fs::read(&path)?;
        bincode::deserialize(&bytes).map_err(|e| HeapError::Index(e.to_string()))
    }

    fn save_index(&self) -> Result<(), HeapError> {
        let index: HashMap<String, DecryptionKeys> = self
            .files
            .iter()
            .filter_map(|f| f.keys.clone().map(|k| (f.uri.to_hex(), k)))
            .collect();
        let bytes = bincode::serialize(&index).map_err(|e| HeapError::Index(e.to_string()))?;
        fs::write(self.path.join(KEY_INDEX_FILE), bytes)?;
        Ok(())
    }

    /// Relocate every live allocation into `new_path`.
    ///
    /// Ordering: copy, swap the index, unlink the old files. A failed
    /// copy rolls back by deleting whatever was already copied; the old
    /// directory stays authoritative.
    fn relocate(&mut self, new_path: PathBuf) -> Result<(), HeapError> {
        fs::create_dir_all(&new_path)?;
        let mut copied: Vec<PathBuf> = Vec::new();
        for file in &self.files {
            let name = file
                .fullpath
                .file_name()
                .ok_or_else(|| HeapError::NotFoundPath(file.fullpath.clone()))?;
            let dest = new_path.join(name);
            if let Err(e) = fs::copy(&file.fullpath, &dest) {
                for p in copied {
                    let _ = fs::remove_file(p);
                }
                return Err(e.into());
            }
            copied.push(dest);
        }

        let old_paths: Vec<PathBuf> = self.files.iter().map(|f| f.fullpath.clone()).collect();
        let old_index = self.path.join(KEY_INDEX_FILE);
        for (file, dest) in self.files.iter_mut().zip(copied) {
            file.fullpath = dest;
        }
        let old_root = std::mem::replace(&mut self.path, new_path);
        self.save_index()?;

        for p in old_paths {
            let _ = fs::remove_file(p);
        }
        let _ = fs::remove_file(old_index);
        debug!(from = %old_root.display(), to = %self.path.display(), "chunk relocated");
        Ok(())
    }
}

/// An ordered sequence of chunks with first-fit allocation
#[derive(Debug, Default)]
pub struct StorageHeap {
    chunks: Vec<StorageChunk>,
}

impl StorageHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backing directory with the given capacity
    pub fn add_chunk(&mut self, path: impl Into<PathBuf>, capacity: u64) -> Result<(), HeapError> {
        self.chunks.push(StorageChunk::open(path.into(), capacity)?);
        Ok(())
    }

    pub fn chunks(&self) -> &[StorageChunk] {
        &self.chunks
    }

    /// Largest single allocation any chunk can currently satisfy
    pub fn max_allocate_size(&self) -> u64 {
        self.chunks
            .iter()
            .map(StorageChunk::free_space)
            .max()
            .unwrap_or(0)
    }

    /// Reserve `size` bytes in the first chunk that fits and create the
    /// backing file. A non-zero uri may have at most one live allocation.
    pub fn allocate_file(&mut self, uri: Hash256, size: u64) -> Result<AllocatedFile, HeapError> {
        if !uri.is_zero() && self.get_file(&uri).is_some() {
            return Err(HeapError::AlreadyAllocated(uri));
        }
        let chunk = self
            .chunks
            .iter_mut()
            .find(|c| c.free_space() >= size)
            .ok_or(HeapError::CapacityExhausted { requested: size })?;
        chunk.allocate(uri, size)
    }

    /// Release the reservation for `uri` and unlink its file
    pub fn free_file(&mut self, uri: &Hash256) -> Result<(), HeapError> {
        for chunk in &mut self.chunks {
            if let Some(pos) = chunk.files.iter().position(|f| f.uri == *uri) {
                return chunk.release_at(pos);
            }
        }
        Err(HeapError::NotFound(*uri))
    }

    /// Release the reservation backing `path` (scratch files have no
    /// usable uri)
    pub fn free_file_at(&mut self, path: &Path) -> Result<(), HeapError> {
        for chunk in &mut self.chunks {
            if let Some(pos) = chunk.files.iter().position(|f| f.fullpath == path) {
                return chunk.release_at(pos);
            }
        }
        Err(HeapError::NotFoundPath(path.to_path_buf()))
    }

    /// Look up a live allocation by uri
    pub fn get_file(&self, uri: &Hash256) -> Option<AllocatedFile> {
        self.chunks
            .iter()
            .flat_map(|c| c.files.iter())
            .find(|f| f.uri == *uri)
            .cloned()
    }

    /// Attach decryption keys to an existing allocation
    pub fn set_decryption_keys(
        &mut self,
        uri: &Hash256,
        keys: DecryptionKeys,
    ) -> Result<(), HeapError> {
        for chunk in &mut self.chunks {
            if chunk.files.iter().any(|f| f.uri == *uri) {
                return chunk.set_keys(uri, keys);
            }
        }
        Err(HeapError::NotFound(*uri))
    }

    /// Relocate chunk `index` to a new directory, moving every live file
    pub fn move_chunk(&mut self, index: usize, new_path: impl Into<PathBuf>) -> Result<(), HeapError> {
        let chunk = self
            .chunks
            .get_mut(index)
            .ok_or(HeapError::UnknownChunk(index))?;
        chunk.relocate(new_path.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesKey;
    use tempfile::tempdir;

    fn uri(tag: &[u8]) -> Hash256 {
        Hash256::from_data(tag)
    }

    #[test]
    fn test_allocate_and_free() {
        let dir = tempdir().unwrap();
        let mut heap = StorageHeap::new();
        heap.add_chunk(dir.path(), 1000).unwrap();

        let file = heap.allocate_file(uri(b"a"), 600).unwrap();
        assert!(file.fullpath.exists());
        assert_eq!(fs::metadata(&file.fullpath).unwrap().len(), 600);
        assert_eq!(heap.max_allocate_size(), 400);

        heap.free_file(&uri(b"a")).unwrap();
        assert!(!file.fullpath.exists());
        assert_eq!(heap.max_allocate_size(), 1000);
    }

    #[test]
    fn test_capacity_exhausted() {
        let dir = tempdir().unwrap();
        let mut heap = StorageHeap::new();
        heap.add_chunk(dir.path(), 100).unwrap();

        heap.allocate_file(uri(b"a"), 80).unwrap();
        let err = heap.allocate_file(uri(b"b"), 50).unwrap_err();
        assert!(matches!(err, HeapError::CapacityExhausted { requested: 50 }));
    }

    #[test]
    fn test_first_fit_across_chunks() {
        let root = tempdir().unwrap();
        let mut heap = StorageHeap::new();
        heap.add_chunk(root.path().join("c0"), 100).unwrap();
        heap.add_chunk(root.path().join("c1"), 1000).unwrap();

        let big = heap.allocate_file(uri(b"big"), 500).unwrap();
        assert!(big.fullpath.starts_with(root.path().join("c1")));

        let small = heap.allocate_file(uri(b"small"), 50).unwrap();
        assert!(small.fullpath.starts_with(root.path().join("c0")));
    }

    #[test]
    fn test_duplicate_uri_rejected() {
        let dir = tempdir().unwrap();
        let mut heap = StorageHeap::new();
        heap.add_chunk(dir.path(), 1000).unwrap();

        heap.allocate_file(uri(b"a"), 10).unwrap();
        let err = heap.allocate_file(uri(b"a"), 10).unwrap_err();
        assert!(matches!(err, HeapError::AlreadyAllocated(_)));
    }

    #[test]
    fn test_scratch_files_get_unique_names() {
        let dir = tempdir().unwrap();
        let mut heap = StorageHeap::new();
        heap.add_chunk(dir.path(), 1000).unwrap();

        let s1 = heap.allocate_file(Hash256::ZERO, 10).unwrap();
        let s2 = heap.allocate_file(Hash256::ZERO, 10).unwrap();
        assert_ne!(s1.fullpath, s2.fullpath);
        assert_eq!(s1.fullpath.extension().unwrap().to_str(), Some(SCRATCH_EXT));

        heap.free_file_at(&s1.fullpath).unwrap();
        heap.free_file_at(&s2.fullpath).unwrap();
        assert_eq!(heap.max_allocate_size(), 1000);
    }

    #[test]
    fn test_zero_size_allocation() {
        let dir = tempdir().unwrap();
        let mut heap = StorageHeap::new();
        heap.add_chunk(dir.path(), 100).unwrap();

        let file = heap.allocate_file(uri(b"empty"), 0).unwrap();
        assert_eq!(fs::metadata(&file.fullpath).unwrap().len(), 0);
        assert_eq!(heap.max_allocate_size(), 100);
    }

    #[test]
    fn test_keys_survive_reopen() {
        let dir = tempdir().unwrap();
        let keys = DecryptionKeys {
            rsa_public_key: b"pem".to_vec(),
            aes_key: AesKey::from_bytes([3u8; 16]),
        };

        {
            let mut heap = StorageHeap::new();
            heap.add_chunk(dir.path(), 1000).unwrap();
            heap.allocate_file(uri(b"kept"), 64).unwrap();
            heap.set_decryption_keys(&uri(b"kept"), keys.clone()).unwrap();
        }

        let mut heap = StorageHeap::new();
        heap.add_chunk(dir.path(), 1000).unwrap();
        let file = heap.get_file(&uri(b"kept")).unwrap();
        assert_eq!(file.size, 64);
        assert_eq!(file.keys, Some(keys));
        assert_eq!(heap.max_allocate_size(), 1000 - 64);
    }

    #[test]
    fn test_move_chunk_relocates_files() {
        let root = tempdir().unwrap();
        let old = root.path().join("old");
        let new = root.path().join("new");

        let mut heap = StorageHeap::new();
        heap.add_chunk(&old, 1000).unwrap();
        let file = heap.allocate_file(uri(b"m"), 5).unwrap();
        fs::write(&file.fullpath, b"hello").unwrap();

        heap.move_chunk(0, &new).unwrap();

        let moved = heap.get_file(&uri(b"m")).unwrap();
        assert!(moved.fullpath.starts_with(&new));
        assert_eq!(fs::read(&moved.fullpath).unwrap(), b"hello");
        assert!(!file.fullpath.exists());
    }

    #[test]
    fn test_move_chunk_unknown_index() {
        let dir = tempdir().unwrap();
        let mut heap = StorageHeap::new();
        heap.add_chunk(dir.path(), 10).unwrap();
        assert!(matches!(
            heap.move_chunk(3, dir.path().join("x")),
            Err(HeapError::UnknownChunk(3))
        ));
    }
}
