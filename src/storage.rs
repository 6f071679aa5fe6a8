//! Content-addressed blob storage
//!
//! Things are immutable byte strings keyed by their BLAKE3 hash, capped
//! at 500 MiB. The backend seam has two implementations: a filesystem
//! layout (`<root>/content/<hex[0:2]>/<hex>`, metadata beside it) and an
//! in-memory store for tests. Integrity is always verifiable: full-blob
//! hashing, plus a Merkle tree over 64 KiB chunks for range proofs.

use hashbrown::HashMap;
use std::path::PathBuf;

use crate::common::{constants, ContentHash, Hash256};
use crate::crypto::{blake3_hash, blake3_hash_parts};
use crate::error::{Error, Result};

/// Merkle chunk size (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Backend seam for blob + metadata storage
pub trait ContentBackend: Send {
    fn put_content(&mut self, hash: &ContentHash, data: &[u8]) -> Result<()>;
    fn get_content(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>>;
    fn has_content(&self, hash: &ContentHash) -> bool;
    fn delete_content(&mut self, hash: &ContentHash) -> Result<bool>;

    fn put_metadata(&mut self, key: &str, value: &[u8]) -> Result<()>;
    fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn delete_metadata(&mut self, key: &str) -> Result<bool>;

    fn list_content(&self) -> Vec<ContentHash>;
    fn total_size(&self) -> u64;
    fn item_count(&self) -> usize;
}

/// Filesystem backend: blobs under `content/<hex[0:2]>/<hex>`, metadata
/// values under `metadata/<sanitized_key>`
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(root.join("content"))?;
        std::fs::create_dir_all(root.join("metadata"))?;
        Ok(Self { root })
    }

    fn content_path(&self, hash: &ContentHash) -> PathBuf {
        let hex_str = hash.to_hex();
        self.root.join("content").join(&hex_str[0..2]).join(hex_str)
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join("metadata").join(sanitized)
    }
}

impl ContentBackend for FsBackend {
    fn put_content(&mut self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        let path = self.content_path(hash);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, data)
            .map_err(|e| Error::StorageWrite(format!("{}: {e}", path.display())))
    }

    fn get_content(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let path = self.content_path(hash);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read(&path)
            .map(Some)
            .map_err(|e| Error::StorageRead(format!("{}: {e}", path.display())))
    }

    fn has_content(&self, hash: &ContentHash) -> bool {
        self.content_path(hash).exists()
    }

    fn delete_content(&mut self, hash: &ContentHash) -> Result<bool> {
        let path = self.content_path(hash);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        Ok(true)
    }

    fn put_metadata(&mut self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.metadata_path(key);
        std::fs::write(&path, value)
            .map_err(|e| Error::StorageWrite(format!("{}: {e}", path.display())))
    }

    fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.metadata_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read(&path)?))
    }

    fn delete_metadata(&mut self, key: &str) -> Result<bool> {
        let path = self.metadata_path(key);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        Ok(true)
    }

    fn list_content(&self) -> Vec<ContentHash> {
        let mut hashes = Vec::new();
        let content_dir = self.root.join("content");
        let Ok(shards) = std::fs::read_dir(&content_dir) else {
            return hashes;
        };
        for shard in shards.flatten() {
            let Ok(entries) = std::fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(hash) = ContentHash::from_hex(name) {
                        hashes.push(hash);
                    }
                }
            }
        }
        hashes
    }

    fn total_size(&self) -> u64 {
        self.list_content()
            .iter()
            .filter_map(|h| std::fs::metadata(self.content_path(h)).ok())
            .map(|m| m.len())
            .sum()
    }

    fn item_count(&self) -> usize {
        self.list_content().len()
    }
}

/// In-memory backend for tests and ephemeral nodes
#[derive(Default)]
pub struct MemoryBackend {
    content: HashMap<ContentHash, Vec<u8>>,
    metadata: HashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentBackend for MemoryBackend {
    fn put_content(&mut self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        self.content.insert(*hash, data.to_vec());
        Ok(())
    }

    fn get_content(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        Ok(self.content.get(hash).cloned())
    }

    fn has_content(&self, hash: &ContentHash) -> bool {
        self.content.contains_key(hash)
    }

    fn delete_content(&mut self, hash: &ContentHash) -> Result<bool> {
        Ok(self.content.remove(hash).is_some())
    }

    fn put_metadata(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.metadata.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(key).cloned())
    }

    fn delete_metadata(&mut self, key: &str) -> Result<bool> {
        Ok(self.metadata.remove(key).is_some())
    }

    fn list_content(&self) -> Vec<ContentHash> {
        self.content.keys().copied().collect()
    }

    fn total_size(&self) -> u64 {
        self.content.values().map(|v| v.len() as u64).sum()
    }

    fn item_count(&self) -> usize {
        self.content.len()
    }
}

/// Result of an integrity check
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub expected_hash: Hash256,
    pub actual_hash: Hash256,
    pub content_size: usize,
}

/// Recompute BLAKE3 and compare with the expected content hash
pub fn verify_content(content: &[u8], expected: &ContentHash) -> IntegrityReport {
    let actual = blake3_hash(content);
    IntegrityReport {
        is_valid: actual == *expected.as_bytes(),
        expected_hash: *expected.as_bytes(),
        actual_hash: actual,
        content_size: content.len(),
    }
}

/// Merkle tree over fixed-size chunks.
///
/// Leaves are BLAKE3 hashes of each chunk; interior nodes hash the
/// concatenation of their children, with an odd trailing node promoted.
/// For a single-chunk Thing the root equals the content hash.
#[derive(Debug, Clone, PartialEq)]
pub struct MerkleTree {
    pub root: Hash256,
    pub chunk_hashes: Vec<Hash256>,
    pub chunk_size: usize,
    pub content_size: usize,
}

impl MerkleTree {
    pub fn build(content: &[u8], chunk_size: usize) -> Self {
        let chunk_hashes: Vec<Hash256> = if content.is_empty() {
            vec![blake3_hash(&[])]
        } else {
            content.chunks(chunk_size).map(blake3_hash).collect()
        };
        let root = Self::fold(&chunk_hashes);
        Self {
            root,
            chunk_hashes,
            chunk_size,
            content_size: content.len(),
        }
    }

    fn fold(level: &[Hash256]) -> Hash256 {
        if level.len() == 1 {
            return level[0];
        }
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                next.push(blake3_hash_parts(&[&pair[0], &pair[1]]));
            } else {
                next.push(pair[0]);
            }
        }
        Self::fold(&next)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_hashes.len()
    }

    /// Verify one chunk against its leaf hash
    pub fn verify_chunk(&self, index: usize, chunk: &[u8]) -> bool {
        self.chunk_hashes
            .get(index)
            .map(|expected| blake3_hash(chunk) == *expected)
            .unwrap_or(false)
    }

    /// Sibling path from a leaf to the root
    pub fn proof(&self, index: usize) -> Option<Vec<Hash256>> {
        if index >= self.chunk_hashes.len() {
            return None;
        }
        let mut proof = Vec::new();
        let mut level = self.chunk_hashes.clone();
        let mut position = index;
        while level.len() > 1 {
            let sibling = if position % 2 == 0 { position + 1 } else { position - 1 };
            if sibling < level.len() {
                proof.push(level[sibling]);
            }
            let mut next = Vec::with_capacity(level.len() / 2 + 1);
            for pair in level.chunks(2) {
                if pair.len() == 2 {
                    next.push(blake3_hash_parts(&[&pair[0], &pair[1]]));
                } else {
                    next.push(pair[0]);
                }
            }
            level = next;
            position /= 2;
        }
        Some(proof)
    }

    /// Replay a proof path against the root
    pub fn verify_proof(
        root: &Hash256,
        chunk: &[u8],
        index: usize,
        leaf_count: usize,
        proof: &[Hash256],
    ) -> bool {
        let mut hash = blake3_hash(chunk);
        let mut position = index;
        let mut level_len = leaf_count;
        let mut proof_iter = proof.iter();
        while level_len > 1 {
            let sibling = if position % 2 == 0 { position + 1 } else { position - 1 };
            if sibling < level_len {
                let Some(sibling_hash) = proof_iter.next() else {
                    return false;
                };
                hash = if position % 2 == 0 {
                    blake3_hash_parts(&[&hash, sibling_hash])
                } else {
                    blake3_hash_parts(&[sibling_hash, &hash])
                };
            }
            position /= 2;
            level_len = level_len / 2 + level_len % 2;
        }
        proof_iter.next().is_none() && hash == *root
    }
}

/// The content store: size gate, integrity, metadata, chunking
pub struct ContentStore {
    backend: Box<dyn ContentBackend>,
}

impl ContentStore {
    pub fn new(backend: Box<dyn ContentBackend>) -> Self {
        Self { backend }
    }

    /// Store a blob under its own hash. Rejects blobs over the size cap.
    pub fn put(&mut self, data: &[u8]) -> Result<ContentHash> {
        if data.len() > constants::MAX_THING_SIZE {
            return Err(Error::ThingSizeLimitExceeded {
                size: data.len(),
                limit: constants::MAX_THING_SIZE,
            });
        }
        let hash = ContentHash::of(data);
        self.backend.put_content(&hash, data)?;

        // Multi-chunk Things bind their Merkle root in metadata so range
        // proofs survive without re-reading the blob
        let tree = MerkleTree::build(data, CHUNK_SIZE);
        if tree.chunk_count() > 1 {
            self.backend
                .put_metadata(&format!("merkle:{}", hash.to_hex()), &tree.root)?;
        }
        log::debug!("stored thing {hash:?} ({} bytes)", data.len());
        Ok(hash)
    }

    /// Store a blob that must hash to `expected`
    pub fn put_verified(&mut self, expected: &ContentHash, data: &[u8]) -> Result<()> {
        if !verify_content(data, expected).is_valid {
            return Err(Error::ThingInvalidHash);
        }
        let stored = self.put(data)?;
        debug_assert_eq!(stored, *expected);
        Ok(())
    }

    pub fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        self.backend.get_content(hash)
    }

    /// Fetch and integrity-check in one step
    pub fn get_verified(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let data = self
            .backend
            .get_content(hash)?
            .ok_or_else(|| Error::ThingNotFound(hash.to_hex()))?;
        if !verify_content(&data, hash).is_valid {
            return Err(Error::StorageCorrupted(hash.to_hex()));
        }
        Ok(data)
    }

    pub fn has(&self, hash: &ContentHash) -> bool {
        self.backend.has_content(hash)
    }

    pub fn delete(&mut self, hash: &ContentHash) -> Result<bool> {
        let _ = self
            .backend
            .delete_metadata(&format!("merkle:{}", hash.to_hex()));
        self.backend.delete_content(hash)
    }

    pub fn merkle_root(&self, hash: &ContentHash) -> Result<Option<Hash256>> {
        Ok(self
            .backend
            .get_metadata(&format!("merkle:{}", hash.to_hex()))?
            .and_then(|v| v.try_into().ok()))
    }

    pub fn put_metadata(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.backend.put_metadata(key, value)
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.backend.get_metadata(key)
    }

    pub fn list(&self) -> Vec<ContentHash> {
        self.backend.list_content()
    }

    pub fn total_size(&self) -> u64 {
        self.backend.total_size()
    }

    pub fn item_count(&self) -> usize {
        self.backend.item_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> ContentStore {
        ContentStore::new(Box::new(MemoryBackend::new()))
    }

    #[test]
    fn test_put_get_round_trip() {
        let mut store = memory_store();
        let data = b"hello cashew";
        let hash = store.put(data).unwrap();

        assert_eq!(hash, ContentHash::of(data));
        assert!(store.has(&hash));
        assert_eq!(store.get(&hash).unwrap().unwrap(), data);
        assert_eq!(store.get_verified(&hash).unwrap(), data);
    }

    #[test]
    fn test_size_cap_enforced() {
        let mut store = memory_store();
        let result = store.put(&vec![0u8; constants::MAX_THING_SIZE + 1]);
        assert!(matches!(
            result,
            Err(Error::ThingSizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_put_verified_rejects_mismatch() {
        let mut store = memory_store();
        let wrong = ContentHash::of(b"other");
        assert!(store.put_verified(&wrong, b"data").is_err());
        assert!(store.put_verified(&ContentHash::of(b"data"), b"data").is_ok());
    }

    #[test]
    fn test_get_missing_returns_none() {
        let store = memory_store();
        assert_eq!(store.get(&ContentHash([9; 32])).unwrap(), None);
        assert!(store.get_verified(&ContentHash([9; 32])).is_err());
    }

    #[test]
    fn test_delete() {
        let mut store = memory_store();
        let hash = store.put(b"to delete").unwrap();
        assert!(store.delete(&hash).unwrap());
        assert!(!store.has(&hash));
        assert!(!store.delete(&hash).unwrap());
    }

    #[test]
    fn test_metadata_round_trip() {
        let mut store = memory_store();
        store.put_metadata("thing:name", b"demo").unwrap();
        assert_eq!(store.get_metadata("thing:name").unwrap().unwrap(), b"demo");
        assert_eq!(store.get_metadata("missing").unwrap(), None);
    }

    #[test]
    fn test_fs_backend_layout_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = FsBackend::new(dir.path().to_path_buf()).unwrap();

        let data = b"on disk";
        let hash = ContentHash::of(data);
        backend.put_content(&hash, data).unwrap();

        // Shard directory is the first two hex characters
        let hex_str = hash.to_hex();
        let expected = dir
            .path()
            .join("content")
            .join(&hex_str[0..2])
            .join(&hex_str);
        assert!(expected.exists());

        assert_eq!(backend.get_content(&hash).unwrap().unwrap(), data);
        assert_eq!(backend.list_content(), vec![hash]);
        assert_eq!(backend.total_size(), data.len() as u64);

        backend.put_metadata("some/key with spaces", b"v").unwrap();
        assert_eq!(
            backend.get_metadata("some/key with spaces").unwrap().unwrap(),
            b"v"
        );

        assert!(backend.delete_content(&hash).unwrap());
        assert_eq!(backend.item_count(), 0);
    }

    #[test]
    fn test_integrity_report() {
        let report = verify_content(b"payload", &ContentHash::of(b"payload"));
        assert!(report.is_valid);
        assert_eq!(report.content_size, 7);

        let report = verify_content(b"payload", &ContentHash::of(b"other"));
        assert!(!report.is_valid);
        assert_ne!(report.expected_hash, report.actual_hash);
    }

    #[test]
    fn test_merkle_single_chunk_root_is_content_hash() {
        let data = b"small thing";
        let tree = MerkleTree::build(data, CHUNK_SIZE);
        assert_eq!(tree.chunk_count(), 1);
        assert_eq!(tree.root, *ContentHash::of(data).as_bytes());
    }

    #[test]
    fn test_merkle_multi_chunk() {
        // 5 chunks of 4 bytes
        let data = b"aaaabbbbccccddddeeee";
        let tree = MerkleTree::build(data, 4);
        assert_eq!(tree.chunk_count(), 5);
        assert_ne!(tree.root, *ContentHash::of(data).as_bytes());

        assert!(tree.verify_chunk(0, b"aaaa"));
        assert!(tree.verify_chunk(4, b"eeee"));
        assert!(!tree.verify_chunk(0, b"bbbb"));
        assert!(!tree.verify_chunk(9, b"aaaa"));
    }

    #[test]
    fn test_merkle_proofs() {
        let data = b"aaaabbbbccccddddeeee";
        let tree = MerkleTree::build(data, 4);

        for (index, chunk) in data.chunks(4).enumerate() {
            let proof = tree.proof(index).unwrap();
            assert!(
                MerkleTree::verify_proof(&tree.root, chunk, index, 5, &proof),
                "proof for chunk {index} must verify"
            );
            // A wrong chunk fails the same proof
            assert!(!MerkleTree::verify_proof(&tree.root, b"zzzz", index, 5, &proof));
        }
        assert!(tree.proof(5).is_none());
    }

    #[test]
    fn test_merkle_determinism() {
        let data = vec![0x5Au8; CHUNK_SIZE * 3 + 17];
        let a = MerkleTree::build(&data, CHUNK_SIZE);
        let b = MerkleTree::build(&data, CHUNK_SIZE);
        assert_eq!(a, b);
    }

    #[test]
    fn test_store_binds_merkle_root_for_large_things() {
        let mut store = memory_store();
        let small_hash = store.put(b"tiny").unwrap();
        assert_eq!(store.merkle_root(&small_hash).unwrap(), None);

        let big = vec![7u8; CHUNK_SIZE * 2 + 5];
        let big_hash = store.put(&big).unwrap();
        let root = store.merkle_root(&big_hash).unwrap().unwrap();
        assert_eq!(root, MerkleTree::build(&big, CHUNK_SIZE).root);
    }
}
