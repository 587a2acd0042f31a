//! Object storage layer for Tessera
//!
//! Objects are content-addressed and append-only. The on-disk store keeps
//! every object zstd-compressed under a two-character fan-out directory and
//! verifies the digest of everything it reads back.

use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fsutil::atomic_write;
use crate::object::{
    decode_object, encode_object, hash_object, Blob, Commit, Object, ObjectId, ObjectKind,
    RawObject, Tag, Tree,
};

/// Generic object store interface
///
/// Implementations must be safe to read from several threads at once;
/// objects never change after they are written.
pub trait ObjectStore: Send + Sync {
    /// Persist an object and return its id. Writing identical content twice
    /// is a successful no-op.
    fn write_object(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId>;

    /// Read an object, verifying that its content still hashes to `id`
    fn read_object(&self, id: &ObjectId) -> Result<RawObject>;

    /// Check if an object exists
    fn has_object(&self, id: &ObjectId) -> Result<bool>;

    /// List every stored object id
    fn list_objects(&self) -> Result<Vec<ObjectId>>;

    /// Read and decode an object
    fn read_parsed(&self, id: &ObjectId) -> Result<Object> {
        self.read_object(id)?.parse()
    }

    fn read_blob(&self, id: &ObjectId) -> Result<Blob> {
        let raw = self.expect_kind(id, ObjectKind::Blob)?;
        Ok(Blob::new(raw.data.to_vec()))
    }

    fn read_tree(&self, id: &ObjectId) -> Result<Tree> {
        let raw = self.expect_kind(id, ObjectKind::Tree)?;
        Tree::from_bytes(&raw.data)
    }

    fn read_commit(&self, id: &ObjectId) -> Result<Commit> {
        let raw = self.expect_kind(id, ObjectKind::Commit)?;
        Commit::from_bytes(&raw.data)
    }

    fn read_tag(&self, id: &ObjectId) -> Result<Tag> {
        let raw = self.expect_kind(id, ObjectKind::Tag)?;
        Tag::from_bytes(&raw.data)
    }

    fn write_blob(&self, data: &[u8]) -> Result<ObjectId> {
        self.write_object(ObjectKind::Blob, data)
    }

    fn write_tree(&self, tree: &Tree) -> Result<ObjectId> {
        self.write_object(ObjectKind::Tree, &tree.to_bytes()?)
    }

    fn write_commit(&self, commit: &Commit) -> Result<ObjectId> {
        self.write_object(ObjectKind::Commit, &commit.to_bytes()?)
    }

    fn write_tag(&self, tag: &Tag) -> Result<ObjectId> {
        self.write_object(ObjectKind::Tag, &tag.to_bytes()?)
    }

    /// Read an object and check its kind
    fn expect_kind(&self, id: &ObjectId, kind: ObjectKind) -> Result<RawObject> {
        let raw = self.read_object(id)?;
        if raw.kind != kind {
            return Err(Error::invalid(format!(
                "object {} is a {}, expected a {}",
                id.short(),
                raw.kind,
                kind
            )));
        }
        Ok(raw)
    }
}

/// On-disk loose object store
///
/// Layout:
/// ```text
/// {root}/{hash[0..2]}/{hash[2..]}   zstd("<kind> <size>\0" + payload)
/// ```
pub struct LooseStore {
    root: PathBuf,
    compression_level: i32,
    /// Verified objects, most recently used first
    cache: Mutex<LruCache<ObjectId, RawObject>>,
}

impl LooseStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: &Path, compression_level: i32, cache_capacity: usize) -> Result<Self> {
        fs::create_dir_all(root)?;
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            root: root.to_path_buf(),
            compression_level,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn decode_verified(id: &ObjectId, compressed: &[u8]) -> Result<RawObject> {
        let corrupt = |detail: String| Error::Corrupt { id: *id, detail };

        let encoded = zstd::decode_all(compressed)
            .map_err(|e| corrupt(format!("decompression failed: {}", e)))?;
        let (kind, payload) =
            decode_object(&encoded).map_err(|e| corrupt(format!("bad header: {}", e)))?;
        let actual = hash_object(kind, payload);
        if actual != *id {
            return Err(corrupt(format!("content hashes to {}", actual)));
        }
        Ok(RawObject {
            id: actual,
            kind,
            data: Bytes::copy_from_slice(payload),
        })
    }
}

impl ObjectStore for LooseStore {
    fn write_object(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId> {
        let id = hash_object(kind, data);
        let path = self.object_path(&id);
        if path.exists() {
            return Ok(id); // Already stored (content-addressed = idempotent)
        }

        let compressed = zstd::encode_all(&encode_object(kind, data)[..], self.compression_level)?;
        atomic_write(&path, &compressed)?;
        tracing::debug!("Wrote {} {} ({} bytes)", kind, id.short(), data.len());
        Ok(id)
    }

    fn read_object(&self, id: &ObjectId) -> Result<RawObject> {
        if let Some(raw) = self.cache.lock().get(id) {
            return Ok(raw.clone());
        }

        let path = self.object_path(id);
        let compressed = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("object {}", id)));
            }
            Err(e) => return Err(e.into()),
        };

        let raw = Self::decode_verified(id, &compressed).inspect_err(|e| {
            tracing::warn!("Refusing to return object {}: {}", id.short(), e);
        })?;
        self.cache.lock().put(*id, raw.clone());
        Ok(raw)
    }

    fn has_object(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.object_path(id).exists())
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for fan in fs::read_dir(&self.root)? {
            let fan = fan?;
            let prefix = fan.file_name().to_string_lossy().into_owned();
            if prefix.len() != 2 || !fan.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(fan.path())? {
                let rest = entry?.file_name().to_string_lossy().into_owned();
                // Skip in-flight temp files
                if let Ok(id) = ObjectId::from_hex(&format!("{}{}", prefix, rest)) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-memory object store, used by tests and embedders that need no
/// persistence
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<ObjectId, RawObject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for MemoryStore {
    fn write_object(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId> {
        let raw = RawObject::new(kind, Bytes::copy_from_slice(data));
        let id = raw.id;
        self.objects.write().entry(id).or_insert(raw);
        Ok(id)
    }

    fn read_object(&self, id: &ObjectId) -> Result<RawObject> {
        self.objects
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("object {}", id)))
    }

    fn has_object(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.objects.read().contains_key(id))
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        let mut ids: Vec<ObjectId> = self.objects.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

/// Outcome of a full-store integrity check
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub verified: usize,
    pub corrupt: Vec<ObjectId>,
}

impl VerifyReport {
    pub fn is_healthy(&self) -> bool {
        self.corrupt.is_empty()
    }
}

/// Re-read every object in the store and collect the ones that fail
/// verification
pub fn verify_store(store: &dyn ObjectStore) -> Result<VerifyReport> {
    let mut report = VerifyReport::default();
    for id in store.list_objects()? {
        match store.read_object(&id) {
            Ok(_) => report.verified += 1,
            Err(Error::Corrupt { .. }) => report.corrupt.push(id),
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{TreeEntry, MODE_FILE};
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> LooseStore {
        LooseStore::open(&dir.path().join("objects"), 3, 16).unwrap()
    }

    #[test]
    fn test_write_read_roundtrip_all_kinds() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        let blob_id = store.write_blob(b"hello world").unwrap();
        let mut tree = Tree::new();
        tree.insert(TreeEntry::new("hello.txt".into(), blob_id, ObjectKind::Blob, MODE_FILE));
        let tree_id = store.write_tree(&tree).unwrap();
        let commit = Commit::new(tree_id, vec![], "alice".into(), "init".into(), 1);
        let commit_id = store.write_commit(&commit).unwrap();
        let tag = Tag {
            target: commit_id,
            target_kind: ObjectKind::Commit,
            name: "v1".into(),
            tagger: "alice".into(),
            message: "first".into(),
            timestamp: 2,
        };
        let tag_id = store.write_tag(&tag).unwrap();

        assert_eq!(store.read_blob(&blob_id).unwrap().data, b"hello world");
        assert_eq!(store.read_tree(&tree_id).unwrap(), tree);
        assert_eq!(store.read_commit(&commit_id).unwrap(), commit);
        assert_eq!(store.read_tag(&tag_id).unwrap(), tag);
    }

    #[test]
    fn test_write_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let a = store.write_blob(b"same content").unwrap();
        let b = store.write_blob(b"same content").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list_objects().unwrap(), vec![a]);
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = hash_object(ObjectKind::Blob, b"never written");
        assert!(matches!(store.read_object(&id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_objects_are_compressed_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let data = vec![b'A'; 10_000];
        let id = store.write_blob(&data).unwrap();
        let on_disk = fs::metadata(store.object_path(&id)).unwrap().len();
        assert!(on_disk < 1_000);
    }

    #[test]
    fn test_corrupt_object_is_detected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.write_blob(b"original").unwrap();

        // Replace the file with a different, well-formed object
        let forged = zstd::encode_all(&encode_object(ObjectKind::Blob, b"tampered")[..], 3).unwrap();
        fs::write(store.object_path(&id), forged).unwrap();

        let fresh = open_store(&dir);
        assert!(matches!(fresh.read_object(&id), Err(Error::Corrupt { .. })));

        let report = verify_store(&fresh).unwrap();
        assert_eq!(report.corrupt, vec![id]);
        assert!(!report.is_healthy());
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let id = store.write_blob(b"content").unwrap();
        fs::write(store.object_path(&id), b"not zstd at all").unwrap();
        let fresh = open_store(&dir);
        assert!(matches!(fresh.read_object(&id), Err(Error::Corrupt { .. })));
    }

    #[test]
    fn test_kind_mismatch_is_invalid() {
        let store = MemoryStore::new();
        let id = store.write_blob(b"not a tree").unwrap();
        assert!(matches!(store.read_tree(&id), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_memory_store_dedup() {
        let store = MemoryStore::new();
        store.write_blob(b"x").unwrap();
        store.write_blob(b"x").unwrap();
        assert_eq!(store.len(), 1);
    }
}
