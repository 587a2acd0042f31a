//! Core object model for Tessera
//!
//! Implements content-addressable objects: Blob, Tree, Commit and Tag.
//! Every object is identified by the SHA-256 digest of its kind, its size
//! and its payload, so identical content always maps to the same id.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Regular file mode
pub const MODE_FILE: u32 = 0o100644;
/// Executable file mode
pub const MODE_EXECUTABLE: u32 = 0o100755;
/// Directory mode
pub const MODE_DIR: u32 = 0o040000;

/// Unique identifier for any stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert to hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form used in logs and graph output
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(10);
        hex
    }

    /// Parse from a full 64-character hexadecimal string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::invalid(format!("malformed hash '{}': {}", hex_str, e)))?;
        if bytes.len() != 32 {
            return Err(Error::invalid(format!(
                "malformed hash '{}': expected 64 hex characters",
                hex_str
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

/// Object type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
            ObjectKind::Tag => "tag",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            "tag" => Ok(ObjectKind::Tag),
            other => Err(Error::invalid(format!("unknown object kind '{}'", other))),
        }
    }
}

/// Header prepended to every payload before hashing and storage:
/// `"<kind> <size>\0"`.
fn header(kind: ObjectKind, size: usize) -> String {
    format!("{} {}\0", kind.as_str(), size)
}

/// Compute the id an object would have, without touching storage
pub fn hash_object(kind: ObjectKind, payload: &[u8]) -> ObjectId {
    let mut hasher = Sha256::new();
    hasher.update(header(kind, payload.len()).as_bytes());
    hasher.update(payload);
    ObjectId(hasher.finalize().into())
}

/// Encode an object into its canonical stored form (header + payload)
pub fn encode_object(kind: ObjectKind, payload: &[u8]) -> Vec<u8> {
    let header = header(kind, payload.len());
    let mut out = Vec::with_capacity(header.len() + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a stored object into kind and payload, validating the declared size
pub fn decode_object(data: &[u8]) -> Result<(ObjectKind, &[u8])> {
    let nul = data
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::Serialization("object header is not terminated".into()))?;
    let header = std::str::from_utf8(&data[..nul])
        .map_err(|_| Error::Serialization("object header is not UTF-8".into()))?;
    let (kind, size) = header
        .split_once(' ')
        .ok_or_else(|| Error::Serialization(format!("malformed object header '{}'", header)))?;
    let kind: ObjectKind = kind.parse()?;
    let size: usize = size
        .parse()
        .map_err(|_| Error::Serialization(format!("malformed object size '{}'", size)))?;
    let payload = &data[nul + 1..];
    if payload.len() != size {
        return Err(Error::Serialization(format!(
            "object declares {} bytes but holds {}",
            size,
            payload.len()
        )));
    }
    Ok((kind, payload))
}

/// An undecoded object as held by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub data: Bytes,
}

impl RawObject {
    pub fn new(kind: ObjectKind, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            id: hash_object(kind, &data),
            kind,
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Decode the payload into a typed object
    pub fn parse(&self) -> Result<Object> {
        Object::from_payload(self.kind, &self.data)
    }
}

/// File content object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    /// Raw content data
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Compute the object ID
    pub fn id(&self) -> ObjectId {
        hash_object(ObjectKind::Blob, &self.data)
    }

    /// Content as text, if it is valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Directory tree entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Name of the entry (a single path component)
    pub name: String,
    /// Object ID (points to Blob or Tree)
    pub id: ObjectId,
    /// Entry type
    pub kind: ObjectKind,
    /// File permissions (Unix mode)
    pub mode: u32,
}

impl TreeEntry {
    pub fn new(name: String, id: ObjectId, kind: ObjectKind, mode: u32) -> Self {
        Self {
            name,
            id,
            kind,
            mode,
        }
    }
}

/// Directory object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Sorted entries for deterministic hashing
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update an entry
    pub fn insert(&mut self, entry: TreeEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    /// Remove an entry
    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries.remove(name)
    }

    /// Get an entry
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in name order
    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.values()
    }

    /// Serialize to binary format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from binary format
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    /// Compute the object ID
    pub fn id(&self) -> Result<ObjectId> {
        Ok(hash_object(ObjectKind::Tree, &self.to_bytes()?))
    }
}

/// Commit object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Tree object ID for this commit
    pub tree_id: ObjectId,
    /// Parent commit IDs (empty for a root commit)
    pub parents: Vec<ObjectId>,
    /// Author name
    pub author: String,
    /// Committer name
    pub committer: String,
    /// Commit message
    pub message: String,
    /// Commit timestamp (Unix seconds)
    pub timestamp: i64,
    /// Timezone offset in minutes
    pub tz_offset: i32,
}

impl Commit {
    pub fn new(
        tree_id: ObjectId,
        parents: Vec<ObjectId>,
        author: String,
        message: String,
        timestamp: i64,
    ) -> Self {
        Self {
            tree_id,
            parents,
            committer: author.clone(),
            author,
            message,
            timestamp,
            tz_offset: 0,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn id(&self) -> Result<ObjectId> {
        Ok(hash_object(ObjectKind::Commit, &self.to_bytes()?))
    }

    /// First line of the message
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

/// Annotated tag object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub target: ObjectId,
    pub target_kind: ObjectKind,
    pub name: String,
    pub tagger: String,
    pub message: String,
    pub timestamp: i64,
}

impl Tag {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Generic object that can be any type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Blob),
    Tree(Tree),
    Commit(Commit),
    Tag(Tag),
}

impl Object {
    /// Get the object kind
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Blob(_) => ObjectKind::Blob,
            Object::Tree(_) => ObjectKind::Tree,
            Object::Commit(_) => ObjectKind::Commit,
            Object::Tag(_) => ObjectKind::Tag,
        }
    }

    /// Serialize the payload (without header)
    pub fn payload(&self) -> Result<Vec<u8>> {
        match self {
            Object::Blob(blob) => Ok(blob.data.clone()),
            Object::Tree(tree) => tree.to_bytes(),
            Object::Commit(commit) => commit.to_bytes(),
            Object::Tag(tag) => tag.to_bytes(),
        }
    }

    /// Get the object ID
    pub fn id(&self) -> Result<ObjectId> {
        Ok(hash_object(self.kind(), &self.payload()?))
    }

    /// Decode a payload of the given kind
    pub fn from_payload(kind: ObjectKind, payload: &[u8]) -> Result<Self> {
        Ok(match kind {
            ObjectKind::Blob => Object::Blob(Blob::new(payload.to_vec())),
            ObjectKind::Tree => Object::Tree(Tree::from_bytes(payload)?),
            ObjectKind::Commit => Object::Commit(Commit::from_bytes(payload)?),
            ObjectKind::Tag => Object::Tag(Tag::from_bytes(payload)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_roundtrip() {
        let id = ObjectId::new([42u8; 32]);
        let id2 = ObjectId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn test_from_hex_rejects_malformed() {
        assert!(matches!(ObjectId::from_hex("zz"), Err(Error::Invalid(_))));
        assert!(matches!(ObjectId::from_hex("abcd"), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_hash_depends_on_kind() {
        let blob = hash_object(ObjectKind::Blob, b"same");
        let tag = hash_object(ObjectKind::Tag, b"same");
        assert_ne!(blob, tag);
        assert_eq!(blob.to_hex().len(), 64);
    }

    #[test]
    fn test_encode_decode_object() {
        let encoded = encode_object(ObjectKind::Blob, b"hello world");
        let (kind, payload) = decode_object(&encoded).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(payload, b"hello world");
    }

    #[test]
    fn test_decode_rejects_size_mismatch() {
        let mut encoded = encode_object(ObjectKind::Blob, b"hello");
        encoded.push(b'!');
        assert!(decode_object(&encoded).is_err());
    }

    #[test]
    fn test_tree_is_canonical() {
        let a = TreeEntry::new("a.txt".into(), ObjectId::new([1u8; 32]), ObjectKind::Blob, MODE_FILE);
        let b = TreeEntry::new("b.txt".into(), ObjectId::new([2u8; 32]), ObjectKind::Blob, MODE_FILE);

        let mut first = Tree::new();
        first.insert(a.clone());
        first.insert(b.clone());

        let mut second = Tree::new();
        second.insert(b);
        second.insert(a);

        assert_eq!(first.id().unwrap(), second.id().unwrap());
    }

    #[test]
    fn test_commit_serialization() {
        let commit = Commit::new(
            ObjectId::new([1u8; 32]),
            vec![ObjectId::new([2u8; 32])],
            "Test Author".to_string(),
            "Test message\n\nbody".to_string(),
            1234567890,
        );
        let bytes = commit.to_bytes().unwrap();
        let commit2 = Commit::from_bytes(&bytes).unwrap();
        assert_eq!(commit, commit2);
        assert_eq!(commit2.summary(), "Test message");
        assert!(!commit2.is_merge());
    }

    #[test]
    fn test_raw_object_parse() {
        let tag = Tag {
            target: ObjectId::new([3u8; 32]),
            target_kind: ObjectKind::Commit,
            name: "v1.0".into(),
            tagger: "alice".into(),
            message: "release".into(),
            timestamp: 10,
        };
        let raw = RawObject::new(ObjectKind::Tag, tag.to_bytes().unwrap());
        assert_eq!(raw.parse().unwrap(), Object::Tag(tag));
    }
}
