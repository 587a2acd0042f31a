//! Conversions between nested tree objects and flat path maps
//!
//! Diff, merge and commit all work on a flat `path → (blob, mode)` map;
//! these helpers translate between that view and the canonical nested
//! [`Tree`] objects in the store.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::object::{ObjectId, ObjectKind, Tree, TreeEntry, MODE_DIR};
use crate::storage::ObjectStore;

/// A file as recorded in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry {
    pub id: ObjectId,
    pub mode: u32,
}

impl FileEntry {
    pub fn new(id: ObjectId, mode: u32) -> Self {
        Self { id, mode }
    }
}

/// Flat snapshot keyed by `/`-separated relative path
pub type FileMap = BTreeMap<String, FileEntry>;

/// Expand a tree object into a flat file map
pub fn flatten_tree(store: &dyn ObjectStore, tree_id: &ObjectId) -> Result<FileMap> {
    let mut files = FileMap::new();
    flatten_into(store, tree_id, "", &mut files)?;
    Ok(files)
}

fn flatten_into(
    store: &dyn ObjectStore,
    tree_id: &ObjectId,
    prefix: &str,
    files: &mut FileMap,
) -> Result<()> {
    let tree = store.read_tree(tree_id)?;
    for entry in tree.iter() {
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{}/{}", prefix, entry.name)
        };
        match entry.kind {
            ObjectKind::Tree => flatten_into(store, &entry.id, &path, files)?,
            ObjectKind::Blob => {
                files.insert(path, FileEntry::new(entry.id, entry.mode));
            }
            other => {
                return Err(Error::invalid(format!(
                    "tree {} holds a {} entry at '{}'",
                    tree_id.short(),
                    other,
                    path
                )));
            }
        }
    }
    Ok(())
}

#[derive(Default)]
struct DirNode {
    files: BTreeMap<String, FileEntry>,
    dirs: BTreeMap<String, DirNode>,
}

/// Write the nested tree objects for a flat file map and return the root
/// tree id. Equal maps always produce equal ids.
pub fn build_tree(store: &dyn ObjectStore, files: &FileMap) -> Result<ObjectId> {
    let mut root = DirNode::default();
    for (path, entry) in files {
        let mut parts: Vec<&str> = path.split('/').collect();
        let name = parts.pop().unwrap_or_default();
        if name.is_empty() || parts.iter().any(|p| p.is_empty()) {
            return Err(Error::invalid(format!("malformed path '{}'", path)));
        }
        let mut node = &mut root;
        for part in parts {
            node = node.dirs.entry(part.to_string()).or_default();
        }
        node.files.insert(name.to_string(), *entry);
    }
    write_dir(store, &root)
}

fn write_dir(store: &dyn ObjectStore, node: &DirNode) -> Result<ObjectId> {
    let mut tree = Tree::new();
    for (name, entry) in &node.files {
        tree.insert(TreeEntry::new(name.clone(), entry.id, ObjectKind::Blob, entry.mode));
    }
    for (name, child) in &node.dirs {
        if tree.get(name).is_some() {
            return Err(Error::invalid(format!("'{}' is both a file and a directory", name)));
        }
        let id = write_dir(store, child)?;
        tree.insert(TreeEntry::new(name.clone(), id, ObjectKind::Tree, MODE_DIR));
    }
    store.write_tree(&tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::MODE_FILE;
    use crate::storage::MemoryStore;

    fn file(store: &MemoryStore, content: &str) -> FileEntry {
        FileEntry::new(store.write_blob(content.as_bytes()).unwrap(), MODE_FILE)
    }

    #[test]
    fn test_build_and_flatten_roundtrip() {
        let store = MemoryStore::new();
        let mut files = FileMap::new();
        files.insert("README".into(), file(&store, "readme"));
        files.insert("src/lib.rs".into(), file(&store, "lib"));
        files.insert("src/util/mod.rs".into(), file(&store, "util"));

        let root = build_tree(&store, &files).unwrap();
        assert_eq!(flatten_tree(&store, &root).unwrap(), files);

        let top = store.read_tree(&root).unwrap();
        assert_eq!(top.get("src").unwrap().kind, ObjectKind::Tree);
    }

    #[test]
    fn test_identical_contents_identical_ids() {
        let store = MemoryStore::new();
        let mut a = FileMap::new();
        a.insert("x/1".into(), file(&store, "one"));
        a.insert("y".into(), file(&store, "two"));
        let mut b = FileMap::new();
        b.insert("y".into(), file(&store, "two"));
        b.insert("x/1".into(), file(&store, "one"));
        assert_eq!(build_tree(&store, &a).unwrap(), build_tree(&store, &b).unwrap());
    }

    #[test]
    fn test_file_directory_clash_rejected() {
        let store = MemoryStore::new();
        let mut files = FileMap::new();
        files.insert("a".into(), file(&store, "file"));
        files.insert("a/b".into(), file(&store, "nested"));
        assert!(matches!(build_tree(&store, &files), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_empty_map_is_empty_tree() {
        let store = MemoryStore::new();
        let root = build_tree(&store, &FileMap::new()).unwrap();
        assert!(store.read_tree(&root).unwrap().is_empty());
    }
}
