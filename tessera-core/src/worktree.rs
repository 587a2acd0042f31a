//! Work-tree access: scanning, hashing and materializing snapshots

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::fsutil::atomic_write;
use crate::object::{hash_object, ObjectKind, MODE_EXECUTABLE, MODE_FILE};
use crate::storage::ObjectStore;
use crate::tree::{FileEntry, FileMap};

/// Store directory name inside the work tree
pub const STORE_DIR: &str = ".tessera";

#[derive(Debug, Clone)]
pub struct WorkTree {
    root: PathBuf,
    ignore: Vec<String>,
}

impl WorkTree {
    pub fn new(root: &Path, ignore: Vec<String>) -> Self {
        Self {
            root: root.to_path_buf(),
            ignore,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn abs(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn is_ignored(&self, rel: &str) -> bool {
        rel.split('/').next() == Some(STORE_DIR)
            || self.ignore.iter().any(|pattern| {
                rel == pattern
                    || rel.starts_with(&format!("{}/", pattern))
                    || rel.split('/').any(|part| part == pattern)
            })
    }

    /// Normalize a user-supplied path to a `/`-separated path relative to
    /// the work tree. The root itself is `""`.
    pub fn rel_path(&self, path: &Path) -> Result<String> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let stripped = joined
            .strip_prefix(&self.root)
            .map_err(|_| Error::invalid(format!("'{}' is outside the work tree", path.display())))?;

        let mut parts: Vec<String> = Vec::new();
        for component in stripped.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(Error::invalid(format!(
                            "'{}' is outside the work tree",
                            path.display()
                        )));
                    }
                }
                _ => return Err(Error::invalid(format!("unsupported path '{}'", path.display()))),
            }
        }
        let rel = parts.join("/");
        if rel.split('/').next() == Some(STORE_DIR) {
            return Err(Error::invalid(format!("'{}' is inside the repository store", path.display())));
        }
        Ok(rel)
    }

    /// Relative paths of the files under `prefix` (`""` for everything)
    pub fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let start = self.abs(prefix);
        if !start.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        let walker = WalkDir::new(&start).sort_by_file_name().into_iter().filter_entry(|e| {
            e.path()
                .strip_prefix(&self.root)
                .map(|rel| rel.as_os_str().is_empty() || !self.is_ignored(&to_slash(rel)))
                .unwrap_or(false)
        });
        for entry in walker {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                files.push(to_slash(rel));
            }
        }
        Ok(files)
    }

    /// Content and mode of a file, `None` if it does not exist. A path
    /// below an existing file does not exist either.
    pub fn read(&self, rel: &str) -> Result<Option<(Vec<u8>, u32)>> {
        let path = self.abs(rel);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_file() {
            return Ok(None);
        }
        Ok(Some((fs::read(&path)?, file_mode(&meta))))
    }

    /// Hash a file without storing it
    pub fn hash_file(&self, rel: &str) -> Result<Option<FileEntry>> {
        Ok(self
            .read(rel)?
            .map(|(data, mode)| FileEntry::new(hash_object(ObjectKind::Blob, &data), mode)))
    }

    /// Hashes of every file in the work tree
    pub fn snapshot(&self) -> Result<FileMap> {
        let mut files = FileMap::new();
        for rel in self.scan("")? {
            if let Some(entry) = self.hash_file(&rel)? {
                files.insert(rel, entry);
            }
        }
        Ok(files)
    }

    pub fn write_file(&self, rel: &str, data: &[u8], mode: u32) -> Result<()> {
        let path = self.abs(rel);
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        }
        atomic_write(&path, data)?;
        set_mode(&path, mode)
    }

    /// Remove a file and any directories it leaves empty
    pub fn remove_file(&self, rel: &str) -> Result<()> {
        let path = self.abs(rel);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
        Ok(())
    }

    /// Fail if any path that differs between `current` and `target` has
    /// local edits that switching would overwrite
    pub fn check_clean(&self, current: &FileMap, target: &FileMap) -> Result<()> {
        for (path, expected) in changed_paths(current, target) {
            let on_disk = self.hash_file(path)?.map(|e| e.id);
            if on_disk != expected.map(|e| e.id) {
                return Err(Error::invalid(format!(
                    "local changes to '{}' would be overwritten",
                    path
                )));
            }
        }
        Ok(())
    }

    /// Rewrite the files that differ between `current` and `target`.
    /// Returns the number of paths touched.
    pub fn materialize(&self, store: &dyn ObjectStore, current: &FileMap, target: &FileMap) -> Result<usize> {
        let mut touched = 0;
        for (path, _) in changed_paths(current, target) {
            match target.get(path) {
                Some(entry) => {
                    let blob = store.read_blob(&entry.id)?;
                    self.write_file(path, &blob.data, entry.mode)?;
                }
                None => self.remove_file(path)?,
            }
            touched += 1;
        }
        tracing::debug!("Materialized {} path(s) in {}", touched, self.root.display());
        Ok(touched)
    }
}

/// Paths whose entry differs between the maps, with the `current` entry
fn changed_paths<'a>(current: &'a FileMap, target: &'a FileMap) -> BTreeMap<&'a str, Option<&'a FileEntry>> {
    let mut out = BTreeMap::new();
    for (path, entry) in current {
        if target.get(path) != Some(entry) {
            out.insert(path.as_str(), Some(entry));
        }
    }
    for path in target.keys() {
        if !current.contains_key(path) {
            out.insert(path.as_str(), None);
        }
    }
    out
}

fn to_slash(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        MODE_EXECUTABLE
    } else {
        MODE_FILE
    }
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    MODE_FILE
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = if mode == MODE_EXECUTABLE { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(perms))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_rel_path_normalization() {
        let dir = tempfile::tempdir().unwrap();
        let wt = WorkTree::new(dir.path(), vec![]);
        assert_eq!(wt.rel_path(Path::new("a/./b/../c.txt")).unwrap(), "a/c.txt");
        assert_eq!(wt.rel_path(&dir.path().join("x")).unwrap(), "x");
        assert_eq!(wt.rel_path(Path::new(".")).unwrap(), "");
        assert!(wt.rel_path(Path::new("../escape")).is_err());
        assert!(wt.rel_path(Path::new(".tessera/HEAD")).is_err());
    }

    #[test]
    fn test_scan_skips_store_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let wt = WorkTree::new(dir.path(), vec!["target".into()]);
        wt.write_file("src/main.rs", b"fn main() {}", MODE_FILE).unwrap();
        wt.write_file("target/debug/out", b"bin", MODE_FILE).unwrap();
        wt.write_file(".tessera/HEAD", b"ref: refs/heads/main", MODE_FILE).unwrap();
        wt.write_file("README", b"hi", MODE_FILE).unwrap();

        assert_eq!(wt.scan("").unwrap(), vec!["README", "src/main.rs"]);
        assert_eq!(wt.scan("src").unwrap(), vec!["src/main.rs"]);
    }

    #[test]
    fn test_materialize_and_clean_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let wt = WorkTree::new(dir.path(), vec![]);

        let a = store.write_blob(b"one\n").unwrap();
        let b = store.write_blob(b"two\n").unwrap();
        let mut current = FileMap::new();
        current.insert("keep".into(), FileEntry::new(a, MODE_FILE));
        current.insert("dir/old".into(), FileEntry::new(a, MODE_FILE));
        wt.materialize(&store, &FileMap::new(), &current).unwrap();

        let mut target = FileMap::new();
        target.insert("keep".into(), FileEntry::new(a, MODE_FILE));
        target.insert("new".into(), FileEntry::new(b, MODE_FILE));

        wt.check_clean(&current, &target).unwrap();
        assert_eq!(wt.materialize(&store, &current, &target).unwrap(), 2);
        assert!(!dir.path().join("dir").exists());
        assert_eq!(fs::read(dir.path().join("new")).unwrap(), b"two\n");
        assert_eq!(wt.snapshot().unwrap(), target);

        // A local edit blocks switching back
        fs::write(dir.path().join("new"), b"edited\n").unwrap();
        assert!(matches!(wt.check_clean(&target, &current), Err(Error::Invalid(_))));
    }
}
