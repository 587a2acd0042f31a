//! Branches, tags and HEAD
//!
//! Each ref is a text file under `<store>/refs/` holding a commit id in hex.
//! `HEAD` holds either `ref: refs/heads/<name>` or a bare id when detached.
//! Writers are expected to hold the repository lock.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fsutil::{atomic_write, read_trimmed};
use crate::object::ObjectId;

pub const HEAD_FILE: &str = "HEAD";
pub const HEADS_PREFIX: &str = "refs/heads/";
pub const TAGS_PREFIX: &str = "refs/tags/";

/// Where HEAD points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    /// On a branch (short name), which may not have commits yet
    Attached(String),
    Detached(ObjectId),
}

impl Head {
    pub fn branch(&self) -> Option<&str> {
        match self {
            Head::Attached(name) => Some(name),
            Head::Detached(_) => None,
        }
    }
}

pub fn branch_ref(name: &str) -> String {
    format!("{}{}", HEADS_PREFIX, name)
}

pub fn tag_ref(name: &str) -> String {
    format!("{}{}", TAGS_PREFIX, name)
}

/// Reject names that cannot be used for a branch or tag
pub fn validate_ref_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("ref name is empty"));
    }
    let bad_char = name
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    let bad_component = name
        .split('/')
        .any(|part| part.is_empty() || part.starts_with('.') || part.ends_with(".lock"));
    if bad_char || bad_component || name.contains("..") || name == "HEAD" {
        return Err(Error::invalid(format!("invalid ref name '{}'", name)));
    }
    Ok(())
}

/// File-backed ref storage rooted at the store directory
#[derive(Debug, Clone)]
pub struct RefStore {
    root: PathBuf,
}

impl RefStore {
    pub fn new(store_dir: &Path) -> Self {
        Self {
            root: store_dir.to_path_buf(),
        }
    }

    fn path(&self, full_name: &str) -> PathBuf {
        self.root.join(full_name)
    }

    pub fn read_head(&self) -> Result<Head> {
        let content = read_trimmed(&self.path(HEAD_FILE))?
            .ok_or_else(|| Error::not_found("HEAD"))?;
        match content.strip_prefix("ref: ") {
            Some(target) => {
                let name = target
                    .strip_prefix(HEADS_PREFIX)
                    .ok_or_else(|| Error::invalid(format!("HEAD points outside refs/heads: {}", target)))?;
                Ok(Head::Attached(name.to_string()))
            }
            None => Ok(Head::Detached(ObjectId::from_hex(&content)?)),
        }
    }

    pub fn write_head(&self, head: &Head) -> Result<()> {
        let content = match head {
            Head::Attached(name) => format!("ref: {}\n", branch_ref(name)),
            Head::Detached(id) => format!("{}\n", id),
        };
        atomic_write(&self.path(HEAD_FILE), content.as_bytes())
    }

    /// Commit HEAD resolves to; `None` on a branch without commits
    pub fn head_commit(&self) -> Result<Option<ObjectId>> {
        match self.read_head()? {
            Head::Attached(name) => self.read_ref(&branch_ref(&name)),
            Head::Detached(id) => Ok(Some(id)),
        }
    }

    /// Read a ref by full name (`refs/heads/main`)
    pub fn read_ref(&self, full_name: &str) -> Result<Option<ObjectId>> {
        match read_trimmed(&self.path(full_name))? {
            Some(hex) => ObjectId::from_hex(&hex)
                .map(Some)
                .map_err(|_| Error::invalid(format!("ref {} holds '{}'", full_name, hex))),
            None => Ok(None),
        }
    }

    pub fn write_ref(&self, full_name: &str, id: &ObjectId) -> Result<()> {
        atomic_write(&self.path(full_name), format!("{}\n", id).as_bytes())?;
        tracing::info!("Updated {} to {}", full_name, id.short());
        Ok(())
    }

    pub fn delete_ref(&self, full_name: &str) -> Result<()> {
        match fs::remove_file(self.path(full_name)) {
            Ok(()) => {
                tracing::info!("Deleted {}", full_name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(full_name)),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a ref only if it still points at `expected` (`None` = must not
    /// exist yet)
    pub fn update_ref(&self, full_name: &str, new: &ObjectId, expected: Option<&ObjectId>) -> Result<()> {
        let current = self.read_ref(full_name)?;
        if current.as_ref() != expected {
            let show = |id: Option<&ObjectId>| id.map(|i| i.short()).unwrap_or_else(|| "nothing".to_string());
            return Err(Error::invalid(format!(
                "ref {} is at {}, expected {}",
                full_name,
                show(current.as_ref()),
                show(expected)
            )));
        }
        self.write_ref(full_name, new)
    }

    pub fn list_branches(&self) -> Result<Vec<(String, ObjectId)>> {
        self.list(HEADS_PREFIX)
    }

    pub fn list_tags(&self) -> Result<Vec<(String, ObjectId)>> {
        self.list(TAGS_PREFIX)
    }

    /// Short names and targets under `prefix`, sorted by name
    fn list(&self, prefix: &str) -> Result<Vec<(String, ObjectId)>> {
        let dir = self.path(prefix.trim_end_matches('/'));
        let mut out = Vec::new();
        if dir.is_dir() {
            self.collect(&dir, "", prefix, &mut out)?;
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn collect(&self, dir: &Path, rel: &str, prefix: &str, out: &mut Vec<(String, ObjectId)>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let short = if rel.is_empty() { name } else { format!("{}/{}", rel, name) };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &short, prefix, out)?;
            } else if let Some(id) = self.read_ref(&format!("{}{}", prefix, short))? {
                out.push((short, id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{hash_object, ObjectKind};

    fn id(s: &str) -> ObjectId {
        hash_object(ObjectKind::Commit, s.as_bytes())
    }

    #[test]
    fn test_head_attached_and_detached() {
        let dir = tempfile::tempdir().unwrap();
        let refs = RefStore::new(dir.path());
        assert!(matches!(refs.read_head(), Err(Error::NotFound(_))));

        refs.write_head(&Head::Attached("main".into())).unwrap();
        assert_eq!(refs.read_head().unwrap(), Head::Attached("main".into()));
        assert_eq!(refs.head_commit().unwrap(), None);

        refs.write_ref(&branch_ref("main"), &id("c1")).unwrap();
        assert_eq!(refs.head_commit().unwrap(), Some(id("c1")));

        refs.write_head(&Head::Detached(id("c0"))).unwrap();
        assert_eq!(refs.head_commit().unwrap(), Some(id("c0")));
        let raw = fs::read_to_string(dir.path().join(HEAD_FILE)).unwrap();
        assert_eq!(raw.trim(), id("c0").to_hex());
    }

    #[test]
    fn test_list_nested_branches() {
        let dir = tempfile::tempdir().unwrap();
        let refs = RefStore::new(dir.path());
        refs.write_ref(&branch_ref("main"), &id("a")).unwrap();
        refs.write_ref(&branch_ref("feature/x"), &id("b")).unwrap();
        refs.write_ref(&tag_ref("v1"), &id("c")).unwrap();

        let names: Vec<String> = refs.list_branches().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["feature/x", "main"]);
        assert_eq!(refs.list_tags().unwrap(), vec![("v1".to_string(), id("c"))]);
    }

    #[test]
    fn test_update_ref_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let refs = RefStore::new(dir.path());
        let name = branch_ref("main");

        refs.update_ref(&name, &id("1"), None).unwrap();
        assert!(refs.update_ref(&name, &id("2"), None).is_err());
        assert!(refs.update_ref(&name, &id("2"), Some(&id("x"))).is_err());
        refs.update_ref(&name, &id("2"), Some(&id("1"))).unwrap();
        assert_eq!(refs.read_ref(&name).unwrap(), Some(id("2")));
    }

    #[test]
    fn test_delete_missing_ref() {
        let dir = tempfile::tempdir().unwrap();
        let refs = RefStore::new(dir.path());
        assert!(matches!(refs.delete_ref(&branch_ref("nope")), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_ref_name_validation() {
        assert!(matches!(validate_ref_name(""), Err(Error::Invalid(_))));
        for bad in ["a b", "a..b", "/a", "a/", ".hidden", "HEAD", "x.lock", "a:b"] {
            assert!(validate_ref_name(bad).is_err(), "{} should be rejected", bad);
        }
        for good in ["main", "feature/login", "v1.0"] {
            assert!(validate_ref_name(good).is_ok());
        }
    }
}
