//! Staging area
//!
//! The index holds changes pending against HEAD: files added, modified or
//! deleted since the last commit, plus unmerged paths left by a conflicted
//! merge. It is persisted with bincode at `<store>/index` and emptied by a
//! successful commit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::fsutil::atomic_write;
use crate::merge_tree::ConflictKind;
use crate::object::ObjectId;
use crate::tree::{FileEntry, FileMap};

pub const INDEX_FILE: &str = "index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageState {
    Added,
    Modified,
    Deleted,
    Unmerged,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Added => "added",
            StageState::Modified => "modified",
            StageState::Deleted => "deleted",
            StageState::Unmerged => "unmerged",
        }
    }
}

/// Blob ids on each side of an unmerged path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictStages {
    pub base: Option<ObjectId>,
    pub ours: Option<ObjectId>,
    pub theirs: Option<ObjectId>,
    pub kind: ConflictKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    /// Staged blob. For deletions this is the blob being removed; for
    /// unmerged paths it is the content left in the work tree.
    pub blob: ObjectId,
    pub mode: u32,
    pub stage: StageState,
    pub conflict: Option<ConflictStages>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    entries: BTreeMap<String, IndexEntry>,
}

impl Index {
    /// Load the index, or an empty one if the file does not exist
    pub fn load(store_dir: &Path) -> Result<Self> {
        let path = store_dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read(&path)?;
        Ok(bincode::deserialize(&data)?)
    }

    pub fn save(&self, store_dir: &Path) -> Result<()> {
        let data = bincode::serialize(self)?;
        atomic_write(&store_dir.join(INDEX_FILE), &data)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&IndexEntry> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn stage(&mut self, path: &str, blob: ObjectId, mode: u32, stage: StageState) {
        self.entries.insert(
            path.to_string(),
            IndexEntry {
                path: path.to_string(),
                blob,
                mode,
                stage,
                conflict: None,
            },
        );
    }

    pub fn mark_unmerged(&mut self, path: &str, blob: ObjectId, mode: u32, stages: ConflictStages) {
        self.entries.insert(
            path.to_string(),
            IndexEntry {
                path: path.to_string(),
                blob,
                mode,
                stage: StageState::Unmerged,
                conflict: Some(stages),
            },
        );
    }

    pub fn remove(&mut self, path: &str) -> Option<IndexEntry> {
        self.entries.remove(path)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn has_unmerged(&self) -> bool {
        self.unmerged().next().is_some()
    }

    pub fn unmerged(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values().filter(|e| e.stage == StageState::Unmerged)
    }

    /// Apply the staged changes to `head`, giving the next commit's snapshot
    pub fn apply_to(&self, head: &FileMap) -> FileMap {
        let mut files = head.clone();
        for entry in self.entries.values() {
            match entry.stage {
                StageState::Deleted => {
                    files.remove(&entry.path);
                }
                StageState::Added | StageState::Modified | StageState::Unmerged => {
                    files.insert(entry.path.clone(), FileEntry::new(entry.blob, entry.mode));
                }
            }
        }
        files
    }
}
