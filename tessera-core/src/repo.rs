//! Repository handle
//!
//! A [`Repository`] ties the object store, refs, index, configuration and
//! work tree together. Every mutating call takes the repository lock for its
//! whole duration and reloads the index under it, so two handles on the same
//! store never interleave writes.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{ConfigValue, RepoConfig};
use crate::context::OpContext;
use crate::dag::{CommitGraph, CommitNode, GraphStatistics, Order};
use crate::diff::DiffOptions;
use crate::error::{Error, Result};
use crate::fsutil::{atomic_write, read_trimmed};
use crate::index::{ConflictStages, Index, StageState};
use crate::lock::RepoLock;
use crate::merge::{MergeLabels, MergeOptions};
use crate::merge_tree::{merge_trees, FileConflict};
use crate::object::{Commit, Object, ObjectId, ObjectKind, RawObject, Tag, MODE_FILE};
use crate::patch::{apply_patches, diff_file_maps, ApplyMode, Patch, PatchTarget};
use crate::refs::{branch_ref, tag_ref, validate_ref_name, Head, RefStore};
use crate::smart::Resolution;
use crate::storage::{verify_store, LooseStore, MemoryStore, ObjectStore, VerifyReport};
use crate::tree::{build_tree, flatten_tree, FileEntry, FileMap};
use crate::worktree::{WorkTree, STORE_DIR};

pub const OBJECTS_DIR: &str = "objects";
pub const MERGE_HEAD_FILE: &str = "MERGE_HEAD";
pub const MERGE_MSG_FILE: &str = "MERGE_MSG";

/// Author used for merge commits when no user is configured
const FALLBACK_AUTHOR: &str = "tessera";

/// Result of [`Repository::merge`]
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// Their commit is already reachable from ours
    UpToDate,
    FastForward { from: Option<ObjectId>, to: ObjectId },
    /// Clean merge, committed with both parents
    Merged { commit: ObjectId, auto_resolved: usize },
    /// Conflicts were left in the work tree and index
    Conflicted(MergeReport),
}

impl MergeOutcome {
    /// `0` for every successful outcome, `1` when conflicts remain
    pub fn exit_code(&self) -> i32 {
        match self {
            MergeOutcome::Conflicted(_) => 1,
            _ => 0,
        }
    }
}

/// Details of a conflicted merge
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub ours: ObjectId,
    pub theirs: ObjectId,
    pub base: Option<ObjectId>,
    pub conflicts: Vec<FileConflict>,
    pub auto_resolved: Vec<(String, Resolution)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    pub target: ObjectId,
    pub current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub name: String,
    /// Commit the tag resolves to
    pub commit: ObjectId,
    /// Present for annotated tags
    pub annotation: Option<Tag>,
}

/// Work-tree state of a path relative to what would be committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkState {
    Modified,
    Deleted,
    Untracked,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub head: Head,
    pub head_commit: Option<ObjectId>,
    /// Changes recorded in the index
    pub staged: Vec<(String, StageState)>,
    /// Changes in the work tree not yet staged
    pub unstaged: Vec<(String, WorkState)>,
    /// Set while a conflicted merge is in progress
    pub merge_head: Option<ObjectId>,
}

impl Status {
    pub fn unmerged(&self) -> impl Iterator<Item = &str> {
        self.staged
            .iter()
            .filter(|(_, s)| *s == StageState::Unmerged)
            .map(|(p, _)| p.as_str())
    }

    pub fn is_clean(&self) -> bool {
        self.staged.is_empty() && self.unstaged.is_empty() && self.merge_head.is_none()
    }
}

pub struct Repository {
    store_dir: PathBuf,
    work_tree: WorkTree,
    objects: LooseStore,
    refs: RefStore,
    config: RepoConfig,
    index: Index,
    graph: Mutex<CommitGraph>,
}

impl Repository {
    /// Create a repository in `path`. Fails with `Exists` if one is already
    /// there.
    pub fn init(path: &Path) -> Result<Self> {
        Self::init_with_config(path, RepoConfig::default())
    }

    pub fn init_with_config(path: &Path, config: RepoConfig) -> Result<Self> {
        let store_dir = path.join(STORE_DIR);
        if store_dir.exists() {
            return Err(Error::Exists(format!("repository at {}", path.display())));
        }
        validate_ref_name(&config.default_branch)?;
        fs::create_dir_all(store_dir.join(OBJECTS_DIR))?;
        fs::create_dir_all(store_dir.join("refs/heads"))?;
        fs::create_dir_all(store_dir.join("refs/tags"))?;
        config.save(&store_dir)?;
        RefStore::new(&store_dir).write_head(&Head::Attached(config.default_branch.clone()))?;
        tracing::info!("Initialized empty repository in {}", store_dir.display());
        Self::open(path)
    }

    /// Open the repository whose work tree is `path`
    pub fn open(path: &Path) -> Result<Self> {
        let store_dir = path.join(STORE_DIR);
        if !store_dir.is_dir() {
            return Err(Error::not_found(format!("no repository at {}", path.display())));
        }
        let config = RepoConfig::load(&store_dir)?;
        let objects = LooseStore::open(
            &store_dir.join(OBJECTS_DIR),
            config.compression_level,
            config.cache_capacity,
        )?;
        Ok(Self {
            work_tree: WorkTree::new(path, config.ignore.clone()),
            refs: RefStore::new(&store_dir),
            index: Index::load(&store_dir)?,
            graph: Mutex::new(CommitGraph::new()),
            store_dir,
            objects,
            config,
        })
    }

    /// Open the repository containing `start` or one of its ancestors
    pub fn discover(start: &Path) -> Result<Self> {
        let start = start.canonicalize()?;
        let mut dir = Some(start.as_path());
        while let Some(d) = dir {
            if d.join(STORE_DIR).is_dir() {
                return Self::open(d);
            }
            dir = d.parent();
        }
        Err(Error::not_found(format!(
            "no repository in {} or any parent",
            start.display()
        )))
    }

    pub fn work_tree(&self) -> &Path {
        self.work_tree.root()
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn objects(&self) -> &dyn ObjectStore {
        &self.objects
    }

    /// Take the repository lock and reload state another handle may have
    /// changed
    fn begin_mutation(&mut self) -> Result<RepoLock> {
        let lock = RepoLock::acquire(&self.store_dir)?;
        self.index = Index::load(&self.store_dir)?;
        Ok(lock)
    }

    fn op_context(&self) -> OpContext {
        OpContext::with_max_workers(self.config.max_workers)
    }

    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            context: self.config.diff_context,
        }
    }

    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            threshold: self.config.merge_threshold,
            smart: self.config.smart_merge,
            labels: MergeLabels::default(),
        }
    }

    pub fn set_config(&mut self, key: &str, value: ConfigValue) -> Result<()> {
        let _lock = self.begin_mutation()?;
        let mut config = RepoConfig::load(&self.store_dir)?;
        config.set(key, value)?;
        config.save(&self.store_dir)?;
        self.work_tree = WorkTree::new(self.work_tree.root(), config.ignore.clone());
        self.config = config;
        Ok(())
    }

    // Objects

    pub fn write_object(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId> {
        self.objects.write_object(kind, data)
    }

    pub fn read_object(&self, id: &ObjectId) -> Result<RawObject> {
        self.objects.read_object(id)
    }

    pub fn has_object(&self, id: &ObjectId) -> Result<bool> {
        self.objects.has_object(id)
    }

    pub fn verify(&self) -> Result<VerifyReport> {
        verify_store(&self.objects)
    }

    // Revisions

    pub fn head(&self) -> Result<Head> {
        self.refs.read_head()
    }

    pub fn head_commit(&self) -> Result<Option<ObjectId>> {
        self.refs.head_commit()
    }

    /// Resolve `HEAD`, a branch, a tag, a full id or a unique id prefix of
    /// at least four characters
    pub fn resolve_rev(&self, rev: &str) -> Result<ObjectId> {
        if rev == "HEAD" {
            return self
                .head_commit()?
                .ok_or_else(|| Error::not_found("HEAD has no commits yet"));
        }
        if validate_ref_name(rev).is_ok() {
            if let Some(id) = self.refs.read_ref(&branch_ref(rev))? {
                return Ok(id);
            }
            if let Some(id) = self.refs.read_ref(&tag_ref(rev))? {
                return Ok(id);
            }
            if rev.starts_with("refs/") {
                if let Some(id) = self.refs.read_ref(rev)? {
                    return Ok(id);
                }
            }
        }
        if rev.len() == 64 {
            let id = ObjectId::from_hex(rev)?;
            return if self.objects.has_object(&id)? {
                Ok(id)
            } else {
                Err(Error::not_found(format!("object {}", rev)))
            };
        }
        if rev.len() >= 4 && rev.chars().all(|c| c.is_ascii_hexdigit()) {
            let prefix = rev.to_ascii_lowercase();
            let matches: Vec<ObjectId> = self
                .objects
                .list_objects()?
                .into_iter()
                .filter(|id| id.to_hex().starts_with(&prefix))
                .collect();
            return match matches.as_slice() {
                [id] => Ok(*id),
                [] => Err(Error::not_found(format!("revision '{}'", rev))),
                _ => Err(Error::invalid(format!("ambiguous revision prefix '{}'", rev))),
            };
        }
        Err(Error::not_found(format!("revision '{}'", rev)))
    }

    /// Resolve a revision and peel tags down to a commit
    pub fn resolve_commit(&self, rev: &str) -> Result<ObjectId> {
        self.peel_to_commit(self.resolve_rev(rev)?)
    }

    fn peel_to_commit(&self, mut id: ObjectId) -> Result<ObjectId> {
        loop {
            let raw = self.objects.read_object(&id)?;
            match raw.kind {
                ObjectKind::Commit => return Ok(id),
                ObjectKind::Tag => id = Tag::from_bytes(&raw.data)?.target,
                other => {
                    return Err(Error::invalid(format!("{} is a {}, not a commit", id.short(), other)));
                }
            }
        }
    }

    fn commit_files(&self, commit: Option<&ObjectId>) -> Result<FileMap> {
        match commit {
            Some(id) => {
                let commit = self.objects.read_commit(id)?;
                flatten_tree(&self.objects, &commit.tree_id)
            }
            None => Ok(FileMap::new()),
        }
    }

    fn head_files(&self) -> Result<FileMap> {
        self.commit_files(self.head_commit()?.as_ref())
    }

    // Index

    /// Stage a file or every file under a directory. Returns the number of
    /// paths whose staged state changed.
    pub fn index_add(&mut self, path: &Path) -> Result<usize> {
        let _lock = self.begin_mutation()?;
        let rel = self.work_tree.rel_path(path)?;
        let head = self.head_files()?;
        let abs = self.work_tree.abs(&rel);

        let mut changed = 0;
        if abs.is_dir() {
            let on_disk = self.work_tree.scan(&rel)?;
            for file in &on_disk {
                changed += self.stage_path(file, &head)?;
            }
            // Files deleted from disk under this directory
            let prefix = if rel.is_empty() { String::new() } else { format!("{}/", rel) };
            let gone: Vec<String> = head
                .keys()
                .chain(self.index.iter().map(|e| &e.path))
                .filter(|p| p.starts_with(&prefix) && !on_disk.contains(p))
                .cloned()
                .collect();
            for file in gone {
                changed += self.stage_path(&file, &head)?;
            }
        } else if abs.exists() || head.contains_key(&rel) || self.index.get(&rel).is_some() {
            changed += self.stage_path(&rel, &head)?;
        } else {
            return Err(Error::not_found(format!("path '{}'", rel)));
        }

        self.index.save(&self.store_dir)?;
        tracing::debug!("Staged {} path(s) from '{}'", changed, rel);
        Ok(changed)
    }

    /// Bring the index entry for one path in line with the work tree.
    /// Returns 1 if the entry changed.
    fn stage_path(&mut self, rel: &str, head: &FileMap) -> Result<usize> {
        let before = self.index.get(rel).cloned();
        match self.work_tree.read(rel)? {
            Some((data, mode)) => {
                let id = self.objects.write_blob(&data)?;
                match head.get(rel) {
                    Some(entry) if entry.id == id && entry.mode == mode => {
                        self.index.remove(rel);
                    }
                    Some(_) => self.index.stage(rel, id, mode, StageState::Modified),
                    None => self.index.stage(rel, id, mode, StageState::Added),
                }
            }
            None => match head.get(rel) {
                Some(entry) => self.index.stage(rel, entry.id, entry.mode, StageState::Deleted),
                None => {
                    self.index.remove(rel);
                }
            },
        }
        Ok(usize::from(self.index.get(rel) != before.as_ref()))
    }

    /// Remove a path from the next commit. Unless `cached`, the work-tree
    /// file is deleted too.
    pub fn index_remove(&mut self, path: &Path, cached: bool) -> Result<()> {
        let _lock = self.begin_mutation()?;
        let rel = self.work_tree.rel_path(path)?;
        let head = self.head_files()?;

        match head.get(&rel) {
            Some(entry) => self.index.stage(&rel, entry.id, entry.mode, StageState::Deleted),
            None => {
                if self.index.remove(&rel).is_none() {
                    return Err(Error::not_found(format!("'{}' is not tracked", rel)));
                }
            }
        }
        if !cached {
            self.work_tree.remove_file(&rel)?;
        }
        self.index.save(&self.store_dir)?;
        tracing::debug!("Removed '{}' from the index", rel);
        Ok(())
    }

    pub fn status(&self) -> Result<Status> {
        let head_files = self.head_files()?;
        let expected = self.index.apply_to(&head_files);
        let on_disk = self.work_tree.snapshot()?;

        let staged = self.index.iter().map(|e| (e.path.clone(), e.stage)).collect();
        let mut unstaged = Vec::new();
        for (path, entry) in &expected {
            match on_disk.get(path) {
                None => unstaged.push((path.clone(), WorkState::Deleted)),
                Some(disk) if disk.id != entry.id || disk.mode != entry.mode => {
                    unstaged.push((path.clone(), WorkState::Modified))
                }
                Some(_) => {}
            }
        }
        for path in on_disk.keys() {
            if !expected.contains_key(path) {
                unstaged.push((path.clone(), WorkState::Untracked));
            }
        }
        unstaged.sort();

        Ok(Status {
            head: self.head()?,
            head_commit: self.head_commit()?,
            staged,
            unstaged,
            merge_head: self.merge_head()?,
        })
    }

    fn merge_head(&self) -> Result<Option<ObjectId>> {
        match read_trimmed(&self.store_dir.join(MERGE_HEAD_FILE))? {
            Some(hex) => Ok(Some(ObjectId::from_hex(&hex)?)),
            None => Ok(None),
        }
    }

    fn clear_merge_state(&self) -> Result<()> {
        for name in [MERGE_HEAD_FILE, MERGE_MSG_FILE] {
            match fs::remove_file(self.store_dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Pending merge message, if a conflicted merge is in progress
    pub fn merge_message(&self) -> Result<Option<String>> {
        read_trimmed(&self.store_dir.join(MERGE_MSG_FILE))
    }

    // Commits

    pub fn commit_create(&mut self, message: &str, author: &str) -> Result<ObjectId> {
        self.commit_create_at(message, author, Utc::now().timestamp())
    }

    /// Snapshot HEAD plus the staged changes as a new commit on HEAD. While
    /// a merge is in progress the commit gets `MERGE_HEAD` as second parent.
    pub fn commit_create_at(&mut self, message: &str, author: &str, timestamp: i64) -> Result<ObjectId> {
        let _lock = self.begin_mutation()?;
        if message.trim().is_empty() {
            return Err(Error::invalid("empty commit message"));
        }
        if author.trim().is_empty() {
            return Err(Error::invalid("empty author"));
        }
        if let Some(entry) = self.index.unmerged().next() {
            return Err(Error::invalid(format!("unmerged path '{}'", entry.path)));
        }
        let merge_head = self.merge_head()?;
        if self.index.is_empty() && merge_head.is_none() {
            return Err(Error::invalid("nothing staged to commit"));
        }

        let head = self.head_commit()?;
        let files = self.index.apply_to(&self.commit_files(head.as_ref())?);
        let parents: Vec<ObjectId> = head.into_iter().chain(merge_head).collect();
        let id = self.write_commit(&files, parents, author, message, timestamp)?;

        self.index.clear();
        self.index.save(&self.store_dir)?;
        self.clear_merge_state()?;
        Ok(id)
    }

    /// Write tree and commit objects, record the commit in the graph and
    /// advance HEAD
    fn write_commit(
        &self,
        files: &FileMap,
        parents: Vec<ObjectId>,
        author: &str,
        message: &str,
        timestamp: i64,
    ) -> Result<ObjectId> {
        let id = self.store_commit(files, parents, author, message, timestamp)?;
        self.advance_head(&id)?;
        tracing::info!("Created commit {} ({})", id.short(), message.lines().next().unwrap_or_default());
        Ok(id)
    }

    /// Write the tree and commit objects without moving HEAD
    fn store_commit(
        &self,
        files: &FileMap,
        parents: Vec<ObjectId>,
        author: &str,
        message: &str,
        timestamp: i64,
    ) -> Result<ObjectId> {
        let tree = build_tree(&self.objects, files)?;
        let commit = Commit::new(tree, parents.clone(), author.to_string(), message.to_string(), timestamp);
        let id = self.objects.write_commit(&commit)?;

        {
            let mut graph = self.graph.lock();
            graph.extend_from(&self.objects, &parents)?;
            if !graph.contains(&id) {
                graph.add_commit(id, message, author, timestamp, &parents)?;
            }
        }
        tracing::debug!("Stored commit {} ({})", id.short(), commit.summary());
        Ok(id)
    }

    fn advance_head(&self, id: &ObjectId) -> Result<()> {
        match self.refs.read_head()? {
            Head::Attached(branch) => self.refs.write_ref(&branch_ref(&branch), id),
            Head::Detached(_) => self.refs.write_head(&Head::Detached(*id)),
        }
    }

    // Branches

    pub fn branch_list(&self) -> Result<Vec<BranchInfo>> {
        let head = self.head()?;
        Ok(self
            .refs
            .list_branches()?
            .into_iter()
            .map(|(name, target)| BranchInfo {
                current: head.branch() == Some(name.as_str()),
                name,
                target,
            })
            .collect())
    }

    /// Create a branch at `start` (HEAD when `None`)
    pub fn branch_create(&mut self, name: &str, start: Option<&str>) -> Result<ObjectId> {
        let _lock = self.begin_mutation()?;
        validate_ref_name(name)?;
        let full = branch_ref(name);
        if self.refs.read_ref(&full)?.is_some() {
            return Err(Error::Exists(format!("branch '{}'", name)));
        }
        let target = self.resolve_commit(start.unwrap_or("HEAD"))?;
        self.refs.write_ref(&full, &target)?;
        Ok(target)
    }

    pub fn branch_delete(&mut self, name: &str) -> Result<()> {
        let _lock = self.begin_mutation()?;
        validate_ref_name(name)?;
        if self.head()?.branch() == Some(name) {
            return Err(Error::invalid(format!("cannot delete the checked-out branch '{}'", name)));
        }
        self.refs.delete_ref(&branch_ref(name))
    }

    /// Switch the work tree and HEAD to a branch, or detach HEAD at any
    /// other revision. Refuses while changes are staged or local edits
    /// would be overwritten.
    pub fn checkout(&mut self, rev: &str) -> Result<Head> {
        let _lock = self.begin_mutation()?;
        if self.merge_head()?.is_some() {
            return Err(Error::invalid("a merge is in progress"));
        }
        if !self.index.is_empty() {
            return Err(Error::invalid("staged changes would be lost; commit them first"));
        }

        let branch = match validate_ref_name(rev) {
            Ok(()) => self.refs.read_ref(&branch_ref(rev))?,
            Err(_) => None,
        };
        let (head, target) = match branch {
            Some(id) => (Head::Attached(rev.to_string()), id),
            None => {
                let id = self.resolve_commit(rev)?;
                (Head::Detached(id), id)
            }
        };

        let current = self.head_files()?;
        let wanted = self.commit_files(Some(&target))?;
        self.work_tree.check_clean(&current, &wanted)?;
        self.work_tree.materialize(&self.objects, &current, &wanted)?;
        self.refs.write_head(&head)?;
        tracing::info!("Checked out {} at {}", rev, target.short());
        Ok(head)
    }

    // Tags

    /// Create a tag at `target` (HEAD when `None`). With a message the tag
    /// is annotated and points at a tag object.
    pub fn tag_create(&mut self, name: &str, target: Option<&str>, message: Option<&str>, tagger: &str) -> Result<ObjectId> {
        let _lock = self.begin_mutation()?;
        validate_ref_name(name)?;
        let full = tag_ref(name);
        if self.refs.read_ref(&full)?.is_some() {
            return Err(Error::Exists(format!("tag '{}'", name)));
        }
        let commit = self.resolve_commit(target.unwrap_or("HEAD"))?;
        let id = match message {
            Some(message) => self.objects.write_tag(&Tag {
                target: commit,
                target_kind: ObjectKind::Commit,
                name: name.to_string(),
                tagger: tagger.to_string(),
                message: message.to_string(),
                timestamp: Utc::now().timestamp(),
            })?,
            None => commit,
        };
        self.refs.write_ref(&full, &id)?;
        Ok(id)
    }

    pub fn tag_list(&self) -> Result<Vec<TagInfo>> {
        let mut out = Vec::new();
        for (name, id) in self.refs.list_tags()? {
            let annotation = match self.objects.read_parsed(&id)? {
                Object::Tag(tag) => Some(tag),
                _ => None,
            };
            out.push(TagInfo {
                name,
                commit: self.peel_to_commit(id)?,
                annotation,
            });
        }
        Ok(out)
    }

    // History

    /// Every commit reachable from a branch, a tag or HEAD
    pub fn commit_graph(&self) -> Result<CommitGraph> {
        let mut tips: Vec<ObjectId> = self.refs.list_branches()?.into_iter().map(|(_, id)| id).collect();
        for tag in self.tag_list()? {
            tips.push(tag.commit);
        }
        tips.extend(self.head_commit()?);

        let mut graph = self.graph.lock();
        graph.extend_from(&self.objects, &tips)?;
        Ok(graph.clone())
    }

    /// Commits reachable from HEAD, at most `max_count` of them
    pub fn log(&self, max_count: usize, order: Order) -> Result<Vec<CommitNode>> {
        let Some(head) = self.head_commit()? else {
            return Ok(Vec::new());
        };
        let graph = CommitGraph::load(&self.objects, &[head])?;
        Ok(graph.commits_in_range(max_count, order).cloned().collect())
    }

    pub fn log_graph(&self, max_count: usize) -> Result<String> {
        Ok(self.commit_graph()?.ascii_graph(max_count))
    }

    pub fn statistics(&self) -> Result<GraphStatistics> {
        Ok(self.commit_graph()?.statistics())
    }

    /// True if `ancestor` is reachable from `descendant`
    pub fn is_ancestor(&self, ancestor: &ObjectId, descendant: &ObjectId) -> Result<bool> {
        let mut graph = self.graph.lock();
        graph.extend_from(&self.objects, &[*ancestor, *descendant])?;
        graph.is_ancestor(ancestor, descendant)
    }

    pub fn merge_base(&self, a: &ObjectId, b: &ObjectId) -> Result<Option<ObjectId>> {
        let mut graph = self.graph.lock();
        graph.extend_from(&self.objects, &[*a, *b])?;
        graph.merge_base(a, b)
    }

    // Refs for the sync layer

    fn full_ref_name(name: &str) -> String {
        if name.starts_with("refs/") {
            name.to_string()
        } else {
            branch_ref(name)
        }
    }

    /// Read a ref by full name or branch name
    pub fn read_ref(&self, name: &str) -> Result<Option<ObjectId>> {
        self.refs.read_ref(&Self::full_ref_name(name))
    }

    /// Move a ref to `new` only if it currently points at `expected`
    pub fn update_ref(&mut self, name: &str, new: &ObjectId, expected: Option<&ObjectId>) -> Result<()> {
        let _lock = self.begin_mutation()?;
        let full = Self::full_ref_name(name);
        let short = full
            .strip_prefix("refs/")
            .and_then(|rest| rest.split_once('/'))
            .map(|(_, short)| short)
            .unwrap_or_default();
        validate_ref_name(short)?;
        if !self.objects.has_object(new)? {
            return Err(Error::not_found(format!("object {}", new)));
        }
        self.refs.update_ref(&full, new, expected)
    }

    // Diff

    /// Patches from `from` to `to`. A missing `to` compares against the
    /// work tree; with neither, the staged snapshot is compared against the
    /// work tree.
    pub fn diff(&self, from: Option<&str>, to: Option<&str>, options: DiffOptions) -> Result<Vec<Patch>> {
        let ctx = self.op_context();
        let old = match from {
            Some(rev) => self.commit_files(Some(&self.resolve_commit(rev)?))?,
            None => self.index.apply_to(&self.head_files()?),
        };
        match to {
            Some(rev) => {
                let new = self.commit_files(Some(&self.resolve_commit(rev)?))?;
                diff_file_maps(&self.objects, &old, &new, options, &ctx)
            }
            None => {
                let overlay = WorkTreeOverlay::new(&self.objects);
                let mut new = FileMap::new();
                for rel in self.work_tree.scan("")? {
                    if let Some((data, mode)) = self.work_tree.read(&rel)? {
                        new.insert(rel, FileEntry::new(overlay.write_blob(&data)?, mode));
                    }
                }
                diff_file_maps(&overlay, &old, &new, options, &ctx)
            }
        }
    }

    /// Patches staged in the index relative to HEAD
    pub fn diff_staged(&self, options: DiffOptions) -> Result<Vec<Patch>> {
        let head = self.head_files()?;
        let staged = self.index.apply_to(&head);
        diff_file_maps(&self.objects, &head, &staged, options, &self.op_context())
    }

    /// Apply a patch set to the work tree, all or nothing. Returns
    /// `Ok(false)` if a hunk does not match; with `check` the set is only
    /// validated.
    pub fn apply(&mut self, patches: &[Patch], mode: ApplyMode, check: bool) -> Result<bool> {
        let _lock = self.begin_mutation()?;
        for path in patches.iter().flat_map(|p| p.old_path.iter().chain(p.new_path.iter())) {
            if path.is_empty() || self.work_tree.rel_path(Path::new(path))? != *path {
                return Err(Error::invalid(format!("patch path '{}' is not inside the work tree", path)));
            }
        }
        let mut target = WorkTreeTarget {
            work_tree: &self.work_tree,
            store: &self.objects,
        };
        let applied = apply_patches(patches, &mut target, mode, check)?;
        if applied && !check {
            tracing::info!("Applied {} patch(es)", patches.len());
        }
        Ok(applied)
    }

    /// How far `apply` may shift a hunk by default
    pub fn apply_mode(&self) -> ApplyMode {
        ApplyMode::Fuzzy {
            max_offset: self.config.fuzz_offset,
        }
    }

    // Merge

    /// Merge `rev` into HEAD.
    ///
    /// Fast-forwards when possible. A clean three-way merge is committed
    /// right away; otherwise conflicted files are written with markers,
    /// recorded as unmerged in the index, and the merge stays in progress
    /// until [`Self::commit_create`] or [`Self::merge_abort`].
    pub fn merge(&mut self, rev: &str) -> Result<MergeOutcome> {
        let _lock = self.begin_mutation()?;
        if self.merge_head()?.is_some() {
            return Err(Error::invalid("a merge is already in progress"));
        }
        if !self.index.is_empty() {
            return Err(Error::invalid("staged changes present; commit them first"));
        }

        let theirs = self.resolve_commit(rev)?;
        let Some(ours) = self.head_commit()? else {
            return self.fast_forward(None, theirs);
        };
        if ours == theirs || self.is_ancestor(&theirs, &ours)? {
            tracing::info!("Already up to date with {}", rev);
            return Ok(MergeOutcome::UpToDate);
        }
        if self.is_ancestor(&ours, &theirs)? {
            return self.fast_forward(Some(ours), theirs);
        }

        let base = self.merge_base(&ours, &theirs)?;
        let base_tree = match &base {
            Some(id) => Some(self.objects.read_commit(id)?.tree_id),
            None => None,
        };
        let ours_tree = self.objects.read_commit(&ours)?.tree_id;
        let theirs_tree = self.objects.read_commit(&theirs)?.tree_id;

        let ctx = self.op_context();
        let result = merge_trees(
            &self.objects,
            base_tree.as_ref(),
            &ours_tree,
            &theirs_tree,
            &self.merge_options(),
            &ctx,
        )?;

        let ours_files = flatten_tree(&self.objects, &ours_tree)?;
        self.work_tree.check_clean(&ours_files, &result.merged)?;
        let message = format!("Merge '{}'", rev);

        if result.is_clean() {
            // HEAD moves only once the work tree holds the stored snapshot
            let author = self.config.author().unwrap_or_else(|| FALLBACK_AUTHOR.to_string());
            let commit = self.store_commit(
                &result.merged,
                vec![ours, theirs],
                &author,
                &message,
                Utc::now().timestamp(),
            )?;
            self.work_tree.materialize(&self.objects, &ours_files, &result.merged)?;
            self.advance_head(&commit)?;
            tracing::info!("Merged {} cleanly as {}", rev, commit.short());
            return Ok(MergeOutcome::Merged {
                commit,
                auto_resolved: result.auto_resolved.len(),
            });
        }

        self.work_tree.materialize(&self.objects, &ours_files, &result.merged)?;

        // Stage everything that differs from ours; conflicts become unmerged
        for (path, entry) in &result.merged {
            match ours_files.get(path) {
                Some(old) if old == entry => {}
                Some(_) => self.index.stage(path, entry.id, entry.mode, StageState::Modified),
                None => self.index.stage(path, entry.id, entry.mode, StageState::Added),
            }
        }
        for (path, entry) in &ours_files {
            if !result.merged.contains_key(path) {
                self.index.stage(path, entry.id, entry.mode, StageState::Deleted);
            }
        }
        for conflict in &result.conflicts {
            if let Some(entry) = result.merged.get(&conflict.path) {
                self.index.mark_unmerged(
                    &conflict.path,
                    entry.id,
                    entry.mode,
                    ConflictStages {
                        base: conflict.base,
                        ours: conflict.ours,
                        theirs: conflict.theirs,
                        kind: conflict.kind,
                    },
                );
            }
        }
        self.index.save(&self.store_dir)?;
        atomic_write(&self.store_dir.join(MERGE_HEAD_FILE), format!("{}\n", theirs).as_bytes())?;
        atomic_write(&self.store_dir.join(MERGE_MSG_FILE), format!("{}\n", message).as_bytes())?;
        tracing::info!("Merge of {} stopped with {} conflict(s)", rev, result.conflicts.len());

        Ok(MergeOutcome::Conflicted(MergeReport {
            ours,
            theirs,
            base,
            conflicts: result.conflicts,
            auto_resolved: result.auto_resolved,
        }))
    }

    fn fast_forward(&mut self, from: Option<ObjectId>, to: ObjectId) -> Result<MergeOutcome> {
        let current = self.commit_files(from.as_ref())?;
        let target = self.commit_files(Some(&to))?;
        self.work_tree.check_clean(&current, &target)?;
        self.work_tree.materialize(&self.objects, &current, &target)?;
        self.advance_head(&to)?;
        tracing::info!("Fast-forwarded to {}", to.short());
        Ok(MergeOutcome::FastForward { from, to })
    }

    /// Abandon an in-progress merge and restore HEAD's snapshot
    pub fn merge_abort(&mut self) -> Result<()> {
        let _lock = self.begin_mutation()?;
        if self.merge_head()?.is_none() {
            return Err(Error::invalid("no merge in progress"));
        }
        let head = self.head_files()?;
        let merged = self.index.apply_to(&head);
        self.work_tree.materialize(&self.objects, &merged, &head)?;
        self.index.clear();
        self.index.save(&self.store_dir)?;
        self.clear_merge_state()?;
        tracing::info!("Merge aborted");
        Ok(())
    }

    /// Mark an unmerged path as resolved using its work-tree content
    pub fn resolve(&mut self, path: &Path) -> Result<()> {
        let _lock = self.begin_mutation()?;
        let rel = self.work_tree.rel_path(path)?;
        match self.index.get(&rel) {
            Some(entry) if entry.stage == StageState::Unmerged => {}
            _ => return Err(Error::invalid(format!("'{}' has no unresolved conflict", rel))),
        }
        let head = self.head_files()?;
        self.stage_path(&rel, &head)?;
        self.index.save(&self.store_dir)?;
        tracing::info!("Resolved '{}'", rel);
        Ok(())
    }
}

/// The work tree as a patch target, taking binary content from the store
struct WorkTreeTarget<'a> {
    work_tree: &'a WorkTree,
    store: &'a dyn ObjectStore,
}

impl PatchTarget for WorkTreeTarget<'_> {
    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.work_tree.read(path)?.map(|(data, _)| data))
    }

    fn write_file(&mut self, path: &str, content: &[u8], mode: Option<u32>) -> Result<()> {
        let mode = match mode {
            Some(mode) => mode,
            None => self.work_tree.read(path)?.map(|(_, mode)| mode).unwrap_or(MODE_FILE),
        };
        self.work_tree.write_file(path, content, mode)
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        self.work_tree.remove_file(path)
    }

    fn blob(&self, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        if !self.store.has_object(id)? {
            return Ok(None);
        }
        Ok(Some(self.store.read_blob(id)?.data))
    }
}

/// Object store view that keeps new writes in memory and falls back to the
/// repository store for reads
struct WorkTreeOverlay<'a> {
    base: &'a dyn ObjectStore,
    extra: MemoryStore,
}

impl<'a> WorkTreeOverlay<'a> {
    fn new(base: &'a dyn ObjectStore) -> Self {
        Self {
            base,
            extra: MemoryStore::new(),
        }
    }
}

impl ObjectStore for WorkTreeOverlay<'_> {
    fn write_object(&self, kind: ObjectKind, data: &[u8]) -> Result<ObjectId> {
        self.extra.write_object(kind, data)
    }

    fn read_object(&self, id: &ObjectId) -> Result<RawObject> {
        if self.extra.has_object(id)? {
            return self.extra.read_object(id);
        }
        self.base.read_object(id)
    }

    fn has_object(&self, id: &ObjectId) -> Result<bool> {
        Ok(self.extra.has_object(id)? || self.base.has_object(id)?)
    }

    fn list_objects(&self) -> Result<Vec<ObjectId>> {
        let mut ids = self.base.list_objects()?;
        ids.extend(self.extra.list_objects()?);
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// Short branch names by commit, for decorating log output
pub fn branch_labels(branches: &[BranchInfo]) -> HashMap<ObjectId, Vec<String>> {
    let mut labels: HashMap<ObjectId, Vec<String>> = HashMap::new();
    for branch in branches {
        labels.entry(branch.target).or_default().push(branch.name.clone());
    }
    labels
}
