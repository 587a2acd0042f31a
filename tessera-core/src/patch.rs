//! Patches between snapshots
//!
//! A [`Patch`] describes how one file changes between two trees. Patch sets
//! are applied all-or-nothing: if any hunk fails to match its target the
//! whole set is rejected and the target is left untouched.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::context::OpContext;
use crate::diff::{diff_lines, is_binary, split_lines, DiffLine, DiffOptions, Hunk, LineOp};
use crate::error::{Error, Result};
use crate::object::{hash_object, ObjectId, ObjectKind, MODE_FILE};
use crate::storage::ObjectStore;
use crate::tree::{flatten_tree, FileEntry, FileMap};

lazy_static! {
    static ref HUNK_HEADER: Regex =
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk header pattern");
}

const NO_NEWLINE: &str = "\\ No newline at end of file";

/// Changes to a single file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Patch {
    /// Path before the change; `None` for an added file
    pub old_path: Option<String>,
    /// Path after the change; `None` for a deleted file
    pub new_path: Option<String>,
    pub old_id: Option<ObjectId>,
    pub new_id: Option<ObjectId>,
    pub old_mode: Option<u32>,
    pub new_mode: Option<u32>,
    pub hunks: Vec<Hunk>,
    /// Binary files carry no hunks
    pub binary: bool,
}

impl Patch {
    /// The path this patch is reported under
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn is_addition(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path.is_none()
    }

    pub fn is_mode_change(&self) -> bool {
        matches!((self.old_mode, self.new_mode), (Some(a), Some(b)) if a != b)
    }

    pub fn additions(&self) -> usize {
        self.count(LineOp::Added)
    }

    pub fn deletions(&self) -> usize {
        self.count(LineOp::Removed)
    }

    fn count(&self, op: LineOp) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .filter(|l| l.op == op)
            .count()
    }

    /// Render in unified diff format, preceded by mode and `index` lines
    /// that [`parse_unified`] reads back
    pub fn to_unified(&self) -> String {
        let mut out = String::new();
        match (self.old_mode, self.new_mode) {
            (Some(old), Some(new)) if old != new => {
                out.push_str(&format!("old mode {:o}\nnew mode {:o}\n", old, new));
            }
            (None, Some(new)) => out.push_str(&format!("new file mode {:o}\n", new)),
            (Some(old), None) => out.push_str(&format!("deleted file mode {:o}\n", old)),
            _ => {}
        }
        let id = |id: &Option<ObjectId>| id.map(|i| i.to_hex()).unwrap_or_else(|| "0".to_string());
        out.push_str(&format!("index {}..{}", id(&self.old_id), id(&self.new_id)));
        match (self.old_mode, self.new_mode) {
            (Some(old), Some(new)) if old == new => out.push_str(&format!(" {:o}\n", old)),
            _ => out.push('\n'),
        }

        let old = self
            .old_path
            .as_ref()
            .map(|p| format!("a/{}", p))
            .unwrap_or_else(|| "/dev/null".to_string());
        let new = self
            .new_path
            .as_ref()
            .map(|p| format!("b/{}", p))
            .unwrap_or_else(|| "/dev/null".to_string());
        out.push_str(&format!("--- {}\n+++ {}\n", old, new));
        if self.binary {
            out.push_str("Binary files differ\n");
            return out;
        }
        for hunk in &self.hunks {
            out.push_str(&hunk.header());
            out.push('\n');
            for line in &hunk.lines {
                let sign = match line.op {
                    LineOp::Context => ' ',
                    LineOp::Added => '+',
                    LineOp::Removed => '-',
                };
                out.push(sign);
                match line.content.strip_suffix('\n') {
                    Some(text) => {
                        out.push_str(text);
                        out.push('\n');
                    }
                    None => {
                        out.push_str(&line.content);
                        out.push('\n');
                        out.push_str(NO_NEWLINE);
                        out.push('\n');
                    }
                }
            }
        }
        out
    }
}

/// Aggregate line counts over a patch set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub files_changed: usize,
    pub additions: usize,
    pub deletions: usize,
}

pub fn patch_stats(patches: &[Patch]) -> PatchStats {
    PatchStats {
        files_changed: patches.len(),
        additions: patches.iter().map(Patch::additions).sum(),
        deletions: patches.iter().map(Patch::deletions).sum(),
    }
}

/// Patches turning tree `a` into tree `b`. A missing tree is the empty tree.
pub fn generate_patches(
    store: &dyn ObjectStore,
    tree_a: Option<&ObjectId>,
    tree_b: Option<&ObjectId>,
    options: DiffOptions,
    ctx: &OpContext,
) -> Result<Vec<Patch>> {
    let a = match tree_a {
        Some(id) => flatten_tree(store, id)?,
        None => FileMap::new(),
    };
    let b = match tree_b {
        Some(id) => flatten_tree(store, id)?,
        None => FileMap::new(),
    };
    diff_file_maps(store, &a, &b, options, ctx)
}

/// Patches turning snapshot `a` into snapshot `b`, sorted by path. A
/// change of mode alone yields a patch without hunks.
pub fn diff_file_maps(
    store: &dyn ObjectStore,
    a: &FileMap,
    b: &FileMap,
    options: DiffOptions,
    ctx: &OpContext,
) -> Result<Vec<Patch>> {
    let paths: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
    let mut patches = Vec::new();

    for path in paths {
        ctx.cancel.check()?;
        let old = a.get(path);
        let new = b.get(path);
        if old == new {
            continue;
        }
        let same_content = old.map(|e| e.id) == new.map(|e| e.id);
        let (hunks, binary) = if same_content {
            (Vec::new(), false)
        } else {
            let old_data = match old {
                Some(e) => store.read_blob(&e.id)?.data,
                None => Vec::new(),
            };
            let new_data = match new {
                Some(e) => store.read_blob(&e.id)?.data,
                None => Vec::new(),
            };
            ctx.stats.record_diff();
            match (std::str::from_utf8(&old_data), std::str::from_utf8(&new_data)) {
                (Ok(o), Ok(n)) if !is_binary(&old_data) && !is_binary(&new_data) => (diff_lines(o, n, options), false),
                _ => (Vec::new(), true),
            }
        };

        patches.push(Patch {
            old_path: old.map(|_| path.clone()),
            new_path: new.map(|_| path.clone()),
            old_id: old.map(|e| e.id),
            new_id: new.map(|e| e.id),
            old_mode: old.map(|e| e.mode),
            new_mode: new.map(|e| e.mode),
            hunks,
            binary,
        });
    }
    Ok(patches)
}

/// Read back the output of [`Patch::to_unified`] for a whole patch set
pub fn parse_unified(text: &str) -> Result<Vec<Patch>> {
    let lines: Vec<&str> = text.split_inclusive('\n').map(|l| l.strip_suffix('\n').unwrap_or(l)).collect();
    let mut patches = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        if lines[i].trim().is_empty() {
            i += 1;
            continue;
        }
        let mut patch = Patch {
            old_path: None,
            new_path: None,
            old_id: None,
            new_id: None,
            old_mode: None,
            new_mode: None,
            hunks: Vec::new(),
            binary: false,
        };

        // Extended headers up to the `---` line
        while i < lines.len() && !lines[i].starts_with("--- ") {
            let line = lines[i];
            if let Some(mode) = line.strip_prefix("old mode ").or(line.strip_prefix("deleted file mode ")) {
                patch.old_mode = Some(parse_mode(mode)?);
            } else if let Some(mode) = line.strip_prefix("new mode ").or(line.strip_prefix("new file mode ")) {
                patch.new_mode = Some(parse_mode(mode)?);
            } else if let Some(range) = line.strip_prefix("index ") {
                let (ids, mode) = match range.split_once(' ') {
                    Some((ids, mode)) => (ids, Some(parse_mode(mode)?)),
                    None => (range, None),
                };
                let (old, new) = ids
                    .split_once("..")
                    .ok_or_else(|| Error::invalid(format!("malformed index line '{}'", line)))?;
                patch.old_id = parse_index_id(old)?;
                patch.new_id = parse_index_id(new)?;
                if mode.is_some() {
                    patch.old_mode = mode;
                    patch.new_mode = mode;
                }
            } else {
                return Err(Error::invalid(format!("unexpected patch line '{}'", line)));
            }
            i += 1;
        }

        let old = lines.get(i).and_then(|l| l.strip_prefix("--- "));
        let new = lines.get(i + 1).and_then(|l| l.strip_prefix("+++ "));
        let (Some(old), Some(new)) = (old, new) else {
            return Err(Error::invalid("patch is missing its ---/+++ header"));
        };
        patch.old_path = parse_path(old, "a/");
        patch.new_path = parse_path(new, "b/");
        if patch.old_path.is_none() && patch.new_path.is_none() {
            return Err(Error::invalid("patch has neither an old nor a new path"));
        }
        i += 2;

        if lines.get(i) == Some(&"Binary files differ") {
            patch.binary = true;
            i += 1;
        }
        while let Some(caps) = lines.get(i).and_then(|l| HUNK_HEADER.captures(l)) {
            let number = |n: usize, default: usize| -> Result<usize> {
                match caps.get(n) {
                    Some(m) => m
                        .as_str()
                        .parse()
                        .map_err(|_| Error::invalid(format!("bad hunk header '{}'", lines[i]))),
                    None => Ok(default),
                }
            };
            let mut hunk = Hunk {
                old_start: number(1, 0)?,
                old_count: number(2, 1)?,
                new_start: number(3, 0)?,
                new_count: number(4, 1)?,
                lines: Vec::new(),
            };
            i += 1;

            let (mut old_seen, mut new_seen) = (0usize, 0usize);
            while old_seen < hunk.old_count || new_seen < hunk.new_count {
                let line = lines
                    .get(i)
                    .ok_or_else(|| Error::invalid(format!("truncated hunk in '{}'", patch.path())))?;
                let op = match line.chars().next() {
                    Some(' ') => LineOp::Context,
                    Some('+') => LineOp::Added,
                    Some('-') => LineOp::Removed,
                    _ => return Err(Error::invalid(format!("bad hunk line '{}'", line))),
                };
                if op != LineOp::Added {
                    old_seen += 1;
                }
                if op != LineOp::Removed {
                    new_seen += 1;
                }
                let mut content = line[1..].to_string();
                i += 1;
                if lines.get(i) == Some(&NO_NEWLINE) {
                    i += 1;
                } else {
                    content.push('\n');
                }
                hunk.lines.push(DiffLine { op, content });
            }
            patch.hunks.push(hunk);
        }
        patches.push(patch);
    }
    Ok(patches)
}

fn parse_mode(text: &str) -> Result<u32> {
    u32::from_str_radix(text.trim(), 8).map_err(|_| Error::invalid(format!("bad file mode '{}'", text)))
}

fn parse_index_id(text: &str) -> Result<Option<ObjectId>> {
    match text.trim() {
        "0" => Ok(None),
        hex => ObjectId::from_hex(hex).map(Some),
    }
}

fn parse_path(text: &str, prefix: &str) -> Option<String> {
    if text == "/dev/null" {
        return None;
    }
    Some(text.strip_prefix(prefix).unwrap_or(text).to_string())
}

/// How strictly hunk context must match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Every hunk must match exactly at its recorded position
    Strict,
    /// A hunk may match up to `max_offset` lines away from its position
    Fuzzy { max_offset: usize },
}

/// Something patches can be applied to: a set of files by path
pub trait PatchTarget {
    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// `mode` is `None` when the patch leaves it unchanged
    fn write_file(&mut self, path: &str, content: &[u8], mode: Option<u32>) -> Result<()>;

    fn remove_file(&mut self, path: &str) -> Result<()>;

    /// Content of a stored blob, which binary patches need. Targets without
    /// an object store return `None`.
    fn blob(&self, _id: &ObjectId) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

impl PatchTarget for BTreeMap<String, String> {
    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(path).map(|s| s.as_bytes().to_vec()))
    }

    fn write_file(&mut self, path: &str, content: &[u8], _mode: Option<u32>) -> Result<()> {
        let text = String::from_utf8(content.to_vec())
            .map_err(|_| Error::invalid(format!("'{}' is not text", path)))?;
        self.insert(path.to_string(), text);
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        self.remove(path);
        Ok(())
    }
}

/// A snapshot in an object store as a patch target. New content is written
/// to the store as blobs.
pub struct FileMapTarget<'a> {
    store: &'a dyn ObjectStore,
    files: FileMap,
}

impl<'a> FileMapTarget<'a> {
    pub fn new(store: &'a dyn ObjectStore, files: FileMap) -> Self {
        Self { store, files }
    }

    pub fn files(&self) -> &FileMap {
        &self.files
    }

    pub fn into_files(self) -> FileMap {
        self.files
    }
}

impl PatchTarget for FileMapTarget<'_> {
    fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.files.get(path) {
            Some(entry) => Ok(Some(self.store.read_blob(&entry.id)?.data)),
            None => Ok(None),
        }
    }

    fn write_file(&mut self, path: &str, content: &[u8], mode: Option<u32>) -> Result<()> {
        let id = self.store.write_blob(content)?;
        let mode = mode
            .or_else(|| self.files.get(path).map(|e| e.mode))
            .unwrap_or(MODE_FILE);
        self.files.insert(path.to_string(), FileEntry::new(id, mode));
        Ok(())
    }

    fn remove_file(&mut self, path: &str) -> Result<()> {
        self.files.remove(path);
        Ok(())
    }

    fn blob(&self, id: &ObjectId) -> Result<Option<Vec<u8>>> {
        if !self.store.has_object(id)? {
            return Ok(None);
        }
        Ok(Some(self.store.read_blob(id)?.data))
    }
}

/// Apply hunks to one text. Returns `None` if any hunk does not match.
pub fn apply_hunks(text: &str, hunks: &[Hunk], mode: ApplyMode) -> Option<String> {
    let lines = split_lines(text);
    let max_offset = match mode {
        ApplyMode::Strict => 0,
        ApplyMode::Fuzzy { max_offset } => max_offset,
    };

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for hunk in hunks {
        let expected: Vec<&str> = hunk.old_lines().collect();
        let pos = find_hunk(&lines, &expected, hunk.old_offset(), cursor, max_offset)?;
        for line in &lines[cursor..pos] {
            out.push_str(line);
        }
        for line in hunk.new_lines() {
            out.push_str(line);
        }
        cursor = pos + expected.len();
    }
    for line in &lines[cursor..] {
        out.push_str(line);
    }
    Some(out)
}

/// Closest position to `wanted`, not before `cursor`, where `expected`
/// matches `lines`
fn find_hunk(
    lines: &[&str],
    expected: &[&str],
    wanted: usize,
    cursor: usize,
    max_offset: usize,
) -> Option<usize> {
    let matches_at = |pos: usize| {
        pos >= cursor
            && pos + expected.len() <= lines.len()
            && lines[pos..pos + expected.len()] == *expected
    };
    if matches_at(wanted) {
        return Some(wanted);
    }
    for delta in 1..=max_offset {
        if let Some(before) = wanted.checked_sub(delta) {
            if matches_at(before) {
                return Some(before);
            }
        }
        if matches_at(wanted + delta) {
            return Some(wanted + delta);
        }
    }
    None
}

/// New content and mode staged for a path; `None` removes it
type Staged = Option<(Vec<u8>, Option<u32>)>;

/// Apply a patch set in file order.
///
/// Returns `Ok(false)` and leaves `target` untouched if any hunk fails to
/// apply. With `dry_run` the set is only validated. Binary patches need the
/// old content to match `old_id` exactly and take the new content from
/// [`PatchTarget::blob`].
pub fn apply_patches(
    patches: &[Patch],
    target: &mut dyn PatchTarget,
    mode: ApplyMode,
    dry_run: bool,
) -> Result<bool> {
    let mut staged: BTreeMap<String, Staged> = BTreeMap::new();

    for patch in patches {
        let current = match &patch.old_path {
            Some(path) => {
                let existing = match staged.get(path) {
                    Some(content) => content.as_ref().map(|(data, _)| data.clone()),
                    None => target.read_file(path)?,
                };
                match existing {
                    Some(content) => content,
                    None => {
                        tracing::debug!("Patch target '{}' is missing", path);
                        return Ok(false);
                    }
                }
            }
            None => {
                let path = patch.new_path.as_deref().unwrap_or_default();
                let exists = match staged.get(path) {
                    Some(content) => content.is_some(),
                    None => target.read_file(path)?.is_some(),
                };
                if exists && mode == ApplyMode::Strict {
                    tracing::debug!("Patch would create '{}' which already exists", path);
                    return Ok(false);
                }
                Vec::new()
            }
        };

        let result = if patch.binary {
            if let Some(old_id) = &patch.old_id {
                if hash_object(ObjectKind::Blob, &current) != *old_id {
                    tracing::debug!("Binary content of '{}' has changed", patch.path());
                    return Ok(false);
                }
            }
            match (&patch.new_path, &patch.new_id) {
                (None, _) => Vec::new(),
                (Some(_), Some(id)) => target.blob(id)?.ok_or_else(|| {
                    Error::invalid(format!(
                        "cannot apply binary patch for '{}': blob {} is not available",
                        patch.path(),
                        id.short()
                    ))
                })?,
                (Some(_), None) => {
                    return Err(Error::invalid(format!("binary patch for '{}' has no new blob", patch.path())));
                }
            }
        } else {
            let Ok(text) = std::str::from_utf8(&current) else {
                tracing::debug!("Patch target '{}' is not text", patch.path());
                return Ok(false);
            };
            let Some(result) = apply_hunks(text, &patch.hunks, mode) else {
                tracing::debug!("Hunk mismatch in '{}'", patch.path());
                return Ok(false);
            };
            result.into_bytes()
        };

        match (&patch.old_path, &patch.new_path) {
            (Some(old), None) => {
                if !result.is_empty() {
                    return Ok(false);
                }
                staged.insert(old.clone(), None);
            }
            (old, Some(new)) => {
                if let Some(old) = old {
                    if old != new {
                        staged.insert(old.clone(), None);
                    }
                }
                staged.insert(new.clone(), Some((result, patch.new_mode)));
            }
            (None, None) => return Err(Error::invalid("patch has neither an old nor a new path")),
        }
    }

    if !dry_run {
        for (path, content) in staged {
            match content {
                Some((data, mode)) => target.write_file(&path, &data, mode)?,
                None => target.remove_file(&path)?,
            }
        }
    }
    Ok(true)
}
