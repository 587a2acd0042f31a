//! Three-way merge of whole snapshots
//!
//! Trees are flattened to path maps, exact renames are detected per side,
//! every path is classified, and the paths that need a content merge run on
//! the bounded worker pool.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::context::OpContext;
use crate::diff::is_binary;
use crate::error::Result;
use crate::merge::{merge_file, MergeOptions, MergeState};
use crate::object::ObjectId;
use crate::pool::run_bounded;
use crate::smart::Resolution;
use crate::storage::ObjectStore;
use crate::tree::{flatten_tree, FileEntry, FileMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Overlapping edits to the same file
    Content,
    /// The same base file renamed to different paths on each side
    Rename,
    /// One side deleted a file the other side modified
    DeleteModify,
    /// Both sides added the path with different content
    AddAdd,
    /// One side has a file where the other side has a directory
    FileDirectory,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::Content => "content",
            ConflictKind::Rename => "rename",
            ConflictKind::DeleteModify => "delete/modify",
            ConflictKind::AddAdd => "add/add",
            ConflictKind::FileDirectory => "file/directory",
        }
    }
}

/// A path the merge could not settle
#[derive(Debug, Clone, PartialEq)]
pub struct FileConflict {
    pub path: String,
    pub kind: ConflictKind,
    pub base: Option<ObjectId>,
    pub ours: Option<ObjectId>,
    pub theirs: Option<ObjectId>,
    /// Second path involved in a rename conflict
    pub other_path: Option<String>,
    pub detail: String,
    pub suggestions: Vec<Resolution>,
}

/// Outcome of [`merge_trees`]
#[derive(Debug, Clone)]
pub struct TreeMergeResult {
    /// Merged snapshot; conflicted text files hold marker content
    pub merged: FileMap,
    pub conflicts: Vec<FileConflict>,
    /// Smart-merge resolutions applied, by path
    pub auto_resolved: Vec<(String, Resolution)>,
    pub state: MergeState,
}

impl TreeMergeResult {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// A path whose content needs a three-way merge
struct ContentUnit {
    path: String,
    base: Option<FileEntry>,
    ours: FileEntry,
    theirs: FileEntry,
}

struct UnitOutcome {
    path: String,
    entry: FileEntry,
    conflict: Option<FileConflict>,
    auto_resolved: Vec<Resolution>,
}

/// Merge `ours` and `theirs` against `base`. A missing base is the empty
/// tree.
pub fn merge_trees(
    store: &dyn ObjectStore,
    base: Option<&ObjectId>,
    ours: &ObjectId,
    theirs: &ObjectId,
    options: &MergeOptions,
    ctx: &OpContext,
) -> Result<TreeMergeResult> {
    let mut base_map = match base {
        Some(id) => flatten_tree(store, id)?,
        None => FileMap::new(),
    };
    let mut ours_map = flatten_tree(store, ours)?;
    let mut theirs_map = flatten_tree(store, theirs)?;

    let mut merged = FileMap::new();
    let mut conflicts = Vec::new();

    let ours_renames = detect_renames(&base_map, &ours_map);
    let theirs_renames = detect_renames(&base_map, &theirs_map);
    for (from, to_ours) in &ours_renames {
        let base_entry = base_map.get(from).copied();
        match theirs_renames.get(from) {
            Some(to_theirs) if to_theirs != to_ours => {
                tracing::debug!("Rename conflict: '{}' -> '{}' / '{}'", from, to_ours, to_theirs);
                if let Some(entry) = ours_map.remove(to_ours) {
                    merged.insert(to_ours.clone(), entry);
                }
                if let Some(entry) = theirs_map.remove(to_theirs) {
                    merged.insert(to_theirs.clone(), entry);
                }
                base_map.remove(from);
                conflicts.push(FileConflict {
                    path: to_ours.clone(),
                    kind: ConflictKind::Rename,
                    base: base_entry.map(|e| e.id),
                    ours: merged.get(to_ours).map(|e| e.id),
                    theirs: merged.get(to_theirs).map(|e| e.id),
                    other_path: Some(to_theirs.clone()),
                    detail: format!("'{}' renamed to '{}' and '{}'", from, to_ours, to_theirs),
                    suggestions: Vec::new(),
                });
            }
            Some(_) => {}
            None => follow_rename(&mut base_map, &mut theirs_map, from, to_ours),
        }
    }
    for (from, to_theirs) in &theirs_renames {
        if !ours_renames.contains_key(from) {
            follow_rename(&mut base_map, &mut ours_map, from, to_theirs);
        }
    }

    let paths: BTreeSet<String> = base_map
        .keys()
        .chain(ours_map.keys())
        .chain(theirs_map.keys())
        .cloned()
        .collect();

    let mut units = Vec::new();
    for path in paths {
        let b = base_map.get(&path).copied();
        let o = ours_map.get(&path).copied();
        let t = theirs_map.get(&path).copied();

        match (b, o, t) {
            _ if o == t => {
                if let Some(entry) = o {
                    merged.insert(path, entry);
                }
            }
            _ if o == b => {
                if let Some(entry) = t {
                    merged.insert(path, entry);
                }
            }
            _ if t == b => {
                if let Some(entry) = o {
                    merged.insert(path, entry);
                }
            }
            (Some(base), Some(ours), None) | (Some(base), None, Some(ours)) => {
                let ours_deleted = o.is_none();
                merged.insert(path.clone(), ours);
                conflicts.push(FileConflict {
                    detail: if ours_deleted {
                        format!("deleted in ours, modified in theirs: '{}'", path)
                    } else {
                        format!("modified in ours, deleted in theirs: '{}'", path)
                    },
                    path,
                    kind: ConflictKind::DeleteModify,
                    base: Some(base.id),
                    ours: o.map(|e| e.id),
                    theirs: t.map(|e| e.id),
                    other_path: None,
                    suggestions: Vec::new(),
                });
            }
            (base, Some(ours), Some(theirs)) => units.push(ContentUnit {
                path,
                base,
                ours,
                theirs,
            }),
            // Every remaining combination has two equal sides
            _ => {}
        }
    }

    tracing::debug!("Merging {} file(s) by content", units.len());
    let outcomes = run_bounded(ctx, units, |unit| merge_unit(store, unit, options, ctx))?;

    let mut auto_resolved = Vec::new();
    for outcome in outcomes {
        merged.insert(outcome.path.clone(), outcome.entry);
        auto_resolved.extend(outcome.auto_resolved.into_iter().map(|r| (outcome.path.clone(), r)));
        conflicts.extend(outcome.conflict);
    }
    separate_file_directory_clashes(&mut merged, &mut conflicts, &base_map, &ours_map);
    conflicts.sort_by(|a, b| a.path.cmp(&b.path));
    for _ in &conflicts {
        ctx.stats.record_conflict();
    }

    let state = if !conflicts.is_empty() {
        MergeState::ConflictDetected
    } else if !auto_resolved.is_empty() {
        MergeState::Resolved
    } else {
        MergeState::AutoMerged
    };
    Ok(TreeMergeResult {
        merged,
        conflicts,
        auto_resolved,
        state,
    })
}

/// Move files that would sit where the merged snapshot also needs a
/// directory to `<path>~<side>`, recording each as a conflict
fn separate_file_directory_clashes(
    merged: &mut FileMap,
    conflicts: &mut Vec<FileConflict>,
    base: &FileMap,
    ours: &FileMap,
) {
    let clashing: Vec<String> = merged
        .keys()
        .filter(|path| {
            let prefix = format!("{}/", path);
            merged
                .range(prefix.clone()..)
                .next()
                .is_some_and(|(next, _)| next.starts_with(&prefix))
        })
        .cloned()
        .collect();

    for path in clashing {
        let Some(entry) = merged.remove(&path) else {
            continue;
        };
        let from_ours = ours.get(&path) == Some(&entry);
        let side = if from_ours { "ours" } else { "theirs" };
        let moved = format!("{}~{}", path, side);
        tracing::debug!("File/directory clash at '{}', file kept as '{}'", path, moved);

        // An earlier conflict on the file follows it to the new path
        conflicts.retain(|c| c.path != path);
        merged.insert(moved.clone(), entry);
        conflicts.push(FileConflict {
            path: moved,
            kind: ConflictKind::FileDirectory,
            base: base.get(&path).map(|e| e.id),
            ours: from_ours.then_some(entry.id),
            theirs: (!from_ours).then_some(entry.id),
            other_path: Some(path.clone()),
            detail: format!("file '{}' from {} clashes with a directory", path, side),
            suggestions: Vec::new(),
        });
    }
}

/// Exact renames on one side: a base blob removed at one path and added at
/// another. Each added path is claimed at most once.
fn detect_renames(base: &FileMap, side: &FileMap) -> BTreeMap<String, String> {
    let mut added: BTreeMap<ObjectId, Vec<&String>> = BTreeMap::new();
    for (path, entry) in side {
        if !base.contains_key(path) {
            added.entry(entry.id).or_default().push(path);
        }
    }

    let mut renames = BTreeMap::new();
    for (path, entry) in base {
        if side.contains_key(path) {
            continue;
        }
        if let Some(candidates) = added.get_mut(&entry.id) {
            if !candidates.is_empty() {
                let to = candidates.remove(0);
                renames.insert(path.clone(), to.clone());
            }
        }
    }
    renames
}

/// Move `from` to `to` in the base and the other side, so the other side's
/// edits follow the rename
fn follow_rename(base: &mut FileMap, other: &mut FileMap, from: &str, to: &str) {
    if other.contains_key(to) {
        return;
    }
    if let Some(entry) = base.remove(from) {
        base.insert(to.to_string(), entry);
    }
    if let Some(entry) = other.remove(from) {
        other.insert(to.to_string(), entry);
    }
}

fn merge_unit(
    store: &dyn ObjectStore,
    unit: ContentUnit,
    options: &MergeOptions,
    ctx: &OpContext,
) -> Result<UnitOutcome> {
    ctx.stats.record_merge();
    let kind = if unit.base.is_some() {
        ConflictKind::Content
    } else {
        ConflictKind::AddAdd
    };
    let mode = match unit.base {
        Some(b) if unit.ours.mode == b.mode => unit.theirs.mode,
        _ => unit.ours.mode,
    };

    let base_data = match unit.base {
        Some(b) => store.read_blob(&b.id)?.data,
        None => Vec::new(),
    };
    let ours_data = store.read_blob(&unit.ours.id)?.data;
    let theirs_data = store.read_blob(&unit.theirs.id)?.data;

    let texts = [base_data.as_slice(), ours_data.as_slice(), theirs_data.as_slice()]
        .into_iter()
        .map(|d| if is_binary(d) { None } else { std::str::from_utf8(d).ok() })
        .collect::<Option<Vec<&str>>>();

    let conflict = |detail: String, suggestions: Vec<Resolution>| FileConflict {
        path: unit.path.clone(),
        kind,
        base: unit.base.map(|e| e.id),
        ours: Some(unit.ours.id),
        theirs: Some(unit.theirs.id),
        other_path: None,
        detail,
        suggestions,
    };

    let Some(texts) = texts else {
        tracing::debug!("Binary conflict in '{}', keeping ours", unit.path);
        return Ok(UnitOutcome {
            entry: FileEntry::new(unit.ours.id, unit.ours.mode),
            conflict: Some(conflict("binary content differs".to_string(), Vec::new())),
            path: unit.path,
            auto_resolved: Vec::new(),
        });
    };

    // Without a base there is nothing to show two additions are
    // independent, so candidates are only suggestions
    let add_add;
    let options = if kind == ConflictKind::AddAdd {
        add_add = MergeOptions {
            threshold: f64::INFINITY,
            ..options.clone()
        };
        &add_add
    } else {
        options
    };
    let result = merge_file(&unit.path, texts[0], texts[1], texts[2], options);
    for _ in &result.auto_resolved {
        ctx.stats.record_auto_resolved();
    }

    if let Some(text) = result.merged_text() {
        let id = store.write_blob(text.as_bytes())?;
        return Ok(UnitOutcome {
            path: unit.path,
            entry: FileEntry::new(id, mode),
            conflict: None,
            auto_resolved: result.auto_resolved,
        });
    }

    let marked = result.render(&options.labels);
    let id = store.write_blob(marked.as_bytes())?;
    let suggestions: Vec<Resolution> = result.conflicts().flat_map(|r| r.suggestions.iter().cloned()).collect();
    let detail = format!("{} conflicting region(s)", result.conflict_count());
    Ok(UnitOutcome {
        conflict: Some(conflict(detail, suggestions)),
        path: unit.path,
        entry: FileEntry::new(id, mode),
        auto_resolved: result.auto_resolved,
    })
}
