//! Three-way text merge
//!
//! Both sides are diffed against the base into change regions over base
//! line ranges. Regions that do not overlap are applied together; overlapping
//! regions with identical results collapse into one change; everything else
//! becomes a [`ConflictRegion`] that smart merge may still resolve.

use serde::{Deserialize, Serialize};

use crate::diff::{myers_diff, split_lines, Edit};
use crate::smart::{smart_merge, ConflictContext, Resolution, SmartOutcome, DEFAULT_THRESHOLD};

/// Lifecycle of a file merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Analyzing,
    AutoMerged,
    ConflictDetected,
    Resolved,
    Aborted,
}

/// Names written after conflict markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeLabels {
    pub ours: String,
    pub base: String,
    pub theirs: String,
}

impl Default for MergeLabels {
    fn default() -> Self {
        Self {
            ours: "ours".to_string(),
            base: "base".to_string(),
            theirs: "theirs".to_string(),
        }
    }
}

/// Merge tuning
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOptions {
    /// Minimum confidence for applying a smart resolution
    pub threshold: f64,
    /// Run smart merge over conflict regions
    pub smart: bool,
    pub labels: MergeLabels,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            smart: true,
            labels: MergeLabels::default(),
        }
    }
}

/// Base range `[start, end)` replaced by `lines` on one side
#[derive(Debug, Clone)]
struct Change<'a> {
    start: usize,
    end: usize,
    lines: Vec<&'a str>,
}

/// Ranges intersect, or an insertion sits at or inside the other range
fn overlaps(a: (usize, usize), b: (usize, usize)) -> bool {
    let a_ins = a.0 == a.1;
    let b_ins = b.0 == b.1;
    if a_ins && b_ins {
        return a.0 == b.0;
    }
    if a_ins {
        return b.0 <= a.0 && a.0 <= b.1;
    }
    if b_ins {
        return a.0 <= b.0 && b.0 <= a.1;
    }
    a.0 < b.1 && b.0 < a.1
}

fn changes<'a>(base: &[&'a str], side: &[&'a str]) -> Vec<Change<'a>> {
    let mut out = Vec::new();
    let mut current: Option<Change<'a>> = None;
    let mut pos = 0usize;

    for edit in myers_diff(base, side) {
        match edit {
            Edit::Equal { .. } => {
                out.extend(current.take());
                pos += 1;
            }
            Edit::Delete { old } => {
                let change = current.get_or_insert_with(|| Change {
                    start: pos,
                    end: pos,
                    lines: Vec::new(),
                });
                change.end = old + 1;
                pos += 1;
            }
            Edit::Insert { new } => {
                current
                    .get_or_insert_with(|| Change {
                        start: pos,
                        end: pos,
                        lines: Vec::new(),
                    })
                    .lines
                    .push(side[new]);
            }
        }
    }
    out.extend(current);
    out
}

/// Apply one side's changes within `[start, end)` of the base
fn side_view<'a>(base: &[&'a str], start: usize, end: usize, changes: &[&Change<'a>]) -> Vec<String> {
    let mut out = Vec::new();
    let mut pos = start;
    for change in changes {
        out.extend(base[pos..change.start].iter().map(|s| s.to_string()));
        out.extend(change.lines.iter().map(|s| s.to_string()));
        pos = change.end;
    }
    out.extend(base[pos..end].iter().map(|s| s.to_string()));
    out
}

/// An unresolved overlap between the two sides
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRegion {
    /// 0-based line in the base where the region starts
    pub base_start: usize,
    pub base: Vec<String>,
    pub ours: Vec<String>,
    pub theirs: Vec<String>,
    /// Smart-merge candidates that did not reach the threshold
    pub suggestions: Vec<Resolution>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeChunk {
    Clean(Vec<String>),
    Conflict(ConflictRegion),
}

/// Outcome of merging one file
#[derive(Debug, Clone, PartialEq)]
pub struct FileMergeResult {
    pub state: MergeState,
    pub chunks: Vec<MergeChunk>,
    /// Resolutions smart merge applied automatically
    pub auto_resolved: Vec<Resolution>,
}

impl FileMergeResult {
    pub fn is_clean(&self) -> bool {
        self.conflict_count() == 0
    }

    pub fn conflict_count(&self) -> usize {
        self.conflicts().count()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &ConflictRegion> {
        self.chunks.iter().filter_map(|c| match c {
            MergeChunk::Conflict(region) => Some(region),
            MergeChunk::Clean(_) => None,
        })
    }

    /// Merged text, if no conflicts remain
    pub fn merged_text(&self) -> Option<String> {
        if !self.is_clean() {
            return None;
        }
        Some(self.render(&MergeLabels::default()))
    }

    /// Merged text with diff3-style markers around each conflict
    pub fn render(&self, labels: &MergeLabels) -> String {
        let mut out = String::new();
        for chunk in &self.chunks {
            match chunk {
                MergeChunk::Clean(lines) => lines.iter().for_each(|l| out.push_str(l)),
                MergeChunk::Conflict(region) => {
                    terminate(&mut out);
                    marker(&mut out, "<<<<<<<", &labels.ours);
                    push_block(&mut out, &region.ours);
                    marker(&mut out, "|||||||", &labels.base);
                    push_block(&mut out, &region.base);
                    out.push_str("=======\n");
                    push_block(&mut out, &region.theirs);
                    marker(&mut out, ">>>>>>>", &labels.theirs);
                }
            }
        }
        out
    }

    /// Replace conflict `index` (in [`Self::conflicts`] order) with `lines`.
    /// Returns false if there is no such conflict.
    pub fn resolve_conflict(&mut self, index: usize, lines: Vec<String>) -> bool {
        let Some(chunk) = self
            .chunks
            .iter_mut()
            .filter(|c| matches!(c, MergeChunk::Conflict(_)))
            .nth(index)
        else {
            return false;
        };
        *chunk = MergeChunk::Clean(lines);
        if self.is_clean() {
            self.state = MergeState::Resolved;
        }
        true
    }

    pub fn abort(&mut self) {
        self.state = MergeState::Aborted;
    }
}

fn terminate(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn marker(out: &mut String, sign: &str, label: &str) {
    out.push_str(sign);
    if !label.is_empty() {
        out.push(' ');
        out.push_str(label);
    }
    out.push('\n');
}

fn push_block(out: &mut String, lines: &[String]) {
    for line in lines {
        out.push_str(line);
    }
    terminate(out);
}

/// Plain three-way merge without smart resolution
pub fn merge_text(base: &str, ours: &str, theirs: &str) -> FileMergeResult {
    let options = MergeOptions {
        smart: false,
        ..MergeOptions::default()
    };
    merge_file("", base, ours, theirs, &options)
}

/// Three-way merge of one file, running smart merge over conflicts when
/// enabled
pub fn merge_file(path: &str, base: &str, ours: &str, theirs: &str, options: &MergeOptions) -> FileMergeResult {
    let mut result = merge_regions(base, ours, theirs);
    if options.smart && !result.is_clean() {
        apply_smart(path, &mut result, options.threshold);
    }
    result.state = if result.is_clean() {
        if result.auto_resolved.is_empty() {
            MergeState::AutoMerged
        } else {
            MergeState::Resolved
        }
    } else {
        MergeState::ConflictDetected
    };
    tracing::debug!(
        "Merged '{}': {:?}, {} conflict(s), {} auto-resolved",
        path,
        result.state,
        result.conflict_count(),
        result.auto_resolved.len()
    );
    result
}

fn apply_smart(path: &str, result: &mut FileMergeResult, threshold: f64) {
    for chunk in result.chunks.iter_mut() {
        let MergeChunk::Conflict(region) = chunk else {
            continue;
        };
        let ctx = ConflictContext::new(path, region.base.clone(), region.ours.clone(), region.theirs.clone());
        match smart_merge(&ctx, threshold) {
            SmartOutcome::Resolved(resolution) => {
                let lines = resolution.merged.clone().unwrap_or_default();
                result.auto_resolved.push(resolution);
                *chunk = MergeChunk::Clean(lines);
            }
            SmartOutcome::Unresolved { suggestions } => region.suggestions = suggestions,
        }
    }
}

fn merge_regions(base: &str, ours: &str, theirs: &str) -> FileMergeResult {
    let base_lines = split_lines(base);
    let ours_lines = split_lines(ours);
    let theirs_lines = split_lines(theirs);
    let ours_changes = changes(&base_lines, &ours_lines);
    let theirs_changes = changes(&base_lines, &theirs_lines);

    let mut chunks: Vec<MergeChunk> = Vec::new();
    let mut clean: Vec<String> = Vec::new();
    let mut pos = 0usize;
    let (mut i, mut j) = (0usize, 0usize);

    while i < ours_changes.len() || j < theirs_changes.len() {
        // Seed the group with the earliest change; ours wins ties
        let take_ours = match (ours_changes.get(i), theirs_changes.get(j)) {
            (Some(o), Some(t)) => o.start <= t.start,
            (Some(_), None) => true,
            _ => false,
        };
        let seed = if take_ours { &ours_changes[i] } else { &theirs_changes[j] };
        let mut range = (seed.start, seed.end);
        let mut group_ours: Vec<&Change> = Vec::new();
        let mut group_theirs: Vec<&Change> = Vec::new();
        if take_ours {
            group_ours.push(seed);
            i += 1;
        } else {
            group_theirs.push(seed);
            j += 1;
        }

        // Grow until neither side has an overlapping change left
        loop {
            let mut grew = false;
            if let Some(c) = ours_changes.get(i) {
                if overlaps(range, (c.start, c.end)) {
                    range = (range.0.min(c.start), range.1.max(c.end));
                    group_ours.push(c);
                    i += 1;
                    grew = true;
                }
            }
            if let Some(c) = theirs_changes.get(j) {
                if overlaps(range, (c.start, c.end)) {
                    range = (range.0.min(c.start), range.1.max(c.end));
                    group_theirs.push(c);
                    j += 1;
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        clean.extend(base_lines[pos..range.0].iter().map(|s| s.to_string()));
        pos = range.1;

        let ours_view = side_view(&base_lines, range.0, range.1, &group_ours);
        let theirs_view = side_view(&base_lines, range.0, range.1, &group_theirs);
        if group_theirs.is_empty() {
            clean.extend(ours_view);
        } else if group_ours.is_empty() || ours_view == theirs_view {
            clean.extend(theirs_view);
        } else {
            if !clean.is_empty() {
                chunks.push(MergeChunk::Clean(std::mem::take(&mut clean)));
            }
            chunks.push(MergeChunk::Conflict(ConflictRegion {
                base_start: range.0,
                base: base_lines[range.0..range.1].iter().map(|s| s.to_string()).collect(),
                ours: ours_view,
                theirs: theirs_view,
                suggestions: Vec::new(),
            }));
        }
    }

    clean.extend(base_lines[pos..].iter().map(|s| s.to_string()));
    if !clean.is_empty() {
        chunks.push(MergeChunk::Clean(clean));
    }
    FileMergeResult {
        state: MergeState::Analyzing,
        chunks,
        auto_resolved: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "L1\nL2\nL3\nL4\nL5\n";

    #[test]
    fn test_disjoint_edits_merge_cleanly() {
        let ours = "L1\nours2\nL3\nL4\nL5\n";
        let theirs = "L1\nL2\nL3\ntheirs4\nL5\n";
        let result = merge_text(BASE, ours, theirs);
        assert_eq!(result.state, MergeState::AutoMerged);
        assert_eq!(result.merged_text().unwrap(), "L1\nours2\nL3\ntheirs4\nL5\n");
    }

    #[test]
    fn test_identical_edits_are_one_change() {
        let side = "L1\nsame\nL3\nL4\nL5\n";
        let result = merge_text(BASE, side, side);
        assert!(result.is_clean());
        assert_eq!(result.merged_text().unwrap(), side);
    }

    #[test]
    fn test_conflicting_edits_produce_markers() {
        let result = merge_text(BASE, "L1\nA\nL3\nL4\nL5\n", "L1\nB\nL3\nL4\nL5\n");
        assert_eq!(result.state, MergeState::ConflictDetected);
        assert_eq!(result.conflict_count(), 1);

        let text = result.render(&MergeLabels::default());
        assert_eq!(
            text,
            "L1\n<<<<<<< ours\nA\n||||||| base\nL2\n=======\nB\n>>>>>>> theirs\nL3\nL4\nL5\n"
        );
        assert!(result.merged_text().is_none());
    }

    #[test]
    fn test_one_side_unchanged_takes_other() {
        let theirs = "L0\nL1\nL2\nL3\nL4\nL5\nL6\n";
        let result = merge_text(BASE, BASE, theirs);
        assert_eq!(result.merged_text().unwrap(), theirs);
    }

    #[test]
    fn test_insertions_at_same_point_collide() {
        let result = merge_text("a\nb\n", "a\nx\nb\n", "a\ny\nb\n");
        assert_eq!(result.conflict_count(), 1);
        let region = result.conflicts().next().unwrap();
        assert!(region.base.is_empty());
        assert_eq!(region.base_start, 1);
    }

    #[test]
    fn test_insertion_at_end_of_modified_range_collides() {
        let result = merge_text("a\nb\nc\n", "a\nB\nc\n", "a\nb\nnew\nc\n");
        assert_eq!(result.conflict_count(), 1);
    }

    #[test]
    fn test_adjacent_line_edits_do_not_collide() {
        let result = merge_text("a\nb\nc\nd\n", "a\nB\nc\nd\n", "a\nb\nC\nd\n");
        assert_eq!(result.merged_text().unwrap(), "a\nB\nC\nd\n");
    }

    #[test]
    fn test_delete_vs_edit_conflicts() {
        let result = merge_text(BASE, "L1\nL3\nL4\nL5\n", "L1\nX\nL3\nL4\nL5\n");
        assert_eq!(result.conflict_count(), 1);
        let region = result.conflicts().next().unwrap();
        assert!(region.ours.is_empty());
        assert_eq!(region.theirs, vec!["X\n".to_string()]);
    }

    #[test]
    fn test_smart_merge_resolves_independent_insertions() {
        let options = MergeOptions::default();
        let result = merge_file("f.toml", "a = 1\nb = 2\n", "a = 1\nx = 3\nb = 2\n", "a = 1\ny = 4\nb = 2\n", &options);
        assert_eq!(result.state, MergeState::Resolved);
        assert_eq!(result.auto_resolved.len(), 1);
        assert_eq!(result.merged_text().unwrap(), "a = 1\nx = 3\ny = 4\nb = 2\n");
    }

    #[test]
    fn test_same_setting_appended_twice_conflicts() {
        let options = MergeOptions::default();
        let base = "name = \"app\"\n";
        let result = merge_file(
            "Cargo.toml",
            base,
            "name = \"app\"\nversion = \"1.0\"\n",
            "name = \"app\"\nversion = \"2.0\"\n",
            &options,
        );
        assert_eq!(result.state, MergeState::ConflictDetected);
        assert_eq!(result.conflict_count(), 1);
        assert!(result.auto_resolved.is_empty());
        assert!(result.merged_text().is_none());
        let region = result.conflicts().next().unwrap();
        assert!(region.suggestions.iter().all(|s| s.confidence < options.threshold));
    }

    #[test]
    fn test_smart_merge_keeps_suggestions() {
        let options = MergeOptions::default();
        let result = merge_file("f.txt", "x\n", "one\ntwo\n", "one\n", &options);
        assert_eq!(result.state, MergeState::ConflictDetected);
        let region = result.conflicts().next().unwrap();
        assert!(!region.suggestions.is_empty());
    }

    #[test]
    fn test_manual_resolution_and_abort() {
        let mut result = merge_text(BASE, "L1\nA\nL3\nL4\nL5\n", "L1\nB\nL3\nL4\nL5\n");
        assert!(!result.resolve_conflict(1, vec![]));
        assert!(result.resolve_conflict(0, vec!["AB\n".to_string()]));
        assert_eq!(result.state, MergeState::Resolved);
        assert_eq!(result.merged_text().unwrap(), "L1\nAB\nL3\nL4\nL5\n");

        result.abort();
        assert_eq!(result.state, MergeState::Aborted);
    }

    #[test]
    fn test_missing_final_newline_in_conflict() {
        let text = merge_text("a", "b", "c").render(&MergeLabels::default());
        assert_eq!(text, "<<<<<<< ours\nb\n||||||| base\na\n=======\nc\n>>>>>>> theirs\n");
    }
}
