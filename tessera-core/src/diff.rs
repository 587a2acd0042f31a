//! Line-level diff
//!
//! Computes the shortest edit script between two line sequences with
//! Myers' O(ND) algorithm and groups it into unified-diff hunks. Lines keep
//! their terminators, so a sequence of hunks reproduces the new text byte
//! for byte, including a missing final newline.

use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut, Range};

/// Default number of unchanged lines shown around each change
pub const DEFAULT_CONTEXT: usize = 3;

/// What kind of diff operation on a line
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineOp {
    /// Line is identical in both versions
    Context,
    /// Line exists only in the new version
    Added,
    /// Line exists only in the old version
    Removed,
}

/// A single line within a hunk, terminator included
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffLine {
    pub op: LineOp,
    pub content: String,
}

impl DiffLine {
    /// Content without its line terminator
    pub fn text(&self) -> &str {
        self.content.trim_end_matches('\n').trim_end_matches('\r')
    }
}

/// A contiguous block of changes within a file
///
/// Starts are 1-based. When a side contributes no lines its start is the
/// line after which the change applies (0 at the top of the file).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl Hunk {
    /// Lines the hunk expects to find in the old text
    pub fn old_lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.op != LineOp::Added)
            .map(|l| l.content.as_str())
    }

    /// Lines the hunk leaves in the new text
    pub fn new_lines(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter(|l| l.op != LineOp::Removed)
            .map(|l| l.content.as_str())
    }

    /// 0-based index in the old text where the hunk begins
    pub fn old_offset(&self) -> usize {
        if self.old_count == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }

    pub fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_count, self.new_start, self.new_count
        )
    }
}

/// Diff tuning knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    pub context: usize,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            context: DEFAULT_CONTEXT,
        }
    }
}

/// One step of an edit script, by index into the old/new sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edit {
    Equal { old: usize, new: usize },
    Delete { old: usize },
    Insert { new: usize },
}

/// Split text into lines, keeping terminators
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Returns true if the data appears to be binary (NUL byte in the first 8 KiB)
pub fn is_binary(data: &[u8]) -> bool {
    let check_len = data.len().min(8192);
    data[..check_len].contains(&0)
}

/// Shortest edit script turning `old` into `new`.
///
/// Linear-space Myers: find the middle snake of the current box with a
/// forward and a backward frontier, then recurse on both halves. Memory is
/// O(N + M) regardless of the edit distance.
pub fn myers_diff<T: PartialEq>(old: &[T], new: &[T]) -> Vec<Edit> {
    let mut edits = Vec::with_capacity(old.len().max(new.len()));
    let max_d = max_d(old.len(), new.len());
    let mut vf = Frontier::new(max_d);
    let mut vb = Frontier::new(max_d);
    conquer(old, 0..old.len(), new, 0..new.len(), &mut vf, &mut vb, &mut edits);
    edits
}

fn max_d(n: usize, m: usize) -> usize {
    (n + m).div_ceil(2) + 1
}

/// Furthest-reaching x per diagonal k, for k in `-max_d..=max_d`
struct Frontier {
    offset: isize,
    v: Vec<isize>,
}

impl Frontier {
    fn new(max_d: usize) -> Self {
        Self {
            offset: max_d as isize,
            v: vec![0; 2 * max_d + 1],
        }
    }
}

impl Index<isize> for Frontier {
    type Output = isize;

    fn index(&self, k: isize) -> &isize {
        &self.v[(k + self.offset) as usize]
    }
}

impl IndexMut<isize> for Frontier {
    fn index_mut(&mut self, k: isize) -> &mut isize {
        &mut self.v[(k + self.offset) as usize]
    }
}

fn common_prefix<T: PartialEq>(old: &[T], old_range: Range<usize>, new: &[T], new_range: Range<usize>) -> usize {
    old[old_range]
        .iter()
        .zip(&new[new_range])
        .take_while(|(a, b)| a == b)
        .count()
}

fn common_suffix<T: PartialEq>(old: &[T], old_range: Range<usize>, new: &[T], new_range: Range<usize>) -> usize {
    old[old_range]
        .iter()
        .rev()
        .zip(new[new_range].iter().rev())
        .take_while(|(a, b)| a == b)
        .count()
}

/// A point on an optimal path through the box, in absolute coordinates
fn middle_snake<T: PartialEq>(
    old: &[T],
    old_range: Range<usize>,
    new: &[T],
    new_range: Range<usize>,
    vf: &mut Frontier,
    vb: &mut Frontier,
) -> Option<(usize, usize)> {
    let n = old_range.len() as isize;
    let m = new_range.len() as isize;
    let delta = n - m;
    let odd = delta & 1 == 1;
    vf[1] = 0;
    vb[1] = 0;

    for d in 0..max_d(old_range.len(), new_range.len()) as isize {
        for k in (-d..=d).rev().step_by(2) {
            let mut x = if k == -d || (k != d && vf[k - 1] < vf[k + 1]) {
                vf[k + 1]
            } else {
                vf[k - 1] + 1
            };
            let y = x - k;
            let (x0, y0) = (x, y);
            if x < n && y < m {
                x += common_prefix(
                    old,
                    old_range.start + x as usize..old_range.end,
                    new,
                    new_range.start + y as usize..new_range.end,
                ) as isize;
            }
            vf[k] = x;
            if odd && (k - delta).abs() < d && vf[k] + vb[-(k - delta)] >= n {
                return Some((old_range.start + x0 as usize, new_range.start + y0 as usize));
            }
        }

        for k in (-d..=d).rev().step_by(2) {
            let mut x = if k == -d || (k != d && vb[k - 1] < vb[k + 1]) {
                vb[k + 1]
            } else {
                vb[k - 1] + 1
            };
            let mut y = x - k;
            if x < n && y < m {
                let advance = common_suffix(
                    old,
                    old_range.start..old_range.start + (n - x) as usize,
                    new,
                    new_range.start..new_range.start + (m - y) as usize,
                ) as isize;
                x += advance;
                y += advance;
            }
            vb[k] = x;
            if !odd && (k - delta).abs() <= d && vb[k] + vf[-(k - delta)] >= n {
                return Some((old_range.start + (n - x) as usize, new_range.start + (m - y) as usize));
            }
        }
    }
    None
}

fn conquer<T: PartialEq>(
    old: &[T],
    mut old_range: Range<usize>,
    new: &[T],
    mut new_range: Range<usize>,
    vf: &mut Frontier,
    vb: &mut Frontier,
    edits: &mut Vec<Edit>,
) {
    let prefix = common_prefix(old, old_range.clone(), new, new_range.clone());
    for i in 0..prefix {
        edits.push(Edit::Equal {
            old: old_range.start + i,
            new: new_range.start + i,
        });
    }
    old_range.start += prefix;
    new_range.start += prefix;

    let suffix = common_suffix(old, old_range.clone(), new, new_range.clone());
    old_range.end -= suffix;
    new_range.end -= suffix;

    if new_range.is_empty() {
        edits.extend(old_range.clone().map(|old| Edit::Delete { old }));
    } else if old_range.is_empty() {
        edits.extend(new_range.clone().map(|new| Edit::Insert { new }));
    } else if let Some((x, y)) = middle_snake(old, old_range.clone(), new, new_range.clone(), vf, vb) {
        conquer(old, old_range.start..x, new, new_range.start..y, vf, vb, edits);
        conquer(old, x..old_range.end, new, y..new_range.end, vf, vb, edits);
    } else {
        edits.extend(old_range.clone().map(|old| Edit::Delete { old }));
        edits.extend(new_range.clone().map(|new| Edit::Insert { new }));
    }

    for i in 0..suffix {
        edits.push(Edit::Equal {
            old: old_range.end + i,
            new: new_range.end + i,
        });
    }
}

/// Compute diff hunks between two texts
pub fn diff_lines(old: &str, new: &str, options: DiffOptions) -> Vec<Hunk> {
    let old_lines = split_lines(old);
    let new_lines = split_lines(new);
    let edits = myers_diff(&old_lines, &new_lines);
    group_into_hunks(&edits, &old_lines, &new_lines, options.context)
}

/// Group an edit script into hunks with `context` unchanged lines around
/// each change
fn group_into_hunks(edits: &[Edit], old: &[&str], new: &[&str], context: usize) -> Vec<Hunk> {
    let change_indices: Vec<usize> = edits
        .iter()
        .enumerate()
        .filter(|(_, e)| !matches!(e, Edit::Equal { .. }))
        .map(|(i, _)| i)
        .collect();
    if change_indices.is_empty() {
        return Vec::new();
    }

    // Each change gets `context` lines before and after; overlapping
    // windows merge
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for &ci in &change_indices {
        let start = ci.saturating_sub(context);
        let end = (ci + context + 1).min(edits.len());
        match ranges.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => ranges.push((start, end)),
        }
    }

    // Positions (count of old/new lines consumed) before each edit
    let mut old_pos = Vec::with_capacity(edits.len());
    let mut new_pos = Vec::with_capacity(edits.len());
    let (mut o, mut n) = (0usize, 0usize);
    for edit in edits {
        old_pos.push(o);
        new_pos.push(n);
        match edit {
            Edit::Equal { .. } => {
                o += 1;
                n += 1;
            }
            Edit::Delete { .. } => o += 1,
            Edit::Insert { .. } => n += 1,
        }
    }

    ranges
        .into_iter()
        .map(|(start, end)| {
            let mut lines = Vec::with_capacity(end - start);
            let (mut old_count, mut new_count) = (0, 0);
            for edit in &edits[start..end] {
                let (op, content) = match *edit {
                    Edit::Equal { old: i, .. } => {
                        old_count += 1;
                        new_count += 1;
                        (LineOp::Context, old[i])
                    }
                    Edit::Delete { old: i } => {
                        old_count += 1;
                        (LineOp::Removed, old[i])
                    }
                    Edit::Insert { new: j } => {
                        new_count += 1;
                        (LineOp::Added, new[j])
                    }
                };
                lines.push(DiffLine {
                    op,
                    content: content.to_string(),
                });
            }
            let old_start = old_pos[start] + usize::from(old_count > 0);
            let new_start = new_pos[start] + usize::from(new_count > 0);
            Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines,
            }
        })
        .collect()
}
