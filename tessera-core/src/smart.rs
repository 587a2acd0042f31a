//! Heuristic conflict resolution
//!
//! Every strategy is a pure function of a [`ConflictContext`]: the base,
//! ours and theirs lines of a single conflict region. Strategies propose a
//! [`Resolution`] with a confidence in `[0, 1]`; [`smart_merge`] applies the
//! best one only when it reaches the acceptance threshold.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

use crate::diff::{myers_diff, Edit};

/// Default acceptance threshold for automatic resolution
pub const DEFAULT_THRESHOLD: f64 = 0.8;

lazy_static! {
    static ref IMPORT_LINE: Regex =
        Regex::new(r"^\s*(use\s+\S.*;|import\s+\S.*|from\s+\S+\s+import\s+\S.*|#include\s*[<\x22].*[>\x22]|require\s*\(.*\);?)\s*$")
            .expect("valid import pattern");
    static ref DECLARATION: Regex = Regex::new(
        r"^(?:pub(?:\([^)]*\))?\s+)?(?:export\s+)?(?:async\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait|type|const|static|mod|def|class|function|interface)\s+([A-Za-z_][A-Za-z0-9_]*)"
    )
    .expect("valid declaration pattern");
    static ref ASSIGNMENT: Regex = Regex::new(
        r#"^(?:let\s+|var\s+|const\s+|export\s+)?["']?([A-Za-z_][A-Za-z0-9_.\-]*)["']?\s*(?:=|:)(?:[^=:]|$)"#
    )
    .expect("valid assignment pattern");
}

/// Confidence of a concatenation whose blocks show no sign of being
/// independent; always below the default threshold
const UNKEYED_CONCAT_CONFIDENCE: f64 = 0.5;

/// One conflicting region, lines keep their terminators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictContext {
    pub path: String,
    pub base: Vec<String>,
    pub ours: Vec<String>,
    pub theirs: Vec<String>,
}

impl ConflictContext {
    pub fn new(path: impl Into<String>, base: Vec<String>, ours: Vec<String>, theirs: Vec<String>) -> Self {
        Self {
            path: path.into(),
            base,
            ours,
            theirs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Both sides differ only in whitespace
    WhitespaceEquivalent,
    /// One side only reformatted the base; take the other side
    IgnoreWhitespaceSide,
    /// Both sides inserted unrelated lines at the same point
    ConcatenateInsertions,
    /// One side's lines contain the other's in order
    Superset,
    /// Both sides only added imports
    ImportUnion,
    /// Both sides added distinct top-level declarations
    DeclarationUnion,
    /// Both sides added declarations with the same name
    DeclarationClash,
}

impl ResolutionStrategy {
    /// Highest confidence the strategy proposes
    pub fn confidence(&self) -> f64 {
        match self {
            ResolutionStrategy::WhitespaceEquivalent => 0.95,
            ResolutionStrategy::IgnoreWhitespaceSide => 0.9,
            ResolutionStrategy::ConcatenateInsertions => 0.85,
            ResolutionStrategy::Superset => 0.7,
            ResolutionStrategy::ImportUnion => 0.9,
            ResolutionStrategy::DeclarationUnion => 0.85,
            ResolutionStrategy::DeclarationClash => 0.3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::WhitespaceEquivalent => "whitespace-equivalent",
            ResolutionStrategy::IgnoreWhitespaceSide => "ignore-whitespace-side",
            ResolutionStrategy::ConcatenateInsertions => "concatenate-insertions",
            ResolutionStrategy::Superset => "superset",
            ResolutionStrategy::ImportUnion => "import-union",
            ResolutionStrategy::DeclarationUnion => "declaration-union",
            ResolutionStrategy::DeclarationClash => "declaration-clash",
        }
    }
}

/// A proposed resolution of one conflict region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub confidence: f64,
    pub strategy: ResolutionStrategy,
    /// Replacement lines for the region, when the strategy can produce them
    pub merged: Option<Vec<String>>,
    pub description: String,
}

impl Resolution {
    fn new(strategy: ResolutionStrategy, merged: Option<Vec<String>>, description: impl Into<String>) -> Self {
        Self {
            confidence: strategy.confidence(),
            strategy,
            merged,
            description: description.into(),
        }
    }

    fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.min(self.strategy.confidence());
        self
    }
}

/// Result of [`smart_merge`]
#[derive(Debug, Clone, PartialEq)]
pub enum SmartOutcome {
    Resolved(Resolution),
    /// Below threshold; candidates sorted by descending confidence
    Unresolved { suggestions: Vec<Resolution> },
}

/// Best formatting-level resolution, if any applies
pub fn resolve_by_patterns(ctx: &ConflictContext) -> Option<Resolution> {
    best(pattern_candidates(ctx))
}

/// Best structure-aware resolution, if any applies
pub fn resolve_by_semantics(ctx: &ConflictContext) -> Option<Resolution> {
    best(semantic_candidates(ctx))
}

/// Try patterns, then semantics. Applies the best candidate iff its
/// confidence is at least `threshold`.
pub fn smart_merge(ctx: &ConflictContext, threshold: f64) -> SmartOutcome {
    let mut candidates = pattern_candidates(ctx);
    candidates.extend(semantic_candidates(ctx));
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    if let Some(pos) = candidates
        .iter()
        .position(|c| c.confidence >= threshold && c.merged.is_some())
    {
        let chosen = candidates.swap_remove(pos);
        tracing::debug!(
            "Resolved conflict in '{}' by {} ({:.2})",
            ctx.path,
            chosen.strategy.as_str(),
            chosen.confidence
        );
        return SmartOutcome::Resolved(chosen);
    }
    SmartOutcome::Unresolved {
        suggestions: candidates,
    }
}

fn best(mut candidates: Vec<Resolution>) -> Option<Resolution> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    candidates.into_iter().next()
}

fn pattern_candidates(ctx: &ConflictContext) -> Vec<Resolution> {
    let mut out = Vec::new();
    let ours_norm = normalize(&ctx.ours);
    let theirs_norm = normalize(&ctx.theirs);
    let base_norm = normalize(&ctx.base);

    if ours_norm == theirs_norm {
        out.push(Resolution::new(
            ResolutionStrategy::WhitespaceEquivalent,
            Some(ctx.ours.clone()),
            "sides differ only in whitespace; keeping ours",
        ));
    } else if ours_norm == base_norm {
        out.push(Resolution::new(
            ResolutionStrategy::IgnoreWhitespaceSide,
            Some(ctx.theirs.clone()),
            "ours only reformatted the base; keeping theirs",
        ));
    } else if theirs_norm == base_norm {
        out.push(Resolution::new(
            ResolutionStrategy::IgnoreWhitespaceSide,
            Some(ctx.ours.clone()),
            "theirs only reformatted the base; keeping ours",
        ));
    }

    if ctx.base.is_empty() && !ctx.ours.is_empty() && !ctx.theirs.is_empty() {
        let ours: HashSet<&str> = ctx.ours.iter().map(|l| l.trim()).collect();
        let shared = ctx.theirs.iter().any(|l| {
            let t = l.trim();
            !t.is_empty() && ours.contains(t)
        });
        if !shared {
            out.push(concatenation(ctx));
        }
    }

    if is_subsequence(&ctx.theirs, &ctx.ours) {
        out.push(Resolution::new(
            ResolutionStrategy::Superset,
            Some(ctx.ours.clone()),
            "ours contains every line of theirs",
        ));
    } else if is_subsequence(&ctx.ours, &ctx.theirs) {
        out.push(Resolution::new(
            ResolutionStrategy::Superset,
            Some(ctx.theirs.clone()),
            "theirs contains every line of ours",
        ));
    }
    out
}

fn semantic_candidates(ctx: &ConflictContext) -> Vec<Resolution> {
    let mut out = Vec::new();
    let (Some(ours_added), Some(theirs_added)) = (added_lines(&ctx.base, &ctx.ours), added_lines(&ctx.base, &ctx.theirs))
    else {
        // a side removed base lines, structure heuristics do not apply
        return out;
    };

    let all_imports = ctx
        .base
        .iter()
        .chain(&ctx.ours)
        .chain(&ctx.theirs)
        .filter(|l| !l.trim().is_empty())
        .all(|l| IMPORT_LINE.is_match(l.trim_end()));
    if all_imports && !ours_added.is_empty() && !theirs_added.is_empty() {
        let union: BTreeSet<String> = ctx
            .base
            .iter()
            .chain(&ctx.ours)
            .chain(&ctx.theirs)
            .filter(|l| !l.trim().is_empty())
            .map(|l| with_newline(l.trim_end()))
            .collect();
        out.push(Resolution::new(
            ResolutionStrategy::ImportUnion,
            Some(union.into_iter().collect()),
            "both sides added imports; sorted union",
        ));
        return out;
    }

    let ours_decls = declared_names(&ours_added);
    let theirs_decls = declared_names(&theirs_added);
    if starts_with_declaration(&ours_added) && starts_with_declaration(&theirs_added) {
        let clashes: Vec<&String> = ours_decls.intersection(&theirs_decls).collect();
        let merged = concat(&ctx.ours, &theirs_added);
        if clashes.is_empty() {
            out.push(Resolution::new(
                ResolutionStrategy::DeclarationUnion,
                Some(merged),
                "both sides added distinct declarations; ours then theirs",
            ));
        } else {
            let names: Vec<&str> = clashes.iter().map(|s| s.as_str()).collect();
            out.push(Resolution::new(
                ResolutionStrategy::DeclarationClash,
                Some(merged),
                format!("both sides declare {}", names.join(", ")),
            ));
        }
    }
    out
}

/// Both blocks must define keys or names, and none in common, for the
/// insertions to count as independent
fn concatenation(ctx: &ConflictContext) -> Resolution {
    let merged = Some(concat(&ctx.ours, &ctx.theirs));
    let ours_keys = defined_keys(&ctx.ours);
    let theirs_keys = defined_keys(&ctx.theirs);
    let clash: Vec<&str> = ours_keys.intersection(&theirs_keys).map(String::as_str).collect();

    if !clash.is_empty() {
        Resolution::new(
            ResolutionStrategy::ConcatenateInsertions,
            merged,
            format!("both insertions define {}; ours then theirs", clash.join(", ")),
        )
        .with_confidence(UNKEYED_CONCAT_CONFIDENCE)
    } else if ours_keys.is_empty() || theirs_keys.is_empty() {
        Resolution::new(
            ResolutionStrategy::ConcatenateInsertions,
            merged,
            "insertions at the same point; ours then theirs",
        )
        .with_confidence(UNKEYED_CONCAT_CONFIDENCE)
    } else {
        Resolution::new(
            ResolutionStrategy::ConcatenateInsertions,
            merged,
            "insertions define distinct keys; ours then theirs",
        )
    }
}

/// Declaration names and assignment keys at the start of any line
fn defined_keys(lines: &[String]) -> BTreeSet<String> {
    let mut keys = declared_names(lines);
    keys.extend(
        lines
            .iter()
            .filter_map(|l| ASSIGNMENT.captures(l.trim_start()))
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string())),
    );
    keys
}

/// Whitespace-insensitive form of a region
fn normalize(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect()
}

fn is_subsequence(small: &[String], big: &[String]) -> bool {
    if small.is_empty() || small.len() >= big.len() {
        return false;
    }
    let mut it = big.iter();
    small.iter().all(|line| it.any(|b| b == line))
}

/// Lines `side` adds to `base`, or `None` if it also removes any
fn added_lines(base: &[String], side: &[String]) -> Option<Vec<String>> {
    let mut added = Vec::new();
    for edit in myers_diff(base, side) {
        match edit {
            Edit::Delete { .. } => return None,
            Edit::Insert { new } => added.push(side[new].clone()),
            Edit::Equal { .. } => {}
        }
    }
    Some(added)
}

fn starts_with_declaration(lines: &[String]) -> bool {
    lines
        .iter()
        .find(|l| !l.trim().is_empty())
        .is_some_and(|l| DECLARATION.is_match(l))
}

/// Names of the top-level declarations among `lines`
fn declared_names(lines: &[String]) -> BTreeSet<String> {
    lines
        .iter()
        .filter_map(|l| DECLARATION.captures(l))
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn concat(first: &[String], second: &[String]) -> Vec<String> {
    let mut out: Vec<String> = first.to_vec();
    if let Some(last) = out.last_mut() {
        if !last.ends_with('\n') && !second.is_empty() {
            last.push('\n');
        }
    }
    out.extend(second.iter().cloned());
    out
}

fn with_newline(line: &str) -> String {
    format!("{}\n", line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.split_inclusive('\n').map(String::from).collect()
    }

    fn ctx(base: &str, ours: &str, theirs: &str) -> ConflictContext {
        ConflictContext::new("file.rs", lines(base), lines(ours), lines(theirs))
    }

    fn resolved(outcome: SmartOutcome) -> Resolution {
        match outcome {
            SmartOutcome::Resolved(r) => r,
            other => panic!("expected resolution, got {:?}", other),
        }
    }

    #[test]
    fn test_whitespace_equivalent_sides() {
        let c = ctx("let x = 1;\n", "let x =  2;\n", "let x = 2;  \n");
        let r = resolved(smart_merge(&c, DEFAULT_THRESHOLD));
        assert_eq!(r.strategy, ResolutionStrategy::WhitespaceEquivalent);
        assert_eq!(r.confidence, 0.95);
        assert_eq!(r.merged.unwrap(), lines("let x =  2;\n"));
    }

    #[test]
    fn test_one_side_only_reformatted() {
        let c = ctx("a  +  b\n", "a + b\n", "a - b\n");
        let r = resolve_by_patterns(&c).unwrap();
        assert_eq!(r.strategy, ResolutionStrategy::IgnoreWhitespaceSide);
        assert_eq!(r.merged.unwrap(), lines("a - b\n"));
    }

    #[test]
    fn test_insertions_with_distinct_keys_concatenate() {
        let c = ctx("", "port = 8080\n", "host = \"localhost\"\n");
        let r = resolved(smart_merge(&c, DEFAULT_THRESHOLD));
        assert_eq!(r.strategy, ResolutionStrategy::ConcatenateInsertions);
        assert_eq!(r.confidence, 0.85);
        assert_eq!(r.merged.unwrap(), lines("port = 8080\nhost = \"localhost\"\n"));
    }

    #[test]
    fn test_insertions_setting_same_key_stay_conflicted() {
        let c = ctx("", "version = \"1.0\"\n", "version = \"2.0\"\n");
        match smart_merge(&c, DEFAULT_THRESHOLD) {
            SmartOutcome::Unresolved { suggestions } => {
                assert_eq!(suggestions[0].strategy, ResolutionStrategy::ConcatenateInsertions);
                assert!(suggestions[0].confidence < DEFAULT_THRESHOLD);
                assert!(suggestions[0].description.contains("version"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unkeyed_insertions_are_only_a_suggestion() {
        let c = ctx("", "alpha\n", "beta\n");
        match smart_merge(&c, DEFAULT_THRESHOLD) {
            SmartOutcome::Unresolved { suggestions } => {
                assert_eq!(suggestions[0].strategy, ResolutionStrategy::ConcatenateInsertions);
                assert_eq!(suggestions[0].confidence, 0.5);
                assert_eq!(suggestions[0].merged.as_deref(), Some(&lines("alpha\nbeta\n")[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_superset_is_only_a_suggestion() {
        let c = ctx("x\n", "one\ntwo\nthree\n", "one\nthree\n");
        match smart_merge(&c, DEFAULT_THRESHOLD) {
            SmartOutcome::Unresolved { suggestions } => {
                assert_eq!(suggestions[0].strategy, ResolutionStrategy::Superset);
                assert_eq!(suggestions[0].merged.as_deref(), Some(&lines("one\ntwo\nthree\n")[..]));
            }
            other => panic!("unexpected {:?}", other),
        }
        // A lower threshold accepts it
        let r = resolved(smart_merge(&c, 0.6));
        assert_eq!(r.strategy, ResolutionStrategy::Superset);
    }

    #[test]
    fn test_import_union_sorted_and_deduplicated() {
        let c = ctx(
            "use std::fmt;\n",
            "use std::fmt;\nuse std::io;\n",
            "use std::collections::HashMap;\nuse std::fmt;\n",
        );
        let r = resolve_by_semantics(&c).unwrap();
        assert_eq!(r.strategy, ResolutionStrategy::ImportUnion);
        assert_eq!(
            r.merged.unwrap(),
            lines("use std::collections::HashMap;\nuse std::fmt;\nuse std::io;\n")
        );
    }

    #[test]
    fn test_distinct_declarations_union() {
        let c = ctx(
            "",
            "fn parse() {\n    todo()\n}\n",
            "pub struct Config {\n    size: usize,\n}\n",
        );
        let r = resolve_by_semantics(&c).unwrap();
        assert_eq!(r.strategy, ResolutionStrategy::DeclarationUnion);
        let merged = r.merged.unwrap();
        assert_eq!(merged.first().map(String::as_str), Some("fn parse() {\n"));
        assert_eq!(merged.len(), 6);
    }

    #[test]
    fn test_declaration_clash_is_low_confidence() {
        let c = ctx("", "fn parse() -> u8 {\n    1\n}\n", "fn parse() -> u16 {\n    2\n}\n");
        let r = resolve_by_semantics(&c).unwrap();
        assert_eq!(r.strategy, ResolutionStrategy::DeclarationClash);
        assert_eq!(r.confidence, 0.3);
        assert!(r.description.contains("parse"));
    }

    #[test]
    fn test_genuine_conflict_unresolved() {
        let c = ctx("value = 1\n", "value = 2\n", "value = 3\n");
        assert!(resolve_by_patterns(&c).is_none());
        assert!(resolve_by_semantics(&c).is_none());
        assert_eq!(
            smart_merge(&c, DEFAULT_THRESHOLD),
            SmartOutcome::Unresolved { suggestions: vec![] }
        );
    }

    #[test]
    fn test_strategies_are_deterministic() {
        let c = ctx("", "fn a() {}\n", "fn b() {}\n");
        assert_eq!(smart_merge(&c, DEFAULT_THRESHOLD), smart_merge(&c, DEFAULT_THRESHOLD));
    }
}
