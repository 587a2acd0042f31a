//! Text rendering for command output

use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::fmt::Write as _;
use tessera_core::patch::patch_stats;
use tessera_core::{
    CommitNode, Head, MergeOutcome, Object, Patch, RawObject, StageState, Status, WorkState,
};

fn head_line(status: &Status) -> String {
    match &status.head {
        Head::Attached(branch) if status.head_commit.is_none() => {
            format!("On branch {} (no commits yet)", branch)
        }
        Head::Attached(branch) => format!("On branch {}", branch),
        Head::Detached(id) => format!("HEAD detached at {}", id.short()),
    }
}

pub fn status(status: &Status) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", head_line(status));
    if let Some(merge_head) = &status.merge_head {
        let _ = writeln!(out, "Merging {}; fix conflicts, then `tessera resolve`", merge_head.short());
    }

    let unmerged: Vec<&str> = status.unmerged().collect();
    if !unmerged.is_empty() {
        let _ = writeln!(out, "\nUnmerged paths:");
        for path in unmerged {
            let _ = writeln!(out, "    both modified:   {}", path);
        }
    }

    let staged: Vec<_> = status
        .staged
        .iter()
        .filter(|(_, s)| *s != StageState::Unmerged)
        .collect();
    if !staged.is_empty() {
        let _ = writeln!(out, "\nChanges to be committed:");
        for (path, state) in staged {
            let _ = writeln!(out, "    {:<12} {}", format!("{}:", state.as_str()), path);
        }
    }

    let (untracked, unstaged): (Vec<_>, Vec<_>) = status
        .unstaged
        .iter()
        .partition(|(_, s)| *s == WorkState::Untracked);
    if !unstaged.is_empty() {
        let _ = writeln!(out, "\nChanges not staged for commit:");
        for (path, state) in unstaged {
            let label = match state {
                WorkState::Modified => "modified:",
                _ => "deleted:",
            };
            let _ = writeln!(out, "    {:<12} {}", label, path);
        }
    }
    if !untracked.is_empty() {
        let _ = writeln!(out, "\nUntracked files:");
        for (path, _) in untracked {
            let _ = writeln!(out, "    {}", path);
        }
    }
    if status.is_clean() {
        let _ = writeln!(out, "nothing to commit, working tree clean");
    }
    out
}

pub fn status_json(status: &Status) -> Value {
    json!({
        "head": match &status.head {
            Head::Attached(branch) => json!({ "branch": branch }),
            Head::Detached(id) => json!({ "detached": id.to_hex() }),
        },
        "head_commit": status.head_commit.map(|id| id.to_hex()),
        "merge_head": status.merge_head.map(|id| id.to_hex()),
        "staged": status
            .staged
            .iter()
            .map(|(path, state)| json!({ "path": path, "state": state.as_str() }))
            .collect::<Vec<_>>(),
        "unstaged": status
            .unstaged
            .iter()
            .map(|(path, state)| json!({ "path": path, "state": format!("{:?}", state).to_lowercase() }))
            .collect::<Vec<_>>(),
    })
}

pub fn log_entry(node: &CommitNode, branches: Option<&Vec<String>>) -> String {
    let mut out = String::new();
    let decoration = branches
        .map(|names| format!(" ({})", names.join(", ")))
        .unwrap_or_default();
    let _ = writeln!(out, "commit {}{}", node.id, decoration);
    if node.parents.len() > 1 {
        let parents: Vec<String> = node.parents.iter().map(|p| p.short()).collect();
        let _ = writeln!(out, "Merge:  {}", parents.join(" "));
    }
    let _ = writeln!(out, "Author: {}", node.author);
    let date = Utc
        .timestamp_opt(node.timestamp, 0)
        .single()
        .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| node.timestamp.to_string());
    let _ = writeln!(out, "Date:   {}\n", date);
    for line in node.message.lines() {
        let _ = writeln!(out, "    {}", line);
    }
    out.push('\n');
    out
}

pub fn merge_outcome(outcome: &MergeOutcome) -> String {
    let mut out = String::new();
    match outcome {
        MergeOutcome::UpToDate => {
            let _ = writeln!(out, "Already up to date.");
        }
        MergeOutcome::FastForward { from, to } => {
            let from = from.map(|id| id.short()).unwrap_or_else(|| "(empty)".to_string());
            let _ = writeln!(out, "Fast-forward {}..{}", from, to.short());
        }
        MergeOutcome::Merged { commit, auto_resolved } => {
            let _ = writeln!(out, "Merge made as {}", commit.short());
            if *auto_resolved > 0 {
                let _ = writeln!(out, "{} conflict(s) resolved automatically", auto_resolved);
            }
        }
        MergeOutcome::Conflicted(report) => {
            for (path, resolution) in &report.auto_resolved {
                let _ = writeln!(
                    out,
                    "Auto-resolved {} ({}, confidence {:.2})",
                    path,
                    resolution.strategy.as_str(),
                    resolution.confidence
                );
            }
            for conflict in &report.conflicts {
                let _ = writeln!(out, "CONFLICT ({}): {}", conflict.kind.as_str(), conflict.detail);
                for suggestion in &conflict.suggestions {
                    let _ = writeln!(
                        out,
                        "    suggestion: {} ({:.2})",
                        suggestion.description, suggestion.confidence
                    );
                }
            }
            let _ = writeln!(out, "Automatic merge failed; fix conflicts and then commit the result.");
        }
    }
    out
}

pub fn diff_stat(patches: &[Patch]) -> String {
    let mut out = String::new();
    let width = patches.iter().map(|p| p.path().len()).max().unwrap_or(0);
    for patch in patches {
        if patch.binary {
            let _ = writeln!(out, " {:<width$} | Bin", patch.path(), width = width);
        } else {
            let _ = writeln!(
                out,
                " {:<width$} | {:>4} {}{}",
                patch.path(),
                patch.additions() + patch.deletions(),
                "+".repeat(patch.additions().min(40)),
                "-".repeat(patch.deletions().min(40)),
                width = width
            );
        }
    }
    let stats = patch_stats(patches);
    let _ = writeln!(
        out,
        " {} file(s) changed, {} insertion(s)(+), {} deletion(s)(-)",
        stats.files_changed, stats.additions, stats.deletions
    );
    out
}

/// Pretty form of a stored object
pub fn object(raw: &RawObject) -> Result<String> {
    let mut out = String::new();
    match raw.parse()? {
        Object::Blob(blob) => out.push_str(&String::from_utf8_lossy(&blob.data)),
        Object::Tree(tree) => {
            for entry in tree.iter() {
                let _ = writeln!(out, "{:06o} {} {}\t{}", entry.mode, entry.kind, entry.id, entry.name);
            }
        }
        Object::Commit(commit) => {
            let _ = writeln!(out, "tree {}", commit.tree_id);
            for parent in &commit.parents {
                let _ = writeln!(out, "parent {}", parent);
            }
            let _ = writeln!(out, "author {} {}", commit.author, commit.timestamp);
            let _ = writeln!(out, "committer {} {}\n", commit.committer, commit.timestamp);
            let _ = writeln!(out, "{}", commit.message);
        }
        Object::Tag(tag) => {
            let _ = writeln!(out, "object {}", tag.target);
            let _ = writeln!(out, "type {}", tag.target_kind);
            let _ = writeln!(out, "tag {}", tag.name);
            let _ = writeln!(out, "tagger {} {}\n", tag.tagger, tag.timestamp);
            let _ = writeln!(out, "{}", tag.message);
        }
    }
    Ok(out)
}
