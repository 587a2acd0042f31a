//! Verify repository integrity

use anyhow::Result;
use tessera_core::{Error, Repository};

/// Re-hash every object, then check that each branch and index entry
/// points at an object that exists
pub fn run(repo: &Repository) -> Result<i32> {
    let report = repo.verify()?;
    for id in &report.corrupt {
        eprintln!("  ERROR: object {} is corrupt", id);
    }

    let mut dangling = 0usize;
    for branch in repo.branch_list()? {
        if !repo.has_object(&branch.target)? {
            dangling += 1;
            eprintln!("  ERROR: branch {} points at missing {}", branch.name, branch.target.short());
        }
    }
    for entry in repo.index().iter() {
        if !repo.has_object(&entry.blob)? {
            dangling += 1;
            eprintln!("  ERROR: index entry {} names missing blob {}", entry.path, entry.blob.short());
        }
    }

    println!(
        "Verified {} object(s): {} corrupt, {} dangling reference(s)",
        report.verified,
        report.corrupt.len(),
        dangling
    );
    if let Some(id) = report.corrupt.first() {
        return Err(Error::Corrupt {
            id: *id,
            detail: format!("{} corrupt object(s) in store", report.corrupt.len()),
        }
        .into());
    }
    if dangling > 0 {
        return Err(Error::NotFound(format!("{} dangling reference(s)", dangling)).into());
    }
    Ok(0)
}
