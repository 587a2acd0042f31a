//! Crash-safe file writes

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Write `data` to `path` through a uniquely named temp file in the same
/// directory, fsync it, then rename it into place.
///
/// Readers observe either the previous file or the complete new one. The
/// temp file is removed if any step fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let written = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_data()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read a small text file, trimming surrounding whitespace. Missing files
/// read as `None`.
pub fn read_trimmed(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_read_trimmed_missing() {
        let dir = tempdir().unwrap();
        assert_eq!(read_trimmed(&dir.path().join("nope")).unwrap(), None);
        fs::write(dir.path().join("yes"), "  value\n").unwrap();
        assert_eq!(read_trimmed(&dir.path().join("yes")).unwrap().as_deref(), Some("value"));
    }
}
