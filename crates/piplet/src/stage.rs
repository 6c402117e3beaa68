//! Attempt-scoped staging of worker output files.
//!
//! A worker may drop files into its staging directory during the run; after
//! a fault-free FLUSH they are copied to the configured destination. The
//! directory name carries the task-attempt id so concurrent attempts on one
//! host never collide.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Staging directory for one task attempt.
pub fn staging_dir(task_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("piplet-{task_id}"))
}

/// Copy every regular file staged by the attempt into `dest`, then remove
/// the staging directory. An absent staging directory copies nothing.
pub fn copy_staged(task_id: &str, dest: &Path) -> io::Result<usize> {
    let staging = staging_dir(task_id);
    if !staging.is_dir() {
        return Ok(0);
    }

    fs::create_dir_all(dest)?;
    let mut copied = 0;
    for entry in fs::read_dir(&staging)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            tracing::warn!(path = %entry.path().display(), "skipping non-regular staged entry");
            continue;
        }
        fs::copy(entry.path(), dest.join(entry.file_name()))?;
        copied += 1;
    }
    fs::remove_dir_all(&staging)?;

    tracing::debug!(copied, dest = %dest.display(), "staged files copied");
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_task_id(name: &str) -> String {
        format!("test-{}-{name}", std::process::id())
    }

    #[test]
    fn staging_dir_is_attempt_scoped() {
        let a = staging_dir("attempt_0001_m_000000_0");
        let b = staging_dir("attempt_0001_m_000000_1");
        assert_ne!(a, b);
        assert!(a.ends_with("piplet-attempt_0001_m_000000_0"));
    }

    #[test]
    fn copies_staged_files_and_removes_staging() {
        let task_id = unique_task_id("copy");
        let staging = staging_dir(&task_id);
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("part-r-00000"), b"alpha").unwrap();
        fs::write(staging.join("part-r-00001"), b"beta").unwrap();

        let dest = std::env::temp_dir().join(format!("piplet-dest-{task_id}"));
        let copied = copy_staged(&task_id, &dest).unwrap();

        assert_eq!(copied, 2);
        assert_eq!(fs::read(dest.join("part-r-00000")).unwrap(), b"alpha");
        assert_eq!(fs::read(dest.join("part-r-00001")).unwrap(), b"beta");
        assert!(!staging.exists());

        fs::remove_dir_all(&dest).unwrap();
    }

    #[test]
    fn missing_staging_dir_copies_nothing() {
        let task_id = unique_task_id("absent");
        let dest = std::env::temp_dir().join(format!("piplet-dest-{task_id}"));
        assert_eq!(copy_staged(&task_id, &dest).unwrap(), 0);
        assert!(!dest.exists());
    }
}
