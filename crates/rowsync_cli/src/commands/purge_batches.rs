//! Purge-batches command implementation.

use rowsync_batch::{BatchConfig, BatchEngine};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runs the purge-batches command.
pub fn run(
    root: &Path,
    older_than_secs: u64,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let removed = purge(root, Duration::from_secs(older_than_secs), dry_run)?;

    if removed.is_empty() {
        println!("No batch directories older than {older_than_secs}s under {:?}", root);
        return Ok(());
    }

    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!("{verb} {} batch directories:", removed.len());
    for dir in &removed {
        println!("  {}", dir.display());
    }

    Ok(())
}

/// Lists, and unless `dry_run` removes, batch directories under `root`
/// created more than `older_than` ago.
pub fn purge(
    root: &Path,
    older_than: Duration,
    dry_run: bool,
) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let engine = BatchEngine::new(BatchConfig::new(root));
    let dirs = if dry_run {
        engine.stale_batches(older_than)?
    } else {
        engine.purge_stale(older_than)?
    };
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::shop_batch;
    use std::fs;

    #[test]
    fn dry_run_keeps_directories() {
        let dir = tempfile::tempdir().unwrap();
        let info = shop_batch(dir.path());
        // Not a batch name; never touched.
        fs::create_dir(dir.path().join("notes")).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let listed = purge(dir.path(), Duration::ZERO, true).unwrap();
        assert_eq!(listed, vec![info.path()]);
        assert!(info.path().exists());

        let removed = purge(dir.path(), Duration::ZERO, false).unwrap();
        assert_eq!(removed, vec![info.path()]);
        assert!(!info.path().exists());
        assert!(dir.path().join("notes").exists());
    }

    #[test]
    fn young_batches_survive() {
        let dir = tempfile::tempdir().unwrap();
        let info = shop_batch(dir.path());
        let removed = purge(dir.path(), Duration::from_secs(3600), false).unwrap();
        assert!(removed.is_empty());
        assert!(info.path().exists());
    }

    #[test]
    fn missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let removed = purge(&dir.path().join("none"), Duration::ZERO, false).unwrap();
        assert!(removed.is_empty());
    }
}
