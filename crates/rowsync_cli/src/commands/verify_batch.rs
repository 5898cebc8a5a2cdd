//! Verify-batch command implementation.

use rowsync_batch::BatchInfo;
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of parts checked.
    pub parts_checked: usize,
    /// Number of rows read from valid parts.
    pub rows_read: usize,
    /// Number of parts that failed their check.
    pub corrupt_parts: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Returns true if nothing was wrong.
    pub fn is_ok(&self) -> bool {
        self.corrupt_parts == 0 && self.errors.is_empty()
    }
}

/// Runs the verify-batch command.
pub fn run(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying batch at {:?}", dir);
    println!();

    let info = BatchInfo::load(dir)?;
    let result = verify(&info);

    println!("Parts checked: {}", result.parts_checked);
    println!("Rows read:     {}", result.rows_read);
    println!("Corrupt parts: {}", result.corrupt_parts);
    for error in &result.errors {
        println!("  - {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Batch verification passed");
        Ok(())
    } else {
        println!("✗ Batch verification failed");
        Err("Verification failed".into())
    }
}

/// Checks completeness and reads every part, collecting all problems
/// instead of stopping at the first.
pub fn verify(info: &BatchInfo) -> VerifyResult {
    let mut result = VerifyResult::default();

    if let Err(e) = info.ensure_complete() {
        result.errors.push(e.to_string());
    }

    for part in &info.parts {
        result.parts_checked += 1;
        match info.load_part(part) {
            Ok(rows) if rows.len() == part.row_count => result.rows_read += rows.len(),
            Ok(rows) => {
                result.corrupt_parts += 1;
                result.errors.push(format!(
                    "{}: manifest says {} rows, file holds {}",
                    part.file_name,
                    part.row_count,
                    rows.len()
                ));
            }
            Err(e) => {
                result.corrupt_parts += 1;
                result.errors.push(e.to_string());
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::shop_batch;
    use std::fs;

    #[test]
    fn intact_batch_passes() {
        let dir = tempfile::tempdir().unwrap();
        let info = shop_batch(dir.path());
        let result = verify(&info);
        assert!(result.is_ok(), "{:?}", result.errors);
        assert_eq!(result.parts_checked, 4);
        assert_eq!(result.rows_read, 6);
    }

    #[test]
    fn reports_every_damaged_part() {
        let dir = tempfile::tempdir().unwrap();
        let info = shop_batch(dir.path());
        let first = info.path().join(&info.parts[0].file_name);
        fs::write(&first, b"garbage").unwrap();
        fs::remove_file(info.path().join(&info.parts[3].file_name)).unwrap();

        let result = verify(&info);
        assert!(!result.is_ok());
        assert_eq!(result.parts_checked, 4);
        assert_eq!(result.corrupt_parts, 2);
        assert_eq!(result.rows_read, 3);
        // Missing part also fails the completeness check.
        assert_eq!(result.errors.len(), 3);
        assert!(result.errors.iter().any(|e| e.contains("checksum")));
    }
}
