//! Inspect-batch command implementation.

use super::format_size;
use rowsync_batch::BatchInfo;
use rowsync_core::CyclePolicy;
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Batch inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Batch directory.
    pub path: String,
    /// Whether the writer finished the batch.
    pub finished: bool,
    /// Total rows across parts.
    pub row_count: usize,
    /// Bytes on disk, manifest included.
    pub size: u64,
    /// Per-table statistics in first-written order.
    pub tables: Vec<TableStats>,
    /// Parts in the order they were written.
    pub parts: Vec<PartStats>,
    /// Part files in the order a consumer applies them.
    pub apply_order: Vec<String>,
}

/// Statistics for one table of a batch.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table name.
    pub table: String,
    /// Number of parts.
    pub parts: usize,
    /// Number of rows.
    pub rows: usize,
}

/// One part as recorded in the manifest.
#[derive(Debug, Serialize)]
pub struct PartStats {
    /// Part file name.
    pub file: String,
    /// Table name.
    pub table: String,
    /// Sequence within the table.
    pub sequence: u32,
    /// Number of rows.
    pub rows: usize,
    /// Whether this is the final part.
    pub last: bool,
}

/// Runs the inspect-batch command.
pub fn run(dir: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let info = BatchInfo::load(dir)?;
    let result = inspect(&info)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Summarizes a loaded batch.
pub fn inspect(info: &BatchInfo) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let tables = info
        .tables()
        .into_iter()
        .map(|table| {
            let parts: Vec<_> = info.parts.iter().filter(|p| &p.table == table).collect();
            TableStats {
                table: table.to_string(),
                parts: parts.len(),
                rows: parts.iter().map(|p| p.row_count).sum(),
            }
        })
        .collect();

    let parts = info
        .parts
        .iter()
        .map(|p| PartStats {
            file: p.file_name.clone(),
            table: p.table.to_string(),
            sequence: p.sequence,
            rows: p.row_count,
            last: p.is_last_batch,
        })
        .collect();

    // Lenient so that a cyclic schema still shows an order.
    let apply_order = info
        .enumerate_parts(CyclePolicy::AppendInDeclarationOrder)?
        .map(|p| p.file_name.clone())
        .collect();

    Ok(InspectResult {
        path: info.path().display().to_string(),
        finished: info.finished,
        row_count: info.row_count(),
        size: dir_size(&info.path())?,
        tables,
        parts,
        apply_order,
    })
}

fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let metadata = entry?.metadata()?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}

fn print_text_output(result: &InspectResult) {
    println!("RowSync Batch Inspection");
    println!("========================");
    println!();
    println!("Path:     {}", result.path);
    println!("Finished: {}", if result.finished { "yes" } else { "no" });
    println!("Rows:     {}", result.row_count);
    println!("Size:     {} bytes", format_size(result.size));
    println!();
    println!("Tables:");
    for table in &result.tables {
        println!(
            "  {}: {} rows in {} parts",
            table.table, table.rows, table.parts
        );
    }
    println!();
    println!("Parts:");
    for part in &result.parts {
        println!(
            "  {} {}#{} {} rows{}",
            part.file,
            part.table,
            part.sequence,
            part.rows,
            if part.last { " (last)" } else { "" }
        );
    }
    println!();
    println!("Apply order: {}", result.apply_order.join(", "));
}
