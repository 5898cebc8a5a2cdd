//! Scopes command implementation.

use rowsync_core::{
    FileScopeStore, HistoryEntry, LogicalClock, Scope, ScopeRole, ScopeStore, SessionOutcome,
};
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Runs the scopes command.
///
/// Opening the store takes its directory lock, so this fails while a
/// participant holds the store open.
pub fn run(store_dir: &Path, show_history: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !store_dir.is_dir() {
        return Err(format!("No scope store found at {:?}", store_dir).into());
    }
    let store = FileScopeStore::open(store_dir, Arc::new(LogicalClock::new()))?;
    let scopes = store.list_scopes()?;
    tracing::debug!(count = scopes.len(), "loaded scopes");

    if scopes.is_empty() {
        println!("No scopes");
        return Ok(());
    }

    for scope in &scopes {
        println!("{}", describe_scope(scope));
        if show_history && scope.role == ScopeRole::Server {
            let history = store.history(&scope.name)?;
            if history.is_empty() {
                println!("    (no history)");
            }
            for entry in &history {
                println!("    {}", describe_entry(entry));
            }
            if let Some(min) = store.min_client_checkpoint(&scope.name)? {
                println!("    oldest client checkpoint: {min}");
            }
        }
    }

    Ok(())
}

/// One-line description of a scope.
pub fn describe_scope(scope: &Scope) -> String {
    let role = match scope.role {
        ScopeRole::Client => "client",
        ScopeRole::Server => "server",
        ScopeRole::ServerHistory => "history",
    };
    let tables = scope
        .schema
        .as_ref()
        .map(|s| {
            s.tables()
                .iter()
                .map(|t| t.name.to_string())
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_else(|| "-".into());
    let mut line = format!(
        "{} [{}] owner={} rev={} tables={} local={} server={}",
        scope.name,
        role,
        scope.owner_id,
        scope.revision,
        tables,
        checkpoint(scope.last_sync_timestamp),
        checkpoint(scope.last_server_sync_timestamp),
    );
    if scope.is_new {
        line.push_str(" new");
    }
    if let Some(claim) = scope.session {
        line.push_str(&format!(" claimed-by={}", claim.session_id));
    }
    line
}

/// One-line description of a history record.
pub fn describe_entry(entry: &HistoryEntry) -> String {
    let outcome = match &entry.outcome {
        SessionOutcome::Succeeded => "ok".to_string(),
        SessionOutcome::Cancelled => "cancelled".to_string(),
        SessionOutcome::Failed { reason } => format!("failed ({reason})"),
    };
    let finished = entry
        .finished_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!(
        "{finished} client={} {:?} {} checkpoint={} up={} down={} failed={}",
        entry.client_id,
        entry.sync_type,
        outcome,
        checkpoint(entry.server_checkpoint),
        entry.rows_uploaded,
        entry.rows_downloaded,
        entry.rows_failed,
    )
}

fn checkpoint(value: Option<u64>) -> String {
    value.map_or_else(|| "-".into(), |v| v.to_string())
}
