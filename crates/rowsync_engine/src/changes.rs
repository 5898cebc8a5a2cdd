//! Change selection into batches and batch application.
//!
//! Both participants run the same pipeline: the client selects its changes
//! for upload and applies the server's download, the server applies the
//! upload and selects the download.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::retry::retry;
use futures::stream::{self, StreamExt, TryStreamExt};
use rowsync_batch::{BatchEngine, BatchInfo, BatchPartInfo};
use rowsync_core::{
    ApplyFailureKind, ApplyOutcome, ChangeTrackingAdapter, CyclePolicy, RowKey, Schema, Table,
    TrackedRow,
};
use rowsync_protocol::{
    ApplyStats, Checkpoints, Conflict, ConflictEngine, ConflictType, Decision, RowFailure,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Direction a batch travels in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server.
    Upload,
    /// Server to client.
    Download,
}

impl Direction {
    fn includes(self, table: &Table) -> bool {
        match self {
            Direction::Upload => table.direction.uploads(),
            Direction::Download => table.direction.downloads(),
        }
    }
}

/// What to select from a store.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Direction the batch travels in; tables not synchronized in this
    /// direction are skipped.
    pub direction: Direction,
    /// Select rows changed after this timestamp (`None` selects everything).
    pub since: Option<u64>,
    /// Skip rows last written on behalf of this participant.
    pub exclude_origin: Option<Uuid>,
    /// Skip tombstones.
    pub live_only: bool,
}

impl Selection {
    /// Selects the delta after `since`, excluding rows written by `exclude`.
    pub fn delta(direction: Direction, since: Option<u64>, exclude: Option<Uuid>) -> Self {
        Self {
            direction,
            since,
            exclude_origin: exclude,
            live_only: false,
        }
    }

    /// Selects every live row.
    pub fn full(direction: Direction) -> Self {
        Self {
            direction,
            since: None,
            exclude_origin: None,
            live_only: true,
        }
    }
}

/// Streams the selected rows of every table of `schema` into a new batch.
///
/// The returned batch is finished. On error the partially written batch is
/// removed.
pub async fn select_into_batch(
    adapter: &dyn ChangeTrackingAdapter,
    batches: &BatchEngine,
    schema: &Schema,
    selection: &Selection,
    retry_config: &RetryConfig,
    cancel: &CancellationToken,
) -> SyncResult<BatchInfo> {
    let mut writer = batches.create_batch(schema)?;
    let chunk_size = batches.config().batch_size;

    for table in schema.tables() {
        if !selection.direction.includes(table) {
            continue;
        }
        if cancel.is_cancelled() {
            writer.abort()?;
            return Err(SyncError::Cancelled);
        }

        let name = &table.name;
        let since = selection.since;
        let exclude = selection.exclude_origin;
        let opened = retry(retry_config, cancel, "select_changes", || async move {
            adapter
                .select_changes(name, since, exclude)
                .await
                .map_err(SyncError::from)
        })
        .await;
        let mut rows = match opened {
            Ok(rows) => rows,
            Err(e) => {
                writer.abort()?;
                return Err(e);
            }
        };

        let mut chunk = Vec::with_capacity(chunk_size);
        let mut selected = 0usize;
        loop {
            let next = match rows.try_next().await {
                Ok(next) => next,
                Err(e) => {
                    writer.abort()?;
                    return Err(e.into());
                }
            };
            let Some(row) = next else { break };
            if selection.live_only && row.is_tombstone() {
                continue;
            }
            chunk.push(row);
            if chunk.len() >= chunk_size {
                selected += chunk.len();
                writer.add_part(name, chunk.drain(..))?;
            }
        }
        selected += chunk.len();
        writer.add_part(name, chunk)?;
        debug!(table = %name, rows = selected, "changes selected");
    }

    Ok(writer.finish()?)
}

/// Everything needed to apply a batch on one participant.
pub struct ApplyContext<'a> {
    /// Store the rows are applied to.
    pub adapter: &'a dyn ChangeTrackingAdapter,
    /// Schema of the applying side.
    pub schema: &'a Schema,
    /// Conflict classification and resolution.
    pub conflicts: &'a ConflictEngine,
    /// Checkpoints of this participant pair.
    pub checkpoints: Checkpoints,
    /// Participant that produced the batch.
    pub remote_id: Uuid,
    /// Direction the batch travelled in.
    pub direction: Direction,
    /// Rows of one part applied concurrently.
    pub degree_of_parallelism: usize,
    /// Ordering of cyclic tables.
    pub cycle_policy: CyclePolicy,
    /// Retries of transient adapter failures.
    pub retry: &'a RetryConfig,
    /// Checked between parts.
    pub cancel: &'a CancellationToken,
}

/// Result of applying a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Per-table counts.
    pub stats: ApplyStats,
    /// Rows the store rejected.
    pub failures: Vec<RowFailure>,
    /// True conflicts left unresolved.
    pub conflicts: Vec<Conflict>,
}

enum RowOutcome {
    Applied,
    Resolved,
    Skipped,
    Unresolved(Box<Conflict>),
    Failed(RowFailure),
}

/// Applies every part of `batch`, parents before children.
///
/// Rows of a part are applied concurrently up to the degree of parallelism.
/// Row-level failures and unresolved conflicts are collected in the report;
/// the call only fails on stage-level errors (incomplete batch, transient
/// adapter failures that outlived their retries, cancellation).
pub async fn apply_batch(ctx: &ApplyContext<'_>, batch: &BatchInfo) -> SyncResult<ApplyReport> {
    batch.ensure_complete()?;
    let parts: Vec<BatchPartInfo> = batch
        .enumerate_parts(ctx.cycle_policy)?
        .cloned()
        .collect();

    let mut report = ApplyReport::default();
    for part in parts {
        if ctx.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let Some(table) = ctx.schema.table(&part.table) else {
            return Err(SyncError::SchemaIncompatible {
                table: part.table.to_string(),
                reason: "table is not part of the scope".into(),
            });
        };
        if !ctx.direction.includes(table) {
            warn!(table = %table.name, direction = ?ctx.direction, rows = part.row_count, "skipping part of a table not synchronized in this direction");
            continue;
        }

        let rows = load_part(batch, &part).await?;
        debug!(table = %table.name, sequence = part.sequence, rows = rows.len(), "applying part");

        let outcomes: Vec<SyncResult<RowOutcome>> = stream::iter(rows)
            .map(|row| apply_row(ctx, table, row))
            .buffer_unordered(ctx.degree_of_parallelism.max(1))
            .collect()
            .await;

        let stats = report.stats.table_mut(&table.name);
        for outcome in outcomes {
            match outcome? {
                RowOutcome::Applied => stats.applied += 1,
                RowOutcome::Resolved => stats.resolved_conflicts += 1,
                RowOutcome::Skipped => {}
                RowOutcome::Unresolved(conflict) => {
                    stats.unresolved_conflicts += 1;
                    report.conflicts.push(*conflict);
                }
                RowOutcome::Failed(failure) => {
                    warn!(table = %failure.table, key = %failure.key, conflict_type = %failure.conflict_type, reason = %failure.reason, "row not applied");
                    stats.failed += 1;
                    report.failures.push(failure);
                }
            }
        }
    }

    Ok(report)
}

async fn load_part(batch: &BatchInfo, part: &BatchPartInfo) -> SyncResult<Vec<TrackedRow>> {
    let batch = batch.clone();
    let part = part.clone();
    tokio::task::spawn_blocking(move || batch.load_part(&part))
        .await
        .map_err(|e| SyncError::Internal(format!("part loader failed: {e}")))?
        .map_err(SyncError::from)
}

async fn apply_row(
    ctx: &ApplyContext<'_>,
    table: &Table,
    remote: TrackedRow,
) -> SyncResult<RowOutcome> {
    let key = match remote.key(table) {
        Ok(key) => key,
        Err(e) => {
            return Ok(RowOutcome::Failed(RowFailure {
                table: table.name.clone(),
                key: RowKey(Vec::new()),
                conflict_type: ConflictType::ErrorsOccurred,
                reason: e.to_string(),
            }))
        }
    };
    let failed = |conflict_type, reason: String| {
        RowOutcome::Failed(RowFailure {
            table: table.name.clone(),
            key: key.clone(),
            conflict_type,
            reason,
        })
    };

    let name = &table.name;
    let row_key = &key;
    let read = retry(ctx.retry, ctx.cancel, "get_row", || async move {
        ctx.adapter
            .get_row(name, row_key)
            .await
            .map_err(SyncError::from)
    })
    .await;
    let mut local = match read {
        Ok(local) => local,
        Err(e) if e.is_retryable() || matches!(e, SyncError::Cancelled) => return Err(e),
        Err(e) => return Ok(failed(ConflictType::ErrorsOccurred, e.to_string())),
    };

    // The stored row may change between the read and the write; re-decide
    // once against the row the store reports.
    for _ in 0..2 {
        let decision = ctx.conflicts.decide(
            table,
            &key,
            local.as_ref(),
            &remote,
            ctx.checkpoints,
            ctx.remote_id,
        );
        let (row, expected_prior, conflict) = match decision {
            Decision::Skip(_) => return Ok(RowOutcome::Skipped),
            Decision::Unresolved(conflict) => {
                return Ok(RowOutcome::Unresolved(Box::new(conflict)))
            }
            Decision::Write {
                row,
                expected_prior,
                conflict,
            } => (row, expected_prior, conflict),
        };

        let row = &row;
        let written = retry(ctx.retry, ctx.cancel, "apply_row", || async move {
            ctx.adapter
                .apply_row(name, row, expected_prior)
                .await
                .map_err(SyncError::from)
        })
        .await;
        match written {
            Ok(ApplyOutcome::Applied) if conflict.is_some() => return Ok(RowOutcome::Resolved),
            Ok(ApplyOutcome::Applied) => return Ok(RowOutcome::Applied),
            Ok(ApplyOutcome::Failed(failure)) => {
                let conflict_type = match failure.kind {
                    ApplyFailureKind::UniqueKeyConstraint => ConflictType::UniqueKeyConstraint,
                    ApplyFailureKind::Other => ConflictType::ErrorsOccurred,
                };
                return Ok(failed(conflict_type, failure.reason));
            }
            Ok(ApplyOutcome::Conflicted(current)) => local = current,
            Err(e) if e.is_retryable() || matches!(e, SyncError::Cancelled) => return Err(e),
            Err(e) => return Ok(failed(ConflictType::ErrorsOccurred, e.to_string())),
        }
    }

    Ok(failed(
        ConflictType::ErrorsOccurred,
        "row kept changing while it was applied".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_batch::BatchConfig;
    use rowsync_core::{Row, SyncDirection, TableName, Value};
    use rowsync_protocol::{ConflictPolicy, Side};
    use rowsync_testkit::fixtures::{customer, order, people_schema, person, shop_schema};
    use rowsync_testkit::MemoryDataStore;
    use std::time::Duration;
    use tempfile::tempdir;

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    fn key(id: i64) -> RowKey {
        RowKey(vec![Value::Integer(id)])
    }

    #[tokio::test]
    async fn selection_honours_checkpoint_and_origin() {
        let dir = tempdir().unwrap();
        let batches = BatchEngine::new(BatchConfig::new(dir.path()).with_batch_size(2));
        let store = MemoryDataStore::new();
        let schema = people_schema();
        store.provision_now(&schema);
        let people: TableName = "people".into();
        let server = Uuid::new_v4();

        store.upsert(&people, person(1, "ada")).unwrap();
        let checkpoint = store.local_timestamp().await.unwrap();
        for id in 2..=5 {
            store.upsert(&people, person(id, "x")).unwrap();
        }
        store
            .apply_row(&people, &TrackedRow::live(person(6, "srv"), 1, Some(server)), None)
            .await
            .unwrap();
        store.delete(&people, &key(2)).unwrap();

        let cancel = CancellationToken::new();
        let selection = Selection::delta(Direction::Upload, Some(checkpoint), Some(server));
        let batch = select_into_batch(&store, &batches, &schema, &selection, &fast_retry(), &cancel)
            .await
            .unwrap();
        assert_eq!(batch.row_count(), 4);
        assert_eq!(batch.parts.len(), 2);

        let full = select_into_batch(
            &store,
            &batches,
            &schema,
            &Selection::full(Direction::Upload),
            &fast_retry(),
            &cancel,
        )
        .await
        .unwrap();
        // Five live rows; the tombstone of 2 is skipped.
        assert_eq!(full.row_count(), 5);
    }

    #[tokio::test]
    async fn selection_skips_tables_by_direction() {
        let dir = tempdir().unwrap();
        let batches = BatchEngine::new(BatchConfig::new(dir.path()));
        let store = MemoryDataStore::new();
        let mut tables = people_schema().tables().to_vec();
        tables[0] = tables[0].clone().with_direction(SyncDirection::DownloadOnly);
        let schema = Schema::new(tables).unwrap();
        store.provision_now(&schema);
        store.upsert(&"people".into(), person(1, "ada")).unwrap();

        let batch = select_into_batch(
            &store,
            &batches,
            &schema,
            &Selection::delta(Direction::Upload, None, None),
            &fast_retry(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn transient_select_failures_are_retried() {
        let dir = tempdir().unwrap();
        let batches = BatchEngine::new(BatchConfig::new(dir.path()));
        let store = MemoryDataStore::new();
        let schema = people_schema();
        store.provision_now(&schema);
        store.upsert(&"people".into(), person(1, "ada")).unwrap();
        store.fail_next(2);

        let batch = select_into_batch(
            &store,
            &batches,
            &schema,
            &Selection::delta(Direction::Upload, None, None),
            &fast_retry(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(batch.row_count(), 1);
    }

    #[tokio::test]
    async fn apply_writes_parents_first_and_counts_rows() {
        let dir = tempdir().unwrap();
        let batches = BatchEngine::new(BatchConfig::new(dir.path()).with_batch_size(1));
        let schema = shop_schema();
        let source = MemoryDataStore::new();
        let target = MemoryDataStore::new();
        source.provision_now(&schema);
        target.provision_now(&schema);

        source.upsert(&"orders".into(), order(10, 1, 5)).unwrap();
        source.upsert(&"customers".into(), customer(1, "ada")).unwrap();
        source.upsert(&"orders".into(), order(11, 1, 7)).unwrap();

        let cancel = CancellationToken::new();
        let batch = select_into_batch(
            &source,
            &batches,
            &schema,
            &Selection::delta(Direction::Upload, None, None),
            &fast_retry(),
            &cancel,
        )
        .await
        .unwrap();

        let conflicts = ConflictEngine::new(ConflictPolicy::ServerWins, Side::Server);
        let retry_config = fast_retry();
        let client = Uuid::new_v4();
        let ctx = ApplyContext {
            adapter: &target,
            schema: &schema,
            conflicts: &conflicts,
            checkpoints: Checkpoints::default(),
            remote_id: client,
            direction: Direction::Upload,
            degree_of_parallelism: 4,
            cycle_policy: CyclePolicy::Fail,
            retry: &retry_config,
            cancel: &cancel,
        };
        let report = apply_batch(&ctx, &batch).await.unwrap();

        assert_eq!(report.stats.total().applied, 3);
        assert!(report.failures.is_empty());
        let writes = target.applied_writes();
        assert_eq!(writes[0].table, TableName::from("customers"));
        assert!(writes[1..].iter().all(|w| w.table == TableName::from("orders")));
        let stored = target.tracked_row(&"customers".into(), &key(1)).unwrap();
        assert_eq!(stored.metadata.update_scope_id, Some(client));
    }

    #[tokio::test]
    async fn unique_violations_fail_only_their_row() {
        let dir = tempdir().unwrap();
        let batches = BatchEngine::new(BatchConfig::new(dir.path()));
        let schema = people_schema();
        let source = MemoryDataStore::new();
        let target = MemoryDataStore::new().with_unique("people", "email");
        source.provision_now(&schema);
        target.provision_now(&schema);
        let people: TableName = "people".into();

        target
            .upsert(&people, person(9, "zed").with("email", "a@x"))
            .unwrap();
        source
            .upsert(&people, person(1, "ada").with("email", "a@x"))
            .unwrap();
        source.upsert(&people, person(2, "bob")).unwrap();

        let cancel = CancellationToken::new();
        let batch = select_into_batch(
            &source,
            &batches,
            &schema,
            &Selection::delta(Direction::Download, None, None),
            &fast_retry(),
            &cancel,
        )
        .await
        .unwrap();

        let conflicts = ConflictEngine::new(ConflictPolicy::ServerWins, Side::Client);
        let retry_config = fast_retry();
        let ctx = ApplyContext {
            adapter: &target,
            schema: &schema,
            conflicts: &conflicts,
            checkpoints: Checkpoints::default(),
            remote_id: Uuid::new_v4(),
            direction: Direction::Download,
            degree_of_parallelism: 2,
            cycle_policy: CyclePolicy::Fail,
            retry: &retry_config,
            cancel: &cancel,
        };
        let report = apply_batch(&ctx, &batch).await.unwrap();

        let stats = report.stats.table(&people);
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, key(1));
        assert_eq!(
            report.failures[0].conflict_type,
            ConflictType::UniqueKeyConstraint
        );
        assert_eq!(target.rows(&people).len(), 2);
    }

    #[tokio::test]
    async fn apply_stops_when_cancelled() {
        let dir = tempdir().unwrap();
        let batches = BatchEngine::new(BatchConfig::new(dir.path()));
        let schema = people_schema();
        let store = MemoryDataStore::new();
        store.provision_now(&schema);
        let mut writer = batches.create_batch(&schema).unwrap();
        writer
            .add_part(
                &"people".into(),
                vec![TrackedRow::live(Row::new().with("id", 1).with("name", "a"), 1, None)],
            )
            .unwrap();
        let batch = writer.finish().unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let conflicts = ConflictEngine::new(ConflictPolicy::ServerWins, Side::Client);
        let retry_config = fast_retry();
        let ctx = ApplyContext {
            adapter: &store,
            schema: &schema,
            conflicts: &conflicts,
            checkpoints: Checkpoints::default(),
            remote_id: Uuid::new_v4(),
            direction: Direction::Download,
            degree_of_parallelism: 1,
            cycle_policy: CyclePolicy::Fail,
            retry: &retry_config,
            cancel: &cancel,
        };
        assert!(matches!(
            apply_batch(&ctx, &batch).await,
            Err(SyncError::Cancelled)
        ));
        assert!(store.rows(&"people".into()).is_empty());
    }
}
