//! Provisioning of change-tracking infrastructure.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::retry::retry;
use rowsync_core::{ProvisioningManager, Schema, Table, TableChange, TableName};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A single provisioning action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionStep {
    /// Tracking infrastructure was created for a table.
    Create(TableName),
    /// A provisioned table was altered.
    Alter(TableChange),
    /// A table's tracking infrastructure was dropped.
    Drop(TableName),
}

/// What a provisioning call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningOutcome {
    /// Steps in execution order.
    pub steps: Vec<ProvisionStep>,
}

impl ProvisioningOutcome {
    /// Returns true if nothing was changed.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Drives a [`ProvisioningManager`] from schema snapshots.
#[derive(Clone)]
pub struct Provisioner {
    manager: Arc<dyn ProvisioningManager>,
    retry: RetryConfig,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Creates a provisioner.
    pub fn new(manager: Arc<dyn ProvisioningManager>, retry: RetryConfig) -> Self {
        Self { manager, retry }
    }

    /// Creates tracking infrastructure for every table of `schema`.
    pub async fn provision(
        &self,
        schema: &Schema,
        cancel: &CancellationToken,
    ) -> SyncResult<ProvisioningOutcome> {
        self.ensure(schema, cancel).await?;
        let steps = schema
            .tables()
            .iter()
            .map(|t| ProvisionStep::Create(t.name.clone()))
            .collect();
        info!(tables = schema.tables().len(), "provisioned");
        Ok(ProvisioningOutcome { steps })
    }

    /// Drops tracking infrastructure for every table of `schema`.
    pub async fn deprovision(
        &self,
        schema: &Schema,
        cancel: &CancellationToken,
    ) -> SyncResult<ProvisioningOutcome> {
        self.drop_tables(schema, cancel).await?;
        let steps = schema
            .tables()
            .iter()
            .map(|t| ProvisionStep::Drop(t.name.clone()))
            .collect();
        info!(tables = schema.tables().len(), "deprovisioned");
        Ok(ProvisioningOutcome { steps })
    }

    /// Moves the store from the `current` snapshot (`None` when never
    /// provisioned) to `target`.
    ///
    /// Removed tables are dropped first, then new tables created, then
    /// altered tables changed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SchemaIncompatible`] if a table changed its
    /// primary key.
    pub async fn reconcile(
        &self,
        current: Option<&Schema>,
        target: &Schema,
        cancel: &CancellationToken,
    ) -> SyncResult<ProvisioningOutcome> {
        let Some(current) = current else {
            return self.provision(target, cancel).await;
        };

        let diff = current.diff(target)?;
        let mut outcome = ProvisioningOutcome::default();

        if !diff.removed.is_empty() {
            let removed = Schema::new(diff.removed.clone())?;
            self.drop_tables(&removed, cancel).await?;
            outcome
                .steps
                .extend(diff.removed.iter().map(|t| ProvisionStep::Drop(t.name.clone())));
        }

        if !diff.added.is_empty() {
            let added = Schema::new(diff.added.clone())?;
            self.ensure(&added, cancel).await?;
            outcome
                .steps
                .extend(diff.added.iter().map(|t| ProvisionStep::Create(t.name.clone())));
        }

        for change in diff.altered {
            let table = target.table(&change.table).ok_or_else(|| {
                SyncError::SchemaIncompatible {
                    table: change.table.to_string(),
                    reason: "altered table missing from target schema".into(),
                }
            })?;
            self.alter(table, &change, cancel).await?;
            outcome.steps.push(ProvisionStep::Alter(change));
        }

        if !outcome.is_empty() {
            info!(steps = outcome.steps.len(), "schema reconciled");
        }
        Ok(outcome)
    }

    async fn ensure(&self, schema: &Schema, cancel: &CancellationToken) -> SyncResult<()> {
        let manager = &*self.manager;
        retry(&self.retry, cancel, "ensure_tracking_infrastructure", || async move {
            manager
                .ensure_tracking_infrastructure(schema)
                .await
                .map_err(SyncError::from)
        })
        .await
    }

    async fn alter(
        &self,
        table: &Table,
        change: &TableChange,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let manager = &*self.manager;
        retry(&self.retry, cancel, "alter_tracking_infrastructure", || async move {
            manager
                .alter_tracking_infrastructure(table, change)
                .await
                .map_err(SyncError::from)
        })
        .await
    }

    async fn drop_tables(&self, schema: &Schema, cancel: &CancellationToken) -> SyncResult<()> {
        let manager = &*self.manager;
        retry(&self.retry, cancel, "drop_tracking_infrastructure", || async move {
            manager
                .drop_tracking_infrastructure(schema)
                .await
                .map_err(SyncError::from)
        })
        .await
    }
}
