//! Store-side provisioning contract.

use crate::error::AdapterResult;
use crate::schema::{Schema, Table, TableChange};
use async_trait::async_trait;

/// Installs and removes the change-tracking infrastructure of a store.
///
/// Every operation must be idempotent: running it against a store that is
/// already in the requested state succeeds without changes.
#[async_trait]
pub trait ProvisioningManager: Send + Sync {
    /// Creates every table of `schema` that is missing, together with its
    /// tracking metadata. Existing tables are left untouched.
    async fn ensure_tracking_infrastructure(&self, schema: &Schema) -> AdapterResult<()>;

    /// Applies column changes to a provisioned table. `table` is the target
    /// definition.
    async fn alter_tracking_infrastructure(
        &self,
        table: &Table,
        change: &TableChange,
    ) -> AdapterResult<()>;

    /// Removes the tracking infrastructure (and data) of every table of
    /// `schema`.
    async fn drop_tracking_infrastructure(&self, schema: &Schema) -> AdapterResult<()>;
}
