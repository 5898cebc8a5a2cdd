//! Sequential part reader.

use crate::error::BatchResult;
use crate::info::{BatchInfo, BatchPartInfo};
use rowsync_core::{CyclePolicy, TrackedRow};

/// Reads the parts of a finished batch in consumption order, one part in
/// memory at a time.
#[derive(Debug)]
pub struct BatchReader<'a> {
    info: &'a BatchInfo,
    order: std::vec::IntoIter<&'a BatchPartInfo>,
}

impl<'a> BatchReader<'a> {
    /// Creates a reader over a complete batch.
    ///
    /// # Errors
    ///
    /// Fails if the batch is incomplete or its schema has a cycle under
    /// `policy`.
    pub fn new(info: &'a BatchInfo, policy: CyclePolicy) -> BatchResult<Self> {
        info.ensure_complete()?;
        let order: Vec<&BatchPartInfo> = info.enumerate_parts(policy)?.collect();
        Ok(Self {
            info,
            order: order.into_iter(),
        })
    }

    /// Returns the number of parts not yet read.
    pub fn remaining(&self) -> usize {
        self.order.len()
    }
}

impl<'a> Iterator for BatchReader<'a> {
    type Item = BatchResult<(&'a BatchPartInfo, Vec<TrackedRow>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let part = self.order.next()?;
        Some(self.info.load_part(part).map(|rows| (part, rows)))
    }
}
