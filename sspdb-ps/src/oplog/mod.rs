//! Pending writes of a client process.
//!
//! Writes are coalesced per column until a background worker
//! flushes them to servers. Each table keeps one partition per
//! comm channel, so application threads writing rows of different
//! channels do not contend on the same lock.
pub mod codec;

use self::codec::OpLogWriter;
use crate::context::{EntityID, Partitioner};
use crate::error::{Error, Result};
use crate::{ColumnID, RowID, RowValue, TableID, Update};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Coalesced pending updates of one row, ordered by column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowOpLog {
    updates: BTreeMap<ColumnID, Update>,
}

impl RowOpLog {
    /// Record an update, merging with the pending one of the same column.
    /// Returns true if the column had no pending update.
    #[inline]
    pub fn record(&mut self, col: ColumnID, update: Update) -> bool {
        match self.updates.get_mut(&col) {
            Some(pending) => {
                *pending = pending.merge(update);
                false
            }
            None => {
                self.updates.insert(col, update);
                true
            }
        }
    }

    #[inline]
    pub fn find(&self, col: ColumnID) -> Option<Update> {
        self.updates.get(&col).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.updates.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (ColumnID, Update)> + '_ {
        self.updates.iter().map(|(c, u)| (*c, *u))
    }

    /// Replay pending updates on a row value.
    #[inline]
    pub fn apply_to(&self, value: &mut RowValue) -> Result<()> {
        for (col, update) in &self.updates {
            value.apply_update(*col, update)?;
        }
        Ok(())
    }
}

/// Pending updates of the rows of one table handled by one channel.
#[derive(Debug, Default)]
pub struct OpLogPartition {
    rows: BTreeMap<RowID, RowOpLog>,
    num_entries: usize,
    flush_advised: bool,
}

impl OpLogPartition {
    #[inline]
    pub fn record(&mut self, row_id: RowID, col: ColumnID, update: Update) {
        if self.rows.entry(row_id).or_default().record(col, update) {
            self.num_entries += 1;
        }
    }

    #[inline]
    pub fn find(&self, row_id: RowID) -> Option<&RowOpLog> {
        self.rows.get(&row_id)
    }

    #[inline]
    pub fn find_update(&self, row_id: RowID, col: ColumnID) -> Option<Update> {
        self.rows.get(&row_id).and_then(|r| r.find(col))
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Number of distinct pending (row, column) entries.
    #[inline]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (RowID, &RowOpLog)> {
        self.rows.iter().map(|(r, o)| (*r, o))
    }

    /// Append every row to the writer of the server owning it.
    /// Each writer must already have begun this table.
    #[inline]
    pub fn serialize_by_server(
        &self,
        table_id: TableID,
        partitioner: &Partitioner,
        writers: &mut BTreeMap<EntityID, OpLogWriter>,
    ) -> Result<()> {
        for (row_id, oplog) in &self.rows {
            let server = partitioner.server_of(table_id, *row_id);
            let writer = writers
                .get_mut(&server)
                .ok_or(Error::EndpointNotFound(server))?;
            writer.append_row(*row_id, oplog);
        }
        Ok(())
    }
}

/// Whether caller should request a flush of the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpLogStatus {
    Recorded,
    FlushAdvised,
}

/// Pending updates of one table, partitioned by comm channel.
pub struct TableOpLog {
    table_id: TableID,
    partitions: Vec<CachePadded<Mutex<OpLogPartition>>>,
    max_pending: usize,
}

impl TableOpLog {
    #[inline]
    pub fn new(table_id: TableID, num_channels: usize, max_pending: usize) -> Self {
        debug_assert!(num_channels > 0);
        let partitions = (0..num_channels)
            .map(|_| CachePadded::new(Mutex::new(OpLogPartition::default())))
            .collect();
        TableOpLog {
            table_id,
            partitions,
            max_pending,
        }
    }

    #[inline]
    pub fn table_id(&self) -> TableID {
        self.table_id
    }

    #[inline]
    pub fn channel_of(&self, row_id: RowID) -> usize {
        row_id.rem_euclid(self.partitions.len() as i32) as usize
    }

    /// Mutate the partition of given row under its lock.
    /// Flush is advised once when pending entries exceed the limit.
    #[inline]
    pub fn update<R, F>(&self, row_id: RowID, f: F) -> (R, OpLogStatus)
    where
        F: FnOnce(&mut OpLogPartition) -> R,
    {
        let mut g = self.partitions[self.channel_of(row_id)].lock();
        let res = f(&mut *g);
        let status = if g.num_entries > self.max_pending && !g.flush_advised {
            g.flush_advised = true;
            OpLogStatus::FlushAdvised
        } else {
            OpLogStatus::Recorded
        };
        (res, status)
    }

    /// Read the partition of given row under its lock.
    #[inline]
    pub fn with_partition<R, F>(&self, row_id: RowID, f: F) -> R
    where
        F: FnOnce(&OpLogPartition) -> R,
    {
        let g = self.partitions[self.channel_of(row_id)].lock();
        f(&*g)
    }

    #[inline]
    pub fn put(&self, row_id: RowID, col: ColumnID, val: f32) -> OpLogStatus {
        self.update(row_id, |p| p.record(row_id, col, Update::Put(val)))
            .1
    }

    #[inline]
    pub fn inc(&self, row_id: RowID, col: ColumnID, delta: f32) -> OpLogStatus {
        self.update(row_id, |p| p.record(row_id, col, Update::Inc(delta)))
            .1
    }

    #[inline]
    pub fn find_update(&self, row_id: RowID, col: ColumnID) -> Option<Update> {
        self.with_partition(row_id, |p| p.find_update(row_id, col))
    }

    /// Swap out all pending updates of one channel.
    #[inline]
    pub fn take_partition(&self, channel: usize) -> OpLogPartition {
        std::mem::take(&mut *self.partitions[channel].lock())
    }
}
