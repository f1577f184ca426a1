use crate::cache::RowCache;
use crate::config::{TableConfig, TableInfo};
use crate::consistency::ConsistencyController;
use crate::context::{ClientContext, ThreadHandle};
use crate::error::{Error, Result};
use crate::oplog::TableOpLog;
use crate::{ColumnID, RowID, RowValue, TableID, Update};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Client side of a table.
///
/// It owns the process cache and pending oplogs of the table, and
/// serves reads and writes of application threads through its
/// consistency controller.
pub struct ClientTable {
    table_id: TableID,
    config: TableConfig,
    pub(crate) cache: Mutex<RowCache>,
    pub(crate) oplog: TableOpLog,
    pub(crate) controller: ConsistencyController,
    pub(crate) ctx: Arc<ClientContext>,
}

impl ClientTable {
    #[inline]
    pub(crate) fn new(table_id: TableID, config: TableConfig, ctx: Arc<ClientContext>) -> Self {
        let cache = RowCache::new(
            config.process_cache_capacity,
            config.resolved_active_capacity(),
            config.accesses_to_promote,
        );
        let oplog = TableOpLog::new(
            table_id,
            ctx.partitioner.num_channels(),
            config.max_pending_op_logs,
        );
        let controller =
            ConsistencyController::new(ctx.cluster.consistency_model, config.info.staleness);
        ClientTable {
            table_id,
            config,
            cache: Mutex::new(cache),
            oplog,
            controller,
            ctx,
        }
    }

    #[inline]
    pub fn table_id(&self) -> TableID {
        self.table_id
    }

    #[inline]
    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    #[inline]
    pub fn info(&self) -> &TableInfo {
        &self.config.info
    }

    /// Read one column. The value reflects all writes of this process
    /// and all writes of other processes older than staleness allows.
    #[inline]
    pub fn get(&self, handle: &ThreadHandle, row_id: RowID, col: ColumnID) -> Result<f32> {
        self.check_row(row_id)?;
        self.check_col(col)?;
        self.controller.get(self, handle, row_id, col)
    }

    /// Copy out a whole row.
    #[inline]
    pub fn get_row(&self, handle: &ThreadHandle, row_id: RowID) -> Result<RowValue> {
        self.check_row(row_id)?;
        self.controller.get_row(self, handle, row_id)
    }

    #[inline]
    pub fn put(&self, handle: &ThreadHandle, row_id: RowID, col: ColumnID, val: f32) -> Result<()> {
        self.check_row(row_id)?;
        self.check_col(col)?;
        self.controller
            .update(self, handle, row_id, &[(col, Update::Put(val))])
    }

    #[inline]
    pub fn inc(&self, handle: &ThreadHandle, row_id: RowID, col: ColumnID, delta: f32) -> Result<()> {
        self.check_row(row_id)?;
        self.check_col(col)?;
        self.controller
            .update(self, handle, row_id, &[(col, Update::Inc(delta))])
    }

    /// Increment several columns of one row at once.
    #[inline]
    pub fn batch_inc(
        &self,
        handle: &ThreadHandle,
        row_id: RowID,
        deltas: &[(ColumnID, f32)],
    ) -> Result<()> {
        self.check_row(row_id)?;
        let mut updates = Vec::with_capacity(deltas.len());
        for (col, delta) in deltas {
            self.check_col(*col)?;
            updates.push((*col, Update::Inc(*delta)));
        }
        self.controller.update(self, handle, row_id, &updates)
    }

    /// Start fetching a row in background, so a later read at the same
    /// clock does not wait for the server. Replies are collected by
    /// `wait_pending_async_get` or at latest on next clock.
    #[inline]
    pub fn get_async(&self, handle: &ThreadHandle, row_id: RowID) -> Result<()> {
        self.check_row(row_id)?;
        self.controller.get_async(self, handle, row_id)
    }

    /// Block until every async fetch of calling thread completes.
    #[inline]
    pub fn wait_pending_async_get(&self, handle: &ThreadHandle) -> Result<()> {
        self.ctx.wait_pending_async(handle)
    }

    /// Read one column through the thread cache of calling thread.
    /// The row is read from process storage once and then kept by the
    /// thread until its next flush.
    #[inline]
    pub fn thread_get(self: &Arc<Self>, handle: &mut ThreadHandle, row_id: RowID, col: ColumnID) -> Result<f32> {
        self.check_row(row_id)?;
        self.check_col(col)?;
        if let Some(row) = handle
            .thread_tables
            .get(&self.table_id)
            .and_then(|t| t.get_row(row_id))
        {
            return Ok(row.get(col)?);
        }
        let value = self.controller.get_row(self, handle, row_id)?;
        let row = handle.thread_table(self).insert_row(row_id, value)?;
        Ok(row.get(col)?)
    }

    /// Increment a column in thread cache only. Other threads see it
    /// after this thread flushes or clocks.
    #[inline]
    pub fn thread_inc(self: &Arc<Self>, handle: &mut ThreadHandle, row_id: RowID, col: ColumnID, delta: f32) -> Result<()> {
        self.check_row(row_id)?;
        self.check_col(col)?;
        handle.thread_table(self).inc(row_id, col, delta)
    }

    #[inline]
    pub fn thread_batch_inc(
        self: &Arc<Self>,
        handle: &mut ThreadHandle,
        row_id: RowID,
        deltas: &[(ColumnID, f32)],
    ) -> Result<()> {
        self.check_row(row_id)?;
        for (col, _) in deltas {
            self.check_col(*col)?;
        }
        let table = handle.thread_table(self);
        for (col, delta) in deltas {
            table.inc(row_id, *col, *delta)?;
        }
        Ok(())
    }

    /// Move increments in thread cache of this table to process oplog,
    /// and drop rows cached by the thread.
    #[inline]
    pub fn flush_thread_cache(&self, handle: &mut ThreadHandle) -> Result<()> {
        match handle.thread_tables.remove(&self.table_id) {
            Some(table) => table.flush(handle),
            None => Ok(()),
        }
    }

    /// Advance clock of calling thread, same as clock of the table group.
    #[inline]
    pub fn clock(&self, handle: &mut ThreadHandle) -> Result<()> {
        self.ctx.clock(handle)
    }

    /// Whether a row is in process cache.
    #[inline]
    pub fn is_cached(&self, row_id: RowID) -> bool {
        self.cache.lock().has_row(row_id)
    }

    #[inline]
    pub(crate) fn deserialize_row(&self, data: &[u8]) -> Result<RowValue> {
        let info = &self.config.info;
        let value = RowValue::deserialize(info.row_kind, info.row_capacity, data)?;
        Ok(value)
    }

    #[inline]
    fn check_row(&self, row_id: RowID) -> Result<()> {
        if row_id < 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    #[inline]
    fn check_col(&self, col: ColumnID) -> Result<()> {
        if col < 0 || col as usize >= self.config.info.row_capacity {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

impl fmt::Debug for ClientTable {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTable")
            .field("table_id", &self.table_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Tables created in a client process.
#[derive(Default)]
pub struct TableRegistry {
    tables: RwLock<BTreeMap<TableID, Arc<ClientTable>>>,
}

impl TableRegistry {
    #[inline]
    pub fn get(&self, table_id: TableID) -> Option<Arc<ClientTable>> {
        self.tables.read().get(&table_id).cloned()
    }

    #[inline]
    pub fn insert(&self, table: Arc<ClientTable>) -> Result<()> {
        let mut g = self.tables.write();
        if g.contains_key(&table.table_id) {
            return Err(Error::TableExists(table.table_id));
        }
        g.insert(table.table_id, table);
        Ok(())
    }

    /// All tables ordered by id.
    #[inline]
    pub fn snapshot(&self) -> Vec<Arc<ClientTable>> {
        self.tables.read().values().cloned().collect()
    }
}
