use crate::cache::{ClientRow, Lookup, RowCache};
use crate::config::ConsistencyModel;
use crate::context::ThreadHandle;
use crate::error::{Error, Result};
use crate::msg::Msg;
use crate::oplog::OpLogStatus;
use crate::table::ClientTable;
use crate::{Clock, ColumnID, RowID, RowValue, Update};

/// Enforces bounded staleness of reads on one table.
///
/// A thread at clock `c` reading a table with staleness `s` must see
/// all updates made before clock `c - s` by every thread. In pull mode
/// a cached row qualifies if it was fresh at clock `c - s`. In push mode
/// servers keep cached rows updated, so the reader only waits until
/// the process has observed server clock `c - s`.
#[derive(Debug, Clone, Copy)]
pub struct ConsistencyController {
    model: ConsistencyModel,
    staleness: Clock,
}

impl ConsistencyController {
    #[inline]
    pub fn new(model: ConsistencyModel, staleness: Clock) -> Self {
        debug_assert!(staleness >= 0);
        ConsistencyController { model, staleness }
    }

    #[inline]
    pub fn model(&self) -> ConsistencyModel {
        self.model
    }

    /// Oldest clock a reader at given thread clock accepts.
    #[inline]
    pub fn stalest_clock(&self, thread_clock: Clock) -> Clock {
        (thread_clock - self.staleness).max(0)
    }

    #[inline]
    pub fn get(
        &self,
        table: &ClientTable,
        handle: &ThreadHandle,
        row_id: RowID,
        col: ColumnID,
    ) -> Result<f32> {
        // a pending put is the latest value regardless of server state.
        if let Some(Update::Put(v)) = table.oplog.find_update(row_id, col) {
            return Ok(v);
        }
        self.read_with_fetch(
            table,
            handle,
            row_id,
            |cache, min_clock| cache.get(row_id, col, min_clock),
            |row| Ok(row.value.get(col)?),
        )
    }

    #[inline]
    pub fn get_row(
        &self,
        table: &ClientTable,
        handle: &ThreadHandle,
        row_id: RowID,
    ) -> Result<RowValue> {
        self.read_with_fetch(
            table,
            handle,
            row_id,
            |cache, min_clock| {
                Ok(match cache.get_row(row_id, min_clock) {
                    Lookup::Hit(row) => Lookup::Hit(row.value),
                    Lookup::Stale => Lookup::Stale,
                    Lookup::Miss => Lookup::Miss,
                })
            },
            |row| Ok(row.value),
        )
    }

    /// Start fetching a row unless process cache can already serve
    /// a read at the thread's clock. Never blocks.
    #[inline]
    pub fn get_async(&self, table: &ClientTable, handle: &ThreadHandle, row_id: RowID) -> Result<()> {
        let stalest = self.stalest_clock(handle.clock());
        let cached = match table.cache.lock().find(row_id) {
            Some(row) => self.model == ConsistencyModel::SspPush || row.clock >= stalest,
            None => false,
        };
        if cached {
            return Ok(());
        }
        table
            .ctx
            .request_row_async(handle, table.table_id(), row_id, stalest)
    }

    /// Record updates of one row in oplog, and apply them on the cached
    /// row if present. Never blocks on network.
    #[inline]
    pub fn update(
        &self,
        table: &ClientTable,
        handle: &ThreadHandle,
        row_id: RowID,
        updates: &[(ColumnID, Update)],
    ) -> Result<()> {
        let (res, status) = table.oplog.update(row_id, |part| {
            let mut cache = table.cache.lock();
            for (col, update) in updates {
                part.record(row_id, *col, *update);
                cache.apply(row_id, *col, update)?;
            }
            Ok::<_, Error>(())
        });
        res?;
        if status == OpLogStatus::FlushAdvised {
            log::debug!(
                "table {} pending oplog exceeds {}, request flush",
                table.table_id(),
                table.config().max_pending_op_logs
            );
            table
                .ctx
                .bus
                .send(handle.id(), table.ctx.bg_of(row_id), &Msg::BgSendOpLog)?;
        }
        Ok(())
    }

    /// Read from process cache, or fetch the row and read from the
    /// copy handed back by background worker. The copy is used because
    /// other fetches may evict the row before this thread reads it.
    #[inline]
    fn read_with_fetch<T, F, G>(
        &self,
        table: &ClientTable,
        handle: &ThreadHandle,
        row_id: RowID,
        mut read_cache: F,
        read_row: G,
    ) -> Result<T>
    where
        F: FnMut(&mut RowCache, Clock) -> Result<Lookup<T>>,
        G: FnOnce(ClientRow) -> Result<T>,
    {
        let stalest = self.stalest_clock(handle.clock());
        let min_clock = match self.model {
            ConsistencyModel::Ssp => stalest,
            ConsistencyModel::SspPush => {
                table.ctx.system_clock.wait_until(stalest);
                0
            }
        };
        loop {
            {
                let mut cache = table.cache.lock();
                if let Lookup::Hit(v) = read_cache(&mut *cache, min_clock)? {
                    return Ok(v);
                }
            }
            let snapshot = table
                .ctx
                .request_row(handle, table.table_id(), row_id, stalest)?;
            match snapshot {
                Some(snapshot) => {
                    let value = table.deserialize_row(&snapshot.row_data)?;
                    return read_row(ClientRow::new(snapshot.clock, value));
                }
                None => log::debug!(
                    "row {} of table {} not merged by background worker, fetch again",
                    row_id,
                    table.table_id()
                ),
            }
        }
    }
}
