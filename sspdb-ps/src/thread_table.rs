//! Per-thread row cache.
//!
//! A thread table holds rows read by one application thread and the
//! increments it made since its last flush. It is owned by the thread
//! handle, so reads and writes on it take no lock. Increments reach the
//! process oplog only when the thread flushes, at latest on its next clock.
use crate::context::ThreadHandle;
use crate::error::Result;
use crate::oplog::RowOpLog;
use crate::table::ClientTable;
use crate::{ColumnID, RowID, RowValue, Update};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct ThreadTable {
    table: Arc<ClientTable>,
    rows: HashMap<RowID, RowValue>,
    oplogs: BTreeMap<RowID, RowOpLog>,
}

impl ThreadTable {
    #[inline]
    pub fn new(table: Arc<ClientTable>) -> Self {
        ThreadTable {
            table,
            rows: HashMap::new(),
            oplogs: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn get_row(&self, row_id: RowID) -> Option<&RowValue> {
        self.rows.get(&row_id)
    }

    /// Cache a row read from process storage. Increments this thread
    /// has not flushed are applied on it.
    #[inline]
    pub fn insert_row(&mut self, row_id: RowID, mut value: RowValue) -> Result<&RowValue> {
        if let Some(oplog) = self.oplogs.get(&row_id) {
            oplog.apply_to(&mut value)?;
        }
        let row = match self.rows.entry(row_id) {
            Entry::Occupied(mut e) => {
                e.insert(value);
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert(value),
        };
        Ok(row)
    }

    #[inline]
    pub fn inc(&mut self, row_id: RowID, col: ColumnID, delta: f32) -> Result<()> {
        self.oplogs
            .entry(row_id)
            .or_default()
            .record(col, Update::Inc(delta));
        if let Some(row) = self.rows.get_mut(&row_id) {
            row.apply_inc(col, delta)?;
        }
        Ok(())
    }

    #[inline]
    pub fn num_pending_rows(&self) -> usize {
        self.oplogs.len()
    }

    /// Move pending increments into process oplog and drop cached rows.
    #[inline]
    pub fn flush(self, handle: &ThreadHandle) -> Result<()> {
        let table = self.table;
        for (row_id, oplog) in self.oplogs {
            let updates: Vec<(ColumnID, Update)> = oplog.iter().collect();
            table.controller.update(&table, handle, row_id, &updates)?;
        }
        Ok(())
    }
}

/// Flush thread tables of all tables the thread touched.
#[inline]
pub(crate) fn flush_all(handle: &mut ThreadHandle) -> Result<()> {
    let tables = std::mem::take(&mut handle.thread_tables);
    for (_, table) in tables {
        table.flush(handle)?;
    }
    Ok(())
}
