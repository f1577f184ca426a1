use crate::config::TableInfo;
use crate::context::EntityID;
use crate::error::Result;
use crate::oplog::codec::RowUpdates;
use crate::{Clock, RowID, RowValue, TableID};
use std::collections::{BTreeMap, BTreeSet};

/// Authoritative copy of a row on its owning server.
#[derive(Debug, Clone)]
pub struct ServerRow {
    pub value: RowValue,
    /// Server clock when the row was created.
    pub created_clock: Clock,
    /// Updated since last push.
    dirty: bool,
    /// Background workers to push the row to.
    subscribers: BTreeSet<EntityID>,
}

impl ServerRow {
    #[inline]
    pub fn new(value: RowValue, created_clock: Clock) -> Self {
        ServerRow {
            value,
            created_clock,
            dirty: false,
            subscribers: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    pub fn subscribe(&mut self, bg_id: EntityID) -> bool {
        self.subscribers.insert(bg_id)
    }

    #[inline]
    pub fn subscribers(&self) -> impl Iterator<Item = EntityID> + '_ {
        self.subscribers.iter().copied()
    }
}

/// Rows of one table owned by a server. Rows are created on first
/// touch and never evicted.
#[derive(Debug)]
pub struct ServerTable {
    table_id: TableID,
    info: TableInfo,
    rows: BTreeMap<RowID, ServerRow>,
}

impl ServerTable {
    #[inline]
    pub fn new(table_id: TableID, info: TableInfo) -> Self {
        ServerTable {
            table_id,
            info,
            rows: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn table_id(&self) -> TableID {
        self.table_id
    }

    #[inline]
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn find_row(&self, row_id: RowID) -> Option<&ServerRow> {
        self.rows.get(&row_id)
    }

    #[inline]
    pub fn find_create_row(&mut self, row_id: RowID, clock: Clock) -> &mut ServerRow {
        let info = self.info;
        self.rows
            .entry(row_id)
            .or_insert_with(|| ServerRow::new(RowValue::new(info.row_kind, info.row_capacity), clock))
    }

    /// Apply decoded updates of one row, the row is marked dirty.
    #[inline]
    pub fn apply_row_updates(&mut self, updates: &RowUpdates<'_>, clock: Clock) -> Result<()> {
        let row = self.find_create_row(updates.row_id, clock);
        for upd in updates.iter() {
            let (col, update) = upd?;
            row.value.apply_update(col, &update)?;
        }
        row.dirty = true;
        Ok(())
    }

    /// Visit every dirty row with subscribers and clear dirty flags
    /// of all rows.
    #[inline]
    pub fn drain_dirty<F>(&mut self, mut f: F)
    where
        F: FnMut(RowID, &ServerRow),
    {
        for (row_id, row) in self.rows.iter_mut() {
            if !row.dirty {
                continue;
            }
            row.dirty = false;
            if !row.subscribers.is_empty() {
                f(*row_id, row);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::codec::{OpLogReader, OpLogWriter};
    use crate::oplog::RowOpLog;
    use crate::{RowKind, Update};

    #[test]
    fn test_server_table_apply() {
        let mut table = ServerTable::new(3, TableInfo::new(RowKind::Sparse, 16));
        assert!(table.find_row(7).is_none());

        let mut oplog = RowOpLog::default();
        oplog.record(2, Update::Inc(1.5));
        oplog.record(9, Update::Put(4.0));
        let mut writer = OpLogWriter::new();
        writer.begin_table(3, Update::STRIDE);
        writer.append_row(7, &oplog);
        writer.append_row(8, &oplog);
        let data = writer.finish();
        let mut reader = OpLogReader::new(&data).unwrap();
        while let Some(row) = reader.next_row().unwrap() {
            table.apply_row_updates(&row, 2).unwrap();
        }
        assert_eq!(table.num_rows(), 2);
        let row = table.find_row(7).unwrap();
        assert_eq!(row.created_clock, 2);
        assert_eq!(row.value.get(2).unwrap(), 1.5);
        assert_eq!(row.value.get(9).unwrap(), 4.0);
        assert!(row.is_dirty());

        table.find_create_row(8, 5).subscribe(1100);
        let mut pushed = vec![];
        table.drain_dirty(|row_id, row| pushed.push((row_id, row.subscribers().collect::<Vec<_>>())));
        assert_eq!(pushed, vec![(8, vec![1100])]);
        assert!(!table.find_row(7).unwrap().is_dirty());
        // nothing left after drain.
        table.drain_dirty(|_, _| panic!("no dirty row"));
    }
}
