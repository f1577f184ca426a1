//! Byte streams exchanged between clients and servers.
//!
//! Both streams are sequences of tables. A table starts with its id,
//! tables are delimited by `TABLE_SEPARATOR` and the whole stream is
//! terminated by `TABLE_END`, both written where a row id is expected.
//! All integers are little endian.
//!
//! Oplog stream (client to server):
//! ```text
//! [i32 table_id][u64 update_stride]
//!   ([i32 row_id][i32 n][n x i32 column_id][n x update_stride bytes])*
//! [i32 TABLE_SEPARATOR][i32 table_id][u64 update_stride] ...
//! [i32 TABLE_END]
//! ```
//!
//! Row stream (server to client):
//! ```text
//! [i32 table_id] ([i32 row_id][u64 size][size bytes])*
//! [i32 TABLE_SEPARATOR][i32 table_id] ...
//! [i32 TABLE_END]
//! ```
use super::RowOpLog;
use crate::error::{Error, Result};
use crate::{ColumnID, RowID, RowValue, TableID, Update};

pub const TABLE_SEPARATOR: RowID = -1;
pub const TABLE_END: RowID = -2;

/// Sequential writer of oplog stream.
#[derive(Debug, Default)]
pub struct OpLogWriter {
    buf: Vec<u8>,
    num_tables: usize,
    num_rows: usize,
}

impl OpLogWriter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new table, all rows appended afterwards belong to it.
    #[inline]
    pub fn begin_table(&mut self, table_id: TableID, update_stride: usize) {
        debug_assert!(table_id >= 0);
        if self.num_tables > 0 {
            self.buf.extend_from_slice(&TABLE_SEPARATOR.to_le_bytes());
        }
        self.buf.extend_from_slice(&table_id.to_le_bytes());
        self.buf
            .extend_from_slice(&(update_stride as u64).to_le_bytes());
        self.num_tables += 1;
    }

    #[inline]
    pub fn append_row(&mut self, row_id: RowID, oplog: &RowOpLog) {
        debug_assert!(self.num_tables > 0);
        debug_assert!(row_id >= 0);
        self.buf.extend_from_slice(&row_id.to_le_bytes());
        self.buf
            .extend_from_slice(&(oplog.len() as i32).to_le_bytes());
        for (col, _) in oplog.iter() {
            self.buf.extend_from_slice(&col.to_le_bytes());
        }
        for (_, update) in oplog.iter() {
            update.encode(&mut self.buf);
        }
        self.num_rows += 1;
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[inline]
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&TABLE_END.to_le_bytes());
        self.buf
    }
}

/// Updates of one row decoded from oplog stream.
#[derive(Debug, Clone, Copy)]
pub struct RowUpdates<'a> {
    pub table_id: TableID,
    pub row_id: RowID,
    col_ids: &'a [u8],
    updates: &'a [u8],
    stride: usize,
}

impl<'a> RowUpdates<'a> {
    #[inline]
    pub fn len(&self) -> usize {
        self.col_ids.len() / 4
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.col_ids.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = Result<(ColumnID, Update)>> + 'a {
        self.col_ids
            .chunks_exact(4)
            .zip(self.updates.chunks_exact(self.stride))
            .map(|(col, upd)| -> Result<(ColumnID, Update)> {
                let col = ColumnID::from_le_bytes(col.try_into()?);
                let upd = Update::decode(upd)?;
                Ok((col, upd))
            })
    }
}

/// Sequential reader of oplog stream.
#[derive(Debug)]
pub struct OpLogReader<'a> {
    data: &'a [u8],
    pos: usize,
    table_id: TableID,
    stride: usize,
    finished: bool,
}

impl<'a> OpLogReader<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut reader = OpLogReader {
            data,
            pos: 0,
            table_id: TABLE_END,
            stride: 0,
            finished: false,
        };
        let table_id = reader.read_i32()?;
        if table_id == TABLE_END {
            reader.finished = true;
        } else {
            reader.read_table_header(table_id)?;
        }
        Ok(reader)
    }

    /// Returns updates of next row, or None at end of stream.
    #[inline]
    pub fn next_row(&mut self) -> Result<Option<RowUpdates<'a>>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let row_id = self.read_i32()?;
            match row_id {
                TABLE_END => {
                    self.finished = true;
                }
                TABLE_SEPARATOR => {
                    let table_id = self.read_i32()?;
                    self.read_table_header(table_id)?;
                }
                row_id if row_id < 0 => return Err(Error::InvalidFormat),
                row_id => {
                    let n = self.read_i32()?;
                    if n < 0 {
                        return Err(Error::InvalidFormat);
                    }
                    let n = n as usize;
                    let col_len = n.checked_mul(4).ok_or(Error::InvalidFormat)?;
                    let update_len = n.checked_mul(self.stride).ok_or(Error::InvalidFormat)?;
                    let col_ids = self.read_bytes(col_len)?;
                    let updates = self.read_bytes(update_len)?;
                    return Ok(Some(RowUpdates {
                        table_id: self.table_id,
                        row_id,
                        col_ids,
                        updates,
                        stride: self.stride,
                    }));
                }
            }
        }
    }

    #[inline]
    fn read_table_header(&mut self, table_id: TableID) -> Result<()> {
        if table_id < 0 {
            return Err(Error::InvalidFormat);
        }
        let stride = usize::try_from(self.read_u64()?).map_err(|_| Error::InvalidFormat)?;
        if stride < Update::STRIDE {
            return Err(Error::InvalidFormat);
        }
        self.table_id = table_id;
        self.stride = stride;
        Ok(())
    }

    #[inline]
    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_le_bytes(bytes.try_into()?))
    }

    #[inline]
    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into()?))
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        read_bytes(self.data, &mut self.pos, len)
    }
}

/// Sequential writer of row stream.
#[derive(Debug, Default)]
pub struct RowStreamWriter {
    buf: Vec<u8>,
    num_tables: usize,
    num_rows: usize,
}

impl RowStreamWriter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn begin_table(&mut self, table_id: TableID) {
        debug_assert!(table_id >= 0);
        if self.num_tables > 0 {
            self.buf.extend_from_slice(&TABLE_SEPARATOR.to_le_bytes());
        }
        self.buf.extend_from_slice(&table_id.to_le_bytes());
        self.num_tables += 1;
    }

    #[inline]
    pub fn append_row(&mut self, row_id: RowID, value: &RowValue) {
        debug_assert!(self.num_tables > 0);
        self.buf.extend_from_slice(&row_id.to_le_bytes());
        self.buf
            .extend_from_slice(&(value.serialized_size() as u64).to_le_bytes());
        value.serialize(&mut self.buf);
        self.num_rows += 1;
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[inline]
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&TABLE_END.to_le_bytes());
        self.buf
    }
}

/// One row decoded from row stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowEntry<'a> {
    pub table_id: TableID,
    pub row_id: RowID,
    pub data: &'a [u8],
}

/// Sequential reader of row stream.
#[derive(Debug)]
pub struct RowStreamReader<'a> {
    data: &'a [u8],
    pos: usize,
    table_id: TableID,
    finished: bool,
}

impl<'a> RowStreamReader<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut reader = RowStreamReader {
            data,
            pos: 0,
            table_id: TABLE_END,
            finished: false,
        };
        let table_id = reader.read_i32()?;
        if table_id == TABLE_END {
            reader.finished = true;
        } else if table_id < 0 {
            return Err(Error::InvalidFormat);
        } else {
            reader.table_id = table_id;
        }
        Ok(reader)
    }

    #[inline]
    pub fn next_row(&mut self) -> Result<Option<RowEntry<'a>>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            match self.read_i32()? {
                TABLE_END => self.finished = true,
                TABLE_SEPARATOR => {
                    let table_id = self.read_i32()?;
                    if table_id < 0 {
                        return Err(Error::InvalidFormat);
                    }
                    self.table_id = table_id;
                }
                row_id if row_id < 0 => return Err(Error::InvalidFormat),
                row_id => {
                    let size = u64::from_le_bytes(self.read_bytes(8)?.try_into()?);
                    let size = usize::try_from(size).map_err(|_| Error::InvalidFormat)?;
                    let data = self.read_bytes(size)?;
                    return Ok(Some(RowEntry {
                        table_id: self.table_id,
                        row_id,
                        data,
                    }));
                }
            }
        }
    }

    #[inline]
    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_le_bytes(bytes.try_into()?))
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        read_bytes(self.data, &mut self.pos, len)
    }
}

#[inline]
fn read_bytes<'a>(data: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos.checked_add(len).ok_or(Error::InvalidFormat)?;
    if end > data.len() {
        return Err(Error::InvalidFormat);
    }
    let bytes = &data[*pos..end];
    *pos = end;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RowKind;
    use std::collections::BTreeMap;

    type Entries = BTreeMap<(TableID, RowID, ColumnID), Update>;

    fn decode_all(data: &[u8]) -> Entries {
        let mut res = BTreeMap::new();
        let mut reader = OpLogReader::new(data).unwrap();
        while let Some(row) = reader.next_row().unwrap() {
            for upd in row.iter() {
                let (col, upd) = upd.unwrap();
                res.insert((row.table_id, row.row_id, col), upd);
            }
        }
        res
    }

    #[test]
    fn test_oplog_stream_empty() {
        let data = OpLogWriter::new().finish();
        assert_eq!(data, TABLE_END.to_le_bytes().to_vec());
        assert!(decode_all(&data).is_empty());

        // tables without rows.
        let mut writer = OpLogWriter::new();
        writer.begin_table(1, Update::STRIDE);
        writer.begin_table(2, Update::STRIDE);
        assert!(decode_all(&writer.finish()).is_empty());
    }

    #[test]
    fn test_oplog_stream_tables() {
        let mut expected = Entries::new();
        expected.insert((0, 1, 0), Update::Inc(1.0));
        expected.insert((0, 1, 5), Update::Put(2.0));
        expected.insert((0, 9, 3), Update::Inc(-1.5));
        expected.insert((3, 0, 0), Update::Put(4.0));
        expected.insert((7, 2, 1), Update::Inc(0.25));

        let mut writer = OpLogWriter::new();
        let mut curr_table = None;
        let mut rows: BTreeMap<(TableID, RowID), RowOpLog> = BTreeMap::new();
        for ((t, r, c), u) in &expected {
            rows.entry((*t, *r)).or_default().record(*c, *u);
        }
        for ((t, r), oplog) in &rows {
            if curr_table != Some(*t) {
                writer.begin_table(*t, Update::STRIDE);
                curr_table = Some(*t);
            }
            writer.append_row(*r, oplog);
        }
        assert_eq!(writer.num_rows(), 4);
        let data = writer.finish();
        assert_eq!(decode_all(&data), expected);
    }

    #[test]
    fn test_oplog_stream_wider_stride() {
        // handcraft a stream with 8-byte stride, the tail of each update is padding.
        let mut data = vec![];
        data.extend_from_slice(&4i32.to_le_bytes());
        data.extend_from_slice(&8u64.to_le_bytes());
        data.extend_from_slice(&3i32.to_le_bytes());
        data.extend_from_slice(&1i32.to_le_bytes());
        data.extend_from_slice(&6i32.to_le_bytes());
        Update::Put(1.0).encode(&mut data);
        data.extend_from_slice(&[0, 0, 0]);
        data.extend_from_slice(&TABLE_END.to_le_bytes());
        let entries = decode_all(&data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[&(4, 3, 6)], Update::Put(1.0));
    }

    #[test]
    fn test_oplog_stream_truncated() {
        let mut writer = OpLogWriter::new();
        writer.begin_table(0, Update::STRIDE);
        let mut oplog = RowOpLog::default();
        oplog.record(0, Update::Inc(1.0));
        writer.append_row(0, &oplog);
        let data = writer.finish();
        let truncated = &data[..data.len() - 6];
        let mut reader = OpLogReader::new(truncated).unwrap();
        assert!(reader.next_row().is_err());
        assert!(OpLogReader::new(&[]).is_err());
    }

    #[test]
    fn test_oplog_stream_huge_stride() {
        let mut data = vec![];
        data.extend_from_slice(&0i32.to_le_bytes());
        data.extend_from_slice(&(u64::MAX / 2).to_le_bytes());
        data.extend_from_slice(&1i32.to_le_bytes());
        data.extend_from_slice(&3i32.to_le_bytes());
        data.extend_from_slice(&[0u8; 32]);
        let mut reader = OpLogReader::new(&data).unwrap();
        assert_eq!(reader.next_row().unwrap_err(), Error::InvalidFormat);

        // row count overflows column id bytes.
        let mut data = vec![];
        data.extend_from_slice(&0i32.to_le_bytes());
        data.extend_from_slice(&(Update::STRIDE as u64).to_le_bytes());
        data.extend_from_slice(&1i32.to_le_bytes());
        data.extend_from_slice(&i32::MAX.to_le_bytes());
        let mut reader = OpLogReader::new(&data).unwrap();
        assert_eq!(reader.next_row().unwrap_err(), Error::InvalidFormat);
    }

    #[test]
    fn test_row_stream_huge_size() {
        let mut data = vec![];
        data.extend_from_slice(&0i32.to_le_bytes());
        data.extend_from_slice(&7i32.to_le_bytes());
        data.extend_from_slice(&u64::MAX.to_le_bytes());
        data.extend_from_slice(&[0u8; 16]);
        let mut reader = RowStreamReader::new(&data).unwrap();
        assert_eq!(reader.next_row().unwrap_err(), Error::InvalidFormat);
    }

    #[test]
    fn test_row_stream() {
        let mut r1 = RowValue::new(RowKind::Dense, 3);
        r1.set(1, 1.0).unwrap();
        let mut r2 = RowValue::new(RowKind::Sparse, 100);
        r2.set(42, -2.0).unwrap();

        let mut writer = RowStreamWriter::new();
        writer.begin_table(0);
        writer.append_row(5, &r1);
        writer.append_row(6, &r1);
        // empty table in the middle.
        writer.begin_table(1);
        writer.begin_table(2);
        writer.append_row(0, &r2);
        assert_eq!(writer.num_rows(), 3);
        let data = writer.finish();

        let mut reader = RowStreamReader::new(&data).unwrap();
        let mut rows = vec![];
        while let Some(entry) = reader.next_row().unwrap() {
            rows.push(entry);
        }
        assert_eq!(rows.len(), 3);
        assert_eq!((rows[0].table_id, rows[0].row_id), (0, 5));
        assert_eq!((rows[1].table_id, rows[1].row_id), (0, 6));
        assert_eq!((rows[2].table_id, rows[2].row_id), (2, 0));
        assert_eq!(RowValue::deserialize(RowKind::Dense, 3, rows[0].data).unwrap(), r1);
        assert_eq!(RowValue::deserialize(RowKind::Sparse, 100, rows[2].data).unwrap(), r2);
    }

    #[test]
    fn test_row_stream_empty() {
        let data = RowStreamWriter::new().finish();
        let mut reader = RowStreamReader::new(&data).unwrap();
        assert_eq!(reader.next_row().unwrap(), None);

        let mut writer = RowStreamWriter::new();
        writer.begin_table(3);
        let data = writer.finish();
        let mut reader = RowStreamReader::new(&data).unwrap();
        assert_eq!(reader.next_row().unwrap(), None);
    }
}
