use crate::error::{Error, Result};
use crate::ColumnID;
use std::collections::BTreeMap;

const ENTRY_SIZE: usize = 8;

/// Row that only stores non-zero columns.
///
/// Columns are kept in ascending order, a column whose value
/// becomes zero is removed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseRow {
    capacity: usize,
    entries: BTreeMap<ColumnID, f32>,
}

impl SparseRow {
    #[inline]
    pub fn new(capacity: usize) -> Self {
        SparseRow {
            capacity,
            entries: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored non-zero columns.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (ColumnID, f32)> + '_ {
        self.entries.iter().map(|(c, v)| (*c, *v))
    }

    #[inline]
    fn check(&self, col: ColumnID) -> Result<()> {
        if col < 0 || col as usize >= self.capacity {
            return Err(Error::ColumnOutOfBound(col));
        }
        Ok(())
    }

    #[inline]
    pub fn get(&self, col: ColumnID) -> Result<f32> {
        self.check(col)?;
        Ok(self.entries.get(&col).copied().unwrap_or(0.0))
    }

    #[inline]
    pub fn set(&mut self, col: ColumnID, val: f32) -> Result<()> {
        self.check(col)?;
        if val == 0.0 {
            self.entries.remove(&col);
        } else {
            self.entries.insert(col, val);
        }
        Ok(())
    }

    #[inline]
    pub fn apply_inc(&mut self, col: ColumnID, delta: f32) -> Result<()> {
        self.check(col)?;
        let v = self.entries.get(&col).copied().unwrap_or(0.0) + delta;
        self.set(col, v)
    }

    #[inline]
    pub fn serialized_size(&self) -> usize {
        self.entries.len() * ENTRY_SIZE
    }

    /// Payload is a sequence of (i32 column, f32 value) pairs in little endian.
    #[inline]
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.serialized_size());
        for (col, val) in &self.entries {
            buf.extend_from_slice(&col.to_le_bytes());
            buf.extend_from_slice(&val.to_le_bytes());
        }
    }

    #[inline]
    pub fn reset_row_data(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() % ENTRY_SIZE != 0 {
            return Err(Error::InvalidFormat);
        }
        self.entries.clear();
        for chunk in bytes.chunks_exact(ENTRY_SIZE) {
            let col = ColumnID::from_le_bytes(chunk[..4].try_into()?);
            let val = f32::from_le_bytes(chunk[4..].try_into()?);
            self.set(col, val)?;
        }
        Ok(())
    }
}
