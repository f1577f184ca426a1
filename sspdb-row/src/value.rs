use crate::dense::DenseRow;
use crate::error::Result;
use crate::sparse::SparseRow;
use crate::update::Update;
use crate::ColumnID;
use serde::{Deserialize, Serialize};

/// Kind of row stored in a table. All rows of one table share the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowKind {
    Dense,
    Sparse,
}

/// Value of one row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Dense(DenseRow),
    Sparse(SparseRow),
}

impl RowValue {
    #[inline]
    pub fn new(kind: RowKind, capacity: usize) -> Self {
        match kind {
            RowKind::Dense => RowValue::Dense(DenseRow::new(capacity)),
            RowKind::Sparse => RowValue::Sparse(SparseRow::new(capacity)),
        }
    }

    /// Build a row of given kind from serialized payload.
    #[inline]
    pub fn deserialize(kind: RowKind, capacity: usize, bytes: &[u8]) -> Result<Self> {
        let mut row = RowValue::new(kind, capacity);
        row.reset_row_data(bytes)?;
        Ok(row)
    }

    #[inline]
    pub fn kind(&self) -> RowKind {
        match self {
            RowValue::Dense(_) => RowKind::Dense,
            RowValue::Sparse(_) => RowKind::Sparse,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        match self {
            RowValue::Dense(r) => r.capacity(),
            RowValue::Sparse(r) => r.capacity(),
        }
    }

    /// Number of columns physically held, used as the weight of a
    /// whole-row access.
    #[inline]
    pub fn num_columns(&self) -> usize {
        match self {
            RowValue::Dense(r) => r.capacity(),
            RowValue::Sparse(r) => r.len(),
        }
    }

    #[inline]
    pub fn get(&self, col: ColumnID) -> Result<f32> {
        match self {
            RowValue::Dense(r) => r.get(col),
            RowValue::Sparse(r) => r.get(col),
        }
    }

    #[inline]
    pub fn set(&mut self, col: ColumnID, val: f32) -> Result<()> {
        match self {
            RowValue::Dense(r) => r.set(col, val),
            RowValue::Sparse(r) => r.set(col, val),
        }
    }

    #[inline]
    pub fn apply_inc(&mut self, col: ColumnID, delta: f32) -> Result<()> {
        match self {
            RowValue::Dense(r) => r.apply_inc(col, delta),
            RowValue::Sparse(r) => r.apply_inc(col, delta),
        }
    }

    #[inline]
    pub fn apply_update(&mut self, col: ColumnID, update: &Update) -> Result<()> {
        match update {
            Update::Inc(d) => self.apply_inc(col, *d),
            Update::Put(v) => self.set(col, *v),
        }
    }

    #[inline]
    pub fn serialized_size(&self) -> usize {
        match self {
            RowValue::Dense(r) => r.serialized_size(),
            RowValue::Sparse(r) => r.serialized_size(),
        }
    }

    #[inline]
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        match self {
            RowValue::Dense(r) => r.serialize(buf),
            RowValue::Sparse(r) => r.serialize(buf),
        }
    }

    #[inline]
    pub fn reset_row_data(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            RowValue::Dense(r) => r.reset_row_data(bytes),
            RowValue::Sparse(r) => r.reset_row_data(bytes),
        }
    }
}
