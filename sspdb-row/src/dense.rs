use crate::error::{Error, Result};
use crate::ColumnID;

/// Fixed-width row of f32 values, one per column.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseRow {
    values: Vec<f32>,
}

impl DenseRow {
    #[inline]
    pub fn new(capacity: usize) -> Self {
        DenseRow {
            values: vec![0.0; capacity],
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    #[inline]
    fn idx(&self, col: ColumnID) -> Result<usize> {
        if col < 0 || col as usize >= self.values.len() {
            return Err(Error::ColumnOutOfBound(col));
        }
        Ok(col as usize)
    }

    #[inline]
    pub fn get(&self, col: ColumnID) -> Result<f32> {
        let idx = self.idx(col)?;
        Ok(self.values[idx])
    }

    #[inline]
    pub fn set(&mut self, col: ColumnID, val: f32) -> Result<()> {
        let idx = self.idx(col)?;
        self.values[idx] = val;
        Ok(())
    }

    #[inline]
    pub fn apply_inc(&mut self, col: ColumnID, delta: f32) -> Result<()> {
        let idx = self.idx(col)?;
        self.values[idx] += delta;
        Ok(())
    }

    #[inline]
    pub fn serialized_size(&self) -> usize {
        self.values.len() * std::mem::size_of::<f32>()
    }

    /// Payload is the raw value array.
    #[inline]
    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(bytemuck::cast_slice(&self.values));
    }

    /// Overwrite all values from a payload produced by `serialize`.
    /// The payload must match the row capacity exactly.
    #[inline]
    pub fn reset_row_data(&mut self, bytes: &[u8]) -> Result<()> {
        let expected = self.serialized_size();
        if bytes.len() != expected {
            return Err(Error::SizeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        bytemuck::cast_slice_mut::<f32, u8>(&mut self.values).copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_row_ops() {
        let mut row = DenseRow::new(4);
        row.set(1, 2.0).unwrap();
        row.apply_inc(1, 0.5).unwrap();
        row.apply_inc(3, -1.0).unwrap();
        assert_eq!(row.values(), &[0.0, 2.5, 0.0, -1.0]);
        assert_eq!(row.get(4), Err(Error::ColumnOutOfBound(4)));
        assert_eq!(row.set(-1, 1.0), Err(Error::ColumnOutOfBound(-1)));
    }

    #[test]
    fn test_dense_row_reset() {
        let mut row = DenseRow::new(3);
        row.set(0, 1.0).unwrap();
        row.set(2, 3.0).unwrap();
        let mut buf = vec![];
        row.serialize(&mut buf);
        assert_eq!(buf.len(), row.serialized_size());

        let mut other = DenseRow::new(3);
        other.reset_row_data(&buf).unwrap();
        assert_eq!(other, row);
        assert!(DenseRow::new(2).reset_row_data(&buf).is_err());
    }
}
