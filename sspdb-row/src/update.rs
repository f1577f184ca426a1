use crate::error::{Error, Result};

const TAG_INC: u8 = 0;
const TAG_PUT: u8 = 1;

/// Pending modification of a single column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Update {
    /// Add delta to current value.
    Inc(f32),
    /// Overwrite current value.
    Put(f32),
}

impl Update {
    /// Fixed number of bytes one update occupies on the wire:
    /// one tag byte followed by a little-endian f32.
    pub const STRIDE: usize = 5;

    #[inline]
    pub fn value(&self) -> f32 {
        match self {
            Update::Inc(v) | Update::Put(v) => *v,
        }
    }

    /// Coalesce a later update into this one.
    ///
    /// A put always wins over whatever was pending before it,
    /// an increment folds into the pending value.
    #[inline]
    pub fn merge(self, next: Update) -> Update {
        match (self, next) {
            (_, Update::Put(b)) => Update::Put(b),
            (Update::Put(a), Update::Inc(b)) => Update::Put(a + b),
            (Update::Inc(a), Update::Inc(b)) => Update::Inc(a + b),
        }
    }

    /// Apply this update on top of an existing value.
    #[inline]
    pub fn apply_to(&self, base: f32) -> f32 {
        match self {
            Update::Inc(d) => base + d,
            Update::Put(v) => *v,
        }
    }

    #[inline]
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let (tag, v) = match self {
            Update::Inc(v) => (TAG_INC, *v),
            Update::Put(v) => (TAG_PUT, *v),
        };
        buf.push(tag);
        buf.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn decode(bytes: &[u8]) -> Result<Update> {
        if bytes.len() < Self::STRIDE {
            return Err(Error::InvalidFormat);
        }
        let v = f32::from_le_bytes(bytes[1..Self::STRIDE].try_into()?);
        match bytes[0] {
            TAG_INC => Ok(Update::Inc(v)),
            TAG_PUT => Ok(Update::Put(v)),
            tag => Err(Error::InvalidUpdateTag(tag)),
        }
    }
}
