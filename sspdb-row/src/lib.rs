pub mod dense;
pub mod error;
pub mod sparse;
pub mod update;
pub mod value;

pub use dense::DenseRow;
pub use error::{Error, Result};
pub use sparse::SparseRow;
pub use update::Update;
pub use value::{RowKind, RowValue};

/// Identifier of a row inside a table.
/// Negative values are reserved as stream sentinels.
pub type RowID = i32;

/// Identifier of a column inside a row.
pub type ColumnID = i32;
