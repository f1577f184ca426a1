pub mod bg_worker;
pub mod cache;
pub mod clock;
pub mod comm;
pub mod config;
pub mod consistency;
pub mod context;
pub mod error;
pub mod msg;
pub mod oplog;
pub mod request;
pub mod server;
pub mod table;
pub mod table_group;
pub mod thread_table;

pub use sspdb_row::{ColumnID, RowID, RowKind, RowValue, Update};

/// Identifier of a table, must be non-negative.
pub type TableID = i32;
/// Logical clock of a thread, a background worker, a client or a server.
pub type Clock = i32;
/// Sequence number of oplog batches sent by one background worker.
/// Starts from 1, 0 means nothing has been sent yet.
pub type Version = u64;

pub mod prelude {
    pub use crate::comm::CommBus;
    pub use crate::config::*;
    pub use crate::context::{ClientID, EntityID, ThreadHandle};
    pub use crate::error::*;
    pub use crate::server::ServerGroup;
    pub use crate::table::ClientTable;
    pub use crate::table_group::TableGroup;
    pub use crate::{Clock, ColumnID, RowID, RowKind, RowValue, TableID, Version};
}
