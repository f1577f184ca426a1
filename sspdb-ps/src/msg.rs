use crate::config::TableInfo;
use crate::context::ClientID;
use crate::error::Result;
use crate::{Clock, RowID, TableID, Version};
use serde::{Deserialize, Serialize};

/// Messages exchanged between application threads, background
/// workers and server threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Msg {
    /// Application thread asks head background worker to create a table.
    BgCreateTable { table_id: TableID, info: TableInfo },
    /// Background worker asks a server to create a table.
    CreateTable { table_id: TableID, info: TableInfo },
    /// Acknowledgement of table creation, from server to background
    /// worker and from background worker to application thread.
    CreateTableReply { table_id: TableID },
    /// Request of a row fresh at given clock, from application thread
    /// to background worker and from background worker to server.
    RowRequest {
        table_id: TableID,
        row_id: RowID,
        clock: Clock,
    },
    /// Background worker tells application thread the requested row
    /// is ready, with a copy of the row as cached. The copy is absent
    /// if the server reply could not be merged with local writes.
    RowRequestReply {
        table_id: TableID,
        row_id: RowID,
        row: Option<RowSnapshot>,
    },
    ServerRowRequestReply {
        table_id: TableID,
        row_id: RowID,
        /// Server clock the row is fresh at.
        clock: Clock,
        /// Last oplog version of the requesting worker applied on server.
        version: Version,
        row_data: Vec<u8>,
    },
    ClientSendOpLog {
        client_id: ClientID,
        version: Version,
        is_clock: bool,
        data: Vec<u8>,
    },
    /// Rows pushed by server in push mode, encoded as row stream.
    ServerPushRow {
        clock: Clock,
        version: Version,
        is_clock: bool,
        data: Vec<u8>,
    },
    /// Flush oplogs and advance clock.
    BgClock,
    /// Flush oplogs without advancing clock.
    BgSendOpLog,
    BgShutDown,
    ClientShutDown,
    ServerShutDownAck,
}

/// Copy of a cached row handed to a reader, so the reader does not
/// depend on the row staying in cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSnapshot {
    /// Server clock the row was fresh at.
    pub clock: Clock,
    pub row_data: Vec<u8>,
}

impl Msg {
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Msg::BgCreateTable { .. } => "BgCreateTable",
            Msg::CreateTable { .. } => "CreateTable",
            Msg::CreateTableReply { .. } => "CreateTableReply",
            Msg::RowRequest { .. } => "RowRequest",
            Msg::RowRequestReply { .. } => "RowRequestReply",
            Msg::ServerRowRequestReply { .. } => "ServerRowRequestReply",
            Msg::ClientSendOpLog { .. } => "ClientSendOpLog",
            Msg::ServerPushRow { .. } => "ServerPushRow",
            Msg::BgClock => "BgClock",
            Msg::BgSendOpLog => "BgSendOpLog",
            Msg::BgShutDown => "BgShutDown",
            Msg::ClientShutDown => "ClientShutDown",
            Msg::ServerShutDownAck => "ServerShutDownAck",
        }
    }

    #[inline]
    pub fn encode(&self) -> Result<Vec<u8>> {
        let data = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        Ok(data)
    }

    #[inline]
    pub fn decode(data: &[u8]) -> Result<Msg> {
        let (msg, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RowKind;

    #[test]
    fn test_msg_codec() {
        let msgs = vec![
            Msg::BgCreateTable {
                table_id: 1,
                info: TableInfo::new(RowKind::Dense, 8),
            },
            Msg::RowRequest {
                table_id: 1,
                row_id: 2,
                clock: 3,
            },
            Msg::ClientSendOpLog {
                client_id: 0,
                version: 7,
                is_clock: true,
                data: vec![1, 2, 3],
            },
            Msg::RowRequestReply {
                table_id: 1,
                row_id: 2,
                row: Some(RowSnapshot {
                    clock: 4,
                    row_data: vec![0, 0, 128, 63],
                }),
            },
            Msg::RowRequestReply {
                table_id: 1,
                row_id: 2,
                row: None,
            },
            Msg::ServerShutDownAck,
        ];
        for msg in msgs {
            let data = msg.encode().unwrap();
            assert_eq!(Msg::decode(&data).unwrap(), msg);
        }
        assert!(Msg::decode(&[255, 255]).is_err());
    }
}
