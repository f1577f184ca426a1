//! Server side of the parameter server.
//!
//! Each server thread owns one partition of the rows of every table.
//! It applies oplogs in version order per background worker, tracks
//! clocks of all clients and answers row requests once the slowest
//! client is fresh enough.
pub mod table;
pub mod thread;

pub use self::thread::{ServerGroup, ServerThread};

use self::table::ServerTable;
use crate::clock::VectorClock;
use crate::config::{ClusterConfig, ConsistencyModel, TableInfo};
use crate::context::{ClientID, EntityID, Partitioner};
use crate::error::{Error, Result};
use crate::msg::Msg;
use crate::oplog::codec::{OpLogReader, RowStreamWriter};
use crate::{Clock, RowID, TableID, Version};
use std::collections::{BTreeMap, HashMap};

/// Row request deferred until server clock catches up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerRowRequest {
    pub bg_id: EntityID,
    pub table_id: TableID,
    pub row_id: RowID,
    pub clock: Clock,
}

pub struct Server {
    id: EntityID,
    model: ConsistencyModel,
    partitioner: Partitioner,
    tables: BTreeMap<TableID, ServerTable>,
    /// Clocks of background workers, grouped by client.
    bg_clocks: HashMap<ClientID, VectorClock<EntityID>>,
    client_clocks: VectorClock<ClientID>,
    /// Last oplog version applied from each background worker.
    bg_versions: HashMap<EntityID, Version>,
    deferred: BTreeMap<Clock, HashMap<EntityID, Vec<ServerRowRequest>>>,
}

impl Server {
    #[inline]
    pub fn new(id: EntityID, cluster: &ClusterConfig) -> Self {
        let partitioner = Partitioner::new(cluster.num_servers, cluster.num_comm_channels);
        let clients = 0..cluster.num_clients as ClientID;
        let bg_clocks = clients
            .clone()
            .map(|c| (c, VectorClock::with_ids(partitioner.bg_ids(c))))
            .collect();
        let bg_versions = clients
            .clone()
            .flat_map(|c| partitioner.bg_ids(c))
            .map(|bg| (bg, 0))
            .collect();
        Server {
            id,
            model: cluster.consistency_model,
            partitioner,
            tables: BTreeMap::new(),
            bg_clocks,
            client_clocks: VectorClock::with_ids(clients),
            bg_versions,
            deferred: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> EntityID {
        self.id
    }

    #[inline]
    pub fn model(&self) -> ConsistencyModel {
        self.model
    }

    /// Ids of all background workers in the cluster.
    #[inline]
    pub fn bg_ids(&self) -> impl Iterator<Item = EntityID> + '_ {
        (0..self.bg_clocks.len() as ClientID).flat_map(|c| self.partitioner.bg_ids(c))
    }

    /// Create a table. Returns false if it already exists, which is
    /// normal as every client creates every table it uses.
    #[inline]
    pub fn create_table(&mut self, table_id: TableID, info: TableInfo) -> bool {
        if let Some(table) = self.tables.get(&table_id) {
            if *table.info() != info {
                log::warn!(
                    "server {} table {} created again with different info",
                    self.id,
                    table_id
                );
            }
            return false;
        }
        self.tables.insert(table_id, ServerTable::new(table_id, info));
        true
    }

    #[inline]
    pub fn table(&self, table_id: TableID) -> Option<&ServerTable> {
        self.tables.get(&table_id)
    }

    /// Clock all clients have reached.
    #[inline]
    pub fn min_clock(&self) -> Clock {
        self.client_clocks.min_clock()
    }

    #[inline]
    pub fn bg_version(&self, bg_id: EntityID) -> Option<Version> {
        self.bg_versions.get(&bg_id).copied()
    }

    /// Apply an oplog stream sent by a background worker. Versions of
    /// each worker must arrive without gap.
    #[inline]
    pub fn apply_oplog(&mut self, sender: EntityID, version: Version, data: &[u8]) -> Result<()> {
        let last = self
            .bg_versions
            .get(&sender)
            .copied()
            .ok_or(Error::UnknownSender(sender))?;
        if version != last + 1 {
            return Err(Error::VersionGap {
                sender,
                expected: last + 1,
                actual: version,
            });
        }
        let clock = self.min_clock();
        let mut reader = OpLogReader::new(data)?;
        while let Some(row) = reader.next_row()? {
            let table = self
                .tables
                .get_mut(&row.table_id)
                .ok_or(Error::TableNotFound(row.table_id))?;
            table.apply_row_updates(&row, clock)?;
        }
        self.bg_versions.insert(sender, version);
        Ok(())
    }

    /// Advance clock of a background worker. Returns true if the
    /// minimum clock of all clients advanced.
    #[inline]
    pub fn clock(&mut self, client_id: ClientID, bg_id: EntityID) -> Result<bool> {
        let bg_clocks = self
            .bg_clocks
            .get_mut(&client_id)
            .ok_or(Error::UnknownSender(bg_id))?;
        if !bg_clocks
            .tick(bg_id)
            .map_err(|_| Error::UnknownSender(bg_id))?
        {
            return Ok(false);
        }
        self.client_clocks.tick(client_id)
    }

    /// Defer a request until server clock reaches its clock.
    #[inline]
    pub fn add_row_request(&mut self, req: ServerRowRequest) {
        debug_assert!(req.clock > self.min_clock());
        self.deferred
            .entry(req.clock)
            .or_default()
            .entry(req.bg_id)
            .or_default()
            .push(req);
    }

    #[inline]
    pub fn num_deferred_requests(&self) -> usize {
        self.deferred
            .values()
            .flat_map(|m| m.values())
            .map(|v| v.len())
            .sum()
    }

    /// Remove and return every deferred request satisfied by current clock.
    #[inline]
    pub fn take_fulfilled_requests(&mut self) -> Vec<ServerRowRequest> {
        let rest = self.deferred.split_off(&(self.min_clock() + 1));
        let ready = std::mem::replace(&mut self.deferred, rest);
        ready
            .into_values()
            .flat_map(|m| m.into_values())
            .flatten()
            .collect()
    }

    /// Build reply of a row request at current clock. In push mode the
    /// requesting worker subscribes the row.
    #[inline]
    pub fn reply_row(&mut self, req: &ServerRowRequest) -> Result<Msg> {
        let clock = self.min_clock();
        let version = self
            .bg_version(req.bg_id)
            .ok_or(Error::UnknownSender(req.bg_id))?;
        let table = self
            .tables
            .get_mut(&req.table_id)
            .ok_or(Error::TableNotFound(req.table_id))?;
        let row = table.find_create_row(req.row_id, clock);
        if self.model == ConsistencyModel::SspPush {
            row.subscribe(req.bg_id);
        }
        let mut row_data = Vec::with_capacity(row.value.serialized_size());
        row.value.serialize(&mut row_data);
        Ok(Msg::ServerRowRequestReply {
            table_id: req.table_id,
            row_id: req.row_id,
            clock,
            version,
            row_data,
        })
    }

    /// Collect dirty subscribed rows into one row stream per background
    /// worker. Every worker gets a message, so each of them observes
    /// the new server clock.
    #[inline]
    pub fn push_rows(&mut self) -> Vec<(EntityID, Msg)> {
        let clock = self.min_clock();
        let mut writers: BTreeMap<EntityID, RowStreamWriter> = self
            .bg_ids()
            .map(|bg| (bg, RowStreamWriter::new()))
            .collect();
        for (table_id, table) in self.tables.iter_mut() {
            for writer in writers.values_mut() {
                writer.begin_table(*table_id);
            }
            table.drain_dirty(|row_id, row| {
                for bg in row.subscribers() {
                    if let Some(writer) = writers.get_mut(&bg) {
                        writer.append_row(row_id, &row.value);
                    }
                }
            });
        }
        writers
            .into_iter()
            .map(|(bg, writer)| {
                let version = self.bg_versions.get(&bg).copied().unwrap_or_default();
                let msg = Msg::ServerPushRow {
                    clock,
                    version,
                    is_clock: true,
                    data: writer.finish(),
                };
                (bg, msg)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{bg_thread_id, server_thread_id};
    use crate::oplog::codec::{OpLogWriter, RowStreamReader};
    use crate::oplog::RowOpLog;
    use crate::{RowKind, RowValue, Update};

    fn cluster(model: ConsistencyModel) -> ClusterConfig {
        ClusterConfig::default()
            .num_clients(2)
            .num_servers(1)
            .num_comm_channels(2)
            .consistency_model(model)
    }

    fn oplog_stream(table_id: TableID, rows: &[(RowID, f32)]) -> Vec<u8> {
        let mut writer = OpLogWriter::new();
        writer.begin_table(table_id, Update::STRIDE);
        for (row_id, delta) in rows {
            let mut oplog = RowOpLog::default();
            oplog.record(0, Update::Inc(*delta));
            writer.append_row(*row_id, &oplog);
        }
        writer.finish()
    }

    #[test]
    fn test_server_version_gap() {
        let mut server = Server::new(server_thread_id(0), &cluster(ConsistencyModel::Ssp));
        server.create_table(0, TableInfo::new(RowKind::Dense, 4));
        let bg = bg_thread_id(0, 0);
        for v in 1..=4 {
            server.apply_oplog(bg, v, &oplog_stream(0, &[(0, 1.0)])).unwrap();
        }
        let err = server
            .apply_oplog(bg, 6, &oplog_stream(0, &[(0, 1.0)]))
            .unwrap_err();
        assert_eq!(
            err,
            Error::VersionGap {
                sender: bg,
                expected: 5,
                actual: 6
            }
        );
        // rejected oplog is not applied.
        assert_eq!(server.bg_version(bg), Some(4));
        let row = server.table(0).unwrap().find_row(0).unwrap();
        assert_eq!(row.value.get(0).unwrap(), 4.0);
        // other workers keep their own versions.
        let other = bg_thread_id(1, 1);
        server.apply_oplog(other, 1, &oplog_stream(0, &[])).unwrap();
        assert!(matches!(
            server.apply_oplog(server_thread_id(3), 1, &oplog_stream(0, &[])),
            Err(Error::UnknownSender(_))
        ));
        assert!(matches!(
            server.apply_oplog(other, 2, &oplog_stream(9, &[(0, 1.0)])),
            Err(Error::TableNotFound(9))
        ));
    }

    #[test]
    fn test_server_clock_aggregation() {
        let mut server = Server::new(server_thread_id(0), &cluster(ConsistencyModel::Ssp));
        let (a0, a1) = (bg_thread_id(0, 0), bg_thread_id(0, 1));
        let (b0, b1) = (bg_thread_id(1, 0), bg_thread_id(1, 1));
        assert!(!server.clock(0, a0).unwrap());
        // client 0 advances, client 1 is still behind.
        assert!(!server.clock(0, a1).unwrap());
        assert!(!server.clock(1, b0).unwrap());
        assert_eq!(server.min_clock(), 0);
        assert!(server.clock(1, b1).unwrap());
        assert_eq!(server.min_clock(), 1);
        assert!(matches!(server.clock(0, b0), Err(Error::UnknownSender(_))));
    }

    #[test]
    fn test_server_deferred_requests() {
        let mut server = Server::new(server_thread_id(0), &cluster(ConsistencyModel::Ssp));
        server.create_table(0, TableInfo::new(RowKind::Dense, 2));
        let req = |bg_id, row_id, clock| ServerRowRequest {
            bg_id,
            table_id: 0,
            row_id,
            clock,
        };
        server.add_row_request(req(bg_thread_id(0, 0), 0, 1));
        server.add_row_request(req(bg_thread_id(1, 0), 2, 1));
        server.add_row_request(req(bg_thread_id(0, 1), 1, 2));
        assert_eq!(server.num_deferred_requests(), 3);
        assert!(server.take_fulfilled_requests().is_empty());

        for client in 0..2 {
            for channel in 0..2 {
                server.clock(client, bg_thread_id(client, channel)).unwrap();
            }
        }
        let mut ready = server.take_fulfilled_requests();
        ready.sort_by_key(|r| r.row_id);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].row_id, 0);
        assert_eq!(ready[1].row_id, 2);
        assert_eq!(server.num_deferred_requests(), 1);

        match server.reply_row(&ready[0]).unwrap() {
            Msg::ServerRowRequestReply {
                clock,
                version,
                row_data,
                ..
            } => {
                assert_eq!(clock, 1);
                assert_eq!(version, 0);
                let row = RowValue::deserialize(RowKind::Dense, 2, &row_data).unwrap();
                assert_eq!(row.get(1).unwrap(), 0.0);
            }
            msg => panic!("unexpected message {}", msg.name()),
        }
    }

    #[test]
    fn test_server_push_rows() {
        let mut server = Server::new(server_thread_id(0), &cluster(ConsistencyModel::SspPush));
        assert!(server.create_table(0, TableInfo::new(RowKind::Dense, 2)));
        assert!(!server.create_table(0, TableInfo::new(RowKind::Dense, 2)));
        let bg = bg_thread_id(1, server.partitioner.channel_of(3));
        assert_eq!(bg, bg_thread_id(1, 1));
        server
            .reply_row(&ServerRowRequest {
                bg_id: bg,
                table_id: 0,
                row_id: 3,
                clock: 0,
            })
            .unwrap();
        server
            .apply_oplog(bg_thread_id(0, 1), 1, &oplog_stream(0, &[(3, 2.0), (5, 1.0)]))
            .unwrap();

        let pushes = server.push_rows();
        assert_eq!(pushes.len(), 4);
        for (to, msg) in pushes {
            let (version, is_clock, data) = match msg {
                Msg::ServerPushRow {
                    version,
                    is_clock,
                    data,
                    ..
                } => (version, is_clock, data),
                msg => panic!("unexpected message {}", msg.name()),
            };
            assert!(is_clock);
            let mut reader = RowStreamReader::new(&data).unwrap();
            if to == bg {
                let entry = reader.next_row().unwrap().unwrap();
                assert_eq!(entry.row_id, 3);
                let row = RowValue::deserialize(RowKind::Dense, 2, entry.data).unwrap();
                assert_eq!(row.get(0).unwrap(), 2.0);
            } else if to == bg_thread_id(0, 1) {
                assert_eq!(version, 1);
            }
            assert!(reader.next_row().unwrap().is_none());
        }
        // pushed rows are clean.
        let pushes = server.push_rows();
        for (_, msg) in pushes {
            if let Msg::ServerPushRow { data, .. } = msg {
                let mut reader = RowStreamReader::new(&data).unwrap();
                assert!(reader.next_row().unwrap().is_none());
            }
        }
    }
}
