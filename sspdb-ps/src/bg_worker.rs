//! Background worker of a client process.
//!
//! Each client runs one worker per comm channel. A worker owns the
//! wire protocol of the rows mapped to its channel: it forwards row
//! requests of application threads to servers, merges server replies
//! with local writes before caching them, and flushes oplogs on clock.
use crate::cache::ClientRow;
use crate::clock::VectorClock;
use crate::comm::Endpoint;
use crate::config::{ConsistencyModel, TableInfo};
use crate::context::{ClientContext, EntityID};
use crate::error::{Error, Result};
use crate::msg::{Msg, RowSnapshot};
use crate::oplog::codec::{OpLogWriter, RowStreamReader};
use crate::request::{BgOpLog, RowRequestInfo, RowRequestTracker};
use crate::table::{ClientTable, TableRegistry};
use crate::{Clock, RowID, RowValue, TableID, Update, Version};
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Table creation waiting for replies of all servers.
struct PendingCreate {
    app_thread_id: EntityID,
    replies: usize,
}

pub struct BgWorker {
    id: EntityID,
    channel: usize,
    ctx: Arc<ClientContext>,
    tables: Arc<TableRegistry>,
    endpoint: Endpoint,
    /// Version assigned to next oplog flush.
    version: Version,
    tracker: RowRequestTracker,
    /// Clocks pushed by each server, push mode only.
    server_clocks: VectorClock<EntityID>,
    pending_creates: HashMap<TableID, PendingCreate>,
    shutdown_acks: usize,
}

impl BgWorker {
    #[inline]
    pub fn new(
        channel: usize,
        endpoint: Endpoint,
        ctx: Arc<ClientContext>,
        tables: Arc<TableRegistry>,
    ) -> Self {
        let servers = ctx.partitioner.server_ids();
        let tracker = match ctx.cluster.consistency_model {
            ConsistencyModel::Ssp => RowRequestTracker::new(),
            ConsistencyModel::SspPush => RowRequestTracker::with_server_acks(servers),
        };
        let server_clocks = VectorClock::with_ids(ctx.partitioner.server_ids());
        BgWorker {
            id: endpoint.id(),
            channel,
            ctx,
            tables,
            endpoint,
            version: 1,
            tracker,
            server_clocks,
            pending_creates: HashMap::new(),
            shutdown_acks: 0,
        }
    }

    /// Start the worker in a dedicated thread.
    #[inline]
    pub fn start(self) -> Result<JoinHandle<()>> {
        let name = format!("BgWorker-{}", self.id);
        let handle = thread::Builder::new().name(name).spawn(move || self.run())?;
        Ok(handle)
    }

    #[inline]
    pub fn run(mut self) {
        log::info!("bg worker {} started", self.id);
        loop {
            let res = match self.endpoint.recv() {
                Ok((sender, msg)) => self.handle(sender, msg),
                Err(e) => Err(e),
            };
            match res {
                Ok(ControlFlow::Continue(())) => (),
                Ok(ControlFlow::Break(())) => break,
                Err(e) => {
                    log::error!("bg worker {} fatal error: {}", self.id, e);
                    panic!("bg worker {} fatal error: {}", self.id, e);
                }
            }
        }
        self.ctx.bus.deregister(self.id);
        log::info!("bg worker {} stopped", self.id);
    }

    #[inline]
    fn handle(&mut self, sender: EntityID, msg: Msg) -> Result<ControlFlow<()>> {
        log::debug!("bg worker {} recv {} from {}", self.id, msg.name(), sender);
        match msg {
            Msg::BgCreateTable { table_id, info } => self.create_table(sender, table_id, info)?,
            Msg::CreateTableReply { table_id } => self.handle_create_table_reply(sender, table_id)?,
            Msg::RowRequest {
                table_id,
                row_id,
                clock,
            } => self.check_forward_row_request(sender, table_id, row_id, clock)?,
            Msg::ServerRowRequestReply {
                table_id,
                row_id,
                clock,
                version,
                row_data,
            } => self.handle_server_row_reply(table_id, row_id, clock, version, &row_data)?,
            Msg::ServerPushRow {
                clock,
                version,
                is_clock,
                data,
            } => self.handle_server_push_row(sender, clock, version, is_clock, &data)?,
            Msg::BgClock => self.send_oplogs(true)?,
            Msg::BgSendOpLog => self.send_oplogs(false)?,
            Msg::BgShutDown => {
                for server in self.ctx.partitioner.server_ids() {
                    self.ctx.bus.send(self.id, server, &Msg::ClientShutDown)?;
                }
            }
            Msg::ServerShutDownAck => {
                self.shutdown_acks += 1;
                if self.shutdown_acks == self.ctx.partitioner.num_servers() {
                    return Ok(ControlFlow::Break(()));
                }
            }
            msg => return Err(Error::UnexpectedMessage(msg.name(), sender)),
        }
        Ok(ControlFlow::Continue(()))
    }

    #[inline]
    fn table(&self, table_id: TableID) -> Result<Arc<ClientTable>> {
        self.tables
            .get(table_id)
            .ok_or(Error::TableNotFound(table_id))
    }

    #[inline]
    fn create_table(&mut self, app_thread_id: EntityID, table_id: TableID, info: TableInfo) -> Result<()> {
        if self.pending_creates.contains_key(&table_id) {
            return Err(Error::TableExists(table_id));
        }
        for server in self.ctx.partitioner.server_ids() {
            self.ctx
                .bus
                .send(self.id, server, &Msg::CreateTable { table_id, info })?;
        }
        self.pending_creates.insert(
            table_id,
            PendingCreate {
                app_thread_id,
                replies: 0,
            },
        );
        Ok(())
    }

    #[inline]
    fn handle_create_table_reply(&mut self, server: EntityID, table_id: TableID) -> Result<()> {
        let pending = self
            .pending_creates
            .get_mut(&table_id)
            .ok_or(Error::UnexpectedMessage("CreateTableReply", server))?;
        pending.replies += 1;
        if pending.replies < self.ctx.partitioner.num_servers() {
            return Ok(());
        }
        let app_thread_id = pending.app_thread_id;
        self.pending_creates.remove(&table_id);
        log::info!("table {} created on all servers", table_id);
        self.ctx
            .bus
            .send(self.id, app_thread_id, &Msg::CreateTableReply { table_id })
    }

    /// Reply immediately if process cache already satisfies the request,
    /// otherwise track it and send to server unless an earlier request
    /// covers it.
    #[inline]
    fn check_forward_row_request(
        &mut self,
        app_thread_id: EntityID,
        table_id: TableID,
        row_id: RowID,
        clock: Clock,
    ) -> Result<()> {
        let table = self.table(table_id)?;
        let snapshot = match table.cache.lock().find(row_id) {
            Some(row) if self.is_fresh(row, clock) => Some(snapshot_of(row)),
            _ => None,
        };
        if let Some(snapshot) = snapshot {
            return self.reply_row(app_thread_id, table_id, row_id, Some(snapshot));
        }
        let request = RowRequestInfo::new(app_thread_id, clock, self.version - 1);
        if self.tracker.add_row_request(table_id, row_id, request) {
            self.send_row_request(table_id, row_id, clock)?;
        }
        Ok(())
    }

    #[inline]
    fn is_fresh(&self, row: &ClientRow, clock: Clock) -> bool {
        match self.ctx.cluster.consistency_model {
            ConsistencyModel::Ssp => row.clock >= clock,
            ConsistencyModel::SspPush => true,
        }
    }

    #[inline]
    fn reply_row(
        &self,
        app_thread_id: EntityID,
        table_id: TableID,
        row_id: RowID,
        row: Option<RowSnapshot>,
    ) -> Result<()> {
        self.ctx.bus.send(
            self.id,
            app_thread_id,
            &Msg::RowRequestReply {
                table_id,
                row_id,
                row,
            },
        )
    }

    #[inline]
    fn send_row_request(&self, table_id: TableID, row_id: RowID, clock: Clock) -> Result<()> {
        let server = self.ctx.partitioner.server_of(table_id, row_id);
        self.ctx.bus.send(
            self.id,
            server,
            &Msg::RowRequest {
                table_id,
                row_id,
                clock,
            },
        )
    }

    #[inline]
    fn handle_server_row_reply(
        &mut self,
        table_id: TableID,
        row_id: RowID,
        clock: Clock,
        version: Version,
        row_data: &[u8],
    ) -> Result<()> {
        let table = self.table(table_id)?;
        let value = table.deserialize_row(row_data)?;
        let snapshot = self.refresh_row(&table, row_id, clock, version, value, true)?;
        if snapshot.is_none() {
            log::warn!(
                "bg worker {} dropped reply of row {} table {} at version {}",
                self.id,
                row_id,
                table_id,
                version
            );
        }
        let outcome = self
            .tracker
            .inform_reply(table_id, row_id, clock, self.version);
        if let Some(next_clock) = outcome.next_clock {
            self.send_row_request(table_id, row_id, next_clock)?;
        }
        for app_thread_id in outcome.waiters {
            self.reply_row(app_thread_id, table_id, row_id, snapshot.clone())?;
        }
        Ok(())
    }

    #[inline]
    fn handle_server_push_row(
        &mut self,
        server: EntityID,
        clock: Clock,
        version: Version,
        is_clock: bool,
        data: &[u8],
    ) -> Result<()> {
        let mut reader = RowStreamReader::new(data)?;
        while let Some(entry) = reader.next_row()? {
            let table = self.table(entry.table_id)?;
            let value = table.deserialize_row(entry.data)?;
            self.refresh_row(&table, entry.row_id, clock, version, value, false)?;
        }
        self.tracker.server_acknowledge_version(server, version);
        if !is_clock {
            return Ok(());
        }
        let min = self
            .server_clocks
            .tick_until(server, clock)
            .map_err(|_| Error::UnknownSender(server))?;
        if let Some(min) = min {
            if let Some(system_clock) = self.ctx.bg_clocks.tick_until(self.id, min)? {
                log::debug!("client {} system clock advances to {}", self.ctx.client_id, system_clock);
                self.ctx.system_clock.advance_to(system_clock);
            }
        }
        Ok(())
    }

    /// Replay oplogs the server has not applied yet on a server row,
    /// then put it into process cache.
    ///
    /// With `insert`, returns a copy of the row as cached right after
    /// the refresh. Without it, only a row already cached is refreshed
    /// and nothing is returned. None is also returned if some oplog
    /// needed for replay is already released.
    #[inline]
    fn refresh_row(
        &self,
        table: &ClientTable,
        row_id: RowID,
        clock: Clock,
        version: Version,
        mut value: RowValue,
        insert: bool,
    ) -> Result<Option<RowSnapshot>> {
        if !self.tracker.covers(version + 1, self.version) {
            return Ok(None);
        }
        let table_id = table.table_id();
        for oplog in self.tracker.oplogs_after(version) {
            if let Some(row_oplog) = oplog.get(table_id).and_then(|p| p.find(row_id)) {
                row_oplog.apply_to(&mut value)?;
            }
        }
        // hold partition lock so no write can slip in between replay and insert.
        table.oplog.with_partition(row_id, |part| {
            if let Some(row_oplog) = part.find(row_id) {
                row_oplog.apply_to(&mut value)?;
            }
            let mut cache = table.cache.lock();
            if !insert && !cache.has_row(row_id) {
                return Ok(None);
            }
            if let Some(evicted) = cache.put_row(row_id, ClientRow::new(clock, value)) {
                log::debug!("table {} evicts row {}", table_id, evicted);
            }
            if !insert {
                return Ok(None);
            }
            // a newer cached row is kept by put_row, copy whichever stays.
            Ok(cache.find(row_id).map(snapshot_of))
        })
    }

    /// Flush this channel's oplogs of all tables to every server.
    /// Every server receives a message even if it has no update, so
    /// versions seen by each server stay continuous.
    #[inline]
    fn send_oplogs(&mut self, is_clock: bool) -> Result<()> {
        let partitioner = self.ctx.partitioner;
        let mut writers: BTreeMap<EntityID, OpLogWriter> = partitioner
            .server_ids()
            .map(|s| (s, OpLogWriter::new()))
            .collect();
        let mut bg_oplog = BgOpLog::new(self.version);
        for table in self.tables.snapshot() {
            let table_id = table.table_id();
            let part = table.oplog.take_partition(self.channel);
            for writer in writers.values_mut() {
                writer.begin_table(table_id, Update::STRIDE);
            }
            part.serialize_by_server(table_id, &partitioner, &mut writers)?;
            bg_oplog.add(table_id, part);
        }
        for (server, writer) in writers {
            let msg = Msg::ClientSendOpLog {
                client_id: self.ctx.client_id,
                version: self.version,
                is_clock,
                data: writer.finish(),
            };
            self.ctx.bus.send(self.id, server, &msg)?;
        }
        self.tracker.add_oplog(bg_oplog);
        self.version += 1;
        Ok(())
    }
}

#[inline]
fn snapshot_of(row: &ClientRow) -> RowSnapshot {
    let mut row_data = Vec::with_capacity(row.value.serialized_size());
    row.value.serialize(&mut row_data);
    RowSnapshot {
        clock: row.clock,
        row_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommBus;
    use crate::config::{ClusterConfig, TableConfig};
    use crate::context::{app_thread_id, bg_thread_id, server_thread_id, ThreadHandle};
    use crate::oplog::codec::RowStreamWriter;
    use crate::{ColumnID, RowKind};

    const TABLE_ID: TableID = 0;

    /// One worker of client 0 talking to one server, driven by hand.
    struct Fixture {
        bg: BgWorker,
        table: Arc<ClientTable>,
        app: ThreadHandle,
        server: Endpoint,
    }

    impl Fixture {
        fn new(model: ConsistencyModel) -> Self {
            let cluster = ClusterConfig::default().consistency_model(model);
            let bus = Arc::new(CommBus::new());
            let server = bus.register(server_thread_id(0)).unwrap();
            let ctx = Arc::new(ClientContext::new(0, cluster, Arc::clone(&bus)));
            let tables = Arc::new(TableRegistry::default());
            let config = TableConfig::new(RowKind::Dense, 4);
            let table = Arc::new(ClientTable::new(TABLE_ID, config, Arc::clone(&ctx)));
            tables.insert(Arc::clone(&table)).unwrap();
            let endpoint = bus.register(bg_thread_id(0, 0)).unwrap();
            let bg = BgWorker::new(0, endpoint, Arc::clone(&ctx), tables);
            let app_id = app_thread_id(0, 0);
            let app_endpoint = bus.register(app_id).unwrap();
            let clock = ctx.thread_clocks.join(app_id).unwrap();
            Fixture {
                bg,
                table,
                app: ThreadHandle::new(app_endpoint, clock),
                server,
            }
        }

        fn request(&mut self, row_id: RowID, clock: Clock) {
            let msg = Msg::RowRequest {
                table_id: TABLE_ID,
                row_id,
                clock,
            };
            let flow = self.bg.handle(self.app.id(), msg).unwrap();
            assert_eq!(flow, ControlFlow::Continue(()));
        }

        fn flush(&mut self) {
            self.bg.handle(self.app.id(), Msg::BgSendOpLog).unwrap();
        }

        fn server_reply(&mut self, row_id: RowID, clock: Clock, version: Version, value: &RowValue) {
            let mut row_data = vec![];
            value.serialize(&mut row_data);
            let msg = Msg::ServerRowRequestReply {
                table_id: TABLE_ID,
                row_id,
                clock,
                version,
                row_data,
            };
            self.bg.handle(server_thread_id(0), msg).unwrap();
        }

        fn recv_app(&self) -> Msg {
            self.app.endpoint.recv().unwrap().1
        }

        fn recv_server(&self) -> Msg {
            self.server.recv().unwrap().1
        }

        fn cached(&self, row_id: RowID) -> Option<ClientRow> {
            self.table.cache.lock().find(row_id).cloned()
        }
    }

    fn dense(vals: &[f32]) -> RowValue {
        let mut value = RowValue::new(RowKind::Dense, 4);
        for (col, val) in vals.iter().enumerate() {
            value.set(col as ColumnID, *val).unwrap();
        }
        value
    }

    #[test]
    fn test_reply_replays_unapplied_oplogs() {
        let mut f = Fixture::new(ConsistencyModel::Ssp);
        f.table.inc(&f.app, 0, 0, 1.0).unwrap();
        f.request(0, 0);
        assert!(matches!(f.recv_server(), Msg::RowRequest { row_id: 0, clock: 0, .. }));
        // flushed while the request is pending, so kept for replay.
        f.flush();
        match f.recv_server() {
            Msg::ClientSendOpLog {
                version: 1,
                is_clock: false,
                ..
            } => (),
            msg => panic!("unexpected {:?}", msg),
        }
        assert_eq!(f.bg.tracker.retained_versions(), vec![1]);
        f.table.inc(&f.app, 0, 0, 2.0).unwrap();
        f.table.inc(&f.app, 0, 1, 0.5).unwrap();

        // server has not applied version 1 when it replies.
        f.server_reply(0, 0, 0, &dense(&[10.0, 0.0, 0.0, 3.0]));
        let expected = dense(&[13.0, 0.5, 0.0, 3.0]);
        match f.recv_app() {
            Msg::RowRequestReply {
                table_id: TABLE_ID,
                row_id: 0,
                row: Some(snapshot),
            } => {
                assert_eq!(snapshot.clock, 0);
                let value = f.table.deserialize_row(&snapshot.row_data).unwrap();
                assert_eq!(value, expected);
            }
            msg => panic!("unexpected {:?}", msg),
        }
        assert_eq!(f.cached(0).unwrap().value, expected);
        // no request is pending, so nothing needs the flushed oplog.
        assert_eq!(f.bg.tracker.num_pending_rows(), 0);
        assert!(f.bg.tracker.retained_versions().is_empty());
    }

    #[test]
    fn test_reply_with_applied_version_skips_replay() {
        let mut f = Fixture::new(ConsistencyModel::Ssp);
        f.table.inc(&f.app, 2, 3, 1.0).unwrap();
        f.request(2, 0);
        f.recv_server();
        f.flush();
        f.recv_server();
        // server already applied version 1, its row includes the increment.
        f.server_reply(2, 1, 1, &dense(&[0.0, 0.0, 0.0, 1.0]));
        assert!(matches!(f.recv_app(), Msg::RowRequestReply { row: Some(_), .. }));
        let row = f.cached(2).unwrap();
        assert_eq!(row.clock, 1);
        assert_eq!(row.value, dense(&[0.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_reply_without_replay_range_releases_waiters() {
        let mut f = Fixture::new(ConsistencyModel::Ssp);
        // no request is pending, so the flushed oplog is dropped at once.
        f.table.inc(&f.app, 0, 0, 1.0).unwrap();
        f.flush();
        f.recv_server();
        assert!(f.bg.tracker.retained_versions().is_empty());
        f.request(0, 0);
        f.recv_server();

        // a reply older than the dropped version cannot be merged.
        f.server_reply(0, 0, 0, &dense(&[10.0, 0.0, 0.0, 0.0]));
        assert!(matches!(
            f.recv_app(),
            Msg::RowRequestReply {
                row_id: 0,
                row: None,
                ..
            }
        ));
        assert!(!f.table.is_cached(0));
        assert_eq!(f.bg.tracker.num_pending_rows(), 0);

        // the reader asks again and gets a reply at current version.
        f.request(0, 0);
        f.recv_server();
        f.server_reply(0, 0, 1, &dense(&[11.0, 0.0, 0.0, 0.0]));
        match f.recv_app() {
            Msg::RowRequestReply { row: Some(s), .. } => {
                let value = f.table.deserialize_row(&s.row_data).unwrap();
                assert_eq!(value.get(0).unwrap(), 11.0);
            }
            msg => panic!("unexpected {:?}", msg),
        }
        assert!(f.table.is_cached(0));
    }

    #[test]
    fn test_request_served_from_cache() {
        let mut f = Fixture::new(ConsistencyModel::Ssp);
        f.request(1, 0);
        f.recv_server();
        f.server_reply(1, 2, 0, &dense(&[1.0, 2.0, 3.0, 4.0]));
        f.recv_app();

        f.request(1, 2);
        match f.recv_app() {
            Msg::RowRequestReply { row: Some(s), .. } => assert_eq!(s.clock, 2),
            msg => panic!("unexpected {:?}", msg),
        }
        assert_eq!(f.bg.tracker.num_pending_rows(), 0);

        // cached row is too stale, forward to server.
        f.request(1, 3);
        assert!(matches!(f.recv_server(), Msg::RowRequest { row_id: 1, clock: 3, .. }));
        assert_eq!(f.bg.tracker.num_pending_rows(), 1);
    }

    #[test]
    fn test_push_refreshes_cached_rows_only() {
        let mut f = Fixture::new(ConsistencyModel::SspPush);
        f.request(0, 0);
        f.recv_server();
        f.server_reply(0, 0, 0, &dense(&[1.0, 0.0, 0.0, 0.0]));
        assert!(matches!(f.recv_app(), Msg::RowRequestReply { row: Some(_), .. }));
        // applied on cached row and kept in oplog.
        f.table.inc(&f.app, 0, 2, 5.0).unwrap();

        let mut writer = RowStreamWriter::new();
        writer.begin_table(TABLE_ID);
        writer.append_row(0, &dense(&[4.0, 0.0, 0.0, 0.0]));
        writer.append_row(1, &dense(&[9.0, 0.0, 0.0, 0.0]));
        let msg = Msg::ServerPushRow {
            clock: 1,
            version: 0,
            is_clock: true,
            data: writer.finish(),
        };
        f.bg.handle(server_thread_id(0), msg).unwrap();

        assert!(!f.table.is_cached(1));
        let row = f.cached(0).unwrap();
        assert_eq!(row.clock, 1);
        assert_eq!(row.value, dense(&[4.0, 0.0, 5.0, 0.0]));
        // the only worker heard from the only server.
        assert_eq!(f.bg.ctx.system_clock.get(), 1);
    }

    #[test]
    fn test_push_from_unknown_server() {
        let mut f = Fixture::new(ConsistencyModel::SspPush);
        let msg = Msg::ServerPushRow {
            clock: 1,
            version: 0,
            is_clock: true,
            data: RowStreamWriter::new().finish(),
        };
        let res = f.bg.handle(server_thread_id(5), msg);
        assert_eq!(res.unwrap_err(), Error::UnknownSender(server_thread_id(5)));
    }

    #[test]
    fn test_shutdown_handshake() {
        let mut f = Fixture::new(ConsistencyModel::Ssp);
        let control = f.app.id();
        assert_eq!(
            f.bg.handle(control, Msg::BgShutDown).unwrap(),
            ControlFlow::Continue(())
        );
        assert_eq!(f.recv_server(), Msg::ClientShutDown);
        assert_eq!(
            f.bg.handle(server_thread_id(0), Msg::ServerShutDownAck).unwrap(),
            ControlFlow::Break(())
        );
    }
}
