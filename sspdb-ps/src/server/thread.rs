use super::{Server, ServerRowRequest};
use crate::comm::{CommBus, Endpoint};
use crate::config::{ClusterConfig, ConsistencyModel};
use crate::context::{client_of, server_thread_id, EntityID, SERVER_ID_BASE};
use crate::error::{Error, Result};
use crate::msg::Msg;
use crate::{Clock, RowID, TableID};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Message loop of one server.
pub struct ServerThread {
    server: Server,
    endpoint: Endpoint,
    bus: Arc<CommBus>,
    num_bg_threads: usize,
    shutdown_reqs: usize,
}

impl ServerThread {
    #[inline]
    pub fn new(endpoint: Endpoint, cluster: &ClusterConfig, bus: Arc<CommBus>) -> Self {
        let server = Server::new(endpoint.id(), cluster);
        ServerThread {
            server,
            endpoint,
            bus,
            num_bg_threads: cluster.total_bg_threads(),
            shutdown_reqs: 0,
        }
    }

    #[inline]
    pub fn run(mut self) {
        let id = self.server.id();
        log::info!("server {} started", id);
        loop {
            let res = match self.endpoint.recv() {
                Ok((sender, msg)) => self.handle(sender, msg),
                Err(e) => Err(e),
            };
            match res {
                Ok(ControlFlow::Continue(())) => (),
                Ok(ControlFlow::Break(())) => break,
                Err(e) => {
                    log::error!("server {} fatal error: {}", id, e);
                    panic!("server {} fatal error: {}", id, e);
                }
            }
        }
        self.bus.deregister(id);
        log::info!("server {} stopped", id);
    }

    #[inline]
    fn handle(&mut self, sender: EntityID, msg: Msg) -> Result<ControlFlow<()>> {
        log::debug!("server {} recv {} from {}", self.server.id(), msg.name(), sender);
        if sender >= SERVER_ID_BASE {
            return Err(Error::UnknownSender(sender));
        }
        match msg {
            Msg::CreateTable { table_id, info } => {
                if self.server.create_table(table_id, info) {
                    log::info!("server {} created table {}", self.server.id(), table_id);
                }
                self.send(sender, &Msg::CreateTableReply { table_id })?;
            }
            Msg::RowRequest {
                table_id,
                row_id,
                clock,
            } => self.handle_row_request(sender, table_id, row_id, clock)?,
            Msg::ClientSendOpLog {
                client_id,
                version,
                is_clock,
                data,
            } => {
                if client_id != client_of(sender) {
                    return Err(Error::UnknownSender(sender));
                }
                self.server.apply_oplog(sender, version, &data)?;
                if is_clock && self.server.clock(client_id, sender)? {
                    self.on_clock_advance()?;
                }
            }
            Msg::ClientShutDown => {
                self.shutdown_reqs += 1;
                if self.shutdown_reqs == self.num_bg_threads {
                    for bg in self.server.bg_ids() {
                        self.send(bg, &Msg::ServerShutDownAck)?;
                    }
                    return Ok(ControlFlow::Break(()));
                }
            }
            msg => return Err(Error::UnexpectedMessage(msg.name(), sender)),
        }
        Ok(ControlFlow::Continue(()))
    }

    #[inline]
    fn handle_row_request(
        &mut self,
        bg_id: EntityID,
        table_id: TableID,
        row_id: RowID,
        clock: Clock,
    ) -> Result<()> {
        let req = ServerRowRequest {
            bg_id,
            table_id,
            row_id,
            clock,
        };
        if clock > self.server.min_clock() {
            self.server.add_row_request(req);
            return Ok(());
        }
        let reply = self.server.reply_row(&req)?;
        self.send(bg_id, &reply)
    }

    #[inline]
    fn on_clock_advance(&mut self) -> Result<()> {
        log::debug!(
            "server {} clock advances to {}",
            self.server.id(),
            self.server.min_clock()
        );
        for req in self.server.take_fulfilled_requests() {
            let reply = self.server.reply_row(&req)?;
            self.send(req.bg_id, &reply)?;
        }
        if self.server.model() == ConsistencyModel::SspPush {
            for (bg, msg) in self.server.push_rows() {
                self.send(bg, &msg)?;
            }
        }
        Ok(())
    }

    #[inline]
    fn send(&self, to: EntityID, msg: &Msg) -> Result<()> {
        self.bus.send(self.server.id(), to, msg)
    }
}

/// Server threads of a cluster.
pub struct ServerGroup {
    handles: Vec<JoinHandle<()>>,
}

impl ServerGroup {
    /// Register endpoints of all servers and start their threads.
    /// Servers are reachable once this returns.
    #[inline]
    pub fn start(cluster: &ClusterConfig, bus: Arc<CommBus>) -> Result<Self> {
        cluster.validate()?;
        let mut endpoints = Vec::with_capacity(cluster.num_servers);
        for idx in 0..cluster.num_servers {
            endpoints.push(bus.register(server_thread_id(idx))?);
        }
        let mut handles = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let name = format!("Server-{}", endpoint.id());
            let st = ServerThread::new(endpoint, cluster, Arc::clone(&bus));
            handles.push(thread::Builder::new().name(name).spawn(move || st.run())?);
        }
        Ok(ServerGroup { handles })
    }

    /// Wait until all servers exit, which happens after every
    /// client shut down.
    #[inline]
    pub fn join(self) -> Result<()> {
        for handle in self.handles {
            handle.join().map_err(|_| Error::ThreadPanicked)?;
        }
        Ok(())
    }
}
