//! Client process bootstrap.
//!
//! A table group starts the background workers of one client, creates
//! tables and registers application threads.
use crate::bg_worker::BgWorker;
use crate::comm::CommBus;
use crate::config::{ClusterConfig, TableConfig};
use crate::context::{app_thread_id, control_thread_id, ClientContext, ClientID, ThreadHandle, MAX_APP_THREADS};
use crate::error::{Error, Result};
use crate::msg::Msg;
use crate::table::{ClientTable, TableRegistry};
use crate::{Clock, TableID};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct TableGroup {
    ctx: Arc<ClientContext>,
    tables: Arc<TableRegistry>,
    bg_threads: Mutex<Vec<JoinHandle<()>>>,
    next_thread_idx: AtomicUsize,
    create_lock: Mutex<()>,
    /// Largest staleness of all created tables.
    max_staleness: AtomicI32,
}

impl TableGroup {
    /// Start background workers of given client. Servers must be
    /// registered on the bus before any table is created.
    #[inline]
    pub fn start(client_id: ClientID, cluster: ClusterConfig, bus: Arc<CommBus>) -> Result<Self> {
        cluster.validate()?;
        if client_id < 0 || client_id as usize >= cluster.num_clients {
            return Err(Error::InvalidArgument);
        }
        let ctx = Arc::new(ClientContext::new(client_id, cluster, bus));
        let tables = Arc::new(TableRegistry::default());
        let mut workers = Vec::with_capacity(ctx.partitioner.num_channels());
        for (channel, bg_id) in ctx.partitioner.bg_ids(client_id).enumerate() {
            let endpoint = ctx.bus.register(bg_id)?;
            workers.push(BgWorker::new(
                channel,
                endpoint,
                Arc::clone(&ctx),
                Arc::clone(&tables),
            ));
        }
        let mut bg_threads = Vec::with_capacity(workers.len());
        for worker in workers {
            bg_threads.push(worker.start()?);
        }
        log::info!(
            "client {} started with {} background workers",
            client_id,
            bg_threads.len()
        );
        Ok(TableGroup {
            ctx,
            tables,
            bg_threads: Mutex::new(bg_threads),
            next_thread_idx: AtomicUsize::new(0),
            create_lock: Mutex::new(()),
            max_staleness: AtomicI32::new(0),
        })
    }

    #[inline]
    pub fn client_id(&self) -> ClientID {
        self.ctx.client_id
    }

    /// Register calling thread. The thread starts at the slowest
    /// clock of the process.
    #[inline]
    pub fn register_thread(&self) -> Result<ThreadHandle> {
        let idx = self.next_thread_idx.fetch_add(1, Ordering::Relaxed);
        if idx >= MAX_APP_THREADS {
            return Err(Error::InvalidArgument);
        }
        let id = app_thread_id(self.ctx.client_id, idx);
        let endpoint = self.ctx.bus.register(id)?;
        let clock = match self.ctx.thread_clocks.join(id) {
            Some(clock) => clock,
            None => {
                self.ctx.bus.deregister(id);
                return Err(Error::EndpointExists(id));
            }
        };
        Ok(ThreadHandle::new(endpoint, clock))
    }

    /// Stop receiving messages on the thread's endpoint. The thread
    /// still counts in process clock, so it should deregister only
    /// after its last clock.
    #[inline]
    pub fn deregister_thread(&self, handle: ThreadHandle) {
        self.ctx.bus.deregister(handle.id());
    }

    /// Create a table on this client and on all servers. Blocks until
    /// every server acknowledged.
    #[inline]
    pub fn create_table(
        &self,
        handle: &ThreadHandle,
        table_id: TableID,
        config: TableConfig,
    ) -> Result<Arc<ClientTable>> {
        if table_id < 0 {
            return Err(Error::InvalidArgument);
        }
        config.validate()?;
        let _g = self.create_lock.lock();
        if self.tables.get(table_id).is_some() {
            return Err(Error::TableExists(table_id));
        }
        self.ctx.wait_pending_async(handle)?;
        let msg = Msg::BgCreateTable {
            table_id,
            info: config.info,
        };
        self.ctx.bus.send(handle.id(), self.ctx.head_bg(), &msg)?;
        match handle.endpoint.recv()? {
            (_, Msg::CreateTableReply { table_id: id }) if id == table_id => (),
            (sender, msg) => return Err(Error::UnexpectedMessage(msg.name(), sender)),
        }
        self.max_staleness
            .fetch_max(config.info.staleness, Ordering::Relaxed);
        let table = Arc::new(ClientTable::new(table_id, config, Arc::clone(&self.ctx)));
        self.tables.insert(Arc::clone(&table))?;
        log::info!("client {} created table {}", self.ctx.client_id, table_id);
        Ok(table)
    }

    #[inline]
    pub fn table(&self, table_id: TableID) -> Option<Arc<ClientTable>> {
        self.tables.get(table_id)
    }

    /// Advance clock of calling thread on all tables.
    #[inline]
    pub fn clock(&self, handle: &mut ThreadHandle) -> Result<()> {
        self.ctx.clock(handle)
    }

    /// Clock enough times that every update made before the barrier
    /// by any thread of the cluster is visible to reads after it.
    /// All threads of all clients must call it together.
    #[inline]
    pub fn global_barrier(&self, handle: &mut ThreadHandle) -> Result<()> {
        for _ in 0..=self.max_staleness() {
            self.clock(handle)?;
        }
        Ok(())
    }

    #[inline]
    pub fn max_staleness(&self) -> Clock {
        self.max_staleness.load(Ordering::Relaxed)
    }

    /// Flush pending oplogs of all tables without advancing clock.
    #[inline]
    pub fn send_oplogs(&self, handle: &ThreadHandle) -> Result<()> {
        self.ctx.send_oplogs(handle.id())
    }

    /// Stop background workers. Servers release workers only after
    /// every client shut down, so this blocks until then.
    #[inline]
    pub fn shutdown(&self) -> Result<()> {
        let sender = control_thread_id(self.ctx.client_id);
        for bg in self.ctx.partitioner.bg_ids(self.ctx.client_id) {
            self.ctx.bus.send(sender, bg, &Msg::BgShutDown)?;
        }
        let handles = std::mem::take(&mut *self.bg_threads.lock());
        for handle in handles {
            handle.join().map_err(|_| Error::ThreadPanicked)?;
        }
        log::info!("client {} shut down", self.ctx.client_id);
        Ok(())
    }
}
