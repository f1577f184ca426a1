use crate::clock::{ProcessClock, SyncVectorClock};
use crate::comm::{CommBus, Endpoint};
use crate::config::{ClockMode, ClusterConfig};
use crate::error::{Error, Result};
use crate::msg::{Msg, RowSnapshot};
use crate::table::ClientTable;
use crate::thread_table::{self, ThreadTable};
use crate::{Clock, RowID, TableID};
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;

/// Address of a thread on the comm bus.
pub type EntityID = i32;
/// Index of a client process.
pub type ClientID = i32;

/// Id space reserved for threads of one client.
pub const MAX_THREADS_PER_CLIENT: EntityID = 1000;
const BG_THREAD_OFFSET: EntityID = 100;
const APP_THREAD_OFFSET: EntityID = 200;
/// Upper bound of comm channels (background workers) per client.
pub const MAX_COMM_CHANNELS: usize = (APP_THREAD_OFFSET - BG_THREAD_OFFSET) as usize;
/// Upper bound of application threads per client.
pub const MAX_APP_THREADS: usize = (MAX_THREADS_PER_CLIENT - APP_THREAD_OFFSET) as usize;
/// Server threads live outside of all client id ranges.
pub const SERVER_ID_BASE: EntityID = 1_000_000;

/// Id used by a client to send control messages on behalf of
/// the whole process, e.g. shutdown.
#[inline]
pub fn control_thread_id(client_id: ClientID) -> EntityID {
    client_id * MAX_THREADS_PER_CLIENT
}

#[inline]
pub fn bg_thread_id(client_id: ClientID, channel: usize) -> EntityID {
    debug_assert!(channel < MAX_COMM_CHANNELS);
    client_id * MAX_THREADS_PER_CLIENT + BG_THREAD_OFFSET + channel as EntityID
}

#[inline]
pub fn app_thread_id(client_id: ClientID, idx: usize) -> EntityID {
    debug_assert!(idx < MAX_APP_THREADS);
    client_id * MAX_THREADS_PER_CLIENT + APP_THREAD_OFFSET + idx as EntityID
}

#[inline]
pub fn server_thread_id(idx: usize) -> EntityID {
    SERVER_ID_BASE + idx as EntityID
}

/// Client a thread belongs to.
#[inline]
pub fn client_of(id: EntityID) -> ClientID {
    debug_assert!(id < SERVER_ID_BASE);
    id / MAX_THREADS_PER_CLIENT
}

/// Partitioner decides which server owns a row and which
/// background worker of a client handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    num_servers: usize,
    num_channels: usize,
}

impl Partitioner {
    #[inline]
    pub fn new(num_servers: usize, num_channels: usize) -> Self {
        debug_assert!(num_servers > 0 && num_channels > 0);
        Partitioner {
            num_servers,
            num_channels,
        }
    }

    #[inline]
    pub fn num_servers(&self) -> usize {
        self.num_servers
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    #[inline]
    pub fn server_of(&self, _table_id: TableID, row_id: RowID) -> EntityID {
        server_thread_id(row_id.rem_euclid(self.num_servers as i32) as usize)
    }

    #[inline]
    pub fn channel_of(&self, row_id: RowID) -> usize {
        row_id.rem_euclid(self.num_channels as i32) as usize
    }

    #[inline]
    pub fn server_ids(&self) -> impl Iterator<Item = EntityID> {
        (0..self.num_servers).map(server_thread_id)
    }

    #[inline]
    pub fn bg_ids(&self, client_id: ClientID) -> impl Iterator<Item = EntityID> {
        (0..self.num_channels).map(move |c| bg_thread_id(client_id, c))
    }
}

/// Shared state of one client process.
///
/// It is created once when the table group starts and passed
/// explicitly to tables and background workers.
pub struct ClientContext {
    pub client_id: ClientID,
    pub cluster: ClusterConfig,
    pub partitioner: Partitioner,
    pub bus: Arc<CommBus>,
    /// Clocks of application threads.
    pub thread_clocks: SyncVectorClock<EntityID>,
    /// Server clocks observed by each background worker, push mode only.
    pub bg_clocks: SyncVectorClock<EntityID>,
    /// Minimum server clock observed by the whole process, push mode only.
    pub system_clock: ProcessClock,
}

impl ClientContext {
    #[inline]
    pub fn new(client_id: ClientID, cluster: ClusterConfig, bus: Arc<CommBus>) -> Self {
        let partitioner = Partitioner::new(cluster.num_servers, cluster.num_comm_channels);
        ClientContext {
            client_id,
            cluster,
            partitioner,
            bus,
            thread_clocks: SyncVectorClock::new(),
            bg_clocks: SyncVectorClock::with_ids(partitioner.bg_ids(client_id)),
            system_clock: ProcessClock::default(),
        }
    }

    /// Background worker responsible for given row.
    #[inline]
    pub fn bg_of(&self, row_id: RowID) -> EntityID {
        bg_thread_id(self.client_id, self.partitioner.channel_of(row_id))
    }

    /// Background worker which coordinates table creation.
    #[inline]
    pub fn head_bg(&self) -> EntityID {
        bg_thread_id(self.client_id, 0)
    }

    /// Advance clock of calling thread. Its thread tables are flushed
    /// and replies of its async requests are received first.
    ///
    /// When the slowest thread of the process moves, every background
    /// worker flushes oplogs and advances the process clock on servers.
    /// In aggressive mode workers also flush when other threads clock.
    #[inline]
    pub fn clock(&self, handle: &mut ThreadHandle) -> Result<()> {
        thread_table::flush_all(handle)?;
        self.wait_pending_async(handle)?;
        handle.clock += 1;
        let msg = if self.thread_clocks.tick(handle.id())? {
            Msg::BgClock
        } else if self.cluster.clock_mode == ClockMode::Aggressive {
            Msg::BgSendOpLog
        } else {
            return Ok(());
        };
        for bg in self.partitioner.bg_ids(self.client_id) {
            self.bus.send(handle.id(), bg, &msg)?;
        }
        Ok(())
    }

    /// Flush oplogs of all background workers without advancing clock.
    #[inline]
    pub fn send_oplogs(&self, sender: EntityID) -> Result<()> {
        for bg in self.partitioner.bg_ids(self.client_id) {
            self.bus.send(sender, bg, &Msg::BgSendOpLog)?;
        }
        Ok(())
    }

    /// Ask background worker to bring given row to at least given clock,
    /// and block until it confirms.
    ///
    /// Returns a copy of the row as cached by the worker. None means the
    /// worker could not build the row and the caller should ask again.
    #[inline]
    pub fn request_row(
        &self,
        handle: &ThreadHandle,
        table_id: TableID,
        row_id: RowID,
        clock: Clock,
    ) -> Result<Option<RowSnapshot>> {
        self.send_row_request(handle, table_id, row_id, clock)?;
        // replies of earlier async requests may arrive first.
        let mut outstanding = handle.pending_async.get() + 1;
        loop {
            let (sender, msg) = handle.endpoint.recv()?;
            match msg {
                Msg::RowRequestReply {
                    table_id: t,
                    row_id: r,
                    row,
                } => {
                    outstanding = outstanding.saturating_sub(1);
                    if t == table_id && r == row_id {
                        handle.pending_async.set(outstanding);
                        return Ok(row);
                    }
                }
                msg => return Err(Error::UnexpectedMessage(msg.name(), sender)),
            }
        }
    }

    /// Ask background worker for given row without waiting for it.
    #[inline]
    pub fn request_row_async(
        &self,
        handle: &ThreadHandle,
        table_id: TableID,
        row_id: RowID,
        clock: Clock,
    ) -> Result<()> {
        self.send_row_request(handle, table_id, row_id, clock)?;
        handle.pending_async.set(handle.pending_async.get() + 1);
        Ok(())
    }

    /// Block until all async requests of the thread are replied.
    #[inline]
    pub fn wait_pending_async(&self, handle: &ThreadHandle) -> Result<()> {
        while handle.pending_async.get() > 0 {
            match handle.endpoint.recv()? {
                (_, Msg::RowRequestReply { .. }) => {
                    handle.pending_async.set(handle.pending_async.get() - 1);
                }
                (sender, msg) => return Err(Error::UnexpectedMessage(msg.name(), sender)),
            }
        }
        Ok(())
    }

    #[inline]
    fn send_row_request(
        &self,
        handle: &ThreadHandle,
        table_id: TableID,
        row_id: RowID,
        clock: Clock,
    ) -> Result<()> {
        let bg = self.bg_of(row_id);
        self.bus.send(
            handle.id(),
            bg,
            &Msg::RowRequest {
                table_id,
                row_id,
                clock,
            },
        )
    }
}

/// Handle of a registered application thread.
///
/// Each thread owns exactly one handle and passes it to every
/// table operation. It carries the thread's own clock.
pub struct ThreadHandle {
    pub(crate) endpoint: Endpoint,
    pub(crate) clock: Clock,
    /// Async row requests whose replies are not received yet.
    pub(crate) pending_async: Cell<usize>,
    pub(crate) thread_tables: HashMap<TableID, ThreadTable>,
}

impl ThreadHandle {
    #[inline]
    pub(crate) fn new(endpoint: Endpoint, clock: Clock) -> Self {
        ThreadHandle {
            endpoint,
            clock,
            pending_async: Cell::new(0),
            thread_tables: HashMap::new(),
        }
    }

    #[inline]
    pub(crate) fn thread_table(&mut self, table: &Arc<ClientTable>) -> &mut ThreadTable {
        self.thread_tables
            .entry(table.table_id())
            .or_insert_with(|| ThreadTable::new(Arc::clone(table)))
    }

    #[inline]
    pub fn id(&self) -> EntityID {
        self.endpoint.id()
    }

    #[inline]
    pub fn clock(&self) -> Clock {
        self.clock
    }

    #[inline]
    pub fn num_pending_async(&self) -> usize {
        self.pending_async.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ids() {
        assert_eq!(bg_thread_id(2, 3), 2103);
        assert_eq!(app_thread_id(2, 5), 2205);
        assert_eq!(control_thread_id(2), 2000);
        assert_eq!(client_of(bg_thread_id(7, 0)), 7);
        assert_eq!(client_of(app_thread_id(7, 10)), 7);
        assert_eq!(server_thread_id(1), SERVER_ID_BASE + 1);
    }

    #[test]
    fn test_partitioner() {
        let p = Partitioner::new(3, 2);
        assert_eq!(p.server_of(0, 4), server_thread_id(1));
        assert_eq!(p.server_of(9, 4), server_thread_id(1));
        assert_eq!(p.channel_of(5), 1);
        assert_eq!(p.server_ids().collect::<Vec<_>>().len(), 3);
        assert_eq!(p.bg_ids(1).collect::<Vec<_>>(), vec![1100, 1101]);
    }
}
