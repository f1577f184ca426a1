use crate::cache::{DEFAULT_ACCESSES_TO_PROMOTE, DEFAULT_ACTIVE_RATIO};
use crate::context::MAX_COMM_CHANNELS;
use crate::error::{Error, Result};
use crate::{Clock, RowKind};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NUM_SERVERS: usize = 1;
pub const DEFAULT_NUM_COMM_CHANNELS: usize = 1;
pub const DEFAULT_PROCESS_CACHE_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_PENDING_OP_LOGS: usize = 100_000;

/// Consistency model shared by all tables of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConsistencyModel {
    /// Readers pull rows from servers when cached copy is too stale.
    #[default]
    Ssp,
    /// Servers push updated rows to subscribed clients on every clock.
    SspPush,
}

/// When a client flushes oplogs as its threads clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ClockMode {
    /// Flush only when the slowest thread of the process clocks,
    /// which also advances the process clock on servers.
    #[default]
    Conservative,
    /// Additionally flush without advancing clock whenever any other
    /// thread clocks, so servers see updates earlier.
    Aggressive,
}

/// Shape of the cluster, identical on every client and server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub num_clients: usize,
    pub num_servers: usize,
    /// Number of background workers per client.
    pub num_comm_channels: usize,
    pub consistency_model: ConsistencyModel,
    /// Only affects clients.
    pub clock_mode: ClockMode,
}

impl Default for ClusterConfig {
    #[inline]
    fn default() -> Self {
        ClusterConfig {
            num_clients: 1,
            num_servers: DEFAULT_NUM_SERVERS,
            num_comm_channels: DEFAULT_NUM_COMM_CHANNELS,
            consistency_model: ConsistencyModel::default(),
            clock_mode: ClockMode::default(),
        }
    }
}

impl ClusterConfig {
    #[inline]
    pub fn num_clients(mut self, num_clients: usize) -> Self {
        self.num_clients = num_clients;
        self
    }

    #[inline]
    pub fn num_servers(mut self, num_servers: usize) -> Self {
        self.num_servers = num_servers;
        self
    }

    #[inline]
    pub fn num_comm_channels(mut self, num_comm_channels: usize) -> Self {
        self.num_comm_channels = num_comm_channels;
        self
    }

    #[inline]
    pub fn consistency_model(mut self, consistency_model: ConsistencyModel) -> Self {
        self.consistency_model = consistency_model;
        self
    }

    #[inline]
    pub fn clock_mode(mut self, clock_mode: ClockMode) -> Self {
        self.clock_mode = clock_mode;
        self
    }

    #[inline]
    pub fn validate(&self) -> Result<()> {
        if self.num_clients == 0
            || self.num_servers == 0
            || self.num_comm_channels == 0
            || self.num_comm_channels > MAX_COMM_CHANNELS
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Total number of background workers in the cluster.
    #[inline]
    pub fn total_bg_threads(&self) -> usize {
        self.num_clients * self.num_comm_channels
    }
}

/// Table properties shared by clients and servers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Number of clocks a reader may lag behind its own clock.
    pub staleness: Clock,
    pub row_kind: RowKind,
    /// Number of columns of dense rows, upper bound of column id for sparse rows.
    pub row_capacity: usize,
}

impl TableInfo {
    #[inline]
    pub fn new(row_kind: RowKind, row_capacity: usize) -> Self {
        TableInfo {
            staleness: 0,
            row_kind,
            row_capacity,
        }
    }
}

/// Client side configuration of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableConfig {
    pub info: TableInfo,
    /// Maximum number of rows cached by the process.
    pub process_cache_capacity: usize,
    /// Maximum number of rows in active list, default is 95% of cache capacity.
    pub active_list_capacity: Option<usize>,
    /// Accesses per column needed to promote a row to active list.
    pub accesses_to_promote: f64,
    /// Pending oplog entries of one partition before a flush is requested.
    pub max_pending_op_logs: usize,
}

impl TableConfig {
    #[inline]
    pub fn new(row_kind: RowKind, row_capacity: usize) -> Self {
        TableConfig {
            info: TableInfo::new(row_kind, row_capacity),
            process_cache_capacity: DEFAULT_PROCESS_CACHE_CAPACITY,
            active_list_capacity: None,
            accesses_to_promote: DEFAULT_ACCESSES_TO_PROMOTE,
            max_pending_op_logs: DEFAULT_MAX_PENDING_OP_LOGS,
        }
    }

    #[inline]
    pub fn staleness(mut self, staleness: Clock) -> Self {
        self.info.staleness = staleness;
        self
    }

    #[inline]
    pub fn process_cache_capacity(mut self, capacity: usize) -> Self {
        self.process_cache_capacity = capacity;
        self
    }

    #[inline]
    pub fn active_list_capacity(mut self, capacity: usize) -> Self {
        self.active_list_capacity = Some(capacity);
        self
    }

    #[inline]
    pub fn accesses_to_promote(mut self, accesses: f64) -> Self {
        self.accesses_to_promote = accesses;
        self
    }

    #[inline]
    pub fn max_pending_op_logs(mut self, max_pending: usize) -> Self {
        self.max_pending_op_logs = max_pending;
        self
    }

    #[inline]
    pub fn resolved_active_capacity(&self) -> usize {
        self.active_list_capacity.unwrap_or(
            (self.process_cache_capacity as f64 * DEFAULT_ACTIVE_RATIO) as usize,
        )
    }

    #[inline]
    pub fn validate(&self) -> Result<()> {
        if self.info.staleness < 0
            || self.info.row_capacity == 0
            || self.process_cache_capacity == 0
            || self.accesses_to_promote <= 0.0
        {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_config_builder() {
        let cfg = ClusterConfig::default()
            .num_clients(2)
            .num_servers(3)
            .num_comm_channels(4)
            .consistency_model(ConsistencyModel::SspPush);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.total_bg_threads(), 8);
        assert!(ClusterConfig::default().num_servers(0).validate().is_err());
        assert!(ClusterConfig::default()
            .num_comm_channels(MAX_COMM_CHANNELS + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn test_table_config_builder() {
        let cfg = TableConfig::new(RowKind::Dense, 10)
            .staleness(2)
            .process_cache_capacity(200);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.info.staleness, 2);
        assert_eq!(cfg.resolved_active_capacity(), 190);
        assert_eq!(cfg.clone().active_list_capacity(10).resolved_active_capacity(), 10);
        assert!(cfg.clone().staleness(-1).validate().is_err());
        assert!(cfg.accesses_to_promote(0.0).validate().is_err());
    }

    #[test]
    fn test_table_info_serde() {
        let info = TableInfo::new(RowKind::Sparse, 1000);
        let data = bincode::serde::encode_to_vec(info, bincode::config::standard()).unwrap();
        let (decoded, _): (TableInfo, usize) =
            bincode::serde::decode_from_slice(&data, bincode::config::standard()).unwrap();
        assert_eq!(decoded, info);
    }
}
