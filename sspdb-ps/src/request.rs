//! Bookkeeping of outstanding row requests of a background worker,
//! and of the flushed oplogs which replies may still need.
//!
//! A server reply carries the last oplog version of the worker the
//! server has applied. Before caching the replied row, the worker
//! replays every flushed oplog newer than that version, so the
//! process keeps seeing its own writes.
use crate::context::EntityID;
use crate::oplog::OpLogPartition;
use crate::{Clock, RowID, TableID, Version};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// An outstanding request of an application thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRequestInfo {
    pub app_thread_id: EntityID,
    pub clock: Clock,
    /// Last oplog version sent when the request was sent.
    pub version: Version,
    pub sent: bool,
}

impl RowRequestInfo {
    #[inline]
    pub fn new(app_thread_id: EntityID, clock: Clock, version: Version) -> Self {
        RowRequestInfo {
            app_thread_id,
            clock,
            version,
            sent: true,
        }
    }
}

/// Oplogs of all tables flushed together under one version.
#[derive(Debug, Default)]
pub struct BgOpLog {
    version: Version,
    tables: BTreeMap<TableID, OpLogPartition>,
}

impl BgOpLog {
    #[inline]
    pub fn new(version: Version) -> Self {
        BgOpLog {
            version,
            tables: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn add(&mut self, table_id: TableID, partition: OpLogPartition) {
        if !partition.is_empty() {
            self.tables.insert(table_id, partition);
        }
    }

    #[inline]
    pub fn get(&self, table_id: TableID) -> Option<&OpLogPartition> {
        self.tables.get(&table_id)
    }
}

/// Result of informing the tracker about a server reply.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplyOutcome {
    /// Application threads whose requests are satisfied.
    pub waiters: SmallVec<[EntityID; 4]>,
    /// Clock of the next queued request which must be sent now.
    pub next_clock: Option<Clock>,
}

/// Latest oplog version acknowledged by each server.
#[derive(Debug)]
pub struct ServerVersionTracker {
    versions: HashMap<EntityID, Version>,
    min_version: Version,
}

impl ServerVersionTracker {
    #[inline]
    pub fn new<I: IntoIterator<Item = EntityID>>(servers: I) -> Self {
        ServerVersionTracker {
            versions: servers.into_iter().map(|s| (s, 0)).collect(),
            min_version: 0,
        }
    }

    /// Record version acknowledged by a server.
    /// Returns the new minimum version if it advanced.
    #[inline]
    pub fn acknowledge(&mut self, server: EntityID, version: Version) -> Option<Version> {
        match self.versions.get_mut(&server) {
            Some(v) if *v < version => *v = version,
            _ => return None,
        }
        let min = self.versions.values().copied().min().unwrap_or(0);
        if min > self.min_version {
            self.min_version = min;
            return Some(min);
        }
        None
    }

    #[inline]
    pub fn min_version(&self) -> Version {
        self.min_version
    }
}

/// How long flushed oplogs are retained.
#[derive(Debug)]
enum Retention {
    /// Keep oplogs newer than the oldest pending request.
    ByRequest {
        version_request_cnt: BTreeMap<Version, usize>,
    },
    /// Keep oplogs until every server acknowledged them.
    ByServerAck(ServerVersionTracker),
}

#[derive(Debug)]
pub struct RowRequestTracker {
    /// Pending requests of each row, in ascending clock order.
    pending: HashMap<(TableID, RowID), VecDeque<RowRequestInfo>>,
    oplogs: BTreeMap<Version, BgOpLog>,
    retention: Retention,
}

impl RowRequestTracker {
    /// Tracker for pull mode, oplogs live as long as requests need them.
    #[inline]
    pub fn new() -> Self {
        RowRequestTracker {
            pending: HashMap::new(),
            oplogs: BTreeMap::new(),
            retention: Retention::ByRequest {
                version_request_cnt: BTreeMap::new(),
            },
        }
    }

    /// Tracker for push mode, oplogs live until all servers
    /// acknowledged them.
    #[inline]
    pub fn with_server_acks<I: IntoIterator<Item = EntityID>>(servers: I) -> Self {
        RowRequestTracker {
            pending: HashMap::new(),
            oplogs: BTreeMap::new(),
            retention: Retention::ByServerAck(ServerVersionTracker::new(servers)),
        }
    }

    /// Add a request. Returns true if the request should be sent to
    /// server, false if a pending request with smaller or equal clock
    /// already covers it.
    #[inline]
    pub fn add_row_request(
        &mut self,
        table_id: TableID,
        row_id: RowID,
        mut request: RowRequestInfo,
    ) -> bool {
        let queue = self.pending.entry((table_id, row_id)).or_default();
        let pos = queue.iter().rposition(|r| r.clock <= request.clock);
        let sent = match pos {
            Some(idx) => {
                request.sent = false;
                queue.insert(idx + 1, request);
                false
            }
            None => {
                request.sent = true;
                queue.push_front(request);
                true
            }
        };
        if let Retention::ByRequest {
            version_request_cnt,
        } = &mut self.retention
        {
            *version_request_cnt.entry(request.version).or_default() += 1;
        }
        sent
    }

    /// Remove every request satisfied by a reply at given clock.
    /// If the oldest remaining request has not been sent yet, it is
    /// marked as sent with current version and its clock is returned.
    #[inline]
    pub fn inform_reply(
        &mut self,
        table_id: TableID,
        row_id: RowID,
        clock: Clock,
        curr_version: Version,
    ) -> ReplyOutcome {
        let mut outcome = ReplyOutcome::default();
        let key = (table_id, row_id);
        let queue = match self.pending.get_mut(&key) {
            Some(queue) => queue,
            None => return outcome,
        };
        while queue.front().is_some_and(|r| r.clock <= clock) {
            let Some(req) = queue.pop_front() else {
                break;
            };
            outcome.waiters.push(req.app_thread_id);
            if let Retention::ByRequest {
                version_request_cnt,
            } = &mut self.retention
            {
                dec_version_count(version_request_cnt, req.version);
            }
        }
        if let Some(front) = queue.front_mut() {
            if !front.sent {
                let old_version = front.version;
                front.sent = true;
                front.version = curr_version.saturating_sub(1);
                outcome.next_clock = Some(front.clock);
                if let Retention::ByRequest {
                    version_request_cnt,
                } = &mut self.retention
                {
                    dec_version_count(version_request_cnt, old_version);
                    *version_request_cnt.entry(front.version).or_default() += 1;
                }
            }
        }
        if queue.is_empty() {
            self.pending.remove(&key);
        }
        self.collect_request_garbage();
        outcome
    }

    /// Hand over a flushed oplog. Returns false if nothing can need
    /// it and it is dropped immediately.
    #[inline]
    pub fn add_oplog(&mut self, oplog: BgOpLog) -> bool {
        let retain = match &self.retention {
            Retention::ByRequest {
                version_request_cnt,
            } => !version_request_cnt.is_empty(),
            Retention::ByServerAck(_) => true,
        };
        if retain {
            self.oplogs.insert(oplog.version, oplog);
        }
        retain
    }

    /// Record version acknowledged by a server, release oplogs
    /// acknowledged by all servers.
    #[inline]
    pub fn server_acknowledge_version(&mut self, server: EntityID, version: Version) {
        if let Retention::ByServerAck(tracker) = &mut self.retention {
            if let Some(min) = tracker.acknowledge(server, version) {
                self.oplogs = self.oplogs.split_off(&(min + 1));
            }
        }
    }

    /// Retained oplogs newer than given version, in version order.
    #[inline]
    pub fn oplogs_after(&self, version: Version) -> impl Iterator<Item = &BgOpLog> {
        self.oplogs.range(version + 1..).map(|(_, o)| o)
    }

    /// Whether every version in [from, to) is retained.
    #[inline]
    pub fn covers(&self, from: Version, to: Version) -> bool {
        from >= to || self.oplogs.range(from..to).count() as u64 == to - from
    }

    #[inline]
    pub fn num_pending_rows(&self) -> usize {
        self.pending.len()
    }

    #[inline]
    pub fn retained_versions(&self) -> Vec<Version> {
        self.oplogs.keys().copied().collect()
    }

    #[inline]
    fn collect_request_garbage(&mut self) {
        if let Retention::ByRequest {
            version_request_cnt,
        } = &self.retention
        {
            match version_request_cnt.keys().next() {
                // replies of pending requests only replay versions newer
                // than the oldest request version.
                Some(min) => self.oplogs = self.oplogs.split_off(&(min + 1)),
                None => self.oplogs.clear(),
            }
        }
    }
}

impl Default for RowRequestTracker {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn dec_version_count(cnt: &mut BTreeMap<Version, usize>, version: Version) {
    if let Some(c) = cnt.get_mut(&version) {
        *c -= 1;
        if *c == 0 {
            cnt.remove(&version);
        }
    }
}
