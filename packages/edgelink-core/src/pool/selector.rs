//! Worker-manager server pool.
//!
//! Pure bookkeeping without I/O: which candidates exist, which may be handed
//! out next, and which are currently in use. Servers live in an arena and are
//! referenced by index from the roster, available and in-use lists, so moving
//! a server between lists never invalidates anything.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::WorkerManagerErrorCode;
use crate::strategy::next_backoff_interval;
use crate::utils::Clock;

use super::server::{ConnectType, Server, ServerId};

/// Candidate pool for one channel.
///
/// Selection priority is the order of the available list: newly learned
/// servers and servers that just succeeded go to the front ("last known good"
/// first). Failed servers leave the in-use list and are not requeued until
/// [`recycle_all`](Self::recycle_all).
pub struct WorkerManagerSelector {
    clock: Arc<dyn Clock>,
    /// Owns every server ever added since the last `reinitialize`.
    servers: Vec<Server>,
    /// Roster order (front = most recently learned).
    roster: VecDeque<ServerId>,
    /// Eligible for selection (front = highest priority).
    available: VecDeque<ServerId>,
    /// Handed out and not yet reported.
    in_use: Vec<ServerId>,
}

impl WorkerManagerSelector {
    /// Creates an empty pool.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            servers: Vec::new(),
            roster: VecDeque::new(),
            available: VecDeque::new(),
            in_use: Vec::new(),
        }
    }

    /// Adds a candidate unless `(address, connect_type)` is already known.
    ///
    /// Returns `true` if the server was added. New servers go to the front of
    /// both the roster and the available list.
    pub fn add_server(&mut self, connect_type: ConnectType, address: SocketAddr) -> bool {
        if self.find(address, connect_type).is_some() {
            log::debug!(
                "[WorkerManagerSelector] Ignoring duplicate {} server {}",
                connect_type,
                address
            );
            return false;
        }

        let id = ServerId(self.servers.len());
        self.servers.push(Server::new(connect_type, address));
        self.roster.push_front(id);
        self.available.push_front(id);
        log::debug!(
            "[WorkerManagerSelector] Added {} server {}",
            connect_type,
            address
        );
        true
    }

    /// Hands out the highest-priority eligible server.
    ///
    /// Skips servers of another connect type, of the other address family, or
    /// still inside their backoff window. The chosen server moves to the
    /// in-use list with its timestamp set to now. `None` means no candidate is
    /// eligible; callers treat this as a hard failure.
    pub fn select(&mut self, ipv4: bool, connect_type: ConnectType) -> Option<SocketAddr> {
        let now = self.clock.now_ms();
        let servers = &self.servers;
        let pos = self.available.iter().position(|id| {
            let server = &servers[id.0];
            server.connect_type == connect_type
                && server.address.is_ipv4() == ipv4
                && (server.ts == 0 || server.ts < now)
        })?;

        let id = self.available.remove(pos)?;
        let server = &mut self.servers[id.0];
        server.ts = now;
        self.in_use.push(id);
        log::info!(
            "[WorkerManagerSelector] Selected {} server {}",
            connect_type,
            server.address
        );
        Some(server.address)
    }

    /// Records which worker a worker manager routed us to.
    ///
    /// Returns `false` if the worker manager is unknown.
    pub fn select_worker(
        &mut self,
        address: SocketAddr,
        connect_type: ConnectType,
        worker: SocketAddr,
    ) -> bool {
        match self.find(address, connect_type) {
            Some(id) => {
                self.servers[id.0].worker_address = Some(worker);
                true
            }
            None => false,
        }
    }

    /// Drops an in-use server after a failed session.
    ///
    /// The server is not requeued; it stays in the roster until recycled.
    pub fn report_failure(
        &mut self,
        address: SocketAddr,
        connect_type: ConnectType,
        code: WorkerManagerErrorCode,
    ) {
        match self.take_in_use(|s| s.matches(address, connect_type)) {
            Some(_) => log::info!(
                "[WorkerManagerSelector] {} server {} failed: {}",
                connect_type,
                address,
                code
            ),
            None => log::debug!(
                "[WorkerManagerSelector] Failure for {} ignored (not in use)",
                address
            ),
        }
    }

    /// Penalizes the worker manager that routed us to a failing worker.
    ///
    /// `address` is matched against the recorded worker first, then against
    /// the worker-manager address itself. An in-use match is dropped from
    /// rotation like [`report_failure`](Self::report_failure). A match still in
    /// the available list gets a doubling backoff instead and is skipped by
    /// [`select`](Self::select) until it expires.
    pub fn report_worker_failure(&mut self, address: SocketAddr, connect_type: ConnectType) {
        let matches = |s: &Server| {
            s.connect_type == connect_type
                && (s.worker_address == Some(address) || s.address == address)
        };

        if let Some(id) = self.take_in_use(matches) {
            log::info!(
                "[WorkerManagerSelector] Worker failure via in-use {}, dropped",
                self.servers[id.0].address
            );
            return;
        }

        let Some(id) = self
            .available
            .iter()
            .copied()
            .find(|id| matches(&self.servers[id.0]))
        else {
            log::debug!(
                "[WorkerManagerSelector] Worker failure for {} ignored (unknown)",
                address
            );
            return;
        };

        let now = self.clock.now_ms();
        let server = &mut self.servers[id.0];
        server.interval = next_backoff_interval(server.interval);
        server.ts = now + server.interval;
        log::info!(
            "[WorkerManagerSelector] Worker failure via {}, backing off {}ms",
            server.address,
            server.interval
        );
    }

    /// Returns an in-use server to the front of the available list.
    ///
    /// Clears its backoff and marks it as having worked once.
    pub fn report_success(&mut self, address: SocketAddr, connect_type: ConnectType) {
        let Some(id) = self.take_in_use(|s| s.matches(address, connect_type)) else {
            log::debug!(
                "[WorkerManagerSelector] Success for {} ignored (not in use)",
                address
            );
            return;
        };

        let server = &mut self.servers[id.0];
        server.reset_backoff();
        server.once_work = true;
        self.available.push_front(id);
        log::info!(
            "[WorkerManagerSelector] {} server {} succeeded",
            connect_type,
            address
        );
    }

    /// Evicts `address` if it has been silent for at least `timeout_ms`.
    ///
    /// Returns `false` without side effects when the address is not in use or
    /// has not timed out yet.
    pub fn check_timeout(
        &mut self,
        connect_type: ConnectType,
        timeout_ms: u64,
        address: SocketAddr,
    ) -> bool {
        let now = self.clock.now_ms();
        let timed_out = self.in_use.iter().any(|id| {
            let server = &self.servers[id.0];
            server.matches(address, connect_type) && now.saturating_sub(server.ts) >= timeout_ms
        });

        if timed_out {
            self.report_failure(
                address,
                connect_type,
                WorkerManagerErrorCode::ConnectionTimedout,
            );
        }
        timed_out
    }

    /// Evicts every in-use server of `connect_type` silent for `timeout_ms`.
    ///
    /// Evicted addresses are appended to `results`; returns how many were evicted.
    pub fn check_timeouts(
        &mut self,
        connect_type: ConnectType,
        timeout_ms: u64,
        results: &mut Vec<SocketAddr>,
    ) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<SocketAddr> = self
            .in_use
            .iter()
            .map(|id| &self.servers[id.0])
            .filter(|s| s.connect_type == connect_type && now.saturating_sub(s.ts) >= timeout_ms)
            .map(|s| s.address)
            .collect();

        for address in &expired {
            self.report_failure(
                *address,
                connect_type,
                WorkerManagerErrorCode::ConnectionTimedout,
            );
        }

        let count = expired.len();
        results.extend(expired);
        count
    }

    /// Refreshes the timeout clock of an in-use server.
    ///
    /// Returns `false` if the address is not in use.
    pub fn touch(&mut self, connect_type: ConnectType, address: SocketAddr) -> bool {
        let now = self.clock.now_ms();
        let servers = &mut self.servers;
        match self
            .in_use
            .iter()
            .find(|id| servers[id.0].matches(address, connect_type))
        {
            Some(id) => {
                servers[id.0].ts = now;
                true
            }
            None => false,
        }
    }

    /// Number of in-use servers of `connect_type`.
    #[must_use]
    pub fn inuse_size(&self, connect_type: ConnectType) -> usize {
        self.count(&self.in_use, connect_type)
    }

    /// Number of available servers of `connect_type` (including backed-off ones).
    #[must_use]
    pub fn avail_size(&self, connect_type: ConnectType) -> usize {
        self.count(&self.available, connect_type)
    }

    /// Number of servers known since the last reinitialize.
    #[must_use]
    pub fn roster_size(&self) -> usize {
        self.roster.len()
    }

    /// Looks up a server record.
    #[must_use]
    pub fn server(&self, address: SocketAddr, connect_type: ConnectType) -> Option<&Server> {
        self.find(address, connect_type).map(|id| &self.servers[id.0])
    }

    /// Forgets every server.
    pub fn reinitialize(&mut self) {
        log::debug!(
            "[WorkerManagerSelector] Reinitializing ({} servers dropped)",
            self.servers.len()
        );
        self.available.clear();
        self.in_use.clear();
        self.roster.clear();
        self.servers.clear();
    }

    /// Makes every known server available again with backoff cleared.
    ///
    /// Available order follows the roster. Nothing is destroyed.
    pub fn recycle_all(&mut self) {
        self.in_use.clear();
        self.available.clear();
        for id in &self.roster {
            self.servers[id.0].reset_backoff();
            self.available.push_back(*id);
        }
        log::info!(
            "[WorkerManagerSelector] Recycled {} server(s)",
            self.available.len()
        );
    }

    fn find(&self, address: SocketAddr, connect_type: ConnectType) -> Option<ServerId> {
        self.servers
            .iter()
            .position(|s| s.matches(address, connect_type))
            .map(ServerId)
    }

    fn take_in_use(&mut self, mut pred: impl FnMut(&Server) -> bool) -> Option<ServerId> {
        let pos = self
            .in_use
            .iter()
            .position(|id| pred(&self.servers[id.0]))?;
        Some(self.in_use.remove(pos))
    }

    fn count<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ServerId>,
        connect_type: ConnectType,
    ) -> usize {
        ids.into_iter()
            .filter(|id| self.servers[id.0].connect_type == connect_type)
            .count()
    }
}
