//! Worker-manager channel state machine.
//!
//! Drives one logical connection: ask the access point for worker managers,
//! feed the answer into the pool, pick one, open a transport and watch it for
//! silence. Every collaborator is injected, and every asynchronous result is
//! fed back through a plain method call (`on_ap_event`, `on_transport_*`,
//! `on_timer`), so the channel itself never blocks or locks.
//!
//! Error notifications are queued and delivered from a zero-delay timer so
//! the owner never sees a callback while one of its own calls is running.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::context::{tls_server_name, IpDetector};
use crate::error::{
    convert_server_code, ChannelError, ChannelResult, TransportError, WorkerManagerErrorCode,
};
use crate::events::ChannelObserver;
use crate::packer::{unpack, unpack_command, AllocateResponse, AllocatedServer};
use crate::pool::{ConnectType, WorkerManagerSelector};
use crate::protocol_constants::{
    AP_FLAG_WORKER_MANAGER, CHANNEL_CONNECTION_CHECK_INTERVAL_MS, CHANNEL_CONNECTION_TIMEDOUT_MS,
};
use crate::strategy::ConnectionStrategy;
use crate::timer::{TimerId, TimerService};
use crate::utils::Clock;

use super::config::ChannelConfig;
use super::state::ChannelState;
use super::traits::{
    ApClient, ApEvent, TlsOptions, Transport, TransportFactory, TransportId, WorkerManagerRequest,
};

/// Collaborators injected into a [`WorkerManagerChannel`].
pub struct ChannelParts {
    pub ap_client: Box<dyn ApClient>,
    pub transports: Box<dyn TransportFactory>,
    pub timers: Box<dyn TimerService>,
    pub clock: Arc<dyn Clock>,
    pub ip_detector: Arc<dyn IpDetector>,
}

/// AP request held back by the backoff gate.
#[derive(Debug, Clone)]
struct PendingApRequest {
    service_type: String,
    payload: String,
}

/// The transport the channel currently owns.
struct ActiveTransport {
    id: TransportId,
    remote: SocketAddr,
    kind: ConnectType,
    transport: Box<dyn Transport>,
}

/// One logical connection to a worker manager.
pub struct WorkerManagerChannel {
    config: Option<ChannelConfig>,
    state: ChannelState,
    pool: WorkerManagerSelector,
    strategy: ConnectionStrategy<PendingApRequest>,

    ap_client: Box<dyn ApClient>,
    transports: Box<dyn TransportFactory>,
    timers: Box<dyn TimerService>,
    ip_detector: Arc<dyn IpDetector>,
    observer: Option<Box<dyn ChannelObserver>>,

    active: Option<ActiveTransport>,
    next_transport_id: u64,
    next_request_id: u64,

    connection_timer: Option<TimerId>,
    async_timer: Option<TimerId>,
    pending_errors: VecDeque<WorkerManagerErrorCode>,
}

impl WorkerManagerChannel {
    /// Creates an unconfigured channel; call [`initialize`](Self::initialize) next.
    pub fn new(parts: ChannelParts) -> Self {
        Self {
            config: None,
            state: ChannelState::Initialized,
            pool: WorkerManagerSelector::new(Arc::clone(&parts.clock)),
            strategy: ConnectionStrategy::new(parts.clock),
            ap_client: parts.ap_client,
            transports: parts.transports,
            timers: parts.timers,
            ip_detector: parts.ip_detector,
            observer: None,
            active: None,
            next_transport_id: 0,
            next_request_id: 0,
            connection_timer: None,
            async_timer: None,
            pending_errors: VecDeque::new(),
        }
    }

    /// Installs the owner's observer, replacing any previous one.
    pub fn set_observer(&mut self, observer: Box<dyn ChannelObserver>) {
        self.observer = Some(observer);
    }

    /// Removes the observer; later notifications are logged and dropped.
    pub fn clear_observer(&mut self) {
        self.observer = None;
    }

    /// (Re)configures the channel and returns it to `Initialized`.
    ///
    /// Tears down any connection in progress. The server pool survives when
    /// the new configuration points at the same servers; otherwise it is
    /// cleared.
    pub fn initialize(&mut self, config: ChannelConfig) {
        self.cleanup();

        let source_changed = self
            .config
            .as_ref()
            .map_or(true, |old| !old.same_server_source(&config));
        if source_changed && self.pool.roster_size() > 0 {
            log::info!("[WorkerManagerChannel] Server source changed, clearing pool");
            self.pool.reinitialize();
        }

        self.ap_client.configure(&config.ap_endpoints());
        log::info!(
            "[WorkerManagerChannel] Initialized ({}, tls={})",
            config.connect_type,
            config.use_tls
        );
        self.config = Some(config);
        self.state = ChannelState::Initialized;
    }

    /// Asks the access point for worker managers.
    ///
    /// Only valid in `Initialized`. While the backoff gate holds a penalty the
    /// request is deferred and issued from [`on_timer`](Self::on_timer).
    pub fn establish_connection(&mut self, service_type: &str, request: &str) -> ChannelResult<()> {
        if self.config.is_none() {
            return Err(ChannelError::NotConfigured);
        }
        if self.state != ChannelState::Initialized {
            return Err(ChannelError::NotReady(self.state.name()));
        }

        let task = PendingApRequest {
            service_type: service_type.to_string(),
            payload: request.to_string(),
        };
        if let Some(task) = self.strategy.connect(task, self.timers.as_mut()) {
            self.issue_ap_request(task);
        }
        Ok(())
    }

    /// Handles an AP client event.
    ///
    /// Only the answer to the outstanding request is acted on; anything else
    /// (other event kinds, failed requests, stale ids, late answers) is
    /// logged and ignored.
    pub fn on_ap_event(&mut self, event: ApEvent) {
        if event.flags & AP_FLAG_WORKER_MANAGER == 0 {
            log::debug!(
                "[WorkerManagerChannel] Ignoring AP event with flags {:#x}",
                event.flags
            );
            return;
        }
        if event.error != 0 {
            log::warn!(
                "[WorkerManagerChannel] AP request {} failed with {}",
                event.request_id,
                event.error
            );
            return;
        }
        match self.state {
            ChannelState::ConnectingAp { request_id } if request_id == event.request_id => {}
            state => {
                log::debug!(
                    "[WorkerManagerChannel] Ignoring AP answer {} in state {}",
                    event.request_id,
                    state
                );
                return;
            }
        }

        self.state = ChannelState::ConnectedAp;

        let response: AllocateResponse = match unpack(&event.payload) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("[WorkerManagerChannel] Malformed AP answer: {}", e);
                self.emit_error_code(WorkerManagerErrorCode::ServerInvalidArgumentError);
                return;
            }
        };

        let code = convert_server_code(response.code);
        self.strategy.on_code(code, self.timers.as_mut());
        if code != WorkerManagerErrorCode::ServerNoError {
            log::warn!(
                "[WorkerManagerChannel] AP answered {} ({}): {}",
                response.code,
                code,
                response.reason
            );
            self.emit_error_code(code);
            return;
        }

        let Some((connect_type, use_tls)) = self
            .config
            .as_ref()
            .map(|c| (c.connect_type, c.tls_enabled()))
        else {
            return;
        };

        for server in &response.servers {
            match resolve_server(server, use_tls) {
                Ok(address) => {
                    self.pool.add_server(connect_type, address);
                }
                Err(code) => log::warn!(
                    "[WorkerManagerChannel] Skipping server {:?}: {}",
                    server.address,
                    code
                ),
            }
        }
        log::info!(
            "[WorkerManagerChannel] AP offered {} server(s), {} available",
            response.servers.len(),
            self.pool.avail_size(connect_type)
        );

        self.create_transport_channel();
    }

    /// Selects a worker manager from the pool and starts connecting to it.
    ///
    /// Emits `NoAvailableWorkerManager` when no server is eligible.
    pub fn create_transport_channel(&mut self) {
        let Some((connect_type, use_tls, ip_family, tls_domain)) = self
            .config
            .as_ref()
            .map(|c| (c.connect_type, c.tls_enabled(), c.ip_family, c.tls_domain.clone()))
        else {
            return;
        };

        self.close_transport();

        if self.pool.avail_size(connect_type) == 0 {
            log::warn!("[WorkerManagerChannel] No {} server available", connect_type);
            self.emit_error_code(WorkerManagerErrorCode::NoAvailableWorkerManager);
            return;
        }

        let ipv4 = ip_family.prefers_ipv4(self.ip_detector.as_ref());
        let Some(remote) = self.pool.select(ipv4, connect_type) else {
            log::warn!(
                "[WorkerManagerChannel] No eligible {} server (ipv4={})",
                connect_type,
                ipv4
            );
            self.emit_error_code(WorkerManagerErrorCode::NoAvailableWorkerManager);
            return;
        };

        let tls = use_tls.then(|| TlsOptions {
            server_name: tls_server_name(&tls_domain, remote.ip()),
        });

        self.next_transport_id += 1;
        let id = TransportId(self.next_transport_id);
        let mut transport = self.transports.create(id, connect_type, tls);
        log::info!(
            "[WorkerManagerChannel] Connecting {} to {} over {}",
            id,
            remote,
            connect_type
        );
        transport.connect(remote);
        self.active = Some(ActiveTransport {
            id,
            remote,
            kind: connect_type,
            transport,
        });
        self.arm_connection_timer();
    }

    /// Handles the connect result of transport `id`.
    pub fn on_transport_connect(&mut self, id: TransportId, connected: bool) {
        let Some((remote, kind)) = self.current(id) else {
            log::debug!("[WorkerManagerChannel] Ignoring connect result of stale {}", id);
            return;
        };

        if !connected {
            let code = match kind {
                ConnectType::Tcp => WorkerManagerErrorCode::TcpConnectionError,
                ConnectType::Udp => WorkerManagerErrorCode::BindSocketError,
            };
            log::warn!("[WorkerManagerChannel] Connect to {} failed", remote);
            self.pool.report_failure(remote, kind, code);
            self.emit_error_code(code);
            return;
        }

        self.pool.touch(kind, remote);
        self.state = ChannelState::ConnectedWorkerManager { remote };
        log::info!("[WorkerManagerChannel] Connected to worker manager {}", remote);
        if let Some(observer) = self.observer.as_mut() {
            observer.on_ready(remote);
        }
    }

    /// Handles a socket error on transport `id`.
    pub fn on_transport_error(&mut self, id: TransportId, error: TransportError) {
        let Some((remote, kind)) = self.current(id) else {
            log::debug!("[WorkerManagerChannel] Ignoring error of stale {}", id);
            return;
        };

        log::warn!("[WorkerManagerChannel] Transport to {} failed: {}", remote, error);
        self.pool
            .report_failure(remote, kind, WorkerManagerErrorCode::ConnectionSocketError);
        self.emit_error_code(WorkerManagerErrorCode::ConnectionSocketError);
    }

    /// Handles one inbound message on transport `id`.
    pub fn on_transport_packet(&mut self, id: TransportId, payload: &str) {
        let Some((remote, kind)) = self.current(id) else {
            log::debug!("[WorkerManagerChannel] Ignoring packet of stale {}", id);
            return;
        };

        self.pool.touch(kind, remote);
        self.on_worker_manager_message(payload);
    }

    /// Forwards a worker-manager message to the observer.
    ///
    /// Messages without a `command` emit `ServerNoCommandError`.
    pub fn on_worker_manager_message(&mut self, raw: &str) {
        match unpack_command(raw) {
            Ok(command) => {
                log::trace!("[WorkerManagerChannel] Received {}", command);
                if let Some(observer) = self.observer.as_mut() {
                    observer.on_message(&command, raw);
                }
            }
            Err(e) => {
                log::warn!("[WorkerManagerChannel] Unusable message: {}", e);
                self.emit_error_code(WorkerManagerErrorCode::ServerNoCommandError);
            }
        }
    }

    /// Dispatches a fired timer.
    ///
    /// Unknown or stale ids are ignored.
    pub fn on_timer(&mut self, id: TimerId) {
        if self.strategy.owns_timer(id) {
            if let Some(task) = self.strategy.on_timer(id) {
                log::info!("[WorkerManagerChannel] Backoff elapsed, requesting AP");
                self.issue_ap_request(task);
            }
        } else if self.connection_timer == Some(id) {
            self.connection_timer = None;
            self.check_connection();
        } else if self.async_timer == Some(id) {
            self.async_timer = None;
            self.flush_errors();
        } else {
            log::trace!("[WorkerManagerChannel] Ignoring stale timer {}", id);
        }
    }

    /// Ends the current worker-manager session.
    ///
    /// Reports the outcome to the pool (failure, success, or a success that
    /// still wants another server) and tears down the transport and timers.
    /// The channel falls back to `ConnectedAp` so the owner can
    /// [`reconnect`](Self::reconnect).
    pub fn close_channel(&mut self, is_success: bool, need_change: bool) {
        if let Some(active) = self.active.as_ref() {
            let (remote, kind) = (active.remote, active.kind);
            if !is_success {
                self.pool
                    .report_failure(remote, kind, WorkerManagerErrorCode::ConnectionSocketError);
            } else if need_change {
                self.pool
                    .report_failure(remote, kind, WorkerManagerErrorCode::ConnectionChanged);
            } else {
                self.pool.report_success(remote, kind);
            }
            log::info!(
                "[WorkerManagerChannel] Closing channel to {} (success={}, change={})",
                remote,
                is_success,
                need_change
            );
        }

        self.close_transport();
        self.cancel_timer_slot(TimerSlot::Connection);
        self.cancel_timer_slot(TimerSlot::Async);
        self.pending_errors.clear();

        if matches!(self.state, ChannelState::ConnectedWorkerManager { .. }) {
            self.state = ChannelState::ConnectedAp;
        }
    }

    /// Queues `code` for asynchronous delivery to the observer.
    ///
    /// Stops connection checking; the owner is expected to close or reconnect.
    pub fn emit_error_code(&mut self, code: WorkerManagerErrorCode) {
        self.cancel_timer_slot(TimerSlot::Connection);

        if self.observer.is_none() {
            log::warn!("[WorkerManagerChannel] No observer for {}, dropping", code);
            return;
        }

        self.pending_errors.push_back(code);
        if self.async_timer.is_none() {
            self.async_timer = Some(self.timers.create_timer(Duration::ZERO));
        }
    }

    /// Connects to the next worker manager already in the pool.
    ///
    /// Valid in `ConnectedAp` once the previous session has been closed.
    pub fn reconnect(&mut self) -> ChannelResult<()> {
        if self.state != ChannelState::ConnectedAp || self.active.is_some() {
            return Err(ChannelError::NotReady(self.state.name()));
        }
        self.create_transport_channel();
        Ok(())
    }

    /// Makes every known server selectable again.
    pub fn recycle_servers(&mut self) {
        log::info!("[WorkerManagerChannel] Recycling {} server(s)", self.pool.roster_size());
        self.pool.recycle_all();
    }

    /// Sends one JSON message to the connected worker manager.
    pub fn send_message(&mut self, message: &str) -> ChannelResult<()> {
        match (&self.state, self.active.as_mut()) {
            (ChannelState::ConnectedWorkerManager { .. }, Some(active)) => {
                Ok(active.transport.send_message(message)?)
            }
            _ => Err(ChannelError::NotConnected),
        }
    }

    /// Records the worker the current worker manager routed us to.
    pub fn select_worker(&mut self, worker: SocketAddr) -> bool {
        match self.active.as_ref() {
            Some(active) => self.pool.select_worker(active.remote, active.kind, worker),
            None => false,
        }
    }

    /// Penalizes the worker manager behind a failing worker.
    pub fn report_worker_failure(&mut self, worker: SocketAddr) {
        if let Some(connect_type) = self.config.as_ref().map(|c| c.connect_type) {
            self.pool.report_worker_failure(worker, connect_type);
        }
    }

    /// Cancels everything in flight: AP request, deferred request, transport
    /// and timers. Pool contents are kept.
    pub fn cleanup(&mut self) {
        self.ap_client.cancel();
        self.strategy.cancel(self.timers.as_mut());
        self.close_transport();
        self.cancel_timer_slot(TimerSlot::Connection);
        self.cancel_timer_slot(TimerSlot::Async);
        self.pending_errors.clear();
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.state
    }

    #[must_use]
    pub fn config(&self) -> Option<&ChannelConfig> {
        self.config.as_ref()
    }

    /// Worker manager of the current transport, if any.
    #[must_use]
    pub fn current_server(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|a| a.remote)
    }

    /// Id of the current transport, if any.
    #[must_use]
    pub fn current_transport(&self) -> Option<TransportId> {
        self.active.as_ref().map(|a| a.id)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.state, ChannelState::ConnectedWorkerManager { .. })
            && self
                .active
                .as_ref()
                .is_some_and(|a| a.transport.is_connected())
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerManagerSelector {
        &self.pool
    }

    /// Current AP backoff in milliseconds.
    #[must_use]
    pub fn backoff_interval(&self) -> u64 {
        self.strategy.interval()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal
    // ─────────────────────────────────────────────────────────────────────────

    fn issue_ap_request(&mut self, task: PendingApRequest) {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.state = ChannelState::ConnectingAp { request_id };
        log::info!(
            "[WorkerManagerChannel] Requesting worker managers for {} (request {})",
            task.service_type,
            request_id
        );
        self.ap_client.require_worker_manager(WorkerManagerRequest {
            request_id,
            service_type: task.service_type,
            payload: task.payload,
        });
    }

    /// Remote and kind of the current transport, if `id` names it.
    fn current(&self, id: TransportId) -> Option<(SocketAddr, ConnectType)> {
        self.active
            .as_ref()
            .filter(|a| a.id == id)
            .map(|a| (a.remote, a.kind))
    }

    fn check_connection(&mut self) {
        let Some((remote, kind)) = self.active.as_ref().map(|a| (a.remote, a.kind)) else {
            return;
        };

        if self
            .pool
            .check_timeout(kind, CHANNEL_CONNECTION_TIMEDOUT_MS, remote)
        {
            log::warn!("[WorkerManagerChannel] {} silent too long, timing out", remote);
            self.emit_error_code(WorkerManagerErrorCode::ConnectionTimedout);
        } else {
            self.arm_connection_timer();
        }
    }

    fn arm_connection_timer(&mut self) {
        self.cancel_timer_slot(TimerSlot::Connection);
        self.connection_timer = Some(
            self.timers
                .create_timer(Duration::from_millis(CHANNEL_CONNECTION_CHECK_INTERVAL_MS)),
        );
    }

    fn cancel_timer_slot(&mut self, slot: TimerSlot) {
        let timer = match slot {
            TimerSlot::Connection => self.connection_timer.take(),
            TimerSlot::Async => self.async_timer.take(),
        };
        if let Some(id) = timer {
            self.timers.cancel_timer(id);
        }
    }

    fn close_transport(&mut self) {
        if let Some(mut active) = self.active.take() {
            log::debug!("[WorkerManagerChannel] Closing {}", active.id);
            active.transport.close();
        }
    }

    fn flush_errors(&mut self) {
        while let Some(code) = self.pending_errors.pop_front() {
            match self.observer.as_mut() {
                Some(observer) => observer.on_error(code),
                None => log::warn!("[WorkerManagerChannel] No observer for {}, dropping", code),
            }
        }
    }
}

impl Drop for WorkerManagerChannel {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[derive(Clone, Copy)]
enum TimerSlot {
    Connection,
    Async,
}

/// Turns an AP server entry into a connectable address.
///
/// Only IP literals are accepted; the port is the TLS or plain one depending
/// on `use_tls`, and a zero port means the server does not offer it.
fn resolve_server(
    server: &AllocatedServer,
    use_tls: bool,
) -> Result<SocketAddr, WorkerManagerErrorCode> {
    let ip: IpAddr = server
        .address
        .parse()
        .map_err(|_| WorkerManagerErrorCode::ServerNoIpError)?;
    let port = if use_tls { server.tcps } else { server.tcp };
    match u16::try_from(port) {
        Ok(port) if port != 0 => Ok(SocketAddr::new(ip, port)),
        _ => Err(WorkerManagerErrorCode::ServerNoTcpError),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::{allocate_response, Harness};
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    /// Harness that has received a successful AP answer with `servers`.
    fn allocated(servers: &[(&str, u16, u16)]) -> Harness {
        let mut h = Harness::new();
        h.channel.establish_connection("probe", "{}").unwrap();
        h.answer_ap(&allocate_response(0, servers));
        h
    }

    #[test]
    fn establish_requires_configuration_and_initialized_state() {
        let mut h = Harness::unconfigured();
        assert_eq!(
            h.channel.establish_connection("probe", "{}"),
            Err(ChannelError::NotConfigured)
        );

        let mut h = Harness::new();
        h.channel.establish_connection("probe", "{}").unwrap();
        assert_eq!(
            h.channel.establish_connection("probe", "{}"),
            Err(ChannelError::NotReady("connecting_ap"))
        );
    }

    #[test]
    fn establish_issues_ap_request() {
        let mut h = Harness::new();
        h.channel.establish_connection("probe", r#"{"x":1}"#).unwrap();

        let world = h.world();
        assert_eq!(world.ap_requests.len(), 1);
        assert_eq!(world.ap_requests[0].service_type, "probe");
        assert_eq!(world.ap_requests[0].payload, r#"{"x":1}"#);
        let request_id = world.ap_requests[0].request_id;
        drop(world);
        assert_eq!(h.channel.state(), ChannelState::ConnectingAp { request_id });
    }

    #[test]
    fn ap_answer_fills_pool_and_connects() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443), ("10.0.0.2", 8000, 8443)]);

        assert_eq!(h.channel.state(), ChannelState::ConnectedAp);
        assert_eq!(h.channel.pool().roster_size(), 2);
        let transport = h.last_transport();
        // Newest server is selected first.
        assert_eq!(transport.remote, Some(addr("10.0.0.2:8000")));
        assert_eq!(transport.tls, None);

        h.connect_last(true);
        assert_eq!(
            h.channel.state(),
            ChannelState::ConnectedWorkerManager {
                remote: addr("10.0.0.2:8000")
            }
        );
        assert!(h.channel.is_connected());
        assert_eq!(h.world().ready, vec![addr("10.0.0.2:8000")]);
    }

    #[test]
    fn tls_uses_secure_port_and_wildcard_name() {
        let mut h = Harness::new();
        let mut config = h.channel.config().cloned().unwrap();
        config.use_tls = true;
        config.tls_domain = "*.edge.example.com".to_string();
        h.channel.initialize(config);
        h.channel.establish_connection("probe", "{}").unwrap();
        h.answer_ap(&allocate_response(0, &[("10.0.0.1", 8000, 8443)]));

        let transport = h.last_transport();
        assert_eq!(transport.remote, Some(addr("10.0.0.1:8443")));
        assert_eq!(
            transport.tls,
            Some(TlsOptions {
                server_name: "10-0-0-1.edge.example.com".to_string()
            })
        );
    }

    #[test]
    fn servers_without_ip_or_port_are_skipped() {
        let mut h = allocated(&[
            ("wm.example.com", 8000, 8443),
            ("10.0.0.3", 0, 8443),
            ("10.0.0.4", 8000, 0),
        ]);
        assert_eq!(h.channel.pool().roster_size(), 1);
        assert_eq!(h.last_transport().remote, Some(addr("10.0.0.4:8000")));
    }

    #[test]
    fn out_of_range_port_skips_only_that_server() {
        let mut h = Harness::new();
        h.channel.establish_connection("probe", "{}").unwrap();
        h.answer_ap(
            r#"{"code":0,"servers":[
                {"address":"10.0.0.5","tcp":70000,"tcps":8443},
                {"address":"10.0.0.6","tcp":8000,"tcps":8443}
            ]}"#,
        );

        assert_eq!(h.channel.pool().roster_size(), 1);
        assert_eq!(h.last_transport().remote, Some(addr("10.0.0.6:8000")));
        h.run_pending();
        assert!(h.world().errors.is_empty());
    }

    #[test]
    fn empty_pool_reports_no_available_worker_manager() {
        let mut h = allocated(&[("wm.example.com", 8000, 8443)]);

        assert!(h.world().transports.is_empty());
        assert!(h.world().errors.is_empty());
        h.run_pending();
        assert_eq!(
            h.world().errors,
            vec![WorkerManagerErrorCode::NoAvailableWorkerManager]
        );
    }

    #[test]
    fn ap_answers_are_ignored_unless_awaited() {
        let mut h = Harness::new();
        h.channel.establish_connection("probe", "{}").unwrap();
        let request_id = h.world().ap_requests[0].request_id;
        let payload = allocate_response(0, &[("10.0.0.1", 8000, 8443)]);

        h.channel.on_ap_event(ApEvent {
            request_id: request_id + 1,
            flags: AP_FLAG_WORKER_MANAGER,
            error: 0,
            payload: payload.clone(),
        });
        h.channel.on_ap_event(ApEvent {
            request_id,
            flags: 0,
            error: 0,
            payload: payload.clone(),
        });
        h.channel.on_ap_event(ApEvent {
            request_id,
            flags: AP_FLAG_WORKER_MANAGER,
            error: 110,
            payload: payload.clone(),
        });
        assert_eq!(h.channel.state(), ChannelState::ConnectingAp { request_id });
        assert_eq!(h.channel.pool().roster_size(), 0);

        h.answer_ap(&payload);
        h.connect_last(true);
        let transports_before = h.world().transports.len();

        // A late duplicate while connected changes nothing.
        h.channel.on_ap_event(ApEvent {
            request_id,
            flags: AP_FLAG_WORKER_MANAGER,
            error: 0,
            payload: allocate_response(0, &[("10.0.0.9", 8000, 8443)]),
        });
        assert!(matches!(
            h.channel.state(),
            ChannelState::ConnectedWorkerManager { .. }
        ));
        assert_eq!(h.channel.pool().roster_size(), 1);
        assert_eq!(h.world().transports.len(), transports_before);
    }

    #[test]
    fn server_error_is_deferred_and_engages_backoff() {
        let mut h = Harness::new();
        h.channel.establish_connection("probe", "{}").unwrap();
        h.answer_ap(&allocate_response(4, &[]));

        assert!(h.world().errors.is_empty());
        h.run_pending();
        assert_eq!(h.world().errors, vec![WorkerManagerErrorCode::ServerTempError]);
        assert_eq!(h.channel.backoff_interval(), 4000);

        // Re-initializing keeps the gate; the next request waits out the penalty.
        let config = h.channel.config().cloned().unwrap();
        h.channel.initialize(config);
        h.channel.establish_connection("probe", "{}").unwrap();
        assert_eq!(h.world().ap_requests.len(), 1);
        assert_eq!(h.channel.state(), ChannelState::Initialized);

        h.advance(3999);
        assert_eq!(h.world().ap_requests.len(), 1);
        h.advance(1);
        assert_eq!(h.world().ap_requests.len(), 2);
        assert!(matches!(
            h.channel.state(),
            ChannelState::ConnectingAp { .. }
        ));
    }

    #[test]
    fn success_clears_backoff() {
        let mut h = Harness::new();
        h.channel.establish_connection("probe", "{}").unwrap();
        h.answer_ap(&allocate_response(3, &[]));
        assert_eq!(h.channel.backoff_interval(), 4000);

        let config = h.channel.config().cloned().unwrap();
        h.channel.initialize(config);
        h.channel.establish_connection("probe", "{}").unwrap();
        h.advance(4000);
        h.answer_ap(&allocate_response(0, &[("10.0.0.1", 8000, 8443)]));
        assert_eq!(h.channel.backoff_interval(), 0);
        assert_eq!(h.last_transport().remote, Some(addr("10.0.0.1:8000")));
    }

    #[test]
    fn malformed_ap_answer_emits_invalid_argument() {
        let mut h = Harness::new();
        h.channel.establish_connection("probe", "{}").unwrap();
        h.answer_ap("not json");
        h.run_pending();
        assert_eq!(
            h.world().errors,
            vec![WorkerManagerErrorCode::ServerInvalidArgumentError]
        );
        assert_eq!(h.channel.state(), ChannelState::ConnectedAp);
    }

    #[test]
    fn connect_failure_maps_to_transport_kind() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443)]);
        h.connect_last(false);
        h.run_pending();
        assert_eq!(
            h.world().errors,
            vec![WorkerManagerErrorCode::TcpConnectionError]
        );
        assert_eq!(h.channel.pool().inuse_size(ConnectType::Tcp), 0);
        assert_eq!(h.channel.pool().avail_size(ConnectType::Tcp), 0);

        let mut h = Harness::new();
        let mut config = h.channel.config().cloned().unwrap();
        config.connect_type = ConnectType::Udp;
        h.channel.initialize(config);
        h.channel.establish_connection("probe", "{}").unwrap();
        h.answer_ap(&allocate_response(0, &[("10.0.0.1", 8000, 8443)]));
        assert_eq!(h.last_transport().kind, ConnectType::Udp);
        assert_eq!(h.last_transport().remote, Some(addr("10.0.0.1:8000")));
        h.connect_last(false);
        h.run_pending();
        assert_eq!(h.world().errors, vec![WorkerManagerErrorCode::BindSocketError]);
    }

    #[test]
    fn silent_connection_times_out() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443)]);
        h.connect_last(true);

        h.advance(4000);
        assert!(h.world().errors.is_empty());
        h.advance(2000);
        assert_eq!(
            h.world().errors,
            vec![WorkerManagerErrorCode::ConnectionTimedout]
        );
        assert_eq!(h.channel.pool().inuse_size(ConnectType::Tcp), 0);
    }

    #[test]
    fn inbound_packets_keep_connection_alive() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443)]);
        h.connect_last(true);
        let id = h.channel.current_transport().unwrap();

        for _ in 0..5 {
            h.advance(2000);
            h.channel
                .on_transport_packet(id, r#"{"command":"heartbeat"}"#);
        }
        assert!(h.world().errors.is_empty());
        assert_eq!(h.world().messages.len(), 5);
        assert_eq!(h.world().messages[0].0, "heartbeat");
    }

    #[test]
    fn message_without_command_is_an_error() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443)]);
        h.connect_last(true);
        let id = h.channel.current_transport().unwrap();

        h.channel.on_transport_packet(id, r#"{"code":0}"#);
        h.run_pending();
        assert!(h.world().messages.is_empty());
        assert_eq!(
            h.world().errors,
            vec![WorkerManagerErrorCode::ServerNoCommandError]
        );
    }

    #[test]
    fn socket_error_reports_failure_and_emits() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443)]);
        h.connect_last(true);
        let id = h.channel.current_transport().unwrap();

        h.channel
            .on_transport_error(id, TransportError::Io("reset".to_string()));
        h.run_pending();
        assert_eq!(
            h.world().errors,
            vec![WorkerManagerErrorCode::ConnectionSocketError]
        );
        assert_eq!(h.channel.pool().inuse_size(ConnectType::Tcp), 0);
    }

    #[test]
    fn stale_transport_events_are_ignored() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443), ("10.0.0.2", 8000, 8443)]);
        let old = h.channel.current_transport().unwrap();
        h.channel.close_channel(false, false);
        h.channel.reconnect().unwrap();
        assert_ne!(h.channel.current_transport(), Some(old));

        h.channel.on_transport_connect(old, true);
        h.channel
            .on_transport_error(old, TransportError::Closed);
        h.channel.on_transport_packet(old, r#"{"command":"x"}"#);
        h.run_pending();

        assert_eq!(h.channel.state(), ChannelState::ConnectedAp);
        assert!(h.world().ready.is_empty());
        assert!(h.world().errors.is_empty());
        assert!(h.world().messages.is_empty());
    }

    #[test]
    fn close_with_success_keeps_server_preferred() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443), ("10.0.0.2", 8000, 8443)]);
        h.connect_last(true);
        let remote = h.channel.current_server().unwrap();

        h.channel.close_channel(true, false);
        assert_eq!(h.channel.state(), ChannelState::ConnectedAp);
        assert!(h.last_transport().closed);
        let server = h.channel.pool().server(remote, ConnectType::Tcp).unwrap();
        assert!(server.once_work);

        h.channel.reconnect().unwrap();
        assert_eq!(h.channel.current_server(), Some(remote));
    }

    #[test]
    fn close_with_change_moves_to_next_server() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443), ("10.0.0.2", 8000, 8443)]);
        h.connect_last(true);
        let first = h.channel.current_server().unwrap();

        h.channel.close_channel(true, true);
        h.channel.reconnect().unwrap();
        let second = h.channel.current_server().unwrap();
        assert_ne!(first, second);

        // Pool exhausted after the second one fails too.
        h.channel.close_channel(false, false);
        h.channel.reconnect().unwrap();
        h.run_pending();
        assert_eq!(
            h.world().errors,
            vec![WorkerManagerErrorCode::NoAvailableWorkerManager]
        );

        h.channel.recycle_servers();
        h.channel.reconnect().unwrap();
        assert!(h.channel.current_server().is_some());
    }

    #[test]
    fn reconnect_requires_closed_session() {
        let mut h = Harness::new();
        assert_eq!(
            h.channel.reconnect(),
            Err(ChannelError::NotReady("initialized"))
        );

        let mut h = allocated(&[("10.0.0.1", 8000, 8443)]);
        assert_eq!(
            h.channel.reconnect(),
            Err(ChannelError::NotReady("connected_ap"))
        );
    }

    #[test]
    fn send_message_requires_connection() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443)]);
        assert_eq!(
            h.channel.send_message(r#"{"command":"heartbeat"}"#),
            Err(ChannelError::NotConnected)
        );

        h.connect_last(true);
        h.channel
            .send_message(r#"{"command":"heartbeat"}"#)
            .unwrap();
        assert_eq!(h.last_transport().sent, vec![r#"{"command":"heartbeat"}"#]);
    }

    #[test]
    fn worker_failure_drops_routing_worker_manager() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443)]);
        h.connect_last(true);
        let worker = addr("192.168.1.5:9000");
        assert!(h.channel.select_worker(worker));

        h.channel.report_worker_failure(worker);
        let pool = h.channel.pool();
        assert_eq!(pool.inuse_size(ConnectType::Tcp), 0);
        assert_eq!(pool.avail_size(ConnectType::Tcp), 0);
        assert_eq!(pool.roster_size(), 1);
    }

    #[test]
    fn errors_are_delivered_in_order_in_one_tick() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443)]);
        h.connect_last(true);

        h.channel
            .emit_error_code(WorkerManagerErrorCode::ConnectionChanged);
        h.channel
            .emit_error_code(WorkerManagerErrorCode::ServerTempError);
        assert_eq!(h.world().armed_zero_delay(), 1);
        h.run_pending();
        assert_eq!(
            h.world().errors,
            vec![
                WorkerManagerErrorCode::ConnectionChanged,
                WorkerManagerErrorCode::ServerTempError
            ]
        );
    }

    #[test]
    fn initialize_keeps_pool_for_same_source() {
        let mut h = allocated(&[("10.0.0.1", 8000, 8443)]);
        let config = h.channel.config().cloned().unwrap();

        h.channel.initialize(config.clone());
        assert_eq!(h.channel.pool().roster_size(), 1);
        assert_eq!(h.channel.state(), ChannelState::Initialized);
        assert!(h.last_transport().closed);

        let mut other = config;
        other.domains = vec!["other.example.com".to_string()];
        h.channel.initialize(other);
        assert_eq!(h.channel.pool().roster_size(), 0);
        assert_eq!(h.world().ap_endpoints.len(), 3);
        assert_eq!(h.world().ap_cancels, 3);
    }

    #[test]
    fn ipv6_family_selects_ipv6_servers() {
        let mut h = Harness::new();
        let mut config = h.channel.config().cloned().unwrap();
        config.ip_family = crate::context::IpFamily::V6;
        h.channel.initialize(config);
        h.channel.establish_connection("probe", "{}").unwrap();
        h.answer_ap(&allocate_response(
            0,
            &[("2001:db8::1", 8000, 8443), ("10.0.0.1", 8000, 8443)],
        ));
        assert_eq!(h.last_transport().remote, Some(addr("[2001:db8::1]:8000")));
    }
}
