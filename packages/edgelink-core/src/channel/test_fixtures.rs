//! Shared fakes for channel tests.
//!
//! Every fake records into one [`World`] behind a mutex so tests can inspect
//! what the channel asked for. Timers run on a [`ManualClock`] and only fire
//! when the test advances it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::context::{IpDetector, NetworkError};
use crate::error::{TransportError, WorkerManagerErrorCode};
use crate::events::ChannelObserver;
use crate::pool::ConnectType;
use crate::protocol_constants::AP_FLAG_WORKER_MANAGER;
use crate::timer::{TimerId, TimerService};
use crate::utils::{Clock, ManualClock};

use super::config::{ApEndpoints, ChannelConfig};
use super::traits::{
    ApClient, ApEvent, TlsOptions, Transport, TransportFactory, TransportId, WorkerManagerRequest,
};
use super::worker_manager_channel::{ChannelParts, WorkerManagerChannel};

pub(crate) const START_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub(crate) struct ArmedTimer {
    pub id: TimerId,
    pub delay: Duration,
    pub due: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct TransportRecord {
    pub id: TransportId,
    pub kind: ConnectType,
    pub tls: Option<TlsOptions>,
    pub remote: Option<SocketAddr>,
    pub connected: bool,
    pub sent: Vec<String>,
    pub closed: bool,
}

#[derive(Default)]
pub(crate) struct World {
    next_timer: u64,
    pub timers: Vec<ArmedTimer>,
    pub ap_endpoints: Vec<ApEndpoints>,
    pub ap_requests: Vec<WorkerManagerRequest>,
    pub ap_cancels: usize,
    pub transports: Vec<TransportRecord>,
    pub ready: Vec<SocketAddr>,
    pub errors: Vec<WorkerManagerErrorCode>,
    pub messages: Vec<(String, String)>,
}

impl World {
    pub fn armed_zero_delay(&self) -> usize {
        self.timers
            .iter()
            .filter(|t| t.delay == Duration::ZERO)
            .count()
    }
}

type Shared = Arc<Mutex<World>>;

struct FakeTimers {
    world: Shared,
    clock: ManualClock,
}

impl TimerService for FakeTimers {
    fn create_timer(&mut self, delay: Duration) -> TimerId {
        let mut world = self.world.lock();
        world.next_timer += 1;
        let id = TimerId(world.next_timer);
        let due = self.clock.now_ms() + delay.as_millis() as u64;
        world.timers.push(ArmedTimer { id, delay, due });
        id
    }

    fn cancel_timer(&mut self, id: TimerId) {
        self.world.lock().timers.retain(|t| t.id != id);
    }
}

struct FakeApClient {
    world: Shared,
}

impl ApClient for FakeApClient {
    fn configure(&mut self, endpoints: &ApEndpoints) {
        self.world.lock().ap_endpoints.push(endpoints.clone());
    }

    fn require_worker_manager(&mut self, request: WorkerManagerRequest) {
        self.world.lock().ap_requests.push(request);
    }

    fn cancel(&mut self) {
        self.world.lock().ap_cancels += 1;
    }
}

struct FakeTransportFactory {
    world: Shared,
}

impl TransportFactory for FakeTransportFactory {
    fn create(
        &mut self,
        id: TransportId,
        kind: ConnectType,
        tls: Option<TlsOptions>,
    ) -> Box<dyn Transport> {
        let mut world = self.world.lock();
        world.transports.push(TransportRecord {
            id,
            kind,
            tls,
            remote: None,
            connected: false,
            sent: Vec::new(),
            closed: false,
        });
        Box::new(FakeTransport {
            world: Arc::clone(&self.world),
            index: world.transports.len() - 1,
            kind,
        })
    }
}

struct FakeTransport {
    world: Shared,
    index: usize,
    kind: ConnectType,
}

impl Transport for FakeTransport {
    fn connect(&mut self, remote: SocketAddr) {
        self.world.lock().transports[self.index].remote = Some(remote);
    }

    fn is_connected(&self) -> bool {
        self.world.lock().transports[self.index].connected
    }

    fn send_message(&mut self, message: &str) -> Result<(), TransportError> {
        let mut world = self.world.lock();
        let record = &mut world.transports[self.index];
        if !record.connected || record.closed {
            return Err(TransportError::NotConnected);
        }
        record.sent.push(message.to_string());
        Ok(())
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.world.lock().transports[self.index].remote
    }

    fn kind(&self) -> ConnectType {
        self.kind
    }

    fn close(&mut self) {
        let mut world = self.world.lock();
        let record = &mut world.transports[self.index];
        record.closed = true;
        record.connected = false;
    }
}

struct RecordingObserver {
    world: Shared,
}

impl ChannelObserver for RecordingObserver {
    fn on_ready(&mut self, remote: SocketAddr) {
        self.world.lock().ready.push(remote);
    }

    fn on_error(&mut self, code: WorkerManagerErrorCode) {
        self.world.lock().errors.push(code);
    }

    fn on_message(&mut self, command: &str, raw: &str) {
        self.world
            .lock()
            .messages
            .push((command.to_string(), raw.to_string()));
    }
}

struct FixedDetector(IpAddr);

impl IpDetector for FixedDetector {
    fn detect(&self) -> Result<IpAddr, NetworkError> {
        Ok(self.0)
    }
}

/// Default configuration used by [`Harness::new`].
pub(crate) fn test_config() -> ChannelConfig {
    ChannelConfig {
        domains: vec!["ap.example.com".to_string()],
        default_ports: vec![443],
        ..Default::default()
    }
}

/// Builds an allocate response JSON with `(address, tcp, tcps)` servers.
pub(crate) fn allocate_response(code: i32, servers: &[(&str, u16, u16)]) -> String {
    let servers: Vec<serde_json::Value> = servers
        .iter()
        .map(|(address, tcp, tcps)| {
            serde_json::json!({ "address": address, "tcp": tcp, "tcps": tcps })
        })
        .collect();
    serde_json::json!({
        "code": code,
        "reason": if code == 0 { "" } else { "busy" },
        "servers": servers,
    })
    .to_string()
}

/// A channel wired to fakes, plus the clock driving its timers.
pub(crate) struct Harness {
    pub channel: WorkerManagerChannel,
    pub world: Shared,
    pub clock: ManualClock,
}

impl Harness {
    /// Channel initialized with [`test_config`] and an observer installed.
    pub fn new() -> Self {
        let mut harness = Self::unconfigured();
        harness.channel.initialize(test_config());
        harness
    }

    /// Channel with an observer but no configuration.
    pub fn unconfigured() -> Self {
        let world: Shared = Arc::new(Mutex::new(World::default()));
        let clock = ManualClock::new(START_MS);
        let mut channel = WorkerManagerChannel::new(ChannelParts {
            ap_client: Box::new(FakeApClient {
                world: Arc::clone(&world),
            }),
            transports: Box::new(FakeTransportFactory {
                world: Arc::clone(&world),
            }),
            timers: Box::new(FakeTimers {
                world: Arc::clone(&world),
                clock: clock.clone(),
            }),
            clock: Arc::new(clock.clone()),
            ip_detector: Arc::new(FixedDetector(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)))),
        });
        channel.set_observer(Box::new(RecordingObserver {
            world: Arc::clone(&world),
        }));
        Self {
            channel,
            world,
            clock,
        }
    }

    pub fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock()
    }

    /// Moves the clock forward, firing due timers in deadline order.
    pub fn advance(&mut self, ms: u64) {
        let target = self.clock.now_ms() + ms;
        loop {
            let next = {
                let mut world = self.world.lock();
                let due = world
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| t.due)
                    .map(|(i, _)| i);
                due.map(|i| world.timers.remove(i))
            };
            let Some(timer) = next else {
                break;
            };
            if timer.due > self.clock.now_ms() {
                self.clock.set(timer.due);
            }
            self.channel.on_timer(timer.id);
        }
        self.clock.set(target);
    }

    /// Fires timers that are already due (zero-delay deliveries).
    pub fn run_pending(&mut self) {
        self.advance(0);
    }

    /// Answers the most recent AP request with `payload`.
    pub fn answer_ap(&mut self, payload: &str) {
        let request_id = self
            .world()
            .ap_requests
            .last()
            .map(|r| r.request_id)
            .unwrap_or_default();
        self.channel.on_ap_event(ApEvent {
            request_id,
            flags: AP_FLAG_WORKER_MANAGER,
            error: 0,
            payload: payload.to_string(),
        });
    }

    pub fn last_transport(&self) -> TransportRecord {
        self.world()
            .transports
            .last()
            .cloned()
            .expect("no transport created")
    }

    /// Completes the connect of the most recent transport.
    pub fn connect_last(&mut self, connected: bool) {
        let id = {
            let mut world = self.world.lock();
            let record = world.transports.last_mut().expect("no transport created");
            record.connected = connected;
            record.id
        };
        self.channel.on_transport_connect(id, connected);
    }
}
