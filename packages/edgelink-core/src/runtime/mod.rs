//! Tokio driver for the channel.
//!
//! One spawned task owns the [`WorkerManagerChannel`]. Timers, transports and
//! the AP client post [`RuntimeEvent`]s to it; the owner talks to it through a
//! cloneable [`ChannelHandle`] and receives [`ChannelEvent`]s on an mpsc
//! receiver. The task stops when every handle is dropped or on
//! [`ChannelHandle::shutdown`].
//!
//! - `spawner`: task spawning abstraction
//! - `timers`: sleep-task timer service
//! - `transport`: TCP/TLS/UDP transports
//! - `ap_client`: HTTP and static AP clients

mod ap_client;
mod spawner;
mod timers;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ClientConfig;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{
    ApClient, ApEvent, ChannelConfig, ChannelParts, ChannelState, TransportId,
    WorkerManagerChannel,
};
use crate::context::{IpDetector, LocalIpDetector};
use crate::error::{ChannelError, ChannelResult, TransportError, WorkerManagerErrorCode};
use crate::events::{ChannelEvent, ChannelObserver, LoggingChannelObserver};
use crate::pool::ConnectType;
use crate::timer::TimerId;
use crate::utils::Clock;

pub use ap_client::{HttpApClient, StaticApClient};
pub use spawner::{TaskSpawner, TokioSpawner};
pub use timers::{TokioClock, TokioTimers};
pub use transport::{tls_client_config, TokioTransportFactory};

/// Something the channel task must react to.
#[derive(Debug)]
pub enum RuntimeEvent {
    Timer(TimerId),
    Ap(ApEvent),
    TransportConnect { id: TransportId, connected: bool },
    TransportError { id: TransportId, error: TransportError },
    TransportPacket { id: TransportId, payload: String },
}

/// Sender half used by timers, transports and AP clients.
pub type EventSender = mpsc::UnboundedSender<RuntimeEvent>;

/// How the runtime obtains worker managers.
#[derive(Debug, Clone, Default)]
pub enum ApMode {
    /// Query the configured AP endpoints over HTTP(S).
    #[default]
    Http,
    /// Answer every AP request with this allocate response JSON.
    Static { response: String },
}

/// Options for [`ChannelRuntime::spawn`].
pub struct RuntimeOptions {
    pub ap: ApMode,
    pub ip_detector: Arc<dyn IpDetector>,
    pub clock: Arc<dyn Clock>,
    /// TLS configuration for worker-manager connections (webpki roots if unset).
    pub tls_config: Option<Arc<ClientConfig>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            ap: ApMode::Http,
            ip_detector: LocalIpDetector::arc(),
            clock: Arc::new(TokioClock::new()),
            tls_config: None,
        }
    }
}

/// Snapshot of the channel for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub current_server: Option<SocketAddr>,
    pub backoff_interval_ms: u64,
    pub available: usize,
    pub in_use: usize,
    pub known: usize,
}

/// Owner requests, answered over a oneshot.
enum ChannelCommand {
    Initialize {
        config: ChannelConfig,
        reply: oneshot::Sender<()>,
    },
    Establish {
        service_type: String,
        request: String,
        reply: oneshot::Sender<ChannelResult<()>>,
    },
    Close {
        is_success: bool,
        need_change: bool,
        reply: oneshot::Sender<()>,
    },
    Reconnect {
        reply: oneshot::Sender<ChannelResult<()>>,
    },
    Recycle {
        reply: oneshot::Sender<()>,
    },
    Send {
        message: String,
        reply: oneshot::Sender<ChannelResult<()>>,
    },
    SelectWorker {
        worker: SocketAddr,
        reply: oneshot::Sender<bool>,
    },
    ReportWorkerFailure {
        worker: SocketAddr,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<ChannelStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Observer that logs each notification and forwards it to the owner's receiver.
struct ForwardingObserver {
    log: LoggingChannelObserver,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ForwardingObserver {
    fn new(tx: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            log: LoggingChannelObserver,
            tx,
        }
    }

    fn forward(&self, event: ChannelEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("[ChannelRuntime] Owner receiver dropped, event discarded");
        }
    }
}

impl ChannelObserver for ForwardingObserver {
    fn on_ready(&mut self, remote: SocketAddr) {
        self.log.on_ready(remote);
        self.forward(ChannelEvent::Ready { remote });
    }

    fn on_error(&mut self, code: WorkerManagerErrorCode) {
        self.log.on_error(code);
        self.forward(ChannelEvent::Error { code });
    }

    fn on_message(&mut self, command: &str, raw: &str) {
        self.log.on_message(command, raw);
        self.forward(ChannelEvent::Message {
            command: command.to_string(),
            raw: raw.to_string(),
        });
    }
}

/// Spawns channel tasks.
pub struct ChannelRuntime;

impl ChannelRuntime {
    /// Builds a channel wired to tokio collaborators and spawns its task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        options: RuntimeOptions,
    ) -> ChannelResult<(ChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let spawner = TokioSpawner::current();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let ap_client: Box<dyn ApClient> = match options.ap {
            ApMode::Http => Box::new(
                HttpApClient::new(spawner.clone(), event_tx.clone())
                    .map_err(|e| ChannelError::Setup(e.to_string()))?,
            ),
            ApMode::Static { response } => {
                Box::new(StaticApClient::new(event_tx.clone(), response))
            }
        };

        let mut transports = TokioTransportFactory::new(spawner.clone(), event_tx.clone());
        if let Some(config) = options.tls_config {
            transports = transports.with_tls_config(config);
        }

        let mut channel = WorkerManagerChannel::new(ChannelParts {
            ap_client,
            transports: Box::new(transports),
            timers: Box::new(TokioTimers::new(spawner.clone(), event_tx)),
            clock: options.clock,
            ip_detector: options.ip_detector,
        });
        channel.set_observer(Box::new(ForwardingObserver::new(notify_tx)));

        spawner.spawn(run(channel, command_rx, event_rx));
        tracing::info!("channel runtime started");

        Ok((
            ChannelHandle {
                commands: command_tx,
            },
            notify_rx,
        ))
    }
}

async fn run(
    mut channel: WorkerManagerChannel,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    mut events: mpsc::UnboundedReceiver<RuntimeEvent>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                if !handle_command(&mut channel, command) {
                    break;
                }
            }
            Some(event) = events.recv() => dispatch_event(&mut channel, event),
        }
    }
    channel.cleanup();
    tracing::info!(state = %channel.state(), "channel runtime stopped");
}

fn dispatch_event(channel: &mut WorkerManagerChannel, event: RuntimeEvent) {
    match event {
        RuntimeEvent::Timer(id) => channel.on_timer(id),
        RuntimeEvent::Ap(event) => channel.on_ap_event(event),
        RuntimeEvent::TransportConnect { id, connected } => {
            tracing::debug!(transport = %id, connected, "transport connect result");
            channel.on_transport_connect(id, connected);
        }
        RuntimeEvent::TransportError { id, error } => channel.on_transport_error(id, error),
        RuntimeEvent::TransportPacket { id, payload } => {
            channel.on_transport_packet(id, &payload);
        }
    }
}

/// Applies one owner command; returns false when the task should stop.
fn handle_command(channel: &mut WorkerManagerChannel, command: ChannelCommand) -> bool {
    match command {
        ChannelCommand::Initialize { config, reply } => {
            channel.initialize(config);
            let _ = reply.send(());
        }
        ChannelCommand::Establish {
            service_type,
            request,
            reply,
        } => {
            let _ = reply.send(channel.establish_connection(&service_type, &request));
        }
        ChannelCommand::Close {
            is_success,
            need_change,
            reply,
        } => {
            channel.close_channel(is_success, need_change);
            let _ = reply.send(());
        }
        ChannelCommand::Reconnect { reply } => {
            let _ = reply.send(channel.reconnect());
        }
        ChannelCommand::Recycle { reply } => {
            channel.recycle_servers();
            let _ = reply.send(());
        }
        ChannelCommand::Send { message, reply } => {
            let _ = reply.send(channel.send_message(&message));
        }
        ChannelCommand::SelectWorker { worker, reply } => {
            let _ = reply.send(channel.select_worker(worker));
        }
        ChannelCommand::ReportWorkerFailure { worker, reply } => {
            channel.report_worker_failure(worker);
            let _ = reply.send(());
        }
        ChannelCommand::Status { reply } => {
            let _ = reply.send(status_of(channel));
        }
        ChannelCommand::Shutdown { reply } => {
            let _ = reply.send(());
            return false;
        }
    }
    true
}

fn status_of(channel: &WorkerManagerChannel) -> ChannelStatus {
    let connect_type = channel
        .config()
        .map_or(ConnectType::Tcp, |c| c.connect_type);
    let pool = channel.pool();
    ChannelStatus {
        state: channel.state(),
        current_server: channel.current_server(),
        backoff_interval_ms: channel.backoff_interval(),
        available: pool.avail_size(connect_type),
        in_use: pool.inuse_size(connect_type),
        known: pool.roster_size(),
    }
}

/// Async handle to a running channel task.
#[derive(Clone)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<ChannelCommand>,
}

impl ChannelHandle {
    async fn call<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> ChannelCommand,
    ) -> ChannelResult<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| ChannelError::RuntimeClosed)?;
        rx.await.map_err(|_| ChannelError::RuntimeClosed)
    }

    /// See [`WorkerManagerChannel::initialize`].
    pub async fn initialize(&self, config: ChannelConfig) -> ChannelResult<()> {
        self.call(|reply| ChannelCommand::Initialize { config, reply })
            .await
    }

    /// See [`WorkerManagerChannel::establish_connection`].
    pub async fn establish_connection(
        &self,
        service_type: impl Into<String>,
        request: impl Into<String>,
    ) -> ChannelResult<()> {
        let service_type = service_type.into();
        let request = request.into();
        self.call(|reply| ChannelCommand::Establish {
            service_type,
            request,
            reply,
        })
        .await?
    }

    /// See [`WorkerManagerChannel::close_channel`].
    pub async fn close_channel(&self, is_success: bool, need_change: bool) -> ChannelResult<()> {
        self.call(|reply| ChannelCommand::Close {
            is_success,
            need_change,
            reply,
        })
        .await
    }

    /// See [`WorkerManagerChannel::reconnect`].
    pub async fn reconnect(&self) -> ChannelResult<()> {
        self.call(|reply| ChannelCommand::Reconnect { reply }).await?
    }

    /// See [`WorkerManagerChannel::recycle_servers`].
    pub async fn recycle_servers(&self) -> ChannelResult<()> {
        self.call(|reply| ChannelCommand::Recycle { reply }).await
    }

    /// See [`WorkerManagerChannel::send_message`].
    pub async fn send_message(&self, message: impl Into<String>) -> ChannelResult<()> {
        let message = message.into();
        self.call(|reply| ChannelCommand::Send { message, reply })
            .await?
    }

    /// See [`WorkerManagerChannel::select_worker`].
    pub async fn select_worker(&self, worker: SocketAddr) -> ChannelResult<bool> {
        self.call(|reply| ChannelCommand::SelectWorker { worker, reply })
            .await
    }

    /// See [`WorkerManagerChannel::report_worker_failure`].
    pub async fn report_worker_failure(&self, worker: SocketAddr) -> ChannelResult<()> {
        self.call(|reply| ChannelCommand::ReportWorkerFailure { worker, reply })
            .await
    }

    /// Current state and pool counters.
    pub async fn status(&self) -> ChannelResult<ChannelStatus> {
        self.call(|reply| ChannelCommand::Status { reply }).await
    }

    /// Stops the channel task, tearing down any connection.
    pub async fn shutdown(&self) -> ChannelResult<()> {
        self.call(|reply| ChannelCommand::Shutdown { reply }).await
    }
}
