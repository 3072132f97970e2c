//! Probe session: keeps one worker-manager connection alive.
//!
//! Requests an allocation, heartbeats while connected, and applies a simple
//! recovery policy whenever the channel reports an error.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use edgelink_core::protocol_constants::HEARTBEAT_COMMAND;
use edgelink_core::{
    pack, unpack, AllocateRequest, ChannelConfig, ChannelEvent, ChannelHandle, HeartbeatRequest,
    HeartbeatResponse, SessionIdentity, WorkerManagerErrorCode,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;

/// What the owner does after closing a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Try the next server already in the pool.
    Reconnect,
    /// Every server failed: wait, make them all eligible again, retry.
    Recycle,
    /// Ask the AP for a fresh allocation (backoff applies).
    Reallocate,
}

/// Recovery policy for a channel error.
pub fn recovery_for(code: WorkerManagerErrorCode) -> Recovery {
    if code == WorkerManagerErrorCode::NoAvailableWorkerManager {
        Recovery::Recycle
    } else if code.is_network_error() {
        Recovery::Reconnect
    } else {
        Recovery::Reallocate
    }
}

/// Counters reported at shutdown.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub connections: u64,
    pub errors: u64,
    pub heartbeats_sent: u64,
    pub messages: u64,
}

/// Drives one channel on behalf of the probe.
pub struct Session {
    handle: ChannelHandle,
    channel_config: ChannelConfig,
    identity: SessionIdentity,
    service_type: String,
    heartbeat_every: Duration,
    retry_delay: Duration,
    seq: u32,
    request_id: u64,
    connected: Option<SocketAddr>,
    stats: SessionStats,
}

impl Session {
    pub fn new(
        handle: ChannelHandle,
        channel_config: ChannelConfig,
        identity: SessionIdentity,
        service_type: String,
        heartbeat_every: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            handle,
            channel_config,
            identity,
            service_type,
            heartbeat_every,
            retry_delay,
            seq: 0,
            request_id: 0,
            connected: None,
            stats: SessionStats::default(),
        }
    }

    /// Configures the channel and sends the first allocation request.
    pub async fn start(&mut self) -> Result<()> {
        self.handle
            .initialize(self.channel_config.clone())
            .await
            .context("Failed to initialize channel")?;
        self.request_allocation().await
    }

    /// Processes channel events until the runtime stops.
    pub async fn run(&mut self, mut events: UnboundedReceiver<ChannelEvent>) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        bail!("channel runtime stopped");
                    };
                    self.on_event(event).await?;
                }
                _ = heartbeat.tick() => self.send_heartbeat().await,
            }
        }
    }

    /// Closes the current session cleanly and stops the runtime.
    pub async fn shutdown(&mut self) -> SessionStats {
        if self.connected.take().is_some() {
            let _ = self.handle.close_channel(true, false).await;
        }
        let _ = self.handle.shutdown().await;
        self.stats
    }

    async fn request_allocation(&mut self) -> Result<()> {
        self.seq += 1;
        self.request_id += 1;
        let request = pack(&AllocateRequest::new(
            &self.identity,
            self.seq,
            self.request_id,
        ))?;
        log::info!(
            "Requesting allocation (sid={}, seq={})",
            self.identity.sid,
            self.seq
        );
        self.handle
            .establish_connection(self.service_type.clone(), request)
            .await
            .context("Failed to request allocation")
    }

    async fn on_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Ready { remote } => {
                log::info!("Connected to worker manager {}", remote);
                self.connected = Some(remote);
                self.stats.connections += 1;
            }
            ChannelEvent::Message { command, raw } => {
                self.stats.messages += 1;
                if command == HEARTBEAT_COMMAND {
                    match unpack::<HeartbeatResponse>(&raw) {
                        Ok(ack) => log::debug!("Heartbeat ack {} (ts={})", ack.request_id, ack.ts),
                        Err(e) => log::warn!("Malformed heartbeat ack: {}", e),
                    }
                } else {
                    log::info!("Worker manager sent {}: {}", command, raw);
                }
            }
            ChannelEvent::Error { code } => {
                self.stats.errors += 1;
                self.recover(code).await?;
            }
        }
        Ok(())
    }

    async fn recover(&mut self, code: WorkerManagerErrorCode) -> Result<()> {
        let recovery = recovery_for(code);
        log::warn!("Channel error {}, recovering with {:?}", code, recovery);

        self.connected = None;
        self.handle.close_channel(false, false).await?;

        match recovery {
            Recovery::Reconnect => self.reconnect_or_reallocate().await,
            Recovery::Recycle => {
                tokio::time::sleep(self.retry_delay).await;
                self.handle.recycle_servers().await?;
                self.reconnect_or_reallocate().await
            }
            Recovery::Reallocate => self.reallocate().await,
        }
    }

    async fn reconnect_or_reallocate(&mut self) -> Result<()> {
        let status = self.handle.status().await?;
        if status.available > 0 && self.handle.reconnect().await.is_ok() {
            return Ok(());
        }
        self.reallocate().await
    }

    async fn reallocate(&mut self) -> Result<()> {
        self.handle
            .initialize(self.channel_config.clone())
            .await
            .context("Failed to re-initialize channel")?;
        self.request_allocation().await
    }

    async fn send_heartbeat(&mut self) {
        if self.connected.is_none() {
            return;
        }
        self.request_id += 1;
        let message = match pack(&HeartbeatRequest::new(&self.identity, self.request_id)) {
            Ok(message) => message,
            Err(e) => {
                log::error!("Failed to build heartbeat: {}", e);
                return;
            }
        };
        match self.handle.send_message(message).await {
            Ok(()) => self.stats.heartbeats_sent += 1,
            Err(e) => log::warn!("Heartbeat not sent: {}", e),
        }
    }
}
