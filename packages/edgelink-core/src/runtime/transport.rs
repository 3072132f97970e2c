//! Tokio transports to worker managers.
//!
//! TCP carries newline-delimited JSON, optionally inside TLS. UDP carries one
//! JSON document per datagram. Each transport runs as one spawned task that
//! posts connect results, errors and inbound messages as [`RuntimeEvent`]s
//! tagged with its [`TransportId`].

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use crate::channel::{TlsOptions, Transport, TransportFactory, TransportId};
use crate::error::TransportError;
use crate::pool::ConnectType;
use crate::protocol_constants::MAX_MESSAGE_LENGTH;

use super::spawner::{TaskSpawner, TokioSpawner};
use super::{EventSender, RuntimeEvent};

/// Builds the TLS client configuration (ring provider, webpki roots).
pub fn tls_client_config() -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Creates tokio-backed transports.
pub struct TokioTransportFactory {
    spawner: TokioSpawner,
    events: EventSender,
    tls_config: Option<Arc<ClientConfig>>,
}

impl TokioTransportFactory {
    pub fn new(spawner: TokioSpawner, events: EventSender) -> Self {
        Self {
            spawner,
            events,
            tls_config: None,
        }
    }

    /// Uses `config` for TLS connections instead of the webpki defaults.
    #[must_use]
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    fn tls_config(&mut self) -> Result<Arc<ClientConfig>, TransportError> {
        if let Some(config) = &self.tls_config {
            return Ok(Arc::clone(config));
        }
        let config = tls_client_config()?;
        self.tls_config = Some(Arc::clone(&config));
        Ok(config)
    }
}

impl TransportFactory for TokioTransportFactory {
    fn create(
        &mut self,
        id: TransportId,
        kind: ConnectType,
        tls: Option<TlsOptions>,
    ) -> Box<dyn Transport> {
        let tls = match (kind, tls) {
            (ConnectType::Tcp, Some(options)) => Some(
                self.tls_config()
                    .map(|config| (config, options.server_name)),
            ),
            _ => None,
        };

        Box::new(TokioTransport {
            id,
            kind,
            tls,
            spawner: self.spawner.clone(),
            events: self.events.clone(),
            remote: None,
            outbound: None,
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        })
    }
}

type TlsSetup = Result<(Arc<ClientConfig>, String), TransportError>;

/// One TCP or UDP connection.
struct TokioTransport {
    id: TransportId,
    kind: ConnectType,
    tls: Option<TlsSetup>,
    spawner: TokioSpawner,
    events: EventSender,
    remote: Option<SocketAddr>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Transport for TokioTransport {
    fn connect(&mut self, remote: SocketAddr) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.remote = Some(remote);
        self.outbound = Some(tx);

        let link = Link {
            id: self.id,
            events: self.events.clone(),
            connected: Arc::clone(&self.connected),
            cancel: self.cancel.clone(),
        };

        match self.kind {
            ConnectType::Tcp => {
                let tls = self.tls.take();
                self.spawner.spawn(run_tcp(link, remote, tls, rx));
            }
            ConnectType::Udp => {
                self.spawner.spawn(run_udp(link, remote, rx));
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send_message(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        match &self.outbound {
            Some(tx) => tx
                .send(message.to_string())
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::NotConnected),
        }
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn kind(&self) -> ConnectType {
        self.kind
    }

    fn close(&mut self) {
        self.cancel.cancel();
        self.outbound = None;
        self.connected.store(false, Ordering::Release);
    }
}

impl Drop for TokioTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// What a transport task needs to talk back to the channel.
struct Link {
    id: TransportId,
    events: EventSender,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Link {
    fn connect_result(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        let _ = self.events.send(RuntimeEvent::TransportConnect {
            id: self.id,
            connected,
        });
    }

    fn error(&self, error: TransportError) {
        self.connected.store(false, Ordering::Release);
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.events.send(RuntimeEvent::TransportError { id: self.id, error });
    }

    fn packet(&self, payload: String) {
        let _ = self.events.send(RuntimeEvent::TransportPacket {
            id: self.id,
            payload,
        });
    }
}

async fn run_tcp(
    link: Link,
    remote: SocketAddr,
    tls: Option<TlsSetup>,
    outbound: mpsc::UnboundedReceiver<String>,
) {
    let stream = tokio::select! {
        _ = link.cancel.cancelled() => return,
        result = TcpStream::connect(remote) => result,
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            log::warn!("[Transport] {} TCP connect to {} failed: {}", link.id, remote, e);
            link.connect_result(false);
            return;
        }
    };
    let _ = stream.set_nodelay(true);

    let Some(tls) = tls else {
        pump_lines(link, stream, outbound).await;
        return;
    };

    let (config, server_name) = match tls {
        Ok(setup) => setup,
        Err(e) => {
            log::warn!("[Transport] {} TLS setup failed: {}", link.id, e);
            link.connect_result(false);
            return;
        }
    };
    let name = match ServerName::try_from(server_name.clone()) {
        Ok(name) => name,
        Err(e) => {
            log::warn!("[Transport] {} invalid TLS name {}: {}", link.id, server_name, e);
            link.connect_result(false);
            return;
        }
    };

    let handshake = tokio::select! {
        _ = link.cancel.cancelled() => return,
        result = TlsConnector::from(config).connect(name, stream) => result,
    };
    match handshake {
        Ok(stream) => pump_lines(link, stream, outbound).await,
        Err(e) => {
            log::warn!("[Transport] {} TLS handshake with {} failed: {}", link.id, remote, e);
            link.connect_result(false);
        }
    }
}

/// Moves newline-delimited messages in both directions until closed.
async fn pump_lines<S>(link: Link, stream: S, mut outbound: mpsc::UnboundedReceiver<String>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    link.connect_result(true);
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_MESSAGE_LENGTH));

    loop {
        tokio::select! {
            _ = link.cancel.cancelled() => break,
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                if let Err(e) = framed.send(message).await {
                    link.error(TransportError::Io(e.to_string()));
                    break;
                }
            }
            line = framed.next() => match line {
                Some(Ok(line)) => {
                    if !line.trim().is_empty() {
                        link.packet(line);
                    }
                }
                Some(Err(e)) => {
                    link.error(TransportError::Io(e.to_string()));
                    break;
                }
                None => {
                    link.error(TransportError::Closed);
                    break;
                }
            }
        }
    }
    log::debug!("[Transport] {} stopped", link.id);
}

async fn run_udp(link: Link, remote: SocketAddr, mut outbound: mpsc::UnboundedReceiver<String>) {
    let local: SocketAddr = if remote.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = match UdpSocket::bind(local).await {
        Ok(socket) => socket,
        Err(e) => {
            log::warn!("[Transport] {} UDP bind failed: {}", link.id, e);
            link.connect_result(false);
            return;
        }
    };
    if let Err(e) = socket.connect(remote).await {
        log::warn!("[Transport] {} UDP connect to {} failed: {}", link.id, remote, e);
        link.connect_result(false);
        return;
    }
    link.connect_result(true);

    let mut buf = vec![0u8; MAX_MESSAGE_LENGTH];
    loop {
        tokio::select! {
            _ = link.cancel.cancelled() => break,
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                if let Err(e) = socket.send(message.as_bytes()).await {
                    link.error(e.into());
                    break;
                }
            }
            received = socket.recv(&mut buf) => match received {
                Ok(len) => {
                    let payload = String::from_utf8_lossy(&buf[..len]).trim().to_string();
                    if !payload.is_empty() {
                        link.packet(payload);
                    }
                }
                Err(e) => {
                    link.error(e.into());
                    break;
                }
            }
        }
    }
    log::debug!("[Transport] {} stopped", link.id);
}
