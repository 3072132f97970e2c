//! End-to-end channel runs against a local TCP worker manager.

use std::net::SocketAddr;
use std::time::Duration;

use edgelink_core::{
    ApMode, ChannelConfig, ChannelEvent, ChannelHandle, ChannelRuntime, ChannelState, IpFamily,
    RuntimeOptions, WorkerManagerErrorCode,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn allocate_response(servers: &[SocketAddr]) -> String {
    let servers: Vec<serde_json::Value> = servers
        .iter()
        .map(|addr| {
            serde_json::json!({
                "address": addr.ip().to_string(),
                "tcp": addr.port(),
                "tcps": 0,
            })
        })
        .collect();
    serde_json::json!({ "code": 0, "servers": servers }).to_string()
}

fn config() -> ChannelConfig {
    ChannelConfig {
        domains: vec!["ap.invalid".to_string()],
        ip_family: IpFamily::V4,
        ..Default::default()
    }
}

async fn start(servers: &[SocketAddr]) -> (ChannelHandle, UnboundedReceiver<ChannelEvent>) {
    let (handle, events) = ChannelRuntime::spawn(RuntimeOptions {
        ap: ApMode::Static {
            response: allocate_response(servers),
        },
        ..RuntimeOptions::default()
    })
    .unwrap();
    handle.initialize(config()).await.unwrap();
    handle
        .establish_connection("probe", r#"{"command":"allocate"}"#)
        .await
        .unwrap();
    (handle, events)
}

async fn next_event(events: &mut UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for channel event")
        .expect("channel runtime stopped")
}

async fn accept(listener: &TcpListener) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let (socket, _) = timeout(WAIT, listener.accept())
        .await
        .expect("timed out waiting for connection")
        .unwrap();
    let (read, write) = socket.into_split();
    (BufReader::new(read), write)
}

#[tokio::test]
async fn connects_exchanges_messages_and_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let (handle, mut events) = start(&[server_addr]).await;

    let (mut reader, mut writer) = accept(&listener).await;
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Ready {
            remote: server_addr
        }
    );

    handle
        .send_message(r#"{"command":"heartbeat","requestId":1}"#)
        .await
        .unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    assert_eq!(line.trim_end(), r#"{"command":"heartbeat","requestId":1}"#);

    writer
        .write_all(b"{\"command\":\"heartbeat\",\"requestId\":1}\n")
        .await
        .unwrap();
    match next_event(&mut events).await {
        ChannelEvent::Message { command, raw } => {
            assert_eq!(command, "heartbeat");
            assert!(raw.contains("\"requestId\":1"));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    writer.write_all(b"{\"requestId\":2}\n").await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Error {
            code: WorkerManagerErrorCode::ServerNoCommandError
        }
    );

    // A clean close keeps the server first in line.
    handle.close_channel(true, false).await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.state, ChannelState::ConnectedAp);
    assert_eq!(status.available, 1);
    assert_eq!(status.in_use, 0);

    handle.reconnect().await.unwrap();
    let _second = accept(&listener).await;
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Ready {
            remote: server_addr
        }
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn refused_connection_exhausts_pool_until_recycled() {
    let refused = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (handle, mut events) = start(&[refused]).await;

    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Error {
            code: WorkerManagerErrorCode::TcpConnectionError
        }
    );

    handle.close_channel(false, false).await.unwrap();
    handle.reconnect().await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Error {
            code: WorkerManagerErrorCode::NoAvailableWorkerManager
        }
    );

    handle.recycle_servers().await.unwrap();
    handle.reconnect().await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Error {
            code: WorkerManagerErrorCode::TcpConnectionError
        }
    );
}

#[tokio::test]
async fn peer_close_reports_socket_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let (handle, mut events) = start(&[server_addr]).await;

    let connection = accept(&listener).await;
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Ready { .. }
    ));

    drop(connection);
    assert_eq!(
        next_event(&mut events).await,
        ChannelEvent::Error {
            code: WorkerManagerErrorCode::ConnectionSocketError
        }
    );
    assert_eq!(handle.status().await.unwrap().in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn silent_worker_manager_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let (_handle, mut events) = start(&[server_addr]).await;

    // The listener never answers; the connection check evicts it.
    let code = loop {
        match events.recv().await {
            Some(ChannelEvent::Ready { .. }) => continue,
            Some(ChannelEvent::Error { code }) => break code,
            other => panic!("unexpected event: {other:?}"),
        }
    };
    assert_eq!(code, WorkerManagerErrorCode::ConnectionTimedout);
    drop(listener);
}
