//! Shutdown and draining

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use nat66_socks::connection::ServerState;
use nat66_socks::nat::MemoryNatController;
use nat66_socks::socks5::protocol::REPLY_SUCCEEDED;

use super::{eventually, socks5_connect, spawn_echo_server, test_server, LoopbackDial};

#[tokio::test]
async fn test_shutdown_without_sessions() {
    let dialer = Arc::new(LoopbackDial::new(spawn_echo_server().await));
    let server = test_server(Arc::new(MemoryNatController::new()), dialer);
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    assert_eq!(handle.state(), ServerState::Stopped);

    let running = server.spawn();
    eventually(|| handle.state() == ServerState::Listening).await;

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), running.wait())
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.stopped())
        .await
        .unwrap();

    assert_eq!(handle.state(), ServerState::Stopped);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_in_flight_session_survives_shutdown() {
    let dialer = Arc::new(LoopbackDial::new(spawn_echo_server().await));
    let server = test_server(Arc::new(MemoryNatController::new()), dialer);
    let addr = server.local_addr().unwrap();
    let running = server.spawn();
    let handle = running.handle();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(socks5_connect(&mut client, "alice", "example.com", 80).await, REPLY_SUCCEEDED);

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), running.wait())
        .await
        .unwrap()
        .unwrap();

    // Listener is gone but the session keeps relaying
    assert_eq!(handle.state(), ServerState::Draining);
    assert!(TcpStream::connect(addr).await.is_err());
    assert_eq!(handle.active_sessions(), 1);

    client.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");

    // Draining does not finish on its own
    let stopped = tokio::time::timeout(Duration::from_millis(100), handle.stopped()).await;
    assert!(stopped.is_err());
    assert_eq!(handle.state(), ServerState::Draining);

    drop(client);
    tokio::time::timeout(Duration::from_secs(5), handle.stopped())
        .await
        .unwrap();
    assert_eq!(handle.state(), ServerState::Stopped);
    assert_eq!(handle.stats().completed, 1);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let dialer = Arc::new(LoopbackDial::new(spawn_echo_server().await));
    let server = test_server(Arc::new(MemoryNatController::new()), dialer);
    let running = server.spawn();
    let handle = running.handle();

    handle.shutdown();
    handle.shutdown();
    running.wait().await.unwrap();

    handle.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle.stopped())
        .await
        .unwrap();
}
