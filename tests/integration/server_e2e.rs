//! End-to-end SOCKS5 sessions through a listening server

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use nat66_socks::identity::Mark;
use nat66_socks::nat::MemoryNatController;
use nat66_socks::outbound::TargetAddr;
use nat66_socks::socks5::protocol::{
    REPLY_ADDRESS_TYPE_NOT_SUPPORTED, REPLY_COMMAND_NOT_SUPPORTED, REPLY_SUCCEEDED,
};

use super::{eventually, read_reply, socks5_connect, spawn_echo_server, test_server, LoopbackDial};

/// Method selection plus username/password with an empty password
async fn authenticate(stream: &mut TcpStream, user: &str) {
    let mut hello = vec![0x05, 0x01, 0x02, 0x01, user.len() as u8];
    hello.extend_from_slice(user.as_bytes());
    hello.push(0x00);
    stream.write_all(&hello).await.unwrap();

    let mut replies = [0u8; 4];
    stream.read_exact(&mut replies).await.unwrap();
    assert_eq!(replies, [0x05, 0x02, 0x01, 0x00]);
}

async fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_session_binds_user_and_relays() {
    let nat = Arc::new(MemoryNatController::new());
    let dialer = Arc::new(LoopbackDial::new(spawn_echo_server().await));
    let server = test_server(Arc::clone(&nat), Arc::clone(&dialer));
    let addr = server.local_addr().unwrap();
    let running = server.spawn();

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert_eq!(socks5_connect(&mut client, "alice", "example.com", 80).await, REPLY_SUCCEEDED);
    echo_roundtrip(&mut client, b"hello through nat66").await;

    assert_eq!(
        nat.binding(Mark::new(1)),
        Some("2001:db8:1:2:93af:71db:186d:6e90".parse().unwrap())
    );
    assert_eq!(
        dialer.dialed(),
        vec![(TargetAddr::Domain("example.com".into(), 80), Mark::new(1))]
    );

    drop(client);
    let handle = running.handle();
    eventually(|| handle.stats().completed == 1).await;
    assert_eq!(handle.active_sessions(), 0);
}

#[tokio::test]
async fn test_returning_user_keeps_mark() {
    let nat = Arc::new(MemoryNatController::new());
    let dialer = Arc::new(LoopbackDial::new(spawn_echo_server().await));
    let server = test_server(Arc::clone(&nat), Arc::clone(&dialer));
    let addr = server.local_addr().unwrap();
    let _running = server.spawn();

    for user in ["alice", "bob", "alice", "bob", "alice"] {
        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(socks5_connect(&mut client, user, "example.org", 443).await, REPLY_SUCCEEDED);
        echo_roundtrip(&mut client, user.as_bytes()).await;
    }

    let marks: Vec<u32> = dialer.dialed().iter().map(|(_, mark)| mark.get()).collect();
    assert_eq!(marks, vec![1, 2, 1, 2, 1]);
    assert_eq!(nat.calls(), 2);
    assert_eq!(
        nat.binding(Mark::new(2)),
        Some("2001:db8:1:2:1e0b:4cfd:9ec5:8ce9".parse().unwrap())
    );
}

#[tokio::test]
async fn test_concurrent_sessions_are_independent() {
    let nat = Arc::new(MemoryNatController::new());
    let dialer = Arc::new(LoopbackDial::new(spawn_echo_server().await));
    let server = test_server(Arc::clone(&nat), dialer);
    let addr = server.local_addr().unwrap();
    let _running = server.spawn();

    let clients: Vec<_> = (0..8)
        .map(|i| {
            tokio::spawn(async move {
                let user = format!("user{}", i % 3);
                let mut client = TcpStream::connect(addr).await.unwrap();
                assert_eq!(
                    socks5_connect(&mut client, &user, "svc.test", 8080).await,
                    REPLY_SUCCEEDED
                );
                echo_roundtrip(&mut client, format!("payload-{i}").as_bytes()).await;
            })
        })
        .collect();

    for client in clients {
        client.await.unwrap();
    }
    assert_eq!(nat.len(), 3);
}

#[tokio::test]
async fn test_ip_target_rejected() {
    let nat = Arc::new(MemoryNatController::new());
    let dialer = Arc::new(LoopbackDial::new(spawn_echo_server().await));
    let server = test_server(Arc::clone(&nat), Arc::clone(&dialer));
    let addr = server.local_addr().unwrap();
    let running = server.spawn();

    let mut client = TcpStream::connect(addr).await.unwrap();
    authenticate(&mut client, "alice").await;

    // CONNECT 192.0.2.1:80
    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 192, 0, 2, 1, 0, 80])
        .await
        .unwrap();
    assert_eq!(read_reply(&mut client).await, REPLY_ADDRESS_TYPE_NOT_SUPPORTED);

    // No binding and no dial for a rejected request
    let handle = running.handle();
    eventually(|| handle.stats().errored == 1).await;
    assert!(nat.is_empty());
    assert!(dialer.dialed().is_empty());
}

#[tokio::test]
async fn test_bind_command_rejected() {
    let nat = Arc::new(MemoryNatController::new());
    let dialer = Arc::new(LoopbackDial::new(spawn_echo_server().await));
    let server = test_server(Arc::clone(&nat), dialer);
    let addr = server.local_addr().unwrap();
    let _running = server.spawn();

    let mut client = TcpStream::connect(addr).await.unwrap();
    authenticate(&mut client, "bob").await;

    let mut request = vec![0x05, 0x02, 0x00, 0x03, 9];
    request.extend_from_slice(b"bind.test");
    request.extend_from_slice(&21u16.to_be_bytes());
    client.write_all(&request).await.unwrap();
    assert_eq!(read_reply(&mut client).await, REPLY_COMMAND_NOT_SUPPORTED);
    assert!(nat.is_empty());
}

#[tokio::test]
async fn test_no_auth_method_rejected() {
    let nat = Arc::new(MemoryNatController::new());
    let dialer = Arc::new(LoopbackDial::new(spawn_echo_server().await));
    let server = test_server(Arc::clone(&nat), dialer);
    let addr = server.local_addr().unwrap();
    let _running = server.spawn();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0xFF]);

    // Server closes the connection
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap();
    assert!(read.map(|n| n == 0).unwrap_or(true));
}
