//! Relay engine integration tests over loopback TCP

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use nat66_socks::connection::RelayEngine;
use nat66_socks::identity::Mark;
use nat66_socks::io::CopyEnd;
use nat66_socks::outbound::TargetAddr;
use nat66_socks::socks5::protocol::{CMD_CONNECT, REPLY_SUCCEEDED};
use nat66_socks::socks5::{Request, Socks5Negotiator};

use super::{read_reply, LoopbackDial};

/// Connected (client-side, proxy-side) loopback pair
async fn client_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

fn connect_request() -> Request {
    Request {
        command: CMD_CONNECT,
        target: TargetAddr::Domain("remote.test".into(), 443),
    }
}

#[tokio::test]
async fn test_remote_close_ends_session() {
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dialer = Arc::new(LoopbackDial::new(remote.local_addr().unwrap()));
    let engine = RelayEngine::new(dialer.clone());

    let (mut client, mut proxy_side) = client_pair().await;
    let relay = tokio::spawn(async move {
        engine
            .relay(&mut proxy_side, &connect_request(), Mark::new(7), &Socks5Negotiator)
            .await
    });

    let (mut upstream, _) = remote.accept().await.unwrap();
    assert_eq!(read_reply(&mut client).await, REPLY_SUCCEEDED);

    upstream.write_all(b"banner\r\n").await.unwrap();
    drop(upstream);

    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"banner\r\n");

    let result = relay.await.unwrap().unwrap();
    assert_eq!(result.upstream_to_client, 8);
    assert_eq!(result.end, CopyEnd::UpstreamToClient);
    assert_eq!(dialer.dialed(), vec![(connect_request().target, Mark::new(7))]);
}

#[tokio::test]
async fn test_client_close_ends_session() {
    let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let engine = RelayEngine::new(Arc::new(LoopbackDial::new(remote.local_addr().unwrap())));

    let (mut client, mut proxy_side) = client_pair().await;
    let relay = tokio::spawn(async move {
        engine
            .relay(&mut proxy_side, &connect_request(), Mark::new(1), &Socks5Negotiator)
            .await
    });

    let (mut upstream, _) = remote.accept().await.unwrap();
    assert_eq!(read_reply(&mut client).await, REPLY_SUCCEEDED);

    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    drop(client);

    // Upstream sees the request and then the close
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), upstream.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"GET / HTTP/1.0\r\n\r\n");

    let result = relay.await.unwrap().unwrap();
    assert_eq!(result.client_to_upstream, 18);
    assert_eq!(result.end, CopyEnd::ClientToUpstream);
}

#[tokio::test]
async fn test_bulk_transfer_through_small_buffers() {
    let echo = super::spawn_echo_server().await;
    let engine = RelayEngine::new(Arc::new(LoopbackDial::new(echo)));

    let (mut client, mut proxy_side) = client_pair().await;
    let relay = tokio::spawn(async move {
        engine
            .relay(&mut proxy_side, &connect_request(), Mark::new(1), &Socks5Negotiator)
            .await
    });
    assert_eq!(read_reply(&mut client).await, REPLY_SUCCEEDED);

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let (mut rd, mut wr) = client.into_split();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        wr.write_all(&payload).await.unwrap();
        wr
    });

    let mut echoed = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(10), rd.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, expected);

    drop(writer.await.unwrap());
    drop(rd);
    let result = relay.await.unwrap().unwrap();
    assert_eq!(result.client_to_upstream, expected.len() as u64);
}
