//! Discovery protocol tests. The responder is driven over loopback unicast
//! (its listener is bound on the wildcard address), so nothing here depends
//! on multicast routing being available.

use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use drover::config::DiscoveryConfig;
use drover::discovery::{parse_endpoint, scan, Responder};

fn test_config(window_ms: u64) -> DiscoveryConfig {
    DiscoveryConfig {
        window: Duration::from_millis(window_ms),
        read_timeout: Duration::from_millis(100),
        ..DiscoveryConfig::default()
    }
    // An ephemeral reply port; the ping advertises whatever was bound.
    .with_reply_port(0)
}

#[tokio::test]
async fn scan_with_no_workers_is_empty_after_the_window() {
    let config = test_config(400);

    let started = Instant::now();
    let mut rx = scan(&config).await.unwrap();
    let reply = rx.recv().await;
    let elapsed = started.elapsed();

    assert!(reply.is_none(), "expected no replies, got {reply:?}");
    assert!(
        elapsed >= Duration::from_millis(400),
        "scan ended before the window: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(3),
        "scan overran the window: {elapsed:?}"
    );
}

#[tokio::test]
async fn scan_rejects_non_multicast_group() {
    let config = DiscoveryConfig {
        group: "127.0.0.1:9999".parse().unwrap(),
        ..test_config(200)
    };
    assert!(scan(&config).await.is_err());
}

#[tokio::test]
async fn responder_replies_with_rpc_endpoint() {
    let group = "239.192.0.1:39999".parse().unwrap();
    let responder = Responder::new(group, 4242, None).await.unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(responder.run(shutdown.clone()));

    // A reply socket standing in for a scanning client.
    let reply_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let reply_port = reply_socket.local_addr().unwrap().port();

    // Ping the responder directly over unicast; its listener is bound on
    // the wildcard address, so the group route is not needed.
    let ping = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let payload = format!("127.0.0.1:{reply_port}");
    ping.send_to(payload.as_bytes(), ("127.0.0.1", 39999))
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), reply_socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for discovery reply")
        .unwrap();

    let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
    let endpoint = parse_endpoint(&reply).expect("reply must be host:port");
    assert_eq!(endpoint.port(), 4242);

    shutdown.cancel();
}

#[tokio::test]
async fn responder_drops_malformed_pings() {
    let group = "239.192.0.1:39998".parse().unwrap();
    let responder = Responder::new(group, 4243, None).await.unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(responder.run(shutdown.clone()));

    let reply_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let reply_port = reply_socket.local_addr().unwrap().port();

    let ping = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // A garbage ping first; the responder must log it and keep serving.
    ping.send_to(b"not an endpoint", ("127.0.0.1", 39998))
        .await
        .unwrap();
    ping.send_to(
        format!("127.0.0.1:{reply_port}").as_bytes(),
        ("127.0.0.1", 39998),
    )
    .await
    .unwrap();

    let mut buf = [0u8; 1024];
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), reply_socket.recv_from(&mut buf))
        .await
        .expect("responder stopped after a malformed ping")
        .unwrap();

    assert!(parse_endpoint(&String::from_utf8_lossy(&buf[..n])).is_ok());

    shutdown.cancel();
}

#[tokio::test]
async fn responder_rejects_non_multicast_group() {
    let group = "10.0.0.1:39997".parse().unwrap();
    assert!(Responder::new(group, 4244, None).await.is_err());
}
