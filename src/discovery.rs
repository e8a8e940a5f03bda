//! Worker discovery over IPv4 UDP multicast.
//!
//! A scan binds a unicast reply socket, multicasts its own reply endpoint
//! to the group, and collects `host:port` replies until the scan window
//! closes. Workers run a [`Responder`] that joins the group and answers
//! every ping with their RPC endpoint. Payloads are ASCII `host:port` in a
//! single datagram; both directions use the same schema.
//!
//! Loss of a ping or a reply is silent. A scan simply yields fewer
//! endpoints; callers retry whole scans, never individual reads.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::error::{PoolError, Result};
use crate::net::{external_ipv4, multicast_interface_ipv4};

/// Discovery datagrams never exceed this size.
const MAX_DATAGRAM: usize = 1024;

/// Parses a discovery payload of the form `host:port`.
pub fn parse_endpoint(payload: &str) -> Result<SocketAddr> {
    payload
        .trim()
        .parse()
        .map_err(|_| PoolError::MalformedEndpoint(payload.to_string()))
}

/// Runs one discovery scan: ping the group, then yield reply payloads until
/// the window closes.
///
/// The returned channel is a bounded, finite sequence of endpoint strings.
/// Duplicates are possible and there is no ordering guarantee; it closes
/// when the deadline fires or a non-timeout read error occurs.
pub async fn scan(config: &DiscoveryConfig) -> Result<mpsc::Receiver<String>> {
    if !config.group.ip().is_multicast() {
        return Err(PoolError::NotMulticast(config.group));
    }

    // Listen before pinging so no reply is lost.
    let socket = UdpSocket::bind(("0.0.0.0", config.reply_port))
        .await
        .map_err(PoolError::DiscoveryBind)?;
    let reply_port = socket.local_addr()?.port();
    tracing::info!(port = reply_port, "discovery listening for replies");

    let ip = external_ipv4()?;
    let payload = format!("{ip}:{reply_port}");
    match socket.send_to(payload.as_bytes(), config.group).await {
        // A failed send is indistinguishable from the ping being lost on
        // the wire; the scan just comes back empty.
        Err(e) => {
            tracing::warn!(group = %config.group, error = %e, "failed to send discovery ping")
        }
        Ok(_) => {
            tracing::info!(group = %config.group, payload = %payload, "sent discovery ping")
        }
    }

    let (tx, rx) = mpsc::channel(16);
    let window = config.window;
    let read_timeout = config.read_timeout;

    tokio::spawn(async move {
        let deadline = Instant::now() + window;
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::info!("discovery window closed");
                break;
            }
            match timeout(read_timeout.min(remaining), socket.recv_from(&mut buf)).await {
                // Per-read timeout; loop around and re-check the deadline.
                Err(_) => continue,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "discovery read failed");
                    break;
                }
                Ok(Ok((n, from))) => {
                    let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
                    tracing::info!(from = %from, reply = %reply, "discovery ack");
                    if tx.send(reply).await.is_err() {
                        // Consumer hung up; no point finishing the window.
                        break;
                    }
                }
            }
        }
    });

    Ok(rx)
}

/// Answers multicast discovery pings with this worker's RPC endpoint.
pub struct Responder {
    socket: UdpSocket,
    reply: String,
}

impl Responder {
    /// Joins `group` and prepares the `external_ip:rpc_port` reply payload.
    ///
    /// `interface` selects the interface to join on; `None` joins on the
    /// first multicast-capable one. The listener sets `SO_REUSEADDR` so
    /// several workers can share a machine.
    pub async fn new(
        group: SocketAddr,
        rpc_port: u16,
        interface: Option<Ipv4Addr>,
    ) -> Result<Self> {
        let group = match group {
            SocketAddr::V4(v4) if v4.ip().is_multicast() => v4,
            other => return Err(PoolError::NotMulticast(other)),
        };

        let join_on = match interface {
            Some(ip) => ip,
            None => multicast_interface_ipv4()?,
        };

        let socket = multicast_listener(group.port())?;
        socket.join_multicast_v4(*group.ip(), join_on)?;

        let ip = external_ipv4()?;
        let reply = format!("{ip}:{rpc_port}");
        tracing::info!(group = %group, interface = %join_on, reply = %reply, "joined multicast group");

        Ok(Self { socket, reply })
    }

    /// Serves pings until the token fires. Malformed pings are logged and
    /// dropped; reply failures never stop the loop.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("discovery responder stopping");
                    return;
                }
                read = self.socket.recv_from(&mut buf) => match read {
                    Ok(read) => read,
                    Err(e) => {
                        tracing::error!(error = %e, "multicast read failed");
                        return;
                    }
                },
            };

            let payload = String::from_utf8_lossy(&buf[..n]).into_owned();
            tracing::info!(from = %from, payload = %payload, "discovery ping");

            let reply_to = match parse_endpoint(&payload) {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping malformed ping");
                    continue;
                }
            };

            if let Err(e) = self.reply_to(reply_to).await {
                tracing::warn!(to = %reply_to, error = %e, "failed to send discovery reply");
            }
        }
    }

    async fn reply_to(&self, addr: SocketAddr) -> Result<()> {
        // Short-lived unicast socket, one reply per ping.
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.send_to(self.reply.as_bytes(), addr).await?;
        Ok(())
    }
}

/// Builds the shared multicast listener socket. tokio cannot set
/// `SO_REUSEADDR` before bind, so the socket is built with socket2 first.
fn multicast_listener(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_endpoint() {
        let addr = parse_endpoint("192.168.1.10:5432").unwrap();
        assert_eq!(addr.port(), 5432);
        assert_eq!(addr.ip().to_string(), "192.168.1.10");
    }

    #[test]
    fn parse_trims_whitespace() {
        assert!(parse_endpoint("127.0.0.1:9999\n").is_ok());
    }

    #[test]
    fn parse_rejects_garbage() {
        for payload in ["", "garbage", "127.0.0.1", "127.0.0.1:notaport"] {
            assert!(
                matches!(parse_endpoint(payload), Err(PoolError::MalformedEndpoint(_))),
                "expected {payload:?} to be rejected"
            );
        }
    }
}
