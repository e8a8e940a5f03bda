use std::net::SocketAddr;
use std::time::Duration;

/// Default multicast group and port for worker discovery.
pub const DEFAULT_GROUP: &str = "239.192.0.1:9999";

/// Default port on which the client listens for discovery replies.
pub const DEFAULT_CLIENT_DISCOVERY_PORT: u16 = 9998;

/// Default port on which the dashboard listens for discovery replies.
pub const DEFAULT_DASHBOARD_DISCOVERY_PORT: u16 = 9997;

/// Default port on which workers serve RPC requests.
pub const DEFAULT_RPC_PORT: u16 = 5432;

/// Default port on which the dashboard serves HTTP.
pub const DEFAULT_HTTP_PORT: u16 = 1248;

/// Parameters of one discovery scan.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Multicast group the ping is sent to.
    pub group: SocketAddr,
    /// Local port replies are collected on. Zero binds an ephemeral port;
    /// the ping always advertises the port actually bound.
    pub reply_port: u16,
    /// How long the scan collects replies.
    pub window: Duration,
    /// Per-read timeout, so the window deadline is honored promptly.
    pub read_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.parse().unwrap(),
            reply_port: DEFAULT_CLIENT_DISCOVERY_PORT,
            window: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
        }
    }
}

impl DiscoveryConfig {
    pub fn with_reply_port(mut self, port: u16) -> Self {
        self.reply_port = port;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Configuration of one worker node.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Port the RPC server listens on; also the port advertised in
    /// discovery replies.
    pub rpc_port: u16,
    /// Maximum 5-minute load average before new jobs are rejected.
    pub load_limit: f64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            rpc_port: DEFAULT_RPC_PORT,
            load_limit: 5.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_group_is_multicast() {
        let config = DiscoveryConfig::default();
        assert!(config.group.ip().is_multicast());
        assert_eq!(config.group.port(), 9999);
    }

    #[test]
    fn default_windows() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.window, Duration::from_secs(5));
        assert_eq!(config.read_timeout, Duration::from_secs(1));
    }

    #[test]
    fn default_worker_limits() {
        let config = WorkerConfig::default();
        assert_eq!(config.rpc_port, 5432);
        assert_eq!(config.load_limit, 5.0);
    }
}
