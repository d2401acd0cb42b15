use std::time::Duration;

/// Server-side tunables. The defaults match the protocol's reference
/// deployment and are safe to use as-is.
#[derive(Clone)]
pub struct ServerConfig {
    /// Depth of the per-client outgoing frame queue.
    pub outgoing_queue_cap: usize,
    /// Depth of the per-request inbound value queue (InStream / Chat).
    /// A full queue blocks the connection's read loop, which is the
    /// intended backpressure signal towards slow handlers.
    pub incoming_queue_cap: usize,
    /// Write deadline for a single frame. A missed deadline fails the
    /// connection.
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            outgoing_queue_cap: 4096,
            incoming_queue_cap: 4096,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Client-side tunables.
#[derive(Clone)]
pub struct ClientConfig {
    /// Dial target, host:port.
    pub address: String,
    /// Optional SOCKS5 proxy address. None or empty means direct dial.
    pub socks5: Option<String>,
    /// Default per-request timeout in milliseconds, adjustable later with
    /// [set_timeout](crate::client::RpcClient::set_timeout). 0 means no
    /// response is expected (fire-and-forget).
    pub timeout_ms: i64,
    /// Depth of the outgoing frame channel.
    pub sending_cap: usize,
    /// Write deadline for a single frame.
    pub write_timeout: Duration,
    /// Client identity presented in the handshake. 0 picks the
    /// process-wide default id, see
    /// [set_default_client_id](crate::client::set_default_client_id).
    pub client_id: i64,
}

impl ClientConfig {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            socks5: None,
            timeout_ms: 30_000,
            sending_cap: 4096,
            write_timeout: Duration::from_secs(30),
            client_id: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.outgoing_queue_cap, 4096);
        assert_eq!(c.incoming_queue_cap, 4096);
        assert_eq!(c.write_timeout, Duration::from_secs(10));
        let c = ClientConfig::new("127.0.0.1:9999");
        assert_eq!(c.timeout_ms, 30_000);
        assert_eq!(c.write_timeout, Duration::from_secs(30));
        assert!(c.socks5.is_none());
        assert_eq!(c.client_id, 0);
    }
}
