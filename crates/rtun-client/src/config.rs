//! Static client configuration.
//!
//! `Config` is built once at startup (see the `rtun` binary for file and flag
//! parsing) and handed to [`ControlSession::new`](crate::ControlSession::new).
//! Nothing in the library reads global settings.

use rtun_core::{Protocol, TunnelError, TunnelResult, MAX_FRAME_LEN};

/// Default socket read buffer size in bytes.
pub const DEFAULT_READ_BUF_SIZE: usize = 8192;

/// Default cap on concurrently open proxy sessions.
pub const DEFAULT_MAX_PROXY_COUNT: usize = 10;

/// Default depth of each connection's write queue.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 10;

/// What to expose for one tunnel protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Requested public hostname (may be empty).
    pub hostname: String,
    /// Requested subdomain (may be empty; some servers ignore it).
    pub subdomain: String,
    /// HTTP basic auth (`user:password`) the server should enforce.
    pub auth: String,
    /// Local service port. Zero disables the tunnel.
    pub local_port: u16,
}

impl TunnelSpec {
    pub fn enabled(&self) -> bool {
        self.local_port > 0
    }
}

/// Configuration for a reverse-tunnel client run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Tunnel server hostname or IP.
    pub server_hostname: String,
    pub server_port: u16,
    pub user: String,
    pub password: String,
    pub http: TunnelSpec,
    pub https: TunnelSpec,
    /// Size of each socket read.
    pub read_buf_size: usize,
    /// Proxy sessions allowed at once; further requests are refused.
    pub max_proxy_count: usize,
    /// Buffers queued per connection before producers block.
    pub write_queue_capacity: usize,
    /// Keepalive `Ping` interval in seconds (0 = disabled).
    pub ping_interval_secs: u64,
    /// Largest frame accepted during handshakes.
    pub max_frame_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_hostname: String::new(),
            server_port: 0,
            user: String::new(),
            password: String::new(),
            http: TunnelSpec::default(),
            https: TunnelSpec::default(),
            read_buf_size: DEFAULT_READ_BUF_SIZE,
            max_proxy_count: DEFAULT_MAX_PROXY_COUNT,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            ping_interval_secs: 0,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl Config {
    /// `host:port` of the tunnel server.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_hostname, self.server_port)
    }

    pub fn tunnel(&self, protocol: Protocol) -> &TunnelSpec {
        match protocol {
            Protocol::Http => &self.http,
            Protocol::Https => &self.https,
        }
    }

    /// Check the preconditions a control session needs before connecting.
    pub fn validate(&self) -> TunnelResult<()> {
        if self.server_hostname.is_empty() {
            return Err(TunnelError::Config("server hostname is empty".into()));
        }
        if self.server_port == 0 {
            return Err(TunnelError::Config("server port is not set".into()));
        }
        if self.read_buf_size == 0 {
            return Err(TunnelError::Config("read buffer size must be positive".into()));
        }
        if self.max_proxy_count == 0 {
            return Err(TunnelError::Config("max proxy count must be positive".into()));
        }
        if self.write_queue_capacity == 0 {
            return Err(TunnelError::Config(
                "write queue capacity must be positive".into(),
            ));
        }
        if self.max_frame_len == 0 || self.max_frame_len > MAX_FRAME_LEN {
            return Err(TunnelError::Config(format!(
                "max frame length must be within 1..={MAX_FRAME_LEN}"
            )));
        }
        Ok(())
    }
}
