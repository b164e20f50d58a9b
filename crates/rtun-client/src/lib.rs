//! rtun-client: reverse-tunnel client library.
//!
//! A [`ControlSession`] keeps one authenticated connection to the tunnel
//! server, requests public HTTP/HTTPS tunnels for local services, and opens a
//! [`ProxySession`] for every incoming public connection the server announces.
//! Each proxy session relays bytes between a fresh server connection and the
//! local service.
//!
//! # Quick Start
//!
//! ```no_run
//! use rtun_client::{Config, ControlSession, TunnelSpec};
//!
//! # async fn example() -> rtun_core::TunnelResult<()> {
//! let session = ControlSession::new(Config {
//!     server_hostname: "tunnel.example.com".into(),
//!     server_port: 4443,
//!     http: TunnelSpec {
//!         local_port: 8080,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! })?;
//!
//! session.service().await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod control;
pub mod proxy;
pub mod signal;
pub mod transport;
pub mod tunnels;
pub mod write_queue;

#[cfg(test)]
mod testing;

// Re-export primary public types.
pub use admission::{ProxyLimiter, ProxyPermit};
pub use config::{Config, TunnelSpec};
pub use control::{ControlSession, ControlState};
pub use proxy::{ProxySession, ProxyState};
pub use signal::CloseSignal;
pub use transport::{BoxedStream, Dialer, TlsDialer};
pub use tunnels::{TunnelBinding, TunnelTable};
pub use write_queue::WriteQueue;
