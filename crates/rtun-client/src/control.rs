//! Control session: the long-lived connection to the tunnel server.
//!
//! Lifecycle: `Init -> Connecting -> Authenticating -> Active -> Closed`.
//!
//! The session authenticates, requests one tunnel per enabled protocol and
//! then waits for `ReqProxy`, each of which opens a new [`ProxySession`] on a
//! fresh server connection. Proxy sessions are admitted through a
//! [`ProxyLimiter`]; requests over the cap are dropped. Any protocol error,
//! auth or tunnel rejection, or transport failure ends the session.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, trace, warn};

use rtun_core::messages::{Auth, AuthResp, NewTunnel, Ping, ReqTunnel};
use rtun_core::{
    decode_message, Message, Protocol, StreamDemux, TunnelError, TunnelResult, MM_VERSION,
    PROTOCOL_VERSION,
};

use crate::admission::ProxyLimiter;
use crate::config::Config;
use crate::proxy::ProxySession;
use crate::signal::CloseSignal;
use crate::transport::{Dialer, TlsDialer};
use crate::tunnels::{Assignment, TunnelBinding, TunnelTable};
use crate::write_queue::WriteQueue;

/// Lifecycle of the control session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Init,
    Connecting,
    /// `Auth` sent, waiting for `AuthResp`.
    Authenticating,
    /// Authenticated; tunnels requested and proxy requests accepted.
    Active,
    Closed,
}

pub struct ControlSession {
    config: Arc<Config>,
    dialer: Arc<dyn Dialer>,
    tunnels: Arc<TunnelTable>,
    limiter: ProxyLimiter,
    signal: CloseSignal,
    state: Mutex<ControlState>,
    client_id: Mutex<String>,
    closed_locally: AtomicBool,
    next_proxy_id: AtomicU64,
}

impl ControlSession {
    /// Session that dials the server over TLS.
    pub fn new(config: Config) -> TunnelResult<Self> {
        let dialer = TlsDialer::new()?;
        Ok(Self::with_dialer(config, Arc::new(dialer)))
    }

    /// Session that opens its connections through `dialer`.
    pub fn with_dialer(config: Config, dialer: Arc<dyn Dialer>) -> Self {
        let limiter = ProxyLimiter::new(config.max_proxy_count);
        Self {
            config: Arc::new(config),
            dialer,
            tunnels: Arc::new(TunnelTable::new()),
            limiter,
            signal: CloseSignal::new(),
            state: Mutex::new(ControlState::Init),
            client_id: Mutex::new(String::new()),
            closed_locally: AtomicBool::new(false),
            next_proxy_id: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ControlState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Client id assigned by the server (empty until authenticated).
    pub fn client_id(&self) -> String {
        self.client_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tunnels(&self) -> &TunnelTable {
        &self.tunnels
    }

    /// Proxy sessions currently running.
    pub fn active_proxies(&self) -> usize {
        self.limiter.active()
    }

    /// `ReqProxy` messages dropped because the proxy cap was reached.
    pub fn refused_proxies(&self) -> u64 {
        self.limiter.refused()
    }

    /// Stop the session. [`service`](Self::service) then returns `Ok(())`
    /// and every proxy session it started is torn down. Idempotent.
    pub fn close(&self) {
        self.closed_locally.store(true, Ordering::Release);
        self.shutdown();
    }

    fn shutdown(&self) {
        self.set_state(ControlState::Closed);
        if self.signal.trigger() {
            debug!("control session closed");
        }
    }

    fn set_state(&self, next: ControlState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ControlState::Closed {
            *state = next;
        }
    }

    /// Connect, authenticate, request tunnels and serve proxy requests until
    /// the session ends.
    ///
    /// Returns `Ok(())` after [`close`](Self::close), and the terminal error
    /// for any other ending (including the server hanging up).
    pub async fn service(&self) -> TunnelResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ControlState::Init => *state = ControlState::Connecting,
                ControlState::Closed => return Err(TunnelError::Closed),
                _ => {
                    return Err(TunnelError::Transport(
                        "control session is already running".into(),
                    ))
                }
            }
        }

        let result = match self.config.validate() {
            Ok(()) => self.serve().await,
            Err(e) => Err(e),
        };
        let closed_locally = self.closed_locally.load(Ordering::Acquire);
        self.shutdown();

        match result {
            Ok(()) => Ok(()),
            Err(TunnelError::Closed) if closed_locally => Ok(()),
            Err(TunnelError::Closed) => Err(TunnelError::Transport(
                "control connection lost".into(),
            )),
            Err(e) => {
                error!(code = e.code(), error = %e, "control session failed");
                Err(e)
            }
        }
    }

    async fn serve(&self) -> TunnelResult<()> {
        let addr = self.config.server_address();
        info!(%addr, "connecting to tunnel server");

        let stream = tokio::select! {
            _ = self.signal.closed() => return Err(TunnelError::Closed),
            dialed = self.dialer.dial_server(&addr) => dialed.map_err(|e| {
                TunnelError::Transport(format!("failed to connect to server {addr}: {e}"))
            })?,
        };

        let (mut reader, writer) = tokio::io::split(stream);
        let (queue, _) = WriteQueue::spawn(
            writer,
            self.config.write_queue_capacity,
            self.signal.clone(),
            "control",
        );

        self.set_state(ControlState::Authenticating);
        queue.send_message(&Message::Auth(self.auth_message())).await?;
        debug!(user = %self.config.user, "sent Auth");
        self.spawn_keepalive(queue.clone());

        let mut demux = StreamDemux::with_max_frame_len(self.config.max_frame_len);
        let mut buf = vec![0u8; self.config.read_buf_size];
        loop {
            let n = tokio::select! {
                _ = self.signal.closed() => return Err(TunnelError::Closed),
                read = reader.read(&mut buf) => read.map_err(|e| {
                    TunnelError::Transport(format!("control read failed: {e}"))
                })?,
            };
            if n == 0 {
                return Err(TunnelError::Transport(
                    "server closed the control connection".into(),
                ));
            }

            for frame in demux.feed_frames(&buf[..n])? {
                let msg = decode_message(&frame)?;
                trace!(msg_type = %msg.msg_type(), "control frame");
                self.dispatch(msg, &queue).await?;
            }
        }
    }

    fn auth_message(&self) -> Auth {
        Auth {
            version: PROTOCOL_VERSION.into(),
            mm_version: MM_VERSION.into(),
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            os: std::env::consts::OS.into(),
            arch: std::env::consts::ARCH.into(),
            client_id: String::new(),
        }
    }

    fn spawn_keepalive(&self, queue: WriteQueue) {
        let secs = self.config.ping_interval_secs;
        if secs == 0 {
            return;
        }
        let signal = self.signal.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = signal.closed() => break,
                    _ = ticker.tick() => {}
                }
                if queue.send_message(&Message::Ping(Ping {})).await.is_err() {
                    break;
                }
                trace!("sent keepalive Ping");
            }
        });
    }

    async fn dispatch(&self, msg: Message, queue: &WriteQueue) -> TunnelResult<()> {
        let state = self.state();
        match msg {
            Message::AuthResp(resp) if state == ControlState::Authenticating => {
                self.on_auth_resp(resp, queue).await
            }
            Message::NewTunnel(resp) if state == ControlState::Active => self.on_new_tunnel(resp),
            Message::ReqProxy(_) if state == ControlState::Active => {
                self.on_req_proxy();
                Ok(())
            }
            Message::Pong(_) => {
                trace!("Pong");
                Ok(())
            }
            other => Err(TunnelError::UnknownResponse(format!(
                "unexpected {} on control connection while {state:?}",
                other.msg_type()
            ))),
        }
    }

    async fn on_auth_resp(&self, resp: AuthResp, queue: &WriteQueue) -> TunnelResult<()> {
        if !resp.error.is_empty() {
            return Err(TunnelError::AuthFailed(resp.error));
        }
        if resp.client_id.is_empty() {
            return Err(TunnelError::AuthFailed(
                "server assigned an empty client id".into(),
            ));
        }

        info!(
            client_id = %resp.client_id,
            version = %resp.version,
            mm_version = %resp.mm_version,
            "authenticated"
        );
        *self.client_id.lock().unwrap_or_else(PoisonError::into_inner) = resp.client_id;
        self.set_state(ControlState::Active);

        let mut requested = 0;
        for protocol in [Protocol::Http, Protocol::Https] {
            let tunnel = self.config.tunnel(protocol);
            if !tunnel.enabled() {
                continue;
            }

            let req_id = new_req_id();
            self.tunnels.register(TunnelBinding {
                protocol,
                hostname: tunnel.hostname.clone(),
                subdomain: tunnel.subdomain.clone(),
                http_auth: tunnel.auth.clone(),
                local_port: tunnel.local_port,
                req_id: req_id.clone(),
                assigned_url: None,
            });
            queue
                .send_message(&Message::ReqTunnel(ReqTunnel {
                    req_id,
                    protocol: protocol.as_str().into(),
                    hostname: tunnel.hostname.clone(),
                    subdomain: tunnel.subdomain.clone(),
                    http_auth: tunnel.auth.clone(),
                    remote_port: 0,
                }))
                .await?;
            debug!(%protocol, port = tunnel.local_port, "requested tunnel");
            requested += 1;
        }

        if requested == 0 {
            warn!("no tunnels configured, nothing will be exposed");
        }
        Ok(())
    }

    fn on_new_tunnel(&self, resp: NewTunnel) -> TunnelResult<()> {
        if !resp.error.is_empty() {
            return Err(TunnelError::NewTunnel(resp.error));
        }

        let Some(protocol) = Protocol::parse(&resp.protocol) else {
            warn!(protocol = %resp.protocol, url = %resp.url, "ignoring tunnel of unsupported protocol");
            return Ok(());
        };

        if let Some(binding) = self.tunnels.get(protocol) {
            if binding.req_id != resp.req_id {
                debug!(
                    sent = %binding.req_id,
                    received = %resp.req_id,
                    "NewTunnel request id differs from ReqTunnel"
                );
            }
        }

        match self.tunnels.assign(protocol, &resp.url) {
            Assignment::Bound => {
                let port = self.config.tunnel(protocol).local_port;
                info!(%protocol, url = %resp.url, port, "tunnel established");
            }
            Assignment::NotRequested => {
                warn!(%protocol, url = %resp.url, "server opened a tunnel that was not requested");
            }
            Assignment::AlreadyBound(existing) => {
                warn!(%protocol, %existing, url = %resp.url, "tunnel already bound, keeping first url");
            }
        }
        Ok(())
    }

    fn on_req_proxy(&self) {
        let Some(permit) = self.limiter.try_acquire() else {
            warn!(
                max = self.limiter.max(),
                refused = self.limiter.refused(),
                "proxy limit reached, dropping ReqProxy"
            );
            return;
        };

        let id = self.next_proxy_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = ProxySession::new(
            id,
            self.client_id(),
            &self.config,
            self.tunnels.clone(),
            self.dialer.clone(),
        )
        .with_parent(self.signal.clone());

        debug!(proxy_id = id, active = self.limiter.active(), "starting proxy session");
        tokio::spawn(async move {
            let _permit = permit;
            match session.run().await {
                Ok(()) => debug!(proxy_id = id, "proxy session finished"),
                Err(e) => warn!(proxy_id = id, code = e.code(), error = %e, "proxy session failed"),
            }
        });
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.signal.trigger();
    }
}

/// Random request id for `ReqTunnel`.
fn new_req_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    use rtun_core::codec::encode_len;
    use rtun_core::messages::{ReqProxy, StartProxy};

    use crate::config::TunnelSpec;
    use crate::testing::{eventually, read_message, write_message, MockDialer, MockPeers};

    fn config() -> Config {
        Config {
            server_hostname: "tunnel.example.com".into(),
            server_port: 4443,
            user: "alice".into(),
            password: "secret".into(),
            http: TunnelSpec {
                hostname: "x.example.com".into(),
                subdomain: "x".into(),
                auth: "u:p".into(),
                local_port: 8080,
            },
            https: TunnelSpec {
                local_port: 8443,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn start(config: Config) -> (Arc<ControlSession>, MockPeers, JoinHandle<TunnelResult<()>>) {
        let (dialer, peers) = MockDialer::new();
        let session = Arc::new(ControlSession::with_dialer(config, dialer));
        let handle = {
            let session = session.clone();
            tokio::spawn(async move { session.service().await })
        };
        (session, peers, handle)
    }

    fn auth_ok(client_id: &str) -> Message {
        Message::AuthResp(AuthResp {
            version: "2".into(),
            mm_version: "1.7".into(),
            client_id: client_id.into(),
            error: String::new(),
        })
    }

    /// Drive the handshake up to `Active` with both tunnels bound.
    async fn establish(session: &ControlSession, server: &mut DuplexStream) {
        read_message(server).await;
        write_message(server, &auth_ok("abc")).await;
        for url in ["http://x.example.com", "https://x.example.com"] {
            let Message::ReqTunnel(req) = read_message(server).await else {
                panic!("expected ReqTunnel");
            };
            write_message(
                server,
                &Message::NewTunnel(NewTunnel {
                    req_id: req.req_id,
                    url: url.into(),
                    protocol: req.protocol,
                    error: String::new(),
                }),
            )
            .await;
        }
        eventually(|| session.tunnels().assigned_url(Protocol::Https).is_some()).await;
    }

    #[tokio::test]
    async fn auth_and_tunnel_requests() {
        let (session, mut peers, _handle) = start(config());
        let mut server = peers.next_server().await;

        let Message::Auth(auth) = read_message(&mut server).await else {
            panic!("expected Auth");
        };
        assert_eq!(auth.version, "2");
        assert_eq!(auth.mm_version, "1.7");
        assert_eq!(auth.user, "alice");
        assert_eq!(auth.password, "secret");
        assert_eq!(auth.os, std::env::consts::OS);
        assert!(auth.client_id.is_empty());
        assert_eq!(session.state(), ControlState::Authenticating);

        write_message(&mut server, &auth_ok("abc")).await;

        let Message::ReqTunnel(http) = read_message(&mut server).await else {
            panic!("expected ReqTunnel");
        };
        assert_eq!(http.protocol, "http");
        assert_eq!(http.hostname, "x.example.com");
        assert_eq!(http.subdomain, "x");
        assert_eq!(http.http_auth, "u:p");
        assert_eq!(http.req_id.len(), 16);

        let Message::ReqTunnel(https) = read_message(&mut server).await else {
            panic!("expected ReqTunnel");
        };
        assert_eq!(https.protocol, "https");
        assert_ne!(https.req_id, http.req_id);

        assert_eq!(session.state(), ControlState::Active);
        assert_eq!(session.client_id(), "abc");

        write_message(
            &mut server,
            &Message::NewTunnel(NewTunnel {
                req_id: http.req_id,
                url: "http://x.example.com".into(),
                protocol: "http".into(),
                error: String::new(),
            }),
        )
        .await;
        eventually(|| session.tunnels().assigned_url(Protocol::Http).is_some()).await;
        assert_eq!(
            session.tunnels().resolve("http://x.example.com").unwrap().local_port,
            8080
        );
    }

    #[tokio::test]
    async fn auth_failure_stops_before_tunnels() {
        let (session, mut peers, handle) = start(config());
        let mut server = peers.next_server().await;
        read_message(&mut server).await;

        write_message(
            &mut server,
            &Message::AuthResp(AuthResp {
                error: "bad token".into(),
                ..Default::default()
            }),
        )
        .await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::AuthFailed(ref m) if m == "bad token"));
        assert_eq!(err.code(), -101);
        assert_eq!(session.state(), ControlState::Closed);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "no ReqTunnel after failed auth");
    }

    #[tokio::test]
    async fn tunnel_rejection_ends_session() {
        let (_session, mut peers, handle) = start(config());
        let mut server = peers.next_server().await;
        read_message(&mut server).await;
        write_message(&mut server, &auth_ok("abc")).await;
        read_message(&mut server).await;

        write_message(
            &mut server,
            &Message::NewTunnel(NewTunnel {
                error: "subdomain taken".into(),
                ..Default::default()
            }),
        )
        .await;

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::NewTunnel(_)));
        assert_eq!(err.code(), -102);
    }

    #[tokio::test]
    async fn unsupported_tunnel_protocol_is_ignored() {
        let (session, mut peers, _handle) = start(config());
        let mut server = peers.next_server().await;
        read_message(&mut server).await;
        write_message(&mut server, &auth_ok("abc")).await;

        write_message(
            &mut server,
            &Message::NewTunnel(NewTunnel {
                url: "tcp://x.example.com:9000".into(),
                protocol: "tcp".into(),
                ..Default::default()
            }),
        )
        .await;
        write_message(&mut server, &Message::Pong(rtun_core::messages::Pong {})).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.state(), ControlState::Active);
    }

    #[tokio::test]
    async fn req_proxy_opens_registered_proxy() {
        let (session, mut peers, _handle) = start(config());
        let mut server = peers.next_server().await;
        establish(&session, &mut server).await;

        write_message(&mut server, &Message::ReqProxy(ReqProxy {})).await;

        let mut proxy = peers.next_server().await;
        let Message::RegProxy(reg) = read_message(&mut proxy).await else {
            panic!("expected RegProxy");
        };
        assert_eq!(reg.client_id, "abc");
        eventually(|| session.active_proxies() == 1).await;

        // The proxy resolves the URL bound by the control session.
        write_message(
            &mut proxy,
            &Message::StartProxy(StartProxy {
                url: "https://x.example.com".into(),
                client_addr: "198.51.100.7:40000".into(),
            }),
        )
        .await;
        let local = peers.next_local().await;
        assert_eq!(local.port, 8443);
        assert!(local.tls);

        // Proxy ends, its slot is released.
        drop(local);
        drop(proxy);
        eventually(|| session.active_proxies() == 0).await;
    }

    #[tokio::test]
    async fn proxy_cap_refuses_extra_requests() {
        let (session, mut peers, _handle) = start(Config {
            max_proxy_count: 1,
            ..config()
        });
        let mut server = peers.next_server().await;
        establish(&session, &mut server).await;

        write_message(&mut server, &Message::ReqProxy(ReqProxy {})).await;
        let _held = peers.next_server().await;
        eventually(|| session.active_proxies() == 1).await;

        write_message(&mut server, &Message::ReqProxy(ReqProxy {})).await;
        eventually(|| session.refused_proxies() == 1).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(peers.server.try_recv().is_err(), "refused request was dialled");
        assert_eq!(session.active_proxies(), 1);
        assert_eq!(session.state(), ControlState::Active);
    }

    #[tokio::test]
    async fn req_proxy_before_auth_is_protocol_error() {
        let (_session, mut peers, handle) = start(config());
        let mut server = peers.next_server().await;
        read_message(&mut server).await;

        write_message(&mut server, &Message::ReqProxy(ReqProxy {})).await;
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::UnknownResponse(_)));
        assert_eq!(err.code(), -100);
        assert!(peers.server.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_message_type_ends_session() {
        let (_session, mut peers, handle) = start(config());
        let mut server = peers.next_server().await;
        read_message(&mut server).await;

        let body = br#"{"Type":"Bogus","Payload":{}}"#;
        server
            .write_all(&encode_len(body.len() as u16))
            .await
            .unwrap();
        server.write_all(body).await.unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(TunnelError::UnknownResponse(_))
        ));
    }

    #[tokio::test]
    async fn server_hangup_is_an_error() {
        let (session, mut peers, handle) = start(config());
        let mut server = peers.next_server().await;
        read_message(&mut server).await;
        drop(server);

        assert!(matches!(
            handle.await.unwrap(),
            Err(TunnelError::Transport(_))
        ));
        assert_eq!(session.state(), ControlState::Closed);
    }

    #[tokio::test]
    async fn connect_failure() {
        let (dialer, _peers) = MockDialer::refusing_server();
        let session = ControlSession::with_dialer(config(), dialer);
        let err = session.service().await.unwrap_err();
        assert!(matches!(err, TunnelError::Transport(_)));
        assert_eq!(err.code(), -107);
        assert_eq!(session.state(), ControlState::Closed);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let (dialer, mut peers) = MockDialer::new();
        let session = ControlSession::with_dialer(
            Config {
                server_port: 0,
                ..config()
            },
            dialer,
        );
        assert!(matches!(
            session.service().await,
            Err(TunnelError::Config(_))
        ));
        assert!(peers.server.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_ends_service_cleanly() {
        let (session, mut peers, handle) = start(config());
        let mut server = peers.next_server().await;
        establish(&session, &mut server).await;

        write_message(&mut server, &Message::ReqProxy(ReqProxy {})).await;
        let mut proxy = peers.next_server().await;
        read_message(&mut proxy).await;

        session.close();
        session.close();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("service still running after close")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(session.state(), ControlState::Closed);

        // Proxy sessions go down with the control session.
        let mut rest = Vec::new();
        proxy.read_to_end(&mut rest).await.unwrap();
        eventually(|| session.active_proxies() == 0).await;

        assert!(matches!(session.service().await, Err(TunnelError::Closed)));
    }

    #[tokio::test]
    async fn keepalive_pings() {
        let (_session, mut peers, _handle) = start(Config {
            ping_interval_secs: 1,
            ..config()
        });
        let mut server = peers.next_server().await;
        read_message(&mut server).await;
        assert!(matches!(read_message(&mut server).await, Message::Ping(_)));
    }
}
