//! Proxy session: one relayed public connection.
//!
//! The session dials the tunnel server, registers itself with `RegProxy`, and
//! waits for `StartProxy`. That frame names the public URL the connection came
//! in on; the URL is resolved to a local port through the control session's
//! [`TunnelTable`], the local service is dialled, and from then on the server
//! connection is a transparent byte pipe to the local service.
//!
//! Tasks per session: server reader (inside [`ProxySession::run`]) and server
//! writer; after `StartProxy`, local reader and local writer. All of them stop
//! when the session's [`CloseSignal`] fires.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, trace, warn};

use rtun_core::messages::{RegProxy, StartProxy};
use rtun_core::{decode_message, Chunk, Message, StreamDemux, TunnelError, TunnelResult};

use crate::config::Config;
use crate::signal::CloseSignal;
use crate::transport::{BoxedStream, Dialer};
use crate::tunnels::TunnelTable;
use crate::write_queue::WriteQueue;

/// Lifecycle of a proxy session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Init,
    /// Connected to the server, waiting for `StartProxy`.
    Handshaking,
    /// Relaying bytes between server and local service.
    Streaming,
    Closed,
}

pub struct ProxySession {
    id: u64,
    client_id: String,
    server_addr: String,
    tunnels: Arc<TunnelTable>,
    dialer: Arc<dyn Dialer>,
    read_buf_size: usize,
    queue_capacity: usize,
    max_frame_len: usize,
    parent: Option<CloseSignal>,
    signal: CloseSignal,
    state: Mutex<ProxyState>,
}

impl ProxySession {
    pub fn new(
        id: u64,
        client_id: impl Into<String>,
        config: &Config,
        tunnels: Arc<TunnelTable>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            id,
            client_id: client_id.into(),
            server_addr: config.server_address(),
            tunnels,
            dialer,
            read_buf_size: config.read_buf_size.max(1),
            queue_capacity: config.write_queue_capacity,
            max_frame_len: config.max_frame_len,
            parent: None,
            signal: CloseSignal::new(),
            state: Mutex::new(ProxyState::Init),
        }
    }

    /// Close this session whenever `parent` fires (control session shutdown).
    pub fn with_parent(mut self, parent: CloseSignal) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tear the session down. Safe to call any number of times, from any
    /// task.
    pub fn close(&self) {
        self.set_state(ProxyState::Closed);
        if self.signal.trigger() {
            debug!(proxy_id = self.id, "proxy session closed");
        }
    }

    fn set_state(&self, next: ProxyState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != ProxyState::Closed {
            *state = next;
        }
    }

    /// Run the session to completion.
    ///
    /// Returns `Ok(())` when the relay ends because either side hung up or
    /// [`close`](Self::close) was called, and the terminal error otherwise.
    /// The session is closed when this returns.
    pub async fn run(&self) -> TunnelResult<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                ProxyState::Init => *state = ProxyState::Handshaking,
                ProxyState::Closed => return Err(TunnelError::Closed),
                _ => {
                    return Err(TunnelError::Transport(
                        "proxy session is already running".into(),
                    ))
                }
            }
        }

        if let Some(parent) = self.parent.clone() {
            let signal = self.signal.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = parent.closed() => { signal.trigger(); }
                    _ = signal.closed() => {}
                }
            });
        }

        let result = match self.serve().await {
            Err(TunnelError::Closed) => Ok(()),
            other => other,
        };
        self.close();
        result
    }

    async fn serve(&self) -> TunnelResult<()> {
        let server = tokio::select! {
            _ = self.signal.closed() => return Err(TunnelError::Closed),
            dialed = self.dialer.dial_server(&self.server_addr) => dialed.map_err(|e| {
                TunnelError::Transport(format!(
                    "failed to connect to server {}: {e}",
                    self.server_addr
                ))
            })?,
        };
        debug!(proxy_id = self.id, addr = %self.server_addr, "proxy connected to server");

        let (mut server_rd, server_wr) = tokio::io::split(server);
        let (server_queue, _) = WriteQueue::spawn(
            server_wr,
            self.queue_capacity,
            self.signal.clone(),
            "proxy-server",
        );
        server_queue
            .send_message(&Message::RegProxy(RegProxy {
                client_id: self.client_id.clone(),
            }))
            .await?;

        // Moves into the local reader once streaming starts, so that the
        // server writer drains and closes the session after a local EOF.
        let mut server_queue = Some(server_queue);
        let mut local_queue: Option<WriteQueue> = None;
        let mut demux = StreamDemux::with_max_frame_len(self.max_frame_len);
        let mut buf = vec![0u8; self.read_buf_size];

        loop {
            let n = tokio::select! {
                _ = self.signal.closed() => return Ok(()),
                read = server_rd.read(&mut buf) => read.map_err(|e| {
                    TunnelError::Transport(format!("proxy server read failed: {e}"))
                })?,
            };

            if n == 0 {
                return match local_queue.take() {
                    Some(queue) => {
                        debug!(proxy_id = self.id, "server hung up, draining to local");
                        drop(queue);
                        self.signal.closed().await;
                        Ok(())
                    }
                    None => Err(TunnelError::Transport(
                        "server closed proxy connection before StartProxy".into(),
                    )),
                };
            }

            demux.feed(&buf[..n]);
            while let Some(chunk) = demux.next_chunk()? {
                match chunk {
                    Chunk::Frame(frame) => match decode_message(&frame)? {
                        Message::StartProxy(start) => {
                            let Some(queue) = server_queue.take() else {
                                return Err(TunnelError::UnknownResponse(
                                    "duplicate StartProxy".into(),
                                ));
                            };
                            local_queue = Some(self.start_proxy(start, queue).await?);
                            demux.switch_to_raw();
                        }
                        other => {
                            return Err(TunnelError::UnknownResponse(format!(
                                "unexpected {} on proxy connection",
                                other.msg_type()
                            )))
                        }
                    },
                    Chunk::Raw(data) => {
                        if let Some(queue) = &local_queue {
                            trace!(proxy_id = self.id, bytes = data.len(), "server -> local");
                            queue.send(data).await?;
                        }
                    }
                }
            }
        }
    }

    /// Resolve the target, dial the local service and start the local side
    /// of the relay. Returns the local write queue.
    async fn start_proxy(
        &self,
        start: StartProxy,
        server_queue: WriteQueue,
    ) -> TunnelResult<WriteQueue> {
        let binding = self
            .tunnels
            .resolve(&start.url)
            .ok_or_else(|| TunnelError::UnknownProxyUrl(start.url.clone()))?;
        let tls = binding.protocol.local_tls();
        let port = binding.local_port;

        let local: BoxedStream = tokio::select! {
            _ = self.signal.closed() => return Err(TunnelError::Closed),
            dialed = self.dialer.dial_local(port, tls) => dialed.map_err(|e| {
                TunnelError::ConnectLocal(format!("{} service on port {port}: {e}", binding.protocol))
            })?,
        };

        let (local_rd, local_wr) = tokio::io::split(local);
        let (local_queue, _) = WriteQueue::spawn(
            local_wr,
            self.queue_capacity,
            self.signal.clone(),
            "proxy-local",
        );
        self.set_state(ProxyState::Streaming);

        info!(
            proxy_id = self.id,
            url = %start.url,
            client_addr = %start.client_addr,
            protocol = %binding.protocol,
            port,
            "proxy streaming"
        );

        tokio::spawn(pump_local(
            local_rd,
            server_queue,
            self.signal.clone(),
            self.read_buf_size,
            self.id,
        ));
        Ok(local_queue)
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        self.signal.trigger();
    }
}

/// Local service -> server direction of the relay.
async fn pump_local<R>(
    mut reader: R,
    server_queue: WriteQueue,
    signal: CloseSignal,
    buf_size: usize,
    proxy_id: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; buf_size];
    loop {
        let n = tokio::select! {
            _ = signal.closed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(proxy_id, "local service hung up, draining to server");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(proxy_id, error = %e, "local read failed, closing proxy");
                    signal.trigger();
                    break;
                }
            },
        };

        trace!(proxy_id, bytes = n, "local -> server");
        if server_queue.send(buf[..n].to_vec()).await.is_err() {
            break;
        }
    }
}
