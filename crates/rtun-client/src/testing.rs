//! In-memory dialer and frame helpers for session tests.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use rtun_core::codec::{decode_len, LENGTH_PREFIX_SIZE};
use rtun_core::{decode_message, encode_frame, Message};

use crate::transport::{BoxedStream, DialFuture, Dialer};

const PIPE_SIZE: usize = 64 * 1024;

/// A local connection opened through [`MockDialer`].
pub(crate) struct LocalDial {
    pub port: u16,
    pub tls: bool,
    pub stream: DuplexStream,
}

/// The far ends of every connection a [`MockDialer`] opened.
pub(crate) struct MockPeers {
    pub server: mpsc::UnboundedReceiver<DuplexStream>,
    pub local: mpsc::UnboundedReceiver<LocalDial>,
}

impl MockPeers {
    pub async fn next_server(&mut self) -> DuplexStream {
        tokio::time::timeout(Duration::from_secs(2), self.server.recv())
            .await
            .expect("no server dial")
            .expect("dialer dropped")
    }

    pub async fn next_local(&mut self) -> LocalDial {
        tokio::time::timeout(Duration::from_secs(2), self.local.recv())
            .await
            .expect("no local dial")
            .expect("dialer dropped")
    }
}

pub(crate) struct MockDialer {
    server_tx: mpsc::UnboundedSender<DuplexStream>,
    local_tx: mpsc::UnboundedSender<LocalDial>,
    refuse_server: bool,
    refuse_local: bool,
}

impl MockDialer {
    pub fn new() -> (Arc<Self>, MockPeers) {
        Self::build(false, false)
    }

    pub fn refusing_server() -> (Arc<Self>, MockPeers) {
        Self::build(true, false)
    }

    pub fn refusing_local() -> (Arc<Self>, MockPeers) {
        Self::build(false, true)
    }

    fn build(refuse_server: bool, refuse_local: bool) -> (Arc<Self>, MockPeers) {
        let (server_tx, server) = mpsc::unbounded_channel();
        let (local_tx, local) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            server_tx,
            local_tx,
            refuse_server,
            refuse_local,
        });
        (dialer, MockPeers { server, local })
    }
}

fn refused() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
}

impl Dialer for MockDialer {
    fn dial_server<'a>(&'a self, _addr: &'a str) -> DialFuture<'a> {
        Box::pin(async move {
            if self.refuse_server {
                return Err(refused());
            }
            let (ours, theirs) = tokio::io::duplex(PIPE_SIZE);
            self.server_tx.send(theirs).map_err(|_| refused())?;
            Ok(Box::new(ours) as BoxedStream)
        })
    }

    fn dial_local(&self, port: u16, tls: bool) -> DialFuture<'_> {
        Box::pin(async move {
            if self.refuse_local {
                return Err(refused());
            }
            let (ours, theirs) = tokio::io::duplex(PIPE_SIZE);
            self.local_tx
                .send(LocalDial {
                    port,
                    tls,
                    stream: theirs,
                })
                .map_err(|_| refused())?;
            Ok(Box::new(ours) as BoxedStream)
        })
    }
}

/// Write one framed message, as the server would.
pub(crate) async fn write_message<S: AsyncWrite + Unpin>(stream: &mut S, msg: &Message) {
    let frame = encode_frame(msg).unwrap();
    stream.write_all(&frame).await.unwrap();
}

/// Read one framed message, as the server would.
pub(crate) async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Message {
    let fut = async {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        stream.read_exact(&mut prefix).await.unwrap();
        let mut body = vec![0u8; decode_len(&prefix) as usize];
        stream.read_exact(&mut body).await.unwrap();
        decode_message(&body).unwrap()
    };
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("no frame from client")
}

/// Poll `cond` until it holds or two seconds pass.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
