//! Bounded, ordered outbound queue with a single drain task per connection.
//!
//! Producers block in [`WriteQueue::send`] once `capacity` buffers are
//! waiting, which throttles a relay to the speed of its slower side. The drain
//! task writes one buffer at a time in enqueue order.
//!
//! Shutdown rules:
//! - the session's [`CloseSignal`] fires: pending buffers are discarded and
//!   blocked producers get [`TunnelError::Closed`];
//! - a write fails: the drain task fires the signal itself;
//! - every producer handle is dropped: the drain task writes what is left,
//!   shuts the writer down and then fires the signal.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use rtun_core::{encode_frame, Message, TunnelError, TunnelResult};

use crate::signal::CloseSignal;

/// Producer handle for one connection's write queue.
#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<Vec<u8>>,
    signal: CloseSignal,
}

impl WriteQueue {
    /// Start the drain task for `writer` and return the producer handle.
    ///
    /// `label` names the connection in log output.
    pub fn spawn<W>(
        writer: W,
        capacity: usize,
        signal: CloseSignal,
        label: &'static str,
    ) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(drain(writer, rx, signal.clone(), label));
        (Self { tx, signal }, handle)
    }

    /// Queue a buffer, waiting for room if the queue is full.
    pub async fn send(&self, buf: Vec<u8>) -> TunnelResult<()> {
        if self.signal.is_closed() {
            return Err(TunnelError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.signal.closed() => Err(TunnelError::Closed),
            result = self.tx.send(buf) => result.map_err(|_| TunnelError::Closed),
        }
    }

    /// Encode `msg` into a frame and queue it.
    pub async fn send_message(&self, msg: &Message) -> TunnelResult<()> {
        let frame = encode_frame(msg)?;
        self.send(frame).await
    }
}

async fn drain<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    signal: CloseSignal,
    label: &'static str,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = signal.closed() => {
                debug!(conn = label, pending = rx.len(), "write queue closed");
                break;
            }
            next = rx.recv() => next,
        };

        let Some(buf) = next else {
            // Every producer is gone: what was queued has been written.
            tokio::select! {
                _ = signal.closed() => {}
                result = writer.shutdown() => {
                    if let Err(e) = result {
                        debug!(conn = label, error = %e, "shutdown after drain failed");
                    }
                }
            }
            debug!(conn = label, "write queue drained, closing session");
            signal.trigger();
            break;
        };

        let result = tokio::select! {
            _ = signal.closed() => break,
            result = write_buf(&mut writer, &buf) => result,
        };

        match result {
            Ok(()) => trace!(conn = label, bytes = buf.len(), "wrote buffer"),
            Err(e) => {
                warn!(conn = label, error = %e, "write failed, closing session");
                signal.trigger();
                break;
            }
        }
    }
}

async fn write_buf<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}
