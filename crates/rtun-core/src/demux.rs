//! Incremental stream demultiplexer.
//!
//! Turns arbitrarily-chunked socket reads into complete frames while in
//! [`DemuxMode::Framed`], and into opaque byte chunks once switched to
//! [`DemuxMode::Raw`]. Chunks are pulled one at a time so the owner can
//! dispatch a handshake frame and flip the mode before the bytes that follow
//! it are looked at.

use crate::codec::{decode_len, LENGTH_PREFIX_SIZE, MAX_FRAME_LEN};
use crate::error::{TunnelError, TunnelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxMode {
    /// Parse length-prefixed frames.
    Framed,
    /// Pass every byte through untouched.
    Raw,
}

/// One unit of output from [`StreamDemux::next_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// A complete frame payload (length prefix removed).
    Frame(Vec<u8>),
    /// Passthrough bytes, only produced in raw mode.
    Raw(Vec<u8>),
}

#[derive(Debug)]
pub struct StreamDemux {
    buffer: Vec<u8>,
    mode: DemuxMode,
    max_frame_len: usize,
}

impl Default for StreamDemux {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDemux {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    /// A demultiplexer that rejects frames declaring more than `max` bytes.
    pub fn with_max_frame_len(max: usize) -> Self {
        Self {
            buffer: Vec::new(),
            mode: DemuxMode::Framed,
            max_frame_len: max,
        }
    }

    pub fn mode(&self) -> DemuxMode {
        self.mode
    }

    /// Append freshly read bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Stop parsing frames. Bytes already buffered are emitted as the first
    /// raw chunk.
    pub fn switch_to_raw(&mut self) {
        self.mode = DemuxMode::Raw;
    }

    /// Pull the next complete chunk, or `None` when more input is needed.
    ///
    /// A partial frame stays buffered. A declared length above the configured
    /// maximum is an error; the stream cannot be resynchronised after it.
    pub fn next_chunk(&mut self) -> TunnelResult<Option<Chunk>> {
        match self.mode {
            DemuxMode::Raw => {
                if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Chunk::Raw(std::mem::take(&mut self.buffer))))
                }
            }
            DemuxMode::Framed => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }
                let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
                prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
                let declared = decode_len(&prefix);

                if declared > self.max_frame_len as u64 {
                    return Err(TunnelError::FrameTooLarge {
                        len: declared,
                        max: self.max_frame_len,
                    });
                }

                let end = LENGTH_PREFIX_SIZE + declared as usize;
                if self.buffer.len() < end {
                    return Ok(None);
                }

                let payload = self.buffer[LENGTH_PREFIX_SIZE..end].to_vec();
                self.buffer.drain(..end);
                Ok(Some(Chunk::Frame(payload)))
            }
        }
    }

    /// Feed bytes and collect every frame that is now complete.
    ///
    /// Only meaningful for channels that never switch to raw mode.
    pub fn feed_frames(&mut self, data: &[u8]) -> TunnelResult<Vec<Vec<u8>>> {
        if self.mode == DemuxMode::Raw {
            return Err(TunnelError::Codec("demux is in raw mode".into()));
        }
        self.feed(data);
        let mut frames = Vec::new();
        while let Some(Chunk::Frame(f)) = self.next_chunk()? {
            frames.push(f);
        }
        Ok(frames)
    }

    /// Number of bytes buffered but not yet emitted.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes and return to framed mode.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.mode = DemuxMode::Framed;
    }
}
