//! rtun-core: Shared protocol library for the reverse-tunnel client.
//!
//! Provides the JSON message catalog, length-prefixed framing, the incremental
//! stream demultiplexer (framed handshake, then raw passthrough), and the error
//! taxonomy shared by the control and proxy channels.

pub mod codec;
pub mod demux;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_message, encode_frame, LENGTH_PREFIX_SIZE, MAX_FRAME_LEN};
pub use demux::{Chunk, DemuxMode, StreamDemux};
pub use error::{TunnelError, TunnelResult};
pub use messages::{Message, MsgType, Protocol, MM_VERSION, PROTOCOL_VERSION};
