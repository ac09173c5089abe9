//! Wire frames for multiplexed interactions.
//!
//! Every frame on the connection is:
//! - A 3-byte big-endian length prefix
//! - A 4-byte stream id (top bit reserved)
//! - 6 bits of frame type and 10 flag bits
//! - A type-specific body
//!
//! Payloads larger than the connection MTU are split by [`Fragmenter`] and
//! rebuilt on the other side by [`Reassembler`].

pub mod codec;
pub mod error;
pub mod fragmentation;
pub mod frame_type;
pub mod reader;
pub mod reassembly;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, encoded_payload_len, Frame, FrameConfig,
    DEFAULT_MAX_FRAME_LENGTH, FRAME_LENGTH_SIZE, FRAME_OFFSET, HEADER_SIZE, MAX_FRAME_LENGTH,
    MAX_METADATA_LENGTH, MAX_REQUEST_N, MAX_STREAM_ID, METADATA_LENGTH_SIZE, REQUEST_N_SIZE,
};
pub use error::{FrameError, Result};
pub use fragmentation::{is_fragmentable, is_valid, Fragmenter, MIN_MTU_SIZE};
pub use frame_type::{error_code, FrameType};
pub use reader::FrameReader;
pub use reassembly::{Reassembler, ReassemblyConfig, DEFAULT_MIN_FRAGMENT_SIZE};
pub use writer::FrameWriter;
