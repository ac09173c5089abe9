use crate::frame_type::FrameType;

/// Errors that can occur during frame encoding, decoding and reassembly.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame exceeds the configured maximum length.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The frame is shorter than its type requires.
    #[error("truncated {frame_type} frame ({size} bytes, need {needed})")]
    Truncated {
        frame_type: &'static str,
        size: usize,
        needed: usize,
    },

    /// The header is intact but the body does not match its type. Only the
    /// stream it names is affected.
    #[error("malformed {frame_type} frame on stream {stream_id} ({size} bytes, need {needed})")]
    MalformedBody {
        stream_id: u32,
        frame_type: FrameType,
        size: usize,
        needed: usize,
    },

    /// The 6-bit type code is not a known frame type.
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    /// Metadata does not fit the 24-bit length field.
    #[error("metadata too large ({0} bytes)")]
    MetadataTooLarge(usize),

    /// Reassembled payload would exceed the inbound limit.
    #[error("reassembled payload too large ({size} bytes, max {max})")]
    ReassemblyTooLarge { size: usize, max: usize },

    /// A non-final fragment is below the minimum fragment size.
    #[error("fragment too small ({size} bytes, min {min})")]
    FragmentTooSmall { size: usize, min: usize },

    /// A follow fragment is not a PAYLOAD frame for the same stream.
    #[error("unexpected {frame_type} frame on stream {stream_id} while reassembling")]
    UnexpectedFragment {
        frame_type: &'static str,
        stream_id: u32,
    },

    /// The frame type cannot be fragmented.
    #[error("{0} frames cannot be fragmented")]
    NotFragmentable(&'static str),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
