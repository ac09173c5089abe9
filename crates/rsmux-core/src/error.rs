use rsmux_frame::{error_code, Frame};

/// Errors surfaced by connections and interactions.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] rsmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] rsmux_frame::FrameError),

    /// The peer's handler failed (APPLICATION_ERROR).
    #[error("application error: {0}")]
    Application(String),

    /// The peer refused the request (REJECTED).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The interaction was cancelled (CANCELED).
    #[error("canceled: {0}")]
    Canceled(String),

    /// The peer considered the request invalid (INVALID).
    #[error("invalid: {0}")]
    Invalid(String),

    /// The peer reported a connection error (CONNECTION_ERROR).
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// The peer is closing the connection (CONNECTION_CLOSE).
    #[error("connection close: {0}")]
    ConnectionClose(String),

    /// ERROR frame with a code outside the well-known set.
    #[error("remote error 0x{code:08x}: {message}")]
    Remote { code: u32, message: String },

    /// Leases are enabled and none is available.
    #[error("missing lease: {0}")]
    MissingLease(String),

    /// A second subscription to a single-subscriber interaction.
    #[error("interaction allows only one subscriber")]
    OnlyOneSubscriber,

    /// The payload cannot be sent as a single frame and fragmentation is off.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The responder produced more elements than were requested.
    #[error("responder produced {produced} elements but only {requested} were requested")]
    Overflow { requested: u64, produced: u64 },

    /// The local connection is closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The peer violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// No stream id can be allocated on this side of the connection.
    #[error("stream id allocation failed: {0}")]
    IdAllocation(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MuxError {
    /// Map a received ERROR frame to an error.
    pub fn from_error_frame(frame: &Frame) -> Self {
        let message = frame.error_message();
        match frame.error_code().unwrap_or(error_code::APPLICATION_ERROR) {
            error_code::APPLICATION_ERROR => Self::Application(message),
            error_code::REJECTED => Self::Rejected(message),
            error_code::CANCELED => Self::Canceled(message),
            error_code::INVALID => Self::Invalid(message),
            error_code::CONNECTION_ERROR => Self::ConnectionError(message),
            error_code::CONNECTION_CLOSE => Self::ConnectionClose(message),
            code => Self::Remote { code, message },
        }
    }

    /// Code used when this error is sent to the peer in an ERROR frame.
    pub fn error_code(&self) -> u32 {
        match self {
            Self::Rejected(_) | Self::MissingLease(_) => error_code::REJECTED,
            Self::Canceled(_) => error_code::CANCELED,
            Self::Invalid(_) | Self::Frame(_) | Self::Overflow { .. } => error_code::INVALID,
            Self::ConnectionError(_) | Self::Protocol(_) => error_code::CONNECTION_ERROR,
            Self::ConnectionClose(_) => error_code::CONNECTION_CLOSE,
            Self::Remote { code, .. } => *code,
            _ => error_code::APPLICATION_ERROR,
        }
    }

    /// Message used when this error is sent to the peer in an ERROR frame.
    pub fn error_message(&self) -> String {
        match self {
            Self::Application(message)
            | Self::Rejected(message)
            | Self::Canceled(message)
            | Self::Invalid(message)
            | Self::ConnectionError(message)
            | Self::ConnectionClose(message)
            | Self::MissingLease(message)
            | Self::Protocol(message) => message.clone(),
            Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// ERROR frame carrying this error.
    pub fn to_frame(&self, stream_id: u32) -> Frame {
        Frame::error(stream_id, self.error_code(), &self.error_message())
    }
}

pub type Result<T> = std::result::Result<T, MuxError>;
