//! Hooks observing the lifecycle of every interaction on a connection.

use bytes::Bytes;
use rsmux_frame::FrameType;

use crate::error::MuxError;

/// Observer for interaction lifecycle events.
///
/// Called from the thread that drives the transition (application, receive
/// or worker thread), so implementations must be cheap and must not block.
/// For one stream `on_start` fires at most once, followed by exactly one of
/// `on_terminate` or `on_cancel`.
pub trait RequestInterceptor: Send + Sync {
    /// The first frame of a stream is about to be sent or was received.
    fn on_start(&self, _stream_id: u32, _frame_type: FrameType, _metadata: Option<&Bytes>) {}

    /// The stream ended by completion (`None`) or with an error.
    fn on_terminate(&self, _stream_id: u32, _frame_type: FrameType, _error: Option<&MuxError>) {}

    /// The stream was cancelled.
    fn on_cancel(&self, _stream_id: u32, _frame_type: FrameType) {}

    /// A request was refused before it got a stream.
    fn on_reject(&self, _error: &MuxError, _frame_type: FrameType, _metadata: Option<&Bytes>) {}
}

/// Interceptor that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInterceptor;

impl RequestInterceptor for NoopInterceptor {}
