//! Interactions started by this side of the connection.

pub(crate) mod channel;
pub(crate) mod fnf;
pub(crate) mod response;
pub(crate) mod stream;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rsmux_frame::{Frame, FrameType, FRAME_LENGTH_SIZE, HEADER_SIZE};

use crate::context::Context;
use crate::error::{MuxError, Result};
use crate::lease::LeasePermitHandler;
use crate::payload::Payload;
use crate::state::StateWord;

pub use channel::RequestChannel;
pub use fnf::FireAndForget;
pub use response::RequestResponse;
pub use stream::RequestStream;

/// Starts interactions on a connection. Cheap to clone; every clone drives
/// the same connection.
#[derive(Clone)]
pub struct Requester {
    ctx: Arc<Context>,
}

impl Requester {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// One-way request; no response and no stream state afterwards.
    pub fn fire_and_forget(&self, payload: Payload) -> FireAndForget {
        FireAndForget::new(Arc::clone(&self.ctx), payload)
    }

    /// Request answered by at most one payload.
    pub fn request_response(&self, payload: Payload) -> RequestResponse {
        RequestResponse::new(Arc::clone(&self.ctx), payload)
    }

    /// Request answered by a demand-driven stream of payloads.
    pub fn request_stream(&self, payload: Payload) -> RequestStream {
        RequestStream::new(Arc::clone(&self.ctx), payload)
    }

    /// Bidirectional stream opened with `first`.
    pub fn request_channel(&self, first: Payload) -> RequestChannel {
        RequestChannel::new(Arc::clone(&self.ctx), first)
    }

    /// Send connection-level metadata (stream 0). Never fragmented.
    pub fn metadata_push(&self, metadata: impl Into<Bytes>) -> Result<()> {
        let metadata = metadata.into();
        if self.ctx.is_closed() {
            return Err(MuxError::ConnectionClosed("connection is closed".into()));
        }
        let size = FRAME_LENGTH_SIZE + HEADER_SIZE + metadata.len();
        if size > self.ctx.config.max_frame_length {
            return Err(MuxError::PayloadTooLarge {
                size,
                max: self.ctx.config.max_frame_length,
            });
        }
        self.ctx.send(Frame::metadata_push(&metadata))
    }

    /// Requests the peer's current lease still allows; `None` when leases
    /// are disabled.
    pub fn available_lease_requests(&self) -> Option<u32> {
        self.ctx
            .requester_leases
            .as_ref()
            .map(|tracker| tracker.available_requests())
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }
}

impl fmt::Debug for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("role", &self.ctx.role)
            .field("active_streams", &self.ctx.requesters.len())
            .field("closed", &self.ctx.is_closed())
            .finish()
    }
}

/// Error for a second subscribe on a single-subscriber interaction.
pub(crate) fn reject_second_subscriber(ctx: &Context, frame_type: FrameType) -> MuxError {
    let error = MuxError::OnlyOneSubscriber;
    if ctx.requester_leases.is_some() {
        ctx.interceptor.on_reject(&error, frame_type, None);
    }
    error
}

/// Send the first frame now, or once the peer's lease allows it.
pub(crate) fn request_permit<T>(
    ctx: &Context,
    state: &StateWord,
    this: Arc<T>,
    send_first_frame: impl FnOnce(&T),
) where
    T: LeasePermitHandler + 'static,
{
    match &ctx.requester_leases {
        Some(tracker) => {
            state.mark_ready_to_send_first_frame();
            tracker.issue(this);
        }
        None => send_first_frame(&this),
    }
}

/// Demand still to announce after the first frame carried
/// `initial_request_n` out of `demand`.
pub(crate) fn excess_demand(demand: u64, unbounded: bool, initial_request_n: u32) -> Option<u64> {
    let sent = u64::from(initial_request_n);
    if unbounded {
        return (sent < u64::from(rsmux_frame::MAX_REQUEST_N)).then_some(u64::MAX);
    }
    (demand > sent).then(|| demand - sent)
}

/// Initial request-n for a first frame.
pub(crate) fn initial_request_n(demand: u64, unbounded: bool) -> u32 {
    let max = rsmux_frame::MAX_REQUEST_N;
    if unbounded {
        max
    } else {
        u32::try_from(demand).map_or(max, |n| n.min(max))
    }
}

#[cfg(test)]
mod tests {
    use rsmux_frame::MAX_REQUEST_N;

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::context::testing::context;
    use crate::registry::Role;

    #[test]
    fn excess_demand_after_first_frame() {
        assert_eq!(excess_demand(5, false, 5), None);
        assert_eq!(excess_demand(8, false, 5), Some(3));
        assert_eq!(excess_demand(0, true, MAX_REQUEST_N), None);
        assert_eq!(excess_demand(0, true, 5), Some(u64::MAX));
    }

    #[test]
    fn initial_request_n_is_clamped() {
        assert_eq!(initial_request_n(3, false), 3);
        assert_eq!(initial_request_n(0, true), MAX_REQUEST_N);
        assert_eq!(initial_request_n(u64::from(MAX_REQUEST_N) + 7, false), MAX_REQUEST_N);
    }

    #[test]
    fn metadata_push_goes_out_on_stream_zero() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let requester = Requester::new(ctx);
        requester.metadata_push("routing").unwrap();

        let frame = &transport.frames()[0];
        assert_eq!(frame.frame_type(), FrameType::MetadataPush);
        assert_eq!(frame.stream_id(), 0);
        assert_eq!(frame.metadata().unwrap().as_ref(), b"routing");
    }

    #[test]
    fn metadata_push_must_fit_one_frame() {
        let (ctx, transport) = context(
            Role::Client,
            ConnectionConfig {
                max_frame_length: 64,
                ..ConnectionConfig::default()
            },
        );
        let requester = Requester::new(ctx);
        assert!(matches!(
            requester.metadata_push(vec![0u8; 100]),
            Err(MuxError::PayloadTooLarge { size: 109, max: 64 })
        ));
        assert!(transport.frames().is_empty());
    }

    #[test]
    fn closed_connection_refuses_metadata_push() {
        let (ctx, _) = context(Role::Client, ConnectionConfig::default());
        ctx.terminate(&MuxError::ConnectionClosed("done".into()), false);
        let requester = Requester::new(ctx);
        assert!(matches!(
            requester.metadata_push("x"),
            Err(MuxError::ConnectionClosed(_))
        ));
    }
}
