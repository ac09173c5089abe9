//! Interactions started by the peer.
//!
//! Each accepted request gets a responder registered under the peer's
//! stream id. Application code runs on a worker thread per request so the
//! receive thread never waits on a handler.

pub(crate) mod channel;
pub(crate) mod fnf;
pub(crate) mod response;
pub(crate) mod stream;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rsmux_frame::{error_code, Frame, FrameType};

use crate::context::Context;
use crate::error::MuxError;
use crate::streams::StreamHandler;

use channel::ChannelResponder;
use fnf::FireAndForgetResponder;
use response::ResponseResponder;
use stream::StreamResponder;

/// Handle the first frame (or first fragment) of a request from the peer.
pub(crate) fn accept_request(ctx: &Arc<Context>, frame: &Frame) {
    let stream_id = frame.stream_id();
    let frame_type = frame.frame_type();

    let running = ctx.workers.load(Ordering::Acquire);
    if running >= ctx.config.max_concurrent_requests {
        let err = MuxError::Rejected(format!("{running} requests already in progress"));
        tracing::debug!(stream_id, %frame_type, error = %err, "request rejected");
        ctx.send_quietly(err.to_frame(stream_id));
        ctx.interceptor
            .on_reject(&err, frame_type, frame.metadata().as_ref());
        return;
    }

    if let Some(tracker) = &ctx.responder_leases {
        if let Err(err) = tracker.use_lease() {
            tracing::debug!(stream_id, %frame_type, error = %err, "request rejected");
            ctx.send_quietly(err.to_frame(stream_id));
            ctx.interceptor
                .on_reject(&err, frame_type, frame.metadata().as_ref());
            return;
        }
    }

    let initial_request_n = u64::from(frame.request_n().unwrap_or(0));
    let handler = match frame_type {
        FrameType::RequestFnf => {
            StreamHandler::FireAndForgetResponder(FireAndForgetResponder::new(ctx, stream_id))
        }
        FrameType::RequestResponse => {
            StreamHandler::ResponseResponder(ResponseResponder::new(ctx, stream_id))
        }
        FrameType::RequestStream => StreamHandler::StreamResponder(StreamResponder::new(
            ctx,
            stream_id,
            initial_request_n,
        )),
        FrameType::RequestChannel => StreamHandler::ChannelResponder(ChannelResponder::new(
            ctx,
            stream_id,
            initial_request_n,
        )),
        other => {
            tracing::warn!(stream_id, frame_type = %other, "not a request frame");
            return;
        }
    };

    // A complete fire-and-forget never receives another frame.
    let needs_entry = frame_type != FrameType::RequestFnf || frame.has_follows();
    if needs_entry && !ctx.responders.register(stream_id, handler.clone()) {
        tracing::warn!(stream_id, %frame_type, "stream id already in use; request dropped");
        return;
    }
    handler.handle_payload(frame);
}

/// Run a request's application code on its own thread. The thread counts
/// against `max_concurrent_requests` until `work` returns.
pub(crate) fn spawn_worker(
    ctx: &Context,
    stream_id: u32,
    work: impl FnOnce() + Send + 'static,
) -> io::Result<()> {
    let slot = WorkerSlot::take(&ctx.workers);
    thread::Builder::new()
        .name(format!("rsmux-responder-{stream_id}"))
        .spawn(move || {
            let _slot = slot;
            work();
        })
        .map(drop)
}

struct WorkerSlot(Arc<AtomicUsize>);

impl WorkerSlot {
    fn take(workers: &Arc<AtomicUsize>) -> Self {
        workers.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(workers))
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// ERROR(INVALID) for a request or inbound payload this side cannot accept.
pub(crate) fn invalid(stream_id: u32, reason: &str) -> Frame {
    Frame::error(stream_id, error_code::INVALID, reason)
}
