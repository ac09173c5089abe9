//! Fire-and-forget, requester side.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};

use rsmux_frame::FrameType;

use crate::context::Context;
use crate::error::{MuxError, Result};
use crate::lease::LeasePermitHandler;
use crate::payload::Payload;
use crate::sync::lock;

use super::reject_second_subscriber;

const FRAME_TYPE: FrameType = FrameType::RequestFnf;

/// A one-way request that has not been sent yet.
pub struct FireAndForget {
    ctx: Arc<Context>,
    payload: Mutex<Option<Payload>>,
    subscribed: AtomicBool,
}

impl FireAndForget {
    pub(crate) fn new(ctx: Arc<Context>, payload: Payload) -> Self {
        Self {
            ctx,
            payload: Mutex::new(Some(payload)),
            subscribed: AtomicBool::new(false),
        }
    }

    /// Send the request. With leases enabled this blocks until a lease
    /// allows it or the request is refused.
    pub fn subscribe(&self) -> Result<()> {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Err(reject_second_subscriber(&self.ctx, FRAME_TYPE));
        }
        let Some(payload) = lock(&self.payload).take() else {
            return Err(MuxError::OnlyOneSubscriber);
        };
        self.ctx.check_payload(FRAME_TYPE, &payload)?;

        let Some(tracker) = &self.ctx.requester_leases else {
            return send(&self.ctx, payload);
        };
        let (tx, rx) = mpsc::channel();
        tracker.issue(Arc::new(FireAndForgetPermit {
            ctx: Arc::clone(&self.ctx),
            payload: Mutex::new(Some(payload)),
            result: Mutex::new(Some(tx)),
        }));
        rx.recv()
            .unwrap_or_else(|_| Err(MuxError::Canceled("fire-and-forget dropped".into())))
    }
}

impl fmt::Debug for FireAndForget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FireAndForget")
            .field("subscribed", &self.subscribed.load(Ordering::Acquire))
            .finish()
    }
}

fn send(ctx: &Context, payload: Payload) -> Result<()> {
    let stream_id = ctx.requesters.next_id()?;
    ctx.interceptor
        .on_start(stream_id, FRAME_TYPE, payload.metadata());
    let result = ctx.send_payload(stream_id, FRAME_TYPE, 0, false, payload);
    ctx.interceptor
        .on_terminate(stream_id, FRAME_TYPE, result.as_ref().err());
    result
}

/// Request waiting in the lease queue.
struct FireAndForgetPermit {
    ctx: Arc<Context>,
    payload: Mutex<Option<Payload>>,
    result: Mutex<Option<Sender<Result<()>>>>,
}

impl FireAndForgetPermit {
    fn settle(&self, result: Result<()>) {
        if let Some(tx) = lock(&self.result).take() {
            let _ = tx.send(result);
        }
    }
}

impl LeasePermitHandler for FireAndForgetPermit {
    fn handle_permit(&self) -> bool {
        let Some(payload) = lock(&self.payload).take() else {
            return false;
        };
        self.settle(send(&self.ctx, payload));
        true
    }

    fn handle_permit_error(&self, error: MuxError) {
        let payload = lock(&self.payload).take();
        self.ctx.interceptor.on_reject(
            &error,
            FRAME_TYPE,
            payload.as_ref().and_then(Payload::metadata),
        );
        self.settle(Err(error));
    }
}
