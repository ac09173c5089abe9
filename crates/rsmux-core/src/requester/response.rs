//! Request/response, requester side.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};

use rsmux_frame::{Frame, FrameType};

use crate::context::Context;
use crate::error::{MuxError, Result};
use crate::lease::LeasePermitHandler;
use crate::payload::Payload;
use crate::state::StateWord;
use crate::streams::{FrameSink, Reassembly, StreamHandler};
use crate::subscription::{deliver, InboundSource, ResponseSubscription, Signal};
use crate::sync::lock;

use super::{reject_second_subscriber, request_permit};

const FRAME_TYPE: FrameType = FrameType::RequestResponse;

pub(crate) struct RequestResponseRequester {
    ctx: Arc<Context>,
    this: Weak<Self>,
    state: StateWord,
    stream_id: AtomicU32,
    payload: Mutex<Option<Payload>>,
    signals: Mutex<Option<Sender<Signal>>>,
    reassembly: Reassembly,
    /// Set by the peer's terminal frame, so a racing first-frame send does
    /// not follow it with CANCEL.
    done: AtomicBool,
}

impl RequestResponseRequester {
    pub(crate) fn new(ctx: Arc<Context>, payload: Payload) -> Arc<Self> {
        let reassembly = Reassembly::new(ctx.config.reassembly_config());
        Arc::new_cyclic(|this| Self {
            ctx,
            this: this.clone(),
            state: StateWord::new(),
            stream_id: AtomicU32::new(0),
            payload: Mutex::new(Some(payload)),
            signals: Mutex::new(None),
            reassembly,
            done: AtomicBool::new(false),
        })
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Result<ResponseSubscription> {
        if self.state.mark_subscribed().is_subscribed() {
            return Err(reject_second_subscriber(&self.ctx, FRAME_TYPE));
        }
        let checked = match lock(&self.payload).as_ref() {
            Some(payload) => self.ctx.check_payload(FRAME_TYPE, payload),
            None => Ok(()),
        };
        if let Err(err) = checked {
            self.state.mark_terminated();
            lock(&self.payload).take();
            return Err(err);
        }

        let (tx, rx) = mpsc::channel();
        *lock(&self.signals) = Some(tx);
        let source: Arc<dyn InboundSource> = self.clone();
        Ok(ResponseSubscription::new(source, rx))
    }

    fn stream_id(&self) -> u32 {
        self.stream_id.load(Ordering::Acquire)
    }

    fn entry(&self) -> Option<StreamHandler> {
        self.this.upgrade().map(StreamHandler::RequestResponse)
    }

    fn remove(&self) {
        if let Some(entry) = self.entry() {
            self.ctx.requesters.remove(self.stream_id(), &entry);
        }
    }

    fn finish(&self, signal: Signal) {
        if let Some(tx) = lock(&self.signals).take() {
            deliver(&tx, signal);
        }
    }

    fn send_first_frame(&self) {
        let Some(payload) = lock(&self.payload).take() else {
            return;
        };
        let Some(entry) = self.entry() else {
            return;
        };
        let stream_id = match self.ctx.requesters.add_and_get_next_id(entry) {
            Ok(stream_id) => stream_id,
            Err(err) => {
                self.fail_unstarted(err);
                return;
            }
        };
        self.stream_id.store(stream_id, Ordering::Release);
        self.ctx
            .interceptor
            .on_start(stream_id, FRAME_TYPE, payload.metadata());

        if let Err(err) = self.ctx.send_payload(stream_id, FRAME_TYPE, 0, false, payload) {
            if !self.state.mark_terminated().is_terminated() {
                self.remove();
                self.ctx.interceptor.on_terminate(stream_id, FRAME_TYPE, Some(&err));
                self.finish(Signal::Error(err));
            }
            return;
        }

        let prev = self.state.mark_first_frame_sent();
        if prev.is_terminated() && !self.done.load(Ordering::Acquire) {
            tracing::debug!(stream_id, "cancelled while the request was being sent");
            self.ctx.send_quietly(Frame::cancel(stream_id));
            self.remove();
            self.ctx.interceptor.on_cancel(stream_id, FRAME_TYPE);
        }
    }

    /// Failure before any frame went out; the interceptor never saw a start.
    fn fail_unstarted(&self, error: MuxError) {
        if !self.state.mark_terminated().is_terminated() {
            lock(&self.payload).take();
            self.finish(Signal::Error(error));
        }
    }

    /// Inbound frame we cannot accept: cancel the stream and fail locally.
    fn fail_inbound(&self, error: MuxError) {
        self.done.store(true, Ordering::Release);
        if self.state.mark_terminated().is_terminated() {
            return;
        }
        let stream_id = self.stream_id();
        tracing::warn!(stream_id, error = %error, "invalid response");
        self.reassembly.release(&self.state);
        self.ctx.send_quietly(Frame::cancel(stream_id));
        self.remove();
        self.ctx.interceptor.on_terminate(stream_id, FRAME_TYPE, Some(&error));
        self.finish(Signal::Error(error));
    }
}

impl InboundSource for RequestResponseRequester {
    fn request(&self, n: u64) {
        let prev = self.state.add_request_n(n);
        if prev.is_terminated() || prev.demand() > 0 {
            return;
        }
        if let Some(this) = self.this.upgrade() {
            request_permit(&self.ctx, &self.state, this, |this| this.send_first_frame());
        }
    }

    fn cancel(&self) {
        let prev = self.state.mark_terminated();
        if prev.is_terminated() {
            return;
        }
        lock(&self.payload).take();
        lock(&self.signals).take();
        self.reassembly.release(&self.state);
        if prev.is_first_frame_sent() {
            let stream_id = self.stream_id();
            self.ctx.send_quietly(Frame::cancel(stream_id));
            self.remove();
            self.ctx.interceptor.on_cancel(stream_id, FRAME_TYPE);
        }
    }
}

impl LeasePermitHandler for RequestResponseRequester {
    fn handle_permit(&self) -> bool {
        if self.state.load().is_terminated() {
            return false;
        }
        self.send_first_frame();
        true
    }

    fn handle_permit_error(&self, error: MuxError) {
        if self.state.mark_terminated().is_terminated() {
            return;
        }
        let payload = lock(&self.payload).take();
        self.ctx.interceptor.on_reject(
            &error,
            FRAME_TYPE,
            payload.as_ref().and_then(Payload::metadata),
        );
        self.finish(Signal::Error(error));
    }
}

impl FrameSink for RequestResponseRequester {
    fn handle_payload(&self, frame: &Frame) {
        if self.state.load().is_terminated() {
            return;
        }
        let frame = match self.reassembly.accept(&self.state, frame) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                self.fail_inbound(err.into());
                return;
            }
        };

        self.done.store(true, Ordering::Release);
        if self.state.mark_terminated().is_terminated() {
            return;
        }
        self.remove();
        let stream_id = self.stream_id();
        if frame.is_next() {
            match Payload::from_frame(&frame) {
                Ok(payload) => {
                    self.ctx.interceptor.on_terminate(stream_id, FRAME_TYPE, None);
                    self.finish(Signal::Next(payload));
                }
                Err(err) => {
                    self.ctx.interceptor.on_terminate(stream_id, FRAME_TYPE, Some(&err));
                    self.finish(Signal::Error(err));
                }
            }
        } else {
            self.ctx.interceptor.on_terminate(stream_id, FRAME_TYPE, None);
            self.finish(Signal::Complete);
        }
    }

    fn handle_error(&self, error: MuxError) {
        self.done.store(true, Ordering::Release);
        let prev = self.state.mark_terminated();
        if prev.is_terminated() {
            return;
        }
        lock(&self.payload).take();
        self.reassembly.release(&self.state);
        self.remove();
        let stream_id = self.stream_id();
        if stream_id != 0 {
            self.ctx
                .interceptor
                .on_terminate(stream_id, FRAME_TYPE, Some(&error));
        }
        self.finish(Signal::Error(error));
    }

    fn handle_malformed(&self, error: MuxError) {
        self.fail_inbound(error);
    }
}

/// A request/response interaction that has not been subscribed yet.
///
/// Nothing is sent until [`subscribe`](Self::subscribe) and the first
/// `recv` on the returned subscription.
#[derive(Clone)]
pub struct RequestResponse {
    inner: Arc<RequestResponseRequester>,
}

impl RequestResponse {
    pub(crate) fn new(ctx: Arc<Context>, payload: Payload) -> Self {
        Self {
            inner: RequestResponseRequester::new(ctx, payload),
        }
    }

    /// Attach the single subscriber. A second call fails with
    /// `MuxError::OnlyOneSubscriber`; an oversized payload fails with
    /// `MuxError::PayloadTooLarge` before any frame is sent.
    pub fn subscribe(&self) -> Result<ResponseSubscription> {
        self.inner.subscribe()
    }

    /// Subscribe and wait for the response.
    pub fn block(&self) -> Result<Option<Payload>> {
        self.subscribe()?.recv()
    }
}

impl fmt::Debug for RequestResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestResponse")
            .field("stream_id", &self.inner.stream_id())
            .field("state", &self.inner.state.load())
            .finish()
    }
}
