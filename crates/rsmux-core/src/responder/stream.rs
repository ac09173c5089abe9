//! Request/stream, responder side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use rsmux_frame::{error_code, Frame, FrameType};

use crate::context::Context;
use crate::credit::Credit;
use crate::error::{MuxError, Result};
use crate::payload::Payload;
use crate::state::StateWord;
use crate::streams::{FrameSink, Reassembly, StreamHandler};
use crate::subscription::{OutboundTarget, PayloadSink};

use super::{invalid, spawn_worker};

const FRAME_TYPE: FrameType = FrameType::RequestStream;

pub(crate) struct StreamResponder {
    ctx: Arc<Context>,
    this: Weak<Self>,
    stream_id: u32,
    state: StateWord,
    reassembly: Reassembly,
    credit: Credit,
    started: AtomicBool,
}

impl StreamResponder {
    pub(crate) fn new(ctx: &Arc<Context>, stream_id: u32, initial_request_n: u64) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            ctx: Arc::clone(ctx),
            this: this.clone(),
            stream_id,
            state: StateWord::new(),
            reassembly: Reassembly::new(ctx.config.reassembly_config()),
            credit: Credit::new(initial_request_n),
            started: AtomicBool::new(false),
        })
    }

    fn remove(&self) {
        if let Some(this) = self.this.upgrade() {
            self.ctx
                .responders
                .remove(self.stream_id, &StreamHandler::StreamResponder(this));
        }
    }

    fn reject(&self, error: &MuxError) {
        if self.state.mark_terminated().is_terminated() {
            return;
        }
        tracing::warn!(stream_id = self.stream_id, error = %error, "invalid request");
        self.credit.close();
        self.reassembly.release(&self.state);
        self.ctx
            .send_quietly(invalid(self.stream_id, &error.to_string()));
        self.remove();
        if self.started.load(Ordering::Acquire) {
            self.ctx
                .interceptor
                .on_terminate(self.stream_id, FRAME_TYPE, Some(error));
        }
    }

    fn start(&self, frame: &Frame) {
        let payload = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(err) => {
                self.reject(&err);
                return;
            }
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.started.store(true, Ordering::Release);
        self.ctx
            .interceptor
            .on_start(self.stream_id, FRAME_TYPE, payload.metadata());

        let spawned = spawn_worker(&self.ctx, self.stream_id, move || {
            let target: Arc<dyn OutboundTarget> = this.clone();
            let sink = PayloadSink::new(target);
            let result = this.ctx.handler.request_stream(payload, &sink);
            let _ = match result {
                Ok(()) => this.complete(),
                Err(err) => this.error(err),
            };
        });
        if let Err(err) = spawned {
            let _ = self.error(MuxError::Application(format!("cannot start handler: {err}")));
        }
    }

    /// Peer stopped the stream: wake a producer blocked on credit and drop
    /// any partial request.
    fn abandon(&self, error: Option<&MuxError>) {
        if self.state.mark_terminated().is_terminated() {
            return;
        }
        self.credit.close();
        self.reassembly.release(&self.state);
        self.remove();
        if self.started.load(Ordering::Acquire) {
            match error {
                Some(error) => self
                    .ctx
                    .interceptor
                    .on_terminate(self.stream_id, FRAME_TYPE, Some(error)),
                None => self.ctx.interceptor.on_cancel(self.stream_id, FRAME_TYPE),
            }
        }
    }
}

impl OutboundTarget for StreamResponder {
    fn send_next(&self, payload: Payload) -> Result<()> {
        if self.state.load().is_terminated() {
            return Err(MuxError::Canceled("stream cancelled by the requester".into()));
        }
        if let Err(err) = self.ctx.check_payload(FrameType::Next, &payload) {
            if !self.state.mark_terminated().is_terminated() {
                self.credit.close();
                self.ctx.send_quietly(Frame::error(
                    self.stream_id,
                    error_code::APPLICATION_ERROR,
                    &err.to_string(),
                ));
                self.remove();
                self.ctx
                    .interceptor
                    .on_terminate(self.stream_id, FRAME_TYPE, Some(&err));
            }
            return Err(err);
        }
        if !self.credit.acquire() {
            return Err(MuxError::Canceled("stream cancelled by the requester".into()));
        }
        self.ctx
            .send_payload(self.stream_id, FrameType::Next, 0, false, payload)
            .inspect_err(|err| self.abandon(Some(err)))
    }

    fn complete(&self) -> Result<()> {
        if self.state.mark_terminated().is_terminated() {
            return Ok(());
        }
        self.credit.close();
        self.remove();
        self.ctx.send_quietly(Frame::complete(self.stream_id));
        self.ctx
            .interceptor
            .on_terminate(self.stream_id, FRAME_TYPE, None);
        Ok(())
    }

    fn error(&self, error: MuxError) -> Result<()> {
        if self.state.mark_terminated().is_terminated() {
            return Ok(());
        }
        self.credit.close();
        self.remove();
        self.ctx.send_quietly(error.to_frame(self.stream_id));
        self.ctx
            .interceptor
            .on_terminate(self.stream_id, FRAME_TYPE, Some(&error));
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.load().is_terminated()
    }
}

impl FrameSink for StreamResponder {
    fn handle_payload(&self, frame: &Frame) {
        if self.state.load().is_terminated() {
            return;
        }
        if self.started.load(Ordering::Acquire) {
            tracing::debug!(stream_id = self.stream_id, "payload after request ignored");
            return;
        }
        match self.reassembly.accept(&self.state, frame) {
            Ok(Some(frame)) => self.start(&frame),
            Ok(None) => {}
            Err(err) => self.reject(&err.into()),
        }
    }

    fn handle_request_n(&self, n: u32) {
        self.credit.add(u64::from(n));
    }

    fn handle_cancel(&self) {
        self.abandon(None);
    }

    fn handle_error(&self, error: MuxError) {
        self.abandon(Some(&error));
    }

    fn handle_malformed(&self, error: MuxError) {
        self.reject(&error);
    }
}
