//! Fire-and-forget, responder side.

use std::sync::{Arc, Weak};

use rsmux_frame::{Frame, FrameType};

use crate::context::Context;
use crate::error::MuxError;
use crate::payload::Payload;
use crate::state::StateWord;
use crate::streams::{FrameSink, Reassembly, StreamHandler};

use super::{invalid, spawn_worker};

const FRAME_TYPE: FrameType = FrameType::RequestFnf;

/// Lives in the registry only while a fragmented request is reassembled.
pub(crate) struct FireAndForgetResponder {
    ctx: Arc<Context>,
    this: Weak<Self>,
    stream_id: u32,
    state: StateWord,
    reassembly: Reassembly,
}

impl FireAndForgetResponder {
    pub(crate) fn new(ctx: &Arc<Context>, stream_id: u32) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            ctx: Arc::clone(ctx),
            this: this.clone(),
            stream_id,
            state: StateWord::new(),
            reassembly: Reassembly::new(ctx.config.reassembly_config()),
        })
    }

    fn remove(&self) {
        if let Some(this) = self.this.upgrade() {
            self.ctx
                .responders
                .remove(self.stream_id, &StreamHandler::FireAndForgetResponder(this));
        }
    }

    fn start(&self, frame: &Frame) {
        let payload = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(stream_id = self.stream_id, error = %err, "fire-and-forget dropped");
                return;
            }
        };
        let stream_id = self.stream_id;
        self.ctx
            .interceptor
            .on_start(stream_id, FRAME_TYPE, payload.metadata());

        let ctx = Arc::clone(&self.ctx);
        let spawned = spawn_worker(&self.ctx, stream_id, move || {
            let result = ctx.handler.fire_and_forget(payload);
            if let Err(err) = &result {
                tracing::warn!(stream_id, error = %err, "fire-and-forget handler failed");
            }
            ctx.interceptor
                .on_terminate(stream_id, FRAME_TYPE, result.as_ref().err());
        });
        if let Err(err) = spawned {
            let error = MuxError::Application(format!("cannot start handler: {err}"));
            tracing::error!(stream_id, error = %error, "fire-and-forget dropped");
            self.ctx
                .interceptor
                .on_terminate(stream_id, FRAME_TYPE, Some(&error));
        }
    }
}

impl FrameSink for FireAndForgetResponder {
    fn handle_payload(&self, frame: &Frame) {
        if self.state.load().is_terminated() {
            return;
        }
        match self.reassembly.accept(&self.state, frame) {
            Ok(None) => {}
            Ok(Some(frame)) => {
                if !self.state.mark_terminated().is_terminated() {
                    self.remove();
                    self.start(&frame);
                }
            }
            Err(err) => {
                if !self.state.mark_terminated().is_terminated() {
                    tracing::warn!(stream_id = self.stream_id, error = %err, "fire-and-forget dropped");
                    self.remove();
                }
            }
        }
    }

    fn handle_cancel(&self) {
        if !self.state.mark_terminated().is_terminated() {
            self.reassembly.release(&self.state);
            self.remove();
        }
    }

    fn handle_error(&self, error: MuxError) {
        if !self.state.mark_terminated().is_terminated() {
            tracing::debug!(stream_id = self.stream_id, error = %error, "fire-and-forget abandoned");
            self.reassembly.release(&self.state);
            self.remove();
        }
    }

    fn handle_malformed(&self, error: MuxError) {
        if !self.state.mark_terminated().is_terminated() {
            tracing::warn!(stream_id = self.stream_id, error = %error, "fire-and-forget dropped");
            self.reassembly.release(&self.state);
            self.ctx
                .send_quietly(invalid(self.stream_id, &error.to_string()));
            self.remove();
        }
    }
}
