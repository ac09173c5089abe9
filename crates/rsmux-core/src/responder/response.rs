//! Request/response, responder side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use rsmux_frame::{error_code, Frame, FrameType};

use crate::context::Context;
use crate::error::{MuxError, Result};
use crate::payload::Payload;
use crate::state::StateWord;
use crate::streams::{FrameSink, Reassembly, StreamHandler};

use super::{invalid, spawn_worker};

const FRAME_TYPE: FrameType = FrameType::RequestResponse;

pub(crate) struct ResponseResponder {
    ctx: Arc<Context>,
    this: Weak<Self>,
    stream_id: u32,
    state: StateWord,
    reassembly: Reassembly,
    started: AtomicBool,
}

impl ResponseResponder {
    pub(crate) fn new(ctx: &Arc<Context>, stream_id: u32) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            ctx: Arc::clone(ctx),
            this: this.clone(),
            stream_id,
            state: StateWord::new(),
            reassembly: Reassembly::new(ctx.config.reassembly_config()),
            started: AtomicBool::new(false),
        })
    }

    fn remove(&self) {
        if let Some(this) = self.this.upgrade() {
            self.ctx
                .responders
                .remove(self.stream_id, &StreamHandler::ResponseResponder(this));
        }
    }

    fn reject(&self, error: &MuxError) {
        if self.state.mark_terminated().is_terminated() {
            return;
        }
        tracing::warn!(stream_id = self.stream_id, error = %error, "invalid request");
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
            let result = this.ctx.handler.request_response(payload);
            this.respond(result);
        });
        if let Err(err) = spawned {
            self.respond(Err(MuxError::Application(format!(
                "cannot start handler: {err}"
            ))));
        }
    }

    fn respond(&self, result: Result<Option<Payload>>) {
        if self.state.mark_terminated().is_terminated() {
            tracing::debug!(stream_id = self.stream_id, "response dropped after cancel");
            return;
        }
        let stream_id = self.stream_id;
        self.remove();
        let error = match result {
            Ok(Some(payload)) => self.send_response(payload).err(),
            Ok(None) => {
                self.ctx.send_quietly(Frame::complete(stream_id));
                None
            }
            Err(err) => {
                self.ctx.send_quietly(err.to_frame(stream_id));
                Some(err)
            }
        };
        self.ctx
            .interceptor
            .on_terminate(stream_id, FRAME_TYPE, error.as_ref());
    }

    fn send_response(&self, payload: Payload) -> Result<()> {
        let sent = self
            .ctx
            .check_payload(FrameType::NextComplete, &payload)
            .and_then(|()| {
                self.ctx
                    .send_payload(self.stream_id, FrameType::Next, 0, true, payload)
            });
        if let Err(err) = &sent {
            tracing::warn!(stream_id = self.stream_id, error = %err, "response not sent");
            self.ctx.send_quietly(Frame::error(
                self.stream_id,
                error_code::APPLICATION_ERROR,
                &err.to_string(),
            ));
        }
        sent
    }

    fn abandon(&self, error: Option<&MuxError>) {
        if self.state.mark_terminated().is_terminated() {
            return;
        }
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

impl FrameSink for ResponseResponder {
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

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::context::testing::{context_with_handler, wait_for_frames};
    use crate::handler::{EchoHandler, RequestHandler};
    use crate::registry::Role;
    use crate::responder::accept_request;

    fn request(stream_id: u32, data: &[u8]) -> Frame {
        Frame::payload_frame(stream_id, FrameType::RequestResponse, 0, 0, None, data).unwrap()
    }

    struct Gated(Mutex<mpsc::Receiver<()>>);

    impl RequestHandler for Gated {
        fn request_response(&self, payload: Payload) -> Result<Option<Payload>> {
            let _ = self.0.lock().unwrap().recv();
            Ok(Some(payload))
        }
    }

    struct Failing;

    impl RequestHandler for Failing {
        fn request_response(&self, _payload: Payload) -> Result<Option<Payload>> {
            Err(MuxError::Rejected("busy".into()))
        }
    }

    struct Empty;

    impl RequestHandler for Empty {
        fn request_response(&self, _payload: Payload) -> Result<Option<Payload>> {
            Ok(None)
        }
    }

    #[test]
    fn echo_answers_with_next_complete() {
        let (ctx, transport) = context_with_handler(
            Role::Server,
            ConnectionConfig::default(),
            Arc::new(EchoHandler::default()),
        );
        accept_request(&ctx, &request(1, b"ping"));
        let frames = wait_for_frames(&transport, 1);
        assert_eq!(frames[0].frame_type(), FrameType::NextComplete);
        assert_eq!(frames[0].data().as_ref(), b"ping");
    }

    #[test]
    fn handler_error_becomes_error_frame() {
        let (ctx, transport) =
            context_with_handler(Role::Server, ConnectionConfig::default(), Arc::new(Failing));
        accept_request(&ctx, &request(1, b"ping"));
        let frames = wait_for_frames(&transport, 1);
        assert_eq!(frames[0].error_code(), Some(error_code::REJECTED));
        assert_eq!(frames[0].error_message(), "busy");
    }

    #[test]
    fn empty_response_completes() {
        let (ctx, transport) =
            context_with_handler(Role::Server, ConnectionConfig::default(), Arc::new(Empty));
        accept_request(&ctx, &request(1, b"ping"));
        let frames = wait_for_frames(&transport, 1);
        assert_eq!(frames[0].frame_type(), FrameType::Complete);
    }

    #[test]
    fn cancel_suppresses_response() {
        let (gate, gated) = mpsc::channel();
        let (ctx, transport) = context_with_handler(
            Role::Server,
            ConnectionConfig::default(),
            Arc::new(Gated(Mutex::new(gated))),
        );
        accept_request(&ctx, &request(1, b"ping"));
        ctx.responders.lookup(1).unwrap().handle_cancel();
        assert!(ctx.responders.lookup(1).is_none());

        gate.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(transport.frames().is_empty());
    }

    #[test]
    fn oversized_response_is_an_application_error() {
        let (ctx, transport) = context_with_handler(
            Role::Server,
            ConnectionConfig {
                max_frame_length: 64,
                ..ConnectionConfig::default()
            },
            Arc::new(EchoHandler::default()),
        );
        accept_request(&ctx, &request(1, &[1u8; 58]));
        let frames = wait_for_frames(&transport, 1);
        assert_eq!(frames[0].error_code(), Some(error_code::APPLICATION_ERROR));
    }
}
