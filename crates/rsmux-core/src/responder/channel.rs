//! Request/channel, responder side.
//!
//! The handler gets the requester's payloads as a [`PayloadStream`] and
//! answers through a [`PayloadSink`]. Demand on the inbound stream is
//! forwarded to the requester one-to-one as REQUEST_N.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};

use rsmux_frame::{error_code, Frame, FrameType};

use crate::context::Context;
use crate::credit::Credit;
use crate::error::{MuxError, Result};
use crate::payload::Payload;
use crate::state::StateWord;
use crate::streams::{FrameSink, Reassembly, StreamHandler};
use crate::subscription::{
    deliver, InboundSource, OutboundTarget, PayloadSink, PayloadStream, Signal,
};
use crate::sync::lock;

use super::{invalid, spawn_worker};

const FRAME_TYPE: FrameType = FrameType::RequestChannel;

pub(crate) struct ChannelResponder {
    ctx: Arc<Context>,
    this: Weak<Self>,
    stream_id: u32,
    state: StateWord,
    reassembly: Reassembly,
    /// Outbound allowance granted by the requester.
    credit: Credit,
    signals: Mutex<Option<Sender<Signal>>>,
    produced: AtomicU64,
    started: AtomicBool,
}

impl ChannelResponder {
    pub(crate) fn new(ctx: &Arc<Context>, stream_id: u32, initial_request_n: u64) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            ctx: Arc::clone(ctx),
            this: this.clone(),
            stream_id,
            state: StateWord::new(),
            reassembly: Reassembly::new(ctx.config.reassembly_config()),
            credit: Credit::new(initial_request_n),
            signals: Mutex::new(None),
            produced: AtomicU64::new(0),
            started: AtomicBool::new(false),
        })
    }

    fn remove(&self) {
        if let Some(this) = self.this.upgrade() {
            self.ctx
                .responders
                .remove(self.stream_id, &StreamHandler::ChannelResponder(this));
        }
    }

    fn finish_inbound(&self, signal: Signal) {
        if let Some(tx) = lock(&self.signals).take() {
            deliver(&tx, signal);
        }
    }

    fn start(&self, frame: &Frame) {
        let first = match Payload::from_frame(frame) {
            Ok(payload) => payload,
            Err(err) => {
                self.fail(err, |id, err| invalid(id, &err.to_string()));
                return;
            }
        };
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.started.store(true, Ordering::Release);
        self.ctx
            .interceptor
            .on_start(self.stream_id, FRAME_TYPE, first.metadata());

        let (tx, rx) = mpsc::channel();
        *lock(&self.signals) = Some(tx);
        let source: Arc<dyn InboundSource> = this.clone();
        let inbound = PayloadStream::new(source, rx);
        if frame.is_complete() {
            self.complete_inbound();
        }

        let spawned = spawn_worker(&self.ctx, self.stream_id, move || {
            let target: Arc<dyn OutboundTarget> = this.clone();
            let sink = PayloadSink::new(target);
            let result = this.ctx.handler.request_channel(first, inbound, &sink);
            let _ = match result {
                Ok(()) => this.complete(),
                Err(err) => this.error(err),
            };
        });
        if let Err(err) = spawned {
            let _ = self.error(MuxError::Application(format!("cannot start handler: {err}")));
        }
    }

    fn complete_inbound(&self) {
        let prev = self.state.mark_inbound_terminated();
        if prev.is_terminated() || prev.is_inbound_terminated() {
            return;
        }
        self.finish_inbound(Signal::Complete);
        if prev.is_outbound_terminated() {
            self.terminated();
        }
    }

    fn inbound_payload(&self, frame: &Frame) {
        if frame.is_next() {
            let produced = self.produced.fetch_add(1, Ordering::AcqRel) + 1;
            let state = self.state.load();
            if !state.is_unbounded() && produced > state.demand() {
                let error = MuxError::Overflow {
                    requested: state.demand(),
                    produced,
                };
                self.fail(error, |id, err| invalid(id, &err.to_string()));
                return;
            }
            match Payload::from_frame(frame) {
                Ok(payload) => {
                    if let Some(tx) = lock(&self.signals).as_ref() {
                        deliver(tx, Signal::Next(payload));
                    }
                }
                Err(err) => {
                    self.fail(err, |id, err| invalid(id, &err.to_string()));
                    return;
                }
            }
        }
        if frame.is_complete() {
            self.complete_inbound();
        }
    }

    /// Terminate both directions, telling the requester with the frame
    /// `notify` builds.
    fn fail(&self, error: MuxError, notify: impl FnOnce(u32, &MuxError) -> Frame) {
        if self.state.mark_terminated().is_terminated() {
            return;
        }
        tracing::warn!(stream_id = self.stream_id, error = %error, "channel failed");
        self.credit.close();
        self.reassembly.release(&self.state);
        self.ctx.send_quietly(notify(self.stream_id, &error));
        self.remove();
        if self.started.load(Ordering::Acquire) {
            self.ctx
                .interceptor
                .on_terminate(self.stream_id, FRAME_TYPE, Some(&error));
        }
        self.finish_inbound(Signal::Error(error));
    }

    fn terminated(&self) {
        self.remove();
        self.ctx
            .interceptor
            .on_terminate(self.stream_id, FRAME_TYPE, None);
    }
}

impl InboundSource for ChannelResponder {
    fn request(&self, n: u64) {
        let prev = self.state.add_request_n(n);
        if prev.is_terminated() || prev.is_inbound_terminated() || prev.is_unbounded() {
            return;
        }
        self.ctx.send_quietly(Frame::request_n_frame(self.stream_id, n));
    }

    /// The handler stopped reading: the requester is told to stop sending;
    /// our outbound side carries on.
    fn cancel(&self) {
        let prev = self.state.mark_inbound_terminated();
        if prev.is_terminated() || prev.is_inbound_terminated() {
            return;
        }
        lock(&self.signals).take();
        self.ctx.send_quietly(Frame::cancel(self.stream_id));
        if prev.is_outbound_terminated() {
            self.terminated();
        }
    }
}

impl OutboundTarget for ChannelResponder {
    fn send_next(&self, payload: Payload) -> Result<()> {
        if self.state.load().is_outbound_terminated() {
            return Err(MuxError::Canceled("channel outbound is closed".into()));
        }
        if let Err(err) = self.ctx.check_payload(FrameType::Next, &payload) {
            let message = err.to_string();
            self.fail(MuxError::Canceled(message), |id, err| {
                Frame::error(id, error_code::APPLICATION_ERROR, &err.error_message())
            });
            return Err(err);
        }
        if !self.credit.acquire() {
            return Err(MuxError::Canceled("channel outbound is closed".into()));
        }
        self.ctx
            .send_payload(self.stream_id, FrameType::Next, 0, false, payload)
            .inspect_err(|err| {
                self.fail(MuxError::ConnectionClosed(err.to_string()), |id, _| {
                    Frame::cancel(id)
                });
            })
    }

    fn complete(&self) -> Result<()> {
        let prev = self.state.mark_outbound_terminated();
        if prev.is_terminated() || prev.is_outbound_terminated() {
            return Ok(());
        }
        self.credit.close();
        let finished = prev.is_inbound_terminated();
        if finished {
            self.remove();
        }
        self.ctx.send_quietly(Frame::complete(self.stream_id));
        if finished {
            self.ctx
                .interceptor
                .on_terminate(self.stream_id, FRAME_TYPE, None);
        }
        Ok(())
    }

    fn error(&self, error: MuxError) -> Result<()> {
        let code = error.error_code();
        let message = error.error_message();
        self.fail(
            MuxError::Canceled(format!("channel outbound failed: {message}")),
            |id, _| Frame::error(id, code, &message),
        );
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.load().is_outbound_terminated()
    }
}

impl FrameSink for ChannelResponder {
    fn handle_payload(&self, frame: &Frame) {
        let state = self.state.load();
        if state.is_terminated() || state.is_inbound_terminated() {
            return;
        }
        let frame = match self.reassembly.accept(&self.state, frame) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                self.fail(err.into(), |id, err| invalid(id, &err.to_string()));
                return;
            }
        };
        if self.started.load(Ordering::Acquire) {
            self.inbound_payload(&frame);
        } else {
            self.start(&frame);
        }
    }

    fn handle_request_n(&self, n: u32) {
        if !self.state.load().is_outbound_terminated() {
            self.credit.add(u64::from(n));
        }
    }

    /// The requester cancels the whole channel.
    fn handle_cancel(&self) {
        let prev = self.state.mark_terminated();
        if prev.is_terminated() {
            return;
        }
        self.credit.close();
        self.reassembly.release(&self.state);
        self.remove();
        if self.started.load(Ordering::Acquire) {
            self.ctx.interceptor.on_cancel(self.stream_id, FRAME_TYPE);
        }
        self.finish_inbound(Signal::Error(MuxError::Canceled(
            "channel cancelled by the requester".into(),
        )));
    }

    fn handle_error(&self, error: MuxError) {
        if self.state.mark_terminated().is_terminated() {
            return;
        }
        self.credit.close();
        self.reassembly.release(&self.state);
        self.remove();
        if self.started.load(Ordering::Acquire) {
            self.ctx
                .interceptor
                .on_terminate(self.stream_id, FRAME_TYPE, Some(&error));
        }
        self.finish_inbound(Signal::Error(error));
    }

    fn handle_malformed(&self, error: MuxError) {
        self.fail(error, |id, err| invalid(id, &err.to_string()));
    }
}
