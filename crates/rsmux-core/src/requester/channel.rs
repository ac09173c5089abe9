//! Request/channel, requester side.
//!
//! Inbound (responder → here) and outbound (here → responder) terminate
//! independently; the stream leaves the registry once both have.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};

use rsmux_frame::{error_code, Frame, FrameType};

use crate::context::Context;
use crate::credit::Credit;
use crate::error::{MuxError, Result};
use crate::lease::LeasePermitHandler;
use crate::payload::Payload;
use crate::state::StateWord;
use crate::streams::{FrameSink, Reassembly, StreamHandler};
use crate::subscription::{
    deliver, InboundSource, OutboundTarget, PayloadSink, PayloadStream, Signal,
};
use crate::sync::lock;

use super::{excess_demand, initial_request_n, reject_second_subscriber, request_permit};

const FRAME_TYPE: FrameType = FrameType::RequestChannel;

pub(crate) struct RequestChannelRequester {
    ctx: Arc<Context>,
    this: Weak<Self>,
    state: StateWord,
    stream_id: AtomicU32,
    first: Mutex<Option<Payload>>,
    signals: Mutex<Option<Sender<Signal>>>,
    reassembly: Reassembly,
    /// Outbound allowance granted by the responder.
    credit: Credit,
    produced: AtomicU64,
    done: AtomicBool,
}

impl RequestChannelRequester {
    pub(crate) fn new(ctx: Arc<Context>, first: Payload) -> Arc<Self> {
        let reassembly = Reassembly::new(ctx.config.reassembly_config());
        Arc::new_cyclic(|this| Self {
            ctx,
            this: this.clone(),
            state: StateWord::new(),
            stream_id: AtomicU32::new(0),
            first: Mutex::new(Some(first)),
            signals: Mutex::new(None),
            reassembly,
            credit: Credit::new(0),
            produced: AtomicU64::new(0),
            done: AtomicBool::new(false),
        })
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Result<(PayloadSink, PayloadStream)> {
        if self.state.mark_subscribed().is_subscribed() {
            return Err(reject_second_subscriber(&self.ctx, FRAME_TYPE));
        }
        let checked = match lock(&self.first).as_ref() {
            Some(first) => self.ctx.check_payload(FRAME_TYPE, first),
            None => Ok(()),
        };
        if let Err(err) = checked {
            self.state.mark_terminated();
            lock(&self.first).take();
            return Err(err);
        }

        let (tx, rx) = mpsc::channel();
        *lock(&self.signals) = Some(tx);
        let source: Arc<dyn InboundSource> = self.clone();
        let target: Arc<dyn OutboundTarget> = self.clone();
        Ok((PayloadSink::new(target), PayloadStream::new(source, rx)))
    }

    fn stream_id(&self) -> u32 {
        self.stream_id.load(Ordering::Acquire)
    }

    fn entry(&self) -> Option<StreamHandler> {
        self.this.upgrade().map(StreamHandler::RequestChannel)
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
        let Some(first) = lock(&self.first).take() else {
            return;
        };
        let Some(entry) = self.entry() else {
            return;
        };
        let stream_id = match self.ctx.requesters.add_and_get_next_id(entry) {
            Ok(stream_id) => stream_id,
            Err(err) => {
                if !self.state.mark_terminated().is_terminated() {
                    self.credit.close();
                    self.finish(Signal::Error(err));
                }
                return;
            }
        };
        self.stream_id.store(stream_id, Ordering::Release);
        self.ctx
            .interceptor
            .on_start(stream_id, FRAME_TYPE, first.metadata());

        let current = self.state.load();
        let initial = initial_request_n(current.demand(), current.is_unbounded());
        let complete = current.is_outbound_terminated();
        if let Err(err) = self
            .ctx
            .send_payload(stream_id, FRAME_TYPE, initial, complete, first)
        {
            if !self.state.mark_terminated().is_terminated() {
                self.credit.close();
                self.remove();
                self.ctx.interceptor.on_terminate(stream_id, FRAME_TYPE, Some(&err));
                self.finish(Signal::Error(err));
            }
            return;
        }

        let prev = self.state.mark_first_frame_sent();
        if prev.is_terminated() {
            if !self.done.load(Ordering::Acquire) {
                tracing::debug!(stream_id, "cancelled while the request was being sent");
                self.ctx.send_quietly(Frame::cancel(stream_id));
                self.remove();
                self.ctx.interceptor.on_cancel(stream_id, FRAME_TYPE);
            }
            return;
        }
        if prev.is_outbound_terminated() && !complete {
            self.ctx.send_quietly(Frame::complete(stream_id));
        }
        if let Some(n) = excess_demand(prev.demand(), prev.is_unbounded(), initial) {
            self.ctx.send_quietly(Frame::request_n_frame(stream_id, n));
        }
    }

    /// Fail both directions. `notify` is the frame telling the responder,
    /// if the stream ever reached it.
    fn fail(&self, error: MuxError, notify: impl FnOnce(u32) -> Frame) {
        self.done.store(true, Ordering::Release);
        let prev = self.state.mark_terminated();
        if prev.is_terminated() {
            return;
        }
        self.credit.close();
        lock(&self.first).take();
        self.reassembly.release(&self.state);
        let stream_id = self.stream_id();
        if prev.is_first_frame_sent() {
            tracing::warn!(stream_id, error = %error, "channel failed");
            self.ctx.send_quietly(notify(stream_id));
        }
        self.remove();
        if stream_id != 0 {
            self.ctx.interceptor.on_terminate(stream_id, FRAME_TYPE, Some(&error));
        }
        self.finish(Signal::Error(error));
    }

    /// Both directions are closed now; the stream is over.
    fn terminated(&self) {
        self.remove();
        self.ctx
            .interceptor
            .on_terminate(self.stream_id(), FRAME_TYPE, None);
    }
}

impl InboundSource for RequestChannelRequester {
    fn request(&self, n: u64) {
        let prev = self.state.add_request_n(n);
        if prev.is_terminated() || prev.is_inbound_terminated() || prev.is_unbounded() {
            return;
        }
        if prev.is_first_frame_sent() {
            self.ctx.send_quietly(Frame::request_n_frame(self.stream_id(), n));
        } else if prev.demand() == 0 {
            if let Some(this) = self.this.upgrade() {
                request_permit(&self.ctx, &self.state, this, |this| this.send_first_frame());
            }
        }
    }

    /// Cancelling the inbound side ends the whole channel.
    fn cancel(&self) {
        let prev = self.state.mark_terminated();
        if prev.is_terminated() {
            return;
        }
        self.credit.close();
        lock(&self.first).take();
        lock(&self.signals).take();
        self.reassembly.release(&self.state);
        if prev.is_first_frame_sent() {
            let stream_id = self.stream_id();
            let frame = if prev.is_inbound_terminated() {
                Frame::error(stream_id, error_code::CANCELED, "channel cancelled")
            } else {
                Frame::cancel(stream_id)
            };
            self.ctx.send_quietly(frame);
            self.remove();
            self.ctx.interceptor.on_cancel(stream_id, FRAME_TYPE);
        }
    }
}

impl OutboundTarget for RequestChannelRequester {
    fn send_next(&self, payload: Payload) -> Result<()> {
        if self.state.load().is_outbound_terminated() {
            return Err(MuxError::Canceled("channel outbound is closed".into()));
        }
        if let Err(err) = self.ctx.check_payload(FrameType::Next, &payload) {
            let message = err.to_string();
            self.fail(MuxError::Canceled(message.clone()), |id| {
                Frame::error(id, error_code::APPLICATION_ERROR, &message)
            });
            return Err(err);
        }
        if !self.credit.acquire() {
            return Err(MuxError::Canceled("channel outbound is closed".into()));
        }
        let stream_id = self.stream_id();
        if let Err(err) = self
            .ctx
            .send_payload(stream_id, FrameType::Next, 0, false, payload)
        {
            let message = err.to_string();
            self.fail(MuxError::ConnectionClosed(message), Frame::cancel);
            return Err(err);
        }
        Ok(())
    }

    fn complete(&self) -> Result<()> {
        let prev = self.state.mark_outbound_terminated();
        if prev.is_terminated() || prev.is_outbound_terminated() {
            return Ok(());
        }
        self.credit.close();
        if prev.is_first_frame_sent() {
            self.ctx.send_quietly(Frame::complete(self.stream_id()));
        }
        if prev.is_inbound_terminated() {
            self.terminated();
        }
        Ok(())
    }

    fn error(&self, error: MuxError) -> Result<()> {
        let message = error.error_message();
        let code = error.error_code();
        self.fail(
            MuxError::Canceled(format!("channel outbound failed: {message}")),
            |id| Frame::error(id, code, &message),
        );
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.load().is_outbound_terminated()
    }
}

impl LeasePermitHandler for RequestChannelRequester {
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
        self.credit.close();
        let first = lock(&self.first).take();
        self.ctx.interceptor.on_reject(
            &error,
            FRAME_TYPE,
            first.as_ref().and_then(Payload::metadata),
        );
        self.finish(Signal::Error(error));
    }
}

impl FrameSink for RequestChannelRequester {
    fn handle_payload(&self, frame: &Frame) {
        let state = self.state.load();
        if state.is_terminated() || state.is_inbound_terminated() {
            return;
        }
        let frame = match self.reassembly.accept(&self.state, frame) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                self.fail(err.into(), Frame::cancel);
                return;
            }
        };

        if frame.is_next() {
            let produced = self.produced.fetch_add(1, Ordering::AcqRel) + 1;
            let state = self.state.load();
            if !state.is_unbounded() && produced > state.demand() {
                self.fail(
                    MuxError::Overflow {
                        requested: state.demand(),
                        produced,
                    },
                    Frame::cancel,
                );
                return;
            }
            match Payload::from_frame(&frame) {
                Ok(payload) => {
                    if let Some(tx) = lock(&self.signals).as_ref() {
                        deliver(tx, Signal::Next(payload));
                    }
                }
                Err(err) => {
                    self.fail(err, Frame::cancel);
                    return;
                }
            }
        }

        if frame.is_complete() {
            self.done.store(true, Ordering::Release);
            let prev = self.state.mark_inbound_terminated();
            if prev.is_terminated() || prev.is_inbound_terminated() {
                return;
            }
            self.finish(Signal::Complete);
            if prev.is_outbound_terminated() {
                self.terminated();
            }
        }
    }

    fn handle_request_n(&self, n: u32) {
        if !self.state.load().is_outbound_terminated() {
            self.credit.add(u64::from(n));
        }
    }

    /// The responder no longer wants our payloads; inbound continues.
    fn handle_cancel(&self) {
        let prev = self.state.mark_outbound_terminated();
        if prev.is_terminated() || prev.is_outbound_terminated() {
            return;
        }
        self.credit.close();
        if prev.is_inbound_terminated() {
            self.terminated();
        }
    }

    fn handle_error(&self, error: MuxError) {
        self.done.store(true, Ordering::Release);
        if self.state.mark_terminated().is_terminated() {
            return;
        }
        self.credit.close();
        lock(&self.first).take();
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
        self.fail(error, Frame::cancel);
    }
}

/// A request/channel interaction that has not been subscribed yet.
#[derive(Clone)]
pub struct RequestChannel {
    inner: Arc<RequestChannelRequester>,
}

impl RequestChannel {
    pub(crate) fn new(ctx: Arc<Context>, first: Payload) -> Self {
        Self {
            inner: RequestChannelRequester::new(ctx, first),
        }
    }

    /// Attach the single subscriber.
    ///
    /// The REQUEST_CHANNEL frame (carrying the first payload) goes out with
    /// the first `request(n)` on the returned stream. `send` on the sink
    /// blocks until the responder grants demand, which it can only do after
    /// that frame.
    pub fn subscribe(&self) -> Result<(PayloadSink, PayloadStream)> {
        self.inner.subscribe()
    }
}

impl fmt::Debug for RequestChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestChannel")
            .field("stream_id", &self.inner.stream_id())
            .field("state", &self.inner.state.load())
            .field("credit", &self.inner.credit.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::context::testing::context;
    use crate::registry::Role;

    fn next(stream_id: u32, data: &[u8]) -> Frame {
        Frame::payload_frame(stream_id, FrameType::Next, 0, 0, None, data).unwrap()
    }

    #[test]
    fn sink_waits_for_request_n() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let (sink, mut inbound) = RequestChannel::new(ctx.clone(), Payload::new("first"))
            .subscribe()
            .unwrap();
        inbound.request(4);
        assert_eq!(transport.frames()[0].request_n(), Some(4));

        let producer = thread::spawn(move || sink.send(Payload::new("second")));
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(transport.frames().len(), 1);

        ctx.requesters.lookup(1).unwrap().handle_request_n(1);
        producer.join().unwrap().unwrap();
        assert_eq!(
            transport.types(),
            vec![FrameType::RequestChannel, FrameType::Next]
        );
    }

    #[test]
    fn complete_before_first_frame_rides_on_it() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let (sink, mut inbound) = RequestChannel::new(ctx, Payload::new("only"))
            .subscribe()
            .unwrap();
        sink.complete().unwrap();
        inbound.request(1);

        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_complete());
        assert!(sink.is_closed());
    }

    #[test]
    fn both_directions_must_finish() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let (sink, mut inbound) = RequestChannel::new(ctx.clone(), Payload::new("a"))
            .subscribe()
            .unwrap();
        inbound.request(1);
        let entry = ctx.requesters.lookup(1).unwrap();

        let last = Frame::payload_frame(1, FrameType::NextComplete, 0, 0, None, b"r").unwrap();
        entry.handle_payload(&last);
        assert_eq!(inbound.recv().unwrap().unwrap().data_utf8(), "r");
        assert!(inbound.recv().unwrap().is_none());
        assert!(ctx.requesters.contains(1));

        sink.complete().unwrap();
        assert!(!ctx.requesters.contains(1));
        assert_eq!(
            transport.types(),
            vec![FrameType::RequestChannel, FrameType::Complete]
        );
    }

    #[test]
    fn responder_cancel_closes_outbound_only() {
        let (ctx, _) = context(Role::Client, ConnectionConfig::default());
        let (sink, mut inbound) = RequestChannel::new(ctx.clone(), Payload::new("a"))
            .subscribe()
            .unwrap();
        inbound.request(2);
        let entry = ctx.requesters.lookup(1).unwrap();
        entry.handle_cancel();

        assert!(matches!(
            sink.send(Payload::new("late")),
            Err(MuxError::Canceled(_))
        ));
        entry.handle_payload(&next(1, b"still flowing"));
        assert_eq!(inbound.recv().unwrap().unwrap().data_utf8(), "still flowing");
        assert!(ctx.requesters.contains(1));
    }

    #[test]
    fn outbound_error_after_inbound_complete_sends_error() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let (sink, mut inbound) = RequestChannel::new(ctx.clone(), Payload::new("a"))
            .subscribe()
            .unwrap();
        inbound.request(1);
        let entry = ctx.requesters.lookup(1).unwrap();
        entry.handle_payload(&Frame::complete(1));
        assert!(inbound.recv().unwrap().is_none());

        sink.error(MuxError::Application("producer died".into())).unwrap();
        let frames = transport.frames();
        let last = frames.last().unwrap();
        assert_eq!(last.frame_type(), FrameType::Error);
        assert_eq!(last.error_code(), Some(error_code::APPLICATION_ERROR));
        assert!(!ctx.requesters.contains(1));
    }

    #[test]
    fn dropping_inbound_cancels_channel() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let (sink, mut inbound) = RequestChannel::new(ctx.clone(), Payload::new("a"))
            .subscribe()
            .unwrap();
        inbound.request(1);
        drop(inbound);

        assert_eq!(
            transport.types(),
            vec![FrameType::RequestChannel, FrameType::Cancel]
        );
        assert!(sink.is_closed());
        assert!(!ctx.requesters.contains(1));
    }
}
