//! Request/stream, requester side.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, Weak};

use rsmux_frame::{Frame, FrameType};

use crate::context::Context;
use crate::error::{MuxError, Result};
use crate::lease::LeasePermitHandler;
use crate::payload::Payload;
use crate::state::StateWord;
use crate::streams::{FrameSink, Reassembly, StreamHandler};
use crate::subscription::{deliver, InboundSource, PayloadStream, Signal};
use crate::sync::lock;

use super::{excess_demand, initial_request_n, reject_second_subscriber, request_permit};

const FRAME_TYPE: FrameType = FrameType::RequestStream;

pub(crate) struct RequestStreamRequester {
    ctx: Arc<Context>,
    this: Weak<Self>,
    state: StateWord,
    stream_id: AtomicU32,
    payload: Mutex<Option<Payload>>,
    signals: Mutex<Option<Sender<Signal>>>,
    reassembly: Reassembly,
    produced: AtomicU64,
    done: AtomicBool,
}

impl RequestStreamRequester {
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
            produced: AtomicU64::new(0),
            done: AtomicBool::new(false),
        })
    }

    pub(crate) fn subscribe(self: &Arc<Self>) -> Result<PayloadStream> {
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
        Ok(PayloadStream::new(source, rx))
    }

    fn stream_id(&self) -> u32 {
        self.stream_id.load(Ordering::Acquire)
    }

    fn entry(&self) -> Option<StreamHandler> {
        self.this.upgrade().map(StreamHandler::RequestStream)
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
                if !self.state.mark_terminated().is_terminated() {
                    self.finish(Signal::Error(err));
                }
                return;
            }
        };
        self.stream_id.store(stream_id, Ordering::Release);
        self.ctx
            .interceptor
            .on_start(stream_id, FRAME_TYPE, payload.metadata());

        let current = self.state.load();
        let initial = initial_request_n(current.demand(), current.is_unbounded());
        if let Err(err) = self
            .ctx
            .send_payload(stream_id, FRAME_TYPE, initial, false, payload)
        {
            if !self.state.mark_terminated().is_terminated() {
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
        if let Some(n) = excess_demand(prev.demand(), prev.is_unbounded(), initial) {
            self.ctx.send_quietly(Frame::request_n_frame(stream_id, n));
        }
    }

    /// Terminate locally and tell the peer to stop.
    fn cancel_with(&self, error: MuxError) {
        self.done.store(true, Ordering::Release);
        if self.state.mark_terminated().is_terminated() {
            return;
        }
        let stream_id = self.stream_id();
        tracing::warn!(stream_id, error = %error, "cancelling stream");
        self.reassembly.release(&self.state);
        self.ctx.send_quietly(Frame::cancel(stream_id));
        self.remove();
        self.ctx.interceptor.on_terminate(stream_id, FRAME_TYPE, Some(&error));
        self.finish(Signal::Error(error));
    }
}

impl InboundSource for RequestStreamRequester {
    fn request(&self, n: u64) {
        let prev = self.state.add_request_n(n);
        if prev.is_terminated() || prev.is_unbounded() {
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

impl LeasePermitHandler for RequestStreamRequester {
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

impl FrameSink for RequestStreamRequester {
    fn handle_payload(&self, frame: &Frame) {
        if self.state.load().is_terminated() {
            return;
        }
        let frame = match self.reassembly.accept(&self.state, frame) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                self.cancel_with(err.into());
                return;
            }
        };

        if frame.is_next() {
            let produced = self.produced.fetch_add(1, Ordering::AcqRel) + 1;
            let state = self.state.load();
            if !state.is_unbounded() && produced > state.demand() {
                self.cancel_with(MuxError::Overflow {
                    requested: state.demand(),
                    produced,
                });
                return;
            }
            match Payload::from_frame(&frame) {
                Ok(payload) => {
                    if let Some(tx) = lock(&self.signals).as_ref() {
                        deliver(tx, Signal::Next(payload));
                    }
                }
                Err(err) => {
                    self.cancel_with(err);
                    return;
                }
            }
        }

        if frame.is_complete() {
            self.done.store(true, Ordering::Release);
            if self.state.mark_terminated().is_terminated() {
                return;
            }
            self.remove();
            self.ctx
                .interceptor
                .on_terminate(self.stream_id(), FRAME_TYPE, None);
            self.finish(Signal::Complete);
        }
    }

    fn handle_error(&self, error: MuxError) {
        self.done.store(true, Ordering::Release);
        if self.state.mark_terminated().is_terminated() {
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
        self.cancel_with(error);
    }
}

/// A request/stream interaction that has not been subscribed yet.
#[derive(Clone)]
pub struct RequestStream {
    inner: Arc<RequestStreamRequester>,
}

impl RequestStream {
    pub(crate) fn new(ctx: Arc<Context>, payload: Payload) -> Self {
        Self {
            inner: RequestStreamRequester::new(ctx, payload),
        }
    }

    /// Attach the single subscriber. The request goes out with the first
    /// `request(n)` on the returned stream, carrying `n` as its initial
    /// demand.
    pub fn subscribe(&self) -> Result<PayloadStream> {
        self.inner.subscribe()
    }
}

impl fmt::Debug for RequestStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestStream")
            .field("stream_id", &self.inner.stream_id())
            .field("state", &self.inner.state.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use rsmux_frame::frame_type::FLAG_FOLLOWS;

    use super::*;
    use crate::config::ConnectionConfig;
    use crate::context::testing::{context, RecordingTransport};
    use crate::registry::Role;

    const RACE_ROUNDS: usize = 500;

    fn next(stream_id: u32, data: &[u8]) -> Frame {
        Frame::payload_frame(stream_id, FrameType::Next, 0, 0, None, data).unwrap()
    }

    /// Start a stream with demand 1, then run `inbound` on this thread while
    /// another thread cancels it.
    fn race_cancel(
        prepare: impl Fn(&StreamHandler),
        inbound: impl Fn(&StreamHandler),
    ) -> (Arc<Context>, Arc<RecordingTransport>, Arc<RequestStreamRequester>, PayloadStream) {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let requester = RequestStreamRequester::new(ctx.clone(), Payload::new("q"));
        let mut stream = requester.subscribe().unwrap();
        stream.request(1);
        let entry = ctx.requesters.lookup(1).unwrap();
        prepare(&entry);

        let barrier = Arc::new(Barrier::new(2));
        let canceller = {
            let requester = requester.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                InboundSource::cancel(requester.as_ref());
            })
        };
        barrier.wait();
        inbound(&entry);
        canceller.join().unwrap();
        (ctx, transport, requester, stream)
    }

    /// Exactly one of: CANCEL went out, or the subscriber saw completion.
    fn assert_settled_once(
        ctx: &Context,
        transport: &RecordingTransport,
        requester: &RequestStreamRequester,
        stream: &mut PayloadStream,
    ) {
        let cancels = transport
            .types()
            .into_iter()
            .filter(|t| *t == FrameType::Cancel)
            .count();
        assert!(cancels <= 1, "{cancels} CANCEL frames");
        assert_eq!(ctx.requesters.len(), 0);
        assert!(!requester.state.load().is_reassembling());

        let mut delivered = 0;
        let completed = loop {
            match stream.recv() {
                Ok(Some(_)) => delivered += 1,
                Ok(None) => break true,
                Err(MuxError::Canceled(_)) => break false,
                Err(err) => panic!("unexpected error: {err}"),
            }
        };
        assert!(delivered <= 1);
        assert_eq!(usize::from(completed) + cancels, 1);
        assert!(matches!(stream.recv(), Ok(None)));
    }

    #[test]
    fn first_request_sets_initial_demand() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let mut stream = RequestStream::new(ctx, Payload::new("q")).subscribe().unwrap();
        assert!(transport.frames().is_empty());

        stream.request(5);
        stream.request(2);
        let frames = transport.frames();
        assert_eq!(frames[0].frame_type(), FrameType::RequestStream);
        assert_eq!(frames[0].request_n(), Some(5));
        assert_eq!(frames[1].frame_type(), FrameType::RequestN);
        assert_eq!(frames[1].request_n(), Some(2));
    }

    #[test]
    fn unbounded_demand_sends_max_once() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let mut stream = RequestStream::new(ctx, Payload::new("q")).subscribe().unwrap();
        stream.request(u64::MAX);
        stream.request(10);
        let frames = transport.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].request_n(), Some(rsmux_frame::MAX_REQUEST_N));
    }

    #[test]
    fn delivers_until_complete() {
        let (ctx, _) = context(Role::Client, ConnectionConfig::default());
        let mut stream = RequestStream::new(ctx.clone(), Payload::new("q"))
            .subscribe()
            .unwrap();
        stream.request(2);
        let entry = ctx.requesters.lookup(1).unwrap();
        entry.handle_payload(&next(1, b"a"));
        entry.handle_payload(&next(1, b"b"));
        entry.handle_payload(&Frame::complete(1));

        let items: Vec<_> = stream.by_ref().map(|p| p.unwrap().data_utf8()).collect();
        assert_eq!(items, vec!["a", "b"]);
        assert_eq!(ctx.requesters.len(), 0);
    }

    #[test]
    fn overflow_cancels_once() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let mut stream = RequestStream::new(ctx.clone(), Payload::new("q"))
            .subscribe()
            .unwrap();
        stream.request(1);
        let entry = ctx.requesters.lookup(1).unwrap();
        entry.handle_payload(&next(1, b"a"));
        entry.handle_payload(&next(1, b"b"));
        entry.handle_payload(&next(1, b"c"));

        assert_eq!(stream.recv().unwrap().unwrap().data_utf8(), "a");
        assert!(matches!(
            stream.recv(),
            Err(MuxError::Overflow {
                requested: 1,
                produced: 2
            })
        ));
        let cancels = transport
            .types()
            .into_iter()
            .filter(|t| *t == FrameType::Cancel)
            .count();
        assert_eq!(cancels, 1);
        assert_eq!(ctx.requesters.len(), 0);
    }

    #[test]
    fn drop_after_start_sends_cancel() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let mut stream = RequestStream::new(ctx.clone(), Payload::new("q"))
            .subscribe()
            .unwrap();
        stream.request(1);
        drop(stream);
        assert_eq!(
            transport.types(),
            vec![FrameType::RequestStream, FrameType::Cancel]
        );
        assert_eq!(ctx.requesters.len(), 0);
    }

    #[test]
    fn cancel_racing_complete_settles_once() {
        for _ in 0..RACE_ROUNDS {
            let (ctx, transport, requester, mut stream) =
                race_cancel(|_| {}, |entry| entry.handle_payload(&Frame::complete(1)));
            assert_settled_once(&ctx, &transport, &requester, &mut stream);
        }
    }

    #[test]
    fn cancel_racing_last_fragment_settles_once() {
        for _ in 0..RACE_ROUNDS {
            let (ctx, transport, requester, mut stream) = race_cancel(
                |entry| {
                    let head =
                        Frame::payload_frame(1, FrameType::Next, FLAG_FOLLOWS, 0, None, &[7u8; 128])
                            .unwrap();
                    entry.handle_payload(&head);
                },
                |entry| {
                    let tail =
                        Frame::payload_frame(1, FrameType::NextComplete, 0, 0, None, b"tail")
                            .unwrap();
                    entry.handle_payload(&tail);
                },
            );
            assert_settled_once(&ctx, &transport, &requester, &mut stream);
        }
    }

    #[test]
    fn malformed_frame_cancels_and_fails_locally() {
        let (ctx, transport) = context(Role::Client, ConnectionConfig::default());
        let mut stream = RequestStream::new(ctx.clone(), Payload::new("q"))
            .subscribe()
            .unwrap();
        stream.request(1);
        let entry = ctx.requesters.lookup(1).unwrap();
        entry.handle_malformed(MuxError::Invalid("short metadata".into()));
        entry.handle_malformed(MuxError::Invalid("short metadata".into()));

        assert_eq!(
            transport.types(),
            vec![FrameType::RequestStream, FrameType::Cancel]
        );
        assert!(matches!(stream.recv(), Err(MuxError::Invalid(_))));
        assert_eq!(ctx.requesters.len(), 0);
    }
}
