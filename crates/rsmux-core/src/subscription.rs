//! Application-facing ends of interactions: blocking receivers for inbound
//! payloads and a credit-aware sink for outbound ones.

use std::fmt;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{MuxError, Result};
use crate::payload::Payload;

/// What an interaction delivers to its subscriber.
#[derive(Debug)]
pub(crate) enum Signal {
    Next(Payload),
    Complete,
    Error(MuxError),
}

/// Producer side of a subscriber channel; delivery fails silently once the
/// subscriber is gone.
pub(crate) fn deliver(tx: &Sender<Signal>, signal: Signal) {
    let _ = tx.send(signal);
}

/// Inbound side of an interaction that a `PayloadStream` pulls from.
pub(crate) trait InboundSource: Send + Sync {
    fn request(&self, n: u64);
    fn cancel(&self);
}

/// Outbound side of an interaction that a `PayloadSink` pushes to.
pub(crate) trait OutboundTarget: Send + Sync {
    /// Send one payload, blocking until the peer has granted credit.
    fn send_next(&self, payload: Payload) -> Result<()>;
    fn complete(&self) -> Result<()>;
    fn error(&self, error: MuxError) -> Result<()>;
    fn is_closed(&self) -> bool;
}

/// Single response of a request/response interaction.
///
/// The request is sent on the first `recv`. Dropping the subscription
/// before the response arrives cancels the interaction.
pub struct ResponseSubscription {
    source: Arc<dyn InboundSource>,
    signals: Receiver<Signal>,
    requested: bool,
    done: bool,
}

impl ResponseSubscription {
    pub(crate) fn new(source: Arc<dyn InboundSource>, signals: Receiver<Signal>) -> Self {
        Self {
            source,
            signals,
            requested: false,
            done: false,
        }
    }

    /// Wait for the response. `Ok(None)` means the responder completed
    /// without a payload.
    pub fn recv(&mut self) -> Result<Option<Payload>> {
        self.demand();
        let signal = self.signals.recv().ok();
        self.settle(signal)
    }

    /// `recv` with a deadline. On timeout the interaction stays active.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Payload>> {
        self.demand();
        match self.signals.recv_timeout(timeout) {
            Ok(signal) => self.settle(Some(signal)),
            Err(RecvTimeoutError::Timeout) => Err(MuxError::Canceled(format!(
                "no response within {timeout:?}"
            ))),
            Err(RecvTimeoutError::Disconnected) => self.settle(None),
        }
    }

    /// Cancel the interaction. Later `recv` calls fail with
    /// `MuxError::Canceled`.
    pub fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            self.source.cancel();
        }
    }

    fn demand(&mut self) {
        if !self.requested {
            self.requested = true;
            self.source.request(1);
        }
    }

    fn settle(&mut self, signal: Option<Signal>) -> Result<Option<Payload>> {
        self.done = true;
        match signal {
            Some(Signal::Next(payload)) => Ok(Some(payload)),
            Some(Signal::Complete) => Ok(None),
            Some(Signal::Error(err)) => Err(err),
            None => Err(MuxError::Canceled("interaction cancelled".into())),
        }
    }
}

impl Drop for ResponseSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ResponseSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSubscription")
            .field("requested", &self.requested)
            .field("done", &self.done)
            .finish()
    }
}

/// Sequence of inbound payloads with explicit demand.
///
/// Nothing arrives until `request(n)` grants demand. `u64::MAX` (or any
/// value of at least 2^31-1) requests everything. Dropping the stream
/// before it terminates cancels it.
pub struct PayloadStream {
    source: Arc<dyn InboundSource>,
    signals: Receiver<Signal>,
    done: bool,
}

impl PayloadStream {
    pub(crate) fn new(source: Arc<dyn InboundSource>, signals: Receiver<Signal>) -> Self {
        Self {
            source,
            signals,
            done: false,
        }
    }

    /// Grant demand for `n` more payloads.
    pub fn request(&mut self, n: u64) {
        if !self.done && n > 0 {
            self.source.request(n);
        }
    }

    /// Next payload; `Ok(None)` once the stream completed.
    pub fn recv(&mut self) -> Result<Option<Payload>> {
        if self.done {
            return Ok(None);
        }
        let signal = self.signals.recv().ok();
        self.settle(signal)
    }

    /// `recv` with a deadline. On timeout the stream stays active.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Payload>> {
        if self.done {
            return Ok(None);
        }
        match self.signals.recv_timeout(timeout) {
            Ok(signal) => self.settle(Some(signal)),
            Err(RecvTimeoutError::Timeout) => Err(MuxError::Canceled(format!(
                "no payload within {timeout:?}"
            ))),
            Err(RecvTimeoutError::Disconnected) => self.settle(None),
        }
    }

    /// Stop receiving. The peer is told to stop producing.
    pub fn cancel(&mut self) {
        if !self.done {
            self.done = true;
            self.source.cancel();
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn settle(&mut self, signal: Option<Signal>) -> Result<Option<Payload>> {
        match signal {
            Some(Signal::Next(payload)) => Ok(Some(payload)),
            Some(Signal::Complete) => {
                self.done = true;
                Ok(None)
            }
            Some(Signal::Error(err)) => {
                self.done = true;
                Err(err)
            }
            None => {
                self.done = true;
                Err(MuxError::Canceled("stream cancelled".into()))
            }
        }
    }
}

impl Iterator for PayloadStream {
    type Item = Result<Payload>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv().transpose()
    }
}

impl Drop for PayloadStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for PayloadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadStream")
            .field("done", &self.done)
            .finish()
    }
}

/// Outbound payloads of a stream or channel.
///
/// `send` blocks until the peer's REQUEST_N credit allows another payload.
/// Clones feed the same stream.
#[derive(Clone)]
pub struct PayloadSink {
    target: Arc<dyn OutboundTarget>,
}

impl PayloadSink {
    pub(crate) fn new(target: Arc<dyn OutboundTarget>) -> Self {
        Self { target }
    }

    /// Send one payload. Fails with `MuxError::Canceled` once the peer
    /// cancelled or the interaction ended.
    pub fn send(&self, payload: Payload) -> Result<()> {
        self.target.send_next(payload)
    }

    /// Finish the outbound side.
    pub fn complete(&self) -> Result<()> {
        self.target.complete()
    }

    /// Fail the interaction; the peer receives an ERROR frame.
    pub fn error(&self, error: MuxError) -> Result<()> {
        self.target.error(error)
    }

    /// Whether further `send` calls will fail.
    pub fn is_closed(&self) -> bool {
        self.target.is_closed()
    }
}

impl fmt::Debug for PayloadSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadSink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct CountingSource {
        requested: AtomicU64,
        cancels: AtomicUsize,
    }

    impl InboundSource for CountingSource {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn response_recv_requests_once() {
        let source = Arc::new(CountingSource::default());
        let (tx, rx) = mpsc::channel();
        let mut sub = ResponseSubscription::new(source.clone(), rx);

        deliver(&tx, Signal::Next(Payload::new("pong")));
        let payload = sub.recv().unwrap().unwrap();
        assert_eq!(payload.data().as_ref(), b"pong");
        assert_eq!(source.requested.load(Ordering::SeqCst), 1);

        drop(sub);
        assert_eq!(source.cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_pending_response_cancels() {
        let source = Arc::new(CountingSource::default());
        let (_tx, rx) = mpsc::channel();
        let sub = ResponseSubscription::new(source.clone(), rx);
        drop(sub);
        assert_eq!(source.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stream_iterates_until_complete() {
        let source = Arc::new(CountingSource::default());
        let (tx, rx) = mpsc::channel();
        let mut stream = PayloadStream::new(source.clone(), rx);
        stream.request(2);

        deliver(&tx, Signal::Next(Payload::new("a")));
        deliver(&tx, Signal::Next(Payload::new("b")));
        deliver(&tx, Signal::Complete);

        let items: Vec<_> = stream.by_ref().map(|p| p.unwrap().data_utf8()).collect();
        assert_eq!(items, vec!["a", "b"]);
        assert!(stream.is_done());
        drop(stream);
        assert_eq!(source.cancels.load(Ordering::SeqCst), 0);
        assert_eq!(source.requested.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stream_error_ends_iteration() {
        let source = Arc::new(CountingSource::default());
        let (tx, rx) = mpsc::channel();
        let mut stream = PayloadStream::new(source, rx);
        deliver(&tx, Signal::Error(MuxError::Application("boom".into())));

        assert!(matches!(stream.next(), Some(Err(MuxError::Application(_)))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn stream_timeout_keeps_stream_open() {
        let source = Arc::new(CountingSource::default());
        let (_tx, rx) = mpsc::channel();
        let mut stream = PayloadStream::new(source.clone(), rx);
        assert!(stream.recv_timeout(Duration::from_millis(5)).is_err());
        assert!(!stream.is_done());
        drop(stream);
        assert_eq!(source.cancels.load(Ordering::SeqCst), 1);
    }
}
