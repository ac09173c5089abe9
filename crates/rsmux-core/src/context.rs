//! State shared by a connection's receive thread, its interactions and the
//! application handles.

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Condvar, Mutex};

use rsmux_frame::frame_type::FLAG_COMPLETE;
use rsmux_frame::{
    encoded_payload_len, error_code, is_fragmentable, is_valid, Frame, FrameType, Fragmenter,
    FRAME_LENGTH_SIZE,
};

use crate::config::ConnectionConfig;
use crate::error::{MuxError, Result};
use crate::handler::RequestHandler;
use crate::interceptor::RequestInterceptor;
use crate::lease::{RequesterLeaseTracker, ResponderLeaseTracker};
use crate::payload::Payload;
use crate::registry::{Role, StreamRegistry};
use crate::streams::StreamHandler;
use crate::sync::{lock, wait};
use crate::transport::DuplexConnection;

pub(crate) struct Context {
    pub(crate) role: Role,
    pub(crate) config: ConnectionConfig,
    transport: Arc<dyn DuplexConnection>,
    /// Streams this side started.
    pub(crate) requesters: StreamRegistry<StreamHandler>,
    /// Streams the peer started.
    pub(crate) responders: StreamRegistry<StreamHandler>,
    pub(crate) handler: Arc<dyn RequestHandler>,
    pub(crate) interceptor: Arc<dyn RequestInterceptor>,
    pub(crate) requester_leases: Option<RequesterLeaseTracker>,
    pub(crate) responder_leases: Option<ResponderLeaseTracker>,
    /// Handler threads currently running.
    pub(crate) workers: Arc<AtomicUsize>,
    close_reason: Mutex<Option<String>>,
    closed: Condvar,
}

impl Context {
    pub(crate) fn new(
        role: Role,
        config: ConnectionConfig,
        transport: Arc<dyn DuplexConnection>,
        handler: Arc<dyn RequestHandler>,
        interceptor: Arc<dyn RequestInterceptor>,
    ) -> Self {
        let (requester_leases, responder_leases) = match config.lease {
            Some(lease) => (
                Some(RequesterLeaseTracker::new(lease.max_pending_requests)),
                Some(ResponderLeaseTracker::new()),
            ),
            None => (None, None),
        };
        Self {
            role,
            config,
            transport,
            requesters: StreamRegistry::initiator(role),
            responders: StreamRegistry::acceptor(),
            handler,
            interceptor,
            requester_leases,
            responder_leases,
            workers: Arc::new(AtomicUsize::new(0)),
            close_reason: Mutex::new(None),
            closed: Condvar::new(),
        }
    }

    pub(crate) fn send(&self, frame: Frame) -> Result<()> {
        self.transport.send(frame)
    }

    /// Send a frame whose loss only matters to a stream that is already
    /// ending.
    pub(crate) fn send_quietly(&self, frame: Frame) {
        let stream_id = frame.stream_id();
        let frame_type = frame.frame_type();
        if let Err(err) = self.transport.send(frame) {
            tracing::debug!(stream_id, %frame_type, error = %err, "frame dropped");
        }
    }

    /// Reject payloads that can never be sent: with fragmentation off the
    /// single frame must fit `max_frame_length`.
    pub(crate) fn check_payload(&self, frame_type: FrameType, payload: &Payload) -> Result<()> {
        let (metadata_len, data_len) = payload.lengths();
        if is_valid(
            self.config.mtu,
            self.config.max_frame_length,
            frame_type,
            metadata_len,
            data_len,
        ) {
            return Ok(());
        }
        Err(MuxError::PayloadTooLarge {
            size: FRAME_LENGTH_SIZE + encoded_payload_len(frame_type, metadata_len, data_len),
            max: self.config.max_frame_length,
        })
    }

    /// Send a payload-bearing frame, fragmenting it when it exceeds the MTU.
    ///
    /// `complete` sets COMPLETE on the (last) frame: REQUEST_CHANNEL gets
    /// the flag, payload types become their COMPLETE variant.
    pub(crate) fn send_payload(
        &self,
        stream_id: u32,
        frame_type: FrameType,
        initial_request_n: u32,
        complete: bool,
        payload: Payload,
    ) -> Result<()> {
        let (metadata_len, data_len) = payload.lengths();
        let (data, metadata) = payload.into_parts();

        if is_fragmentable(self.config.mtu, frame_type, metadata_len, data_len) {
            let frames: Vec<Frame> = Fragmenter::new(
                stream_id,
                frame_type,
                initial_request_n,
                complete,
                self.config.mtu,
                metadata,
                data,
            )?
            .collect();
            tracing::debug!(stream_id, %frame_type, fragments = frames.len(), "sending fragmented payload");
            return self.transport.send_all(frames);
        }

        let (frame_type, flags) = match (complete, frame_type) {
            (true, FrameType::RequestChannel) => (frame_type, FLAG_COMPLETE),
            (true, other) => (other.with_complete(true), 0),
            (false, other) => (other, 0),
        };
        let frame = Frame::payload_frame(
            stream_id,
            frame_type,
            flags,
            initial_request_n,
            metadata.as_deref(),
            &data,
        )?;
        self.transport.send(frame)
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.close_reason).is_some()
    }

    /// Tear the connection down once: optionally tell the peer why, stop
    /// the transport, fail every stream and queued lease request.
    pub(crate) fn terminate(&self, error: &MuxError, notify_peer: bool) {
        let reason = {
            let mut close_reason = lock(&self.close_reason);
            if close_reason.is_some() {
                return;
            }
            let reason = error.to_string();
            *close_reason = Some(reason.clone());
            reason
        };

        if notify_peer {
            self.send_quietly(Frame::error(
                0,
                error_code::CONNECTION_ERROR,
                &error.error_message(),
            ));
        }
        self.transport.close();

        let streams: Vec<_> = self
            .requesters
            .drain()
            .into_iter()
            .chain(self.responders.drain())
            .collect();
        tracing::info!(reason = %reason, active_streams = streams.len(), "connection closed");
        for (stream_id, stream) in streams {
            tracing::debug!(stream_id, "terminating stream on connection close");
            stream.handle_error(MuxError::ConnectionClosed(reason.clone()));
        }
        if let Some(tracker) = &self.requester_leases {
            tracker.dispose(&reason);
        }

        self.closed.notify_all();
    }

    /// Block until the connection is closed; returns the reason.
    pub(crate) fn wait_closed(&self) -> String {
        let mut close_reason = lock(&self.close_reason);
        loop {
            if let Some(reason) = close_reason.as_ref() {
                return reason.clone();
            }
            close_reason = wait(&self.closed, close_reason);
        }
    }
}
