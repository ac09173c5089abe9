//! A running multiplexed connection: receive thread, frame routing and the
//! application-facing handle.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use rsmux_frame::{Frame, FrameError, FrameReader, FrameType};
use rsmux_transport::DuplexStream;

use crate::config::ConnectionConfig;
use crate::context::Context;
use crate::error::{MuxError, Result};
use crate::handler::{NoopHandler, RequestHandler};
use crate::interceptor::{NoopInterceptor, RequestInterceptor};
use crate::lease::{LeaseGrant, LeaseSource};
use crate::registry::Role;
use crate::requester::Requester;
use crate::responder::{accept_request, invalid};
use crate::streams::StreamHandler;
use crate::sync::lock;
use crate::transport::StreamTransport;

/// Everything a connection needs besides its stream.
pub struct ConnectionOptions {
    pub config: ConnectionConfig,
    /// Answers requests from the peer.
    pub handler: Arc<dyn RequestHandler>,
    pub interceptor: Arc<dyn RequestInterceptor>,
    /// Leases granted to the peer. Ignored unless `config.lease` is set.
    pub lease_source: Option<LeaseSource>,
}

impl ConnectionOptions {
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub fn with_lease_source(mut self, source: LeaseSource) -> Self {
        self.lease_source = Some(source);
        self
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            config: ConnectionConfig::default(),
            handler: Arc::new(NoopHandler),
            interceptor: Arc::new(NoopInterceptor),
            lease_source: None,
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("config", &self.config)
            .field("lease_source", &self.lease_source.is_some())
            .finish_non_exhaustive()
    }
}

/// One side of a multiplexed connection.
///
/// Requests to the peer go through [`Connection::requester`]; requests from
/// the peer are answered by the configured [`RequestHandler`]. Dropping the
/// connection closes it.
pub struct Connection {
    ctx: Arc<Context>,
    transport: Arc<StreamTransport>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Run the multiplexer over an established stream.
    pub fn start(stream: DuplexStream, role: Role, options: ConnectionOptions) -> Result<Self> {
        let ConnectionOptions {
            config,
            handler,
            interceptor,
            lease_source,
        } = options;
        config.validate()?;

        let (transport, reader) = StreamTransport::start(stream, config.frame_config())?;
        let transport = Arc::new(transport);
        let ctx = Arc::new(Context::new(
            role,
            config,
            Arc::clone(&transport) as _,
            handler,
            interceptor,
        ));

        let receiver = {
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name("rsmux-receiver".into())
                .spawn(move || receive_loop(reader, &ctx))
                .map_err(|err| MuxError::Transport(err.into()))?
        };

        if let Some(source) = lease_source {
            start_lease_source(&ctx, source)?;
        }

        tracing::debug!(?role, "connection started");
        Ok(Self {
            ctx,
            transport,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Handle for starting interactions. Cheap to clone.
    pub fn requester(&self) -> Requester {
        Requester::new(Arc::clone(&self.ctx))
    }

    pub fn role(&self) -> Role {
        self.ctx.role
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.ctx.config
    }

    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }

    /// Number of interactions currently open in each direction
    /// (started here, started by the peer).
    pub fn active_streams(&self) -> (usize, usize) {
        (self.ctx.requesters.len(), self.ctx.responders.len())
    }

    /// Close the connection. Active interactions fail with
    /// `MuxError::ConnectionClosed`; frames already queued are still
    /// written.
    pub fn close(&self) {
        self.ctx.terminate(
            &MuxError::ConnectionClosed("closed by the application".into()),
            false,
        );
        self.transport.close_and_wait();
        if let Some(handle) = lock(&self.receiver).take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Block until the connection is closed, locally or by the peer, and
    /// return the reason.
    pub fn on_close(&self) -> String {
        self.ctx.wait_closed()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.ctx.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn start_lease_source(ctx: &Arc<Context>, source: LeaseSource) -> Result<()> {
    if ctx.responder_leases.is_none() {
        tracing::warn!("lease source given but leases are disabled; ignoring it");
        return Ok(());
    }
    let ctx = Arc::clone(ctx);
    thread::Builder::new()
        .name("rsmux-lease".into())
        .spawn(move || lease_loop(&ctx, source))
        .map(drop)
        .map_err(|err| MuxError::Transport(err.into()))
}

fn lease_loop(ctx: &Context, source: LeaseSource) {
    for grant in source {
        if ctx.is_closed() {
            break;
        }
        let Some(tracker) = &ctx.responder_leases else {
            break;
        };
        let frame = Frame::lease(grant.ttl, grant.allowed_requests, grant.metadata.as_deref());
        tracker.issue(grant);
        if let Err(err) = ctx.send(frame) {
            tracing::debug!(error = %err, "lease source stopped");
            break;
        }
    }
}

fn receive_loop(mut reader: FrameReader<DuplexStream>, ctx: &Arc<Context>) {
    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => {
                ctx.terminate(
                    &MuxError::ConnectionClosed("peer closed the connection".into()),
                    false,
                );
                return;
            }
            Err(FrameError::Io(err)) => {
                ctx.terminate(&MuxError::Frame(FrameError::Io(err)), false);
                return;
            }
            Err(err @ FrameError::MalformedBody { .. }) => {
                if let Err(err) = reject_malformed(ctx, err) {
                    tracing::warn!(error = %err, "protocol violation");
                    ctx.terminate(&err, true);
                    return;
                }
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "undecodable frame");
                ctx.terminate(&err.into(), true);
                return;
            }
        };
        if ctx.is_closed() {
            return;
        }
        if let Err(err) = dispatch(ctx, &frame) {
            tracing::warn!(error = %err, "protocol violation");
            ctx.terminate(&err, true);
            return;
        }
    }
}

/// Route one inbound frame. An error is fatal for the connection.
fn dispatch(ctx: &Arc<Context>, frame: &Frame) -> Result<()> {
    let stream_id = frame.stream_id();
    let frame_type = frame.frame_type();
    tracing::trace!(stream_id, %frame_type, len = frame.len(), "frame received");

    if stream_id == 0 {
        connection_frame(ctx, frame);
        return Ok(());
    }

    if ctx.role.owns(stream_id) {
        match ctx.requesters.lookup(stream_id) {
            Some(stream) => route(&stream, frame),
            None if !ctx.requesters.is_before_or_current(stream_id) => {
                return Err(MuxError::Protocol(format!(
                    "{frame_type} frame for stream {stream_id} which was never opened"
                )));
            }
            None => {
                tracing::debug!(stream_id, %frame_type, "frame for finished stream dropped");
            }
        }
        return Ok(());
    }

    if frame_type.is_request() {
        accept_request(ctx, frame);
        return Ok(());
    }
    match ctx.responders.lookup(stream_id) {
        Some(stream) => route(&stream, frame),
        None => tracing::debug!(stream_id, %frame_type, "frame for unknown stream dropped"),
    }
    Ok(())
}

/// A frame whose header named a stream but whose body did not decode. Only
/// that stream fails. An error is fatal for the connection.
fn reject_malformed(ctx: &Arc<Context>, err: FrameError) -> Result<()> {
    let (stream_id, frame_type) = match err {
        FrameError::MalformedBody {
            stream_id,
            frame_type,
            ..
        } => (stream_id, frame_type),
        other => return Err(other.into()),
    };
    if ctx.is_closed() {
        return Ok(());
    }
    tracing::warn!(stream_id, %frame_type, error = %err, "malformed frame");

    if ctx.role.owns(stream_id) {
        match ctx.requesters.lookup(stream_id) {
            Some(stream) => stream.handle_malformed(err.into()),
            None if !ctx.requesters.is_before_or_current(stream_id) => {
                return Err(MuxError::Protocol(format!(
                    "{frame_type} frame for stream {stream_id} which was never opened"
                )));
            }
            None => {
                tracing::debug!(stream_id, %frame_type, "frame for finished stream dropped");
            }
        }
        return Ok(());
    }

    match ctx.responders.lookup(stream_id) {
        Some(_) if frame_type.is_request() => {
            tracing::warn!(stream_id, %frame_type, "stream id already in use; request dropped");
        }
        Some(stream) => stream.handle_malformed(err.into()),
        None if frame_type.is_request() => {
            ctx.send_quietly(invalid(stream_id, &err.to_string()));
        }
        None => tracing::debug!(stream_id, %frame_type, "frame for unknown stream dropped"),
    }
    Ok(())
}

fn route(stream: &StreamHandler, frame: &Frame) {
    match frame.frame_type() {
        FrameType::Payload | FrameType::Next | FrameType::Complete | FrameType::NextComplete => {
            stream.handle_payload(frame);
        }
        FrameType::RequestN => stream.handle_request_n(frame.request_n().unwrap_or(0)),
        FrameType::Cancel => stream.handle_cancel(),
        FrameType::Error => stream.handle_error(MuxError::from_error_frame(frame)),
        other => tracing::warn!(
            stream_id = frame.stream_id(),
            frame_type = %other,
            "unexpected frame on a stream"
        ),
    }
}

fn connection_frame(ctx: &Context, frame: &Frame) {
    match frame.frame_type() {
        FrameType::Lease => match &ctx.requester_leases {
            Some(tracker) => tracker.handle_lease(LeaseGrant {
                allowed_requests: frame.lease_requests().unwrap_or(0),
                ttl: frame.lease_ttl().unwrap_or_default(),
                metadata: frame.metadata(),
            }),
            None => tracing::warn!("LEASE received but leases are disabled"),
        },
        FrameType::KeepAlive => {
            if frame.respond_requested() {
                ctx.send_quietly(Frame::keepalive(false, 0, &frame.data()));
            }
        }
        FrameType::MetadataPush => {
            if let Some(metadata) = frame.metadata() {
                ctx.handler.metadata_push(metadata);
            }
        }
        FrameType::Error => {
            let error = MuxError::from_error_frame(frame);
            tracing::warn!(error = %error, "peer failed the connection");
            ctx.terminate(&error, false);
        }
        other if frame.can_ignore() => {
            tracing::debug!(frame_type = %other, "ignorable connection frame dropped");
        }
        other => tracing::warn!(frame_type = %other, "unsupported connection frame dropped"),
    }
}
