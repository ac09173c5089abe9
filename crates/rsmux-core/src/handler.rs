//! Application callbacks for requests received from the peer.

use bytes::Bytes;

use crate::error::{MuxError, Result};
use crate::payload::Payload;
use crate::subscription::{PayloadSink, PayloadStream};

/// Responder-side application logic.
///
/// Every request runs on its own worker thread, so methods may block. At
/// most `ConnectionConfig::max_concurrent_requests` run at once per
/// connection; the peer gets REJECTED for requests beyond that. A
/// stream or channel ends when the method returns: `Ok` completes the
/// outbound side (unless the sink was already completed or failed), `Err` is
/// sent to the peer as an ERROR frame.
pub trait RequestHandler: Send + Sync {
    fn fire_and_forget(&self, _payload: Payload) -> Result<()> {
        Err(unsupported("fire-and-forget"))
    }

    /// `Ok(None)` completes without a payload.
    fn request_response(&self, _payload: Payload) -> Result<Option<Payload>> {
        Err(unsupported("request-response"))
    }

    fn request_stream(&self, _payload: Payload, _sink: &PayloadSink) -> Result<()> {
        Err(unsupported("request-stream"))
    }

    /// `first` is the payload of the REQUEST_CHANNEL frame; later payloads
    /// from the requester arrive on `inbound`.
    fn request_channel(
        &self,
        _first: Payload,
        _inbound: PayloadStream,
        _sink: &PayloadSink,
    ) -> Result<()> {
        Err(unsupported("request-channel"))
    }

    /// METADATA_PUSH received on stream 0. Runs on the receive thread.
    fn metadata_push(&self, _metadata: Bytes) {}
}

fn unsupported(interaction: &str) -> MuxError {
    MuxError::Application(format!("{interaction} not implemented"))
}

/// Handler that answers every request with APPLICATION_ERROR.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl RequestHandler for NoopHandler {}

/// Handler that sends every payload straight back.
///
/// Streams answer with `stream_len` copies of the request, paced by the
/// peer's demand; channels echo the first and every inbound payload.
#[derive(Debug, Clone, Copy)]
pub struct EchoHandler {
    pub stream_len: usize,
}

impl Default for EchoHandler {
    fn default() -> Self {
        Self { stream_len: 3 }
    }
}

impl RequestHandler for EchoHandler {
    fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        tracing::info!(len = payload.len(), "fire-and-forget received");
        Ok(())
    }

    fn request_response(&self, payload: Payload) -> Result<Option<Payload>> {
        Ok(Some(payload))
    }

    fn request_stream(&self, payload: Payload, sink: &PayloadSink) -> Result<()> {
        let (data, metadata) = payload.into_parts();
        for _ in 0..self.stream_len {
            let element = match &metadata {
                Some(metadata) => Payload::with_metadata(data.clone(), metadata.clone()),
                None => Payload::new(data.clone()),
            };
            sink.send(element)?;
        }
        Ok(())
    }

    fn request_channel(
        &self,
        first: Payload,
        mut inbound: PayloadStream,
        sink: &PayloadSink,
    ) -> Result<()> {
        sink.send(first)?;
        inbound.request(u64::MAX);
        while let Some(payload) = inbound.recv()? {
            sink.send(payload)?;
        }
        Ok(())
    }

    fn metadata_push(&self, metadata: Bytes) {
        tracing::info!(len = metadata.len(), "metadata push received");
    }
}
