//! Registry entries: every active interaction, whichever side started it,
//! receives its stream's frames through [`StreamHandler`].

use std::sync::{Arc, Mutex};

use rsmux_frame::{Frame, FrameError, Reassembler, ReassemblyConfig};

use crate::error::MuxError;
use crate::registry::StreamEntry;
use crate::requester::channel::RequestChannelRequester;
use crate::requester::response::RequestResponseRequester;
use crate::requester::stream::RequestStreamRequester;
use crate::responder::channel::ChannelResponder;
use crate::responder::fnf::FireAndForgetResponder;
use crate::responder::response::ResponseResponder;
use crate::responder::stream::StreamResponder;
use crate::state::StateWord;
use crate::sync::lock;

/// Frames routed to one interaction by the receive thread.
pub(crate) trait FrameSink: Send + Sync {
    /// PAYLOAD (or a fragment of the request that opened the stream).
    fn handle_payload(&self, frame: &Frame);

    fn handle_request_n(&self, n: u32) {
        tracing::debug!(n, "REQUEST_N ignored");
    }

    fn handle_cancel(&self) {
        tracing::debug!("CANCEL ignored");
    }

    /// Peer ERROR, or the connection went away.
    fn handle_error(&self, error: MuxError);

    /// A frame for this stream whose body could not be decoded. The stream
    /// ends and the peer is told; the connection carries on.
    fn handle_malformed(&self, error: MuxError);
}

#[derive(Clone)]
pub(crate) enum StreamHandler {
    RequestResponse(Arc<RequestResponseRequester>),
    RequestStream(Arc<RequestStreamRequester>),
    RequestChannel(Arc<RequestChannelRequester>),
    FireAndForgetResponder(Arc<FireAndForgetResponder>),
    ResponseResponder(Arc<ResponseResponder>),
    StreamResponder(Arc<StreamResponder>),
    ChannelResponder(Arc<ChannelResponder>),
}

impl StreamHandler {
    fn sink(&self) -> &dyn FrameSink {
        match self {
            StreamHandler::RequestResponse(s) => s.as_ref(),
            StreamHandler::RequestStream(s) => s.as_ref(),
            StreamHandler::RequestChannel(s) => s.as_ref(),
            StreamHandler::FireAndForgetResponder(s) => s.as_ref(),
            StreamHandler::ResponseResponder(s) => s.as_ref(),
            StreamHandler::StreamResponder(s) => s.as_ref(),
            StreamHandler::ChannelResponder(s) => s.as_ref(),
        }
    }

    pub(crate) fn handle_payload(&self, frame: &Frame) {
        self.sink().handle_payload(frame);
    }

    pub(crate) fn handle_request_n(&self, n: u32) {
        self.sink().handle_request_n(n);
    }

    pub(crate) fn handle_cancel(&self) {
        self.sink().handle_cancel();
    }

    pub(crate) fn handle_error(&self, error: MuxError) {
        self.sink().handle_error(error);
    }

    pub(crate) fn handle_malformed(&self, error: MuxError) {
        self.sink().handle_malformed(error);
    }
}

impl StreamEntry for StreamHandler {
    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (StreamHandler::RequestResponse(a), StreamHandler::RequestResponse(b)) => {
                Arc::ptr_eq(a, b)
            }
            (StreamHandler::RequestStream(a), StreamHandler::RequestStream(b)) => Arc::ptr_eq(a, b),
            (StreamHandler::RequestChannel(a), StreamHandler::RequestChannel(b)) => {
                Arc::ptr_eq(a, b)
            }
            (StreamHandler::FireAndForgetResponder(a), StreamHandler::FireAndForgetResponder(b)) => {
                Arc::ptr_eq(a, b)
            }
            (StreamHandler::ResponseResponder(a), StreamHandler::ResponseResponder(b)) => {
                Arc::ptr_eq(a, b)
            }
            (StreamHandler::StreamResponder(a), StreamHandler::StreamResponder(b)) => {
                Arc::ptr_eq(a, b)
            }
            (StreamHandler::ChannelResponder(a), StreamHandler::ChannelResponder(b)) => {
                Arc::ptr_eq(a, b)
            }
            _ => false,
        }
    }
}

/// Per-stream buffer for a fragmented payload in flight.
#[derive(Debug)]
pub(crate) struct Reassembly {
    buffer: Mutex<Option<Reassembler>>,
    config: ReassemblyConfig,
}

impl Reassembly {
    pub(crate) fn new(config: ReassemblyConfig) -> Self {
        Self {
            buffer: Mutex::new(None),
            config,
        }
    }

    /// Feed one payload frame. Returns the whole frame once the last
    /// fragment arrived, `None` while more are expected.
    pub(crate) fn accept(
        &self,
        state: &StateWord,
        frame: &Frame,
    ) -> Result<Option<Frame>, FrameError> {
        let mut buffer = lock(&self.buffer);
        let Some(reassembler) = buffer.as_mut() else {
            if !frame.has_follows() {
                let size = frame.payload_len();
                if size > self.config.max_inbound_payload_size {
                    return Err(FrameError::ReassemblyTooLarge {
                        size,
                        max: self.config.max_inbound_payload_size,
                    });
                }
                return Ok(Some(frame.clone()));
            }
            *buffer = Some(Reassembler::begin(frame, self.config)?);
            state.mark_reassembling();
            return Ok(None);
        };

        match reassembler.push(frame) {
            Ok(false) => Ok(None),
            Ok(true) => {
                let whole = buffer.take().map(Reassembler::finish);
                state.mark_reassembled();
                Ok(whole)
            }
            Err(err) => {
                buffer.take();
                state.mark_reassembled();
                Err(err)
            }
        }
    }

    /// Drop a partial payload. Returns whether one was buffered.
    pub(crate) fn release(&self, state: &StateWord) -> bool {
        let dropped = lock(&self.buffer).take().is_some();
        if dropped {
            state.mark_reassembled();
        }
        dropped
    }
}
