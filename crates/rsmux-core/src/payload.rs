use std::fmt;

use bytes::Bytes;
use rsmux_frame::Frame;

use crate::error::{MuxError, Result};

/// Application payload: data plus optional metadata.
///
/// Move-only. Both parts are reference-counted views, so building one from a
/// received frame does not copy.
pub struct Payload {
    data: Bytes,
    metadata: Option<Bytes>,
}

impl Payload {
    /// Payload without metadata.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: None,
        }
    }

    /// Payload with metadata.
    pub fn with_metadata(data: impl Into<Bytes>, metadata: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            metadata: Some(metadata.into()),
        }
    }

    /// Payload carried by a request or PAYLOAD frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if !frame.frame_type().carries_payload() {
            return Err(MuxError::Protocol(format!(
                "{} frame carries no payload",
                frame.frame_type()
            )));
        }
        Ok(Self {
            data: frame.data(),
            metadata: frame.metadata(),
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    pub fn has_metadata(&self) -> bool {
        self.metadata.is_some()
    }

    /// Data as UTF-8, lossy.
    pub fn data_utf8(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Metadata length, if present, and data length.
    pub(crate) fn lengths(&self) -> (Option<usize>, usize) {
        (self.metadata.as_ref().map(Bytes::len), self.data.len())
    }

    /// Bytes of metadata plus data.
    pub fn len(&self) -> usize {
        self.metadata.as_ref().map_or(0, Bytes::len) + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_parts(self) -> (Bytes, Option<Bytes>) {
        (self.data, self.metadata)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("data_len", &self.data.len())
            .field("metadata_len", &self.metadata.as_ref().map(Bytes::len))
            .finish()
    }
}
