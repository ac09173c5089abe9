//! Rebuilding one logical frame from a first fragment and its followers.

use bytes::{BufMut, BytesMut};

use crate::codec::{Frame, FRAME_LENGTH_SIZE, MAX_METADATA_LENGTH};
use crate::error::{FrameError, Result};
use crate::fragmentation::MIN_MTU_SIZE;
use crate::frame_type::{FrameType, FLAG_COMPLETE};

/// Default minimum size of a non-final fragment.
pub const DEFAULT_MIN_FRAGMENT_SIZE: usize = MIN_MTU_SIZE - FRAME_LENGTH_SIZE;

/// Limits applied while reassembling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// Largest metadata + data a reassembled frame may carry. `usize::MAX`
    /// means unbounded.
    pub max_inbound_payload_size: usize,
    /// Smallest encoded size (without length prefix) of a fragment that
    /// still has FOLLOWS set.
    pub min_fragment_size: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            max_inbound_payload_size: usize::MAX,
            min_fragment_size: DEFAULT_MIN_FRAGMENT_SIZE,
        }
    }
}

/// Accumulates fragment bodies for one stream.
///
/// Metadata and data are collected separately so the rebuilt frame carries
/// a single metadata section whose length covers every fragment.
#[derive(Debug)]
pub struct Reassembler {
    stream_id: u32,
    frame_type: FrameType,
    initial_request_n: u32,
    metadata: Option<BytesMut>,
    data: BytesMut,
    complete: bool,
    config: ReassemblyConfig,
}

impl Reassembler {
    /// Start reassembly from a first fragment (FOLLOWS set).
    pub fn begin(first: &Frame, config: ReassemblyConfig) -> Result<Self> {
        if !first.frame_type().is_fragmentable() {
            return Err(FrameError::NotFragmentable(first.frame_type().name()));
        }
        let mut reassembler = Self {
            stream_id: first.stream_id(),
            frame_type: first.frame_type().with_complete(false),
            initial_request_n: first.request_n().unwrap_or(0),
            metadata: None,
            data: BytesMut::new(),
            complete: false,
            config,
        };
        reassembler.append(first)?;
        Ok(reassembler)
    }

    /// Append a follow fragment. Returns `true` once the last fragment
    /// (FOLLOWS clear) has been consumed.
    pub fn push(&mut self, fragment: &Frame) -> Result<bool> {
        if fragment.stream_id() != self.stream_id || !fragment.frame_type().is_payload() {
            return Err(FrameError::UnexpectedFragment {
                frame_type: fragment.frame_type().name(),
                stream_id: fragment.stream_id(),
            });
        }
        self.append(fragment)?;
        Ok(!fragment.has_follows())
    }

    fn append(&mut self, fragment: &Frame) -> Result<()> {
        if fragment.has_follows() && fragment.len() < self.config.min_fragment_size {
            return Err(FrameError::FragmentTooSmall {
                size: fragment.len(),
                min: self.config.min_fragment_size,
            });
        }

        let size = self.payload_len() + fragment.payload_len();
        if size > self.config.max_inbound_payload_size {
            return Err(FrameError::ReassemblyTooLarge {
                size,
                max: self.config.max_inbound_payload_size,
            });
        }

        if let Some(metadata) = fragment.metadata() {
            let acc = self.metadata.get_or_insert_with(BytesMut::new);
            if acc.len() + metadata.len() > MAX_METADATA_LENGTH {
                return Err(FrameError::MetadataTooLarge(acc.len() + metadata.len()));
            }
            acc.put_slice(&metadata);
        }
        self.data.put_slice(&fragment.data());
        self.complete = fragment.is_complete();
        Ok(())
    }

    /// Stream being reassembled.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Type of the first fragment.
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Bytes of metadata plus data accumulated so far.
    pub fn payload_len(&self) -> usize {
        self.metadata.as_ref().map_or(0, BytesMut::len) + self.data.len()
    }

    /// Build the reassembled frame: FOLLOWS cleared, COMPLETE taken from the
    /// last fragment.
    pub fn finish(self) -> Frame {
        let (frame_type, flags) = match (self.complete, self.frame_type) {
            (true, FrameType::RequestChannel) => (FrameType::RequestChannel, FLAG_COMPLETE),
            (complete, frame_type) => (frame_type.with_complete(complete), 0),
        };
        Frame::payload_frame_unchecked(
            self.stream_id,
            frame_type,
            flags,
            self.initial_request_n,
            self.metadata.as_deref(),
            &self.data,
        )
    }
}
