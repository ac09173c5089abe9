//! Splitting oversized payloads into MTU-sized fragments.
//!
//! The first fragment keeps the original frame type (and initial request-n);
//! every following fragment is a PAYLOAD with NEXT. Each fragment takes bytes
//! from the metadata first, then from the data, and carries FOLLOWS while
//! bytes remain.

use bytes::Bytes;

use crate::codec::{
    encoded_payload_len, Frame, FRAME_LENGTH_SIZE, FRAME_OFFSET, MAX_FRAME_LENGTH,
    MAX_METADATA_LENGTH, METADATA_LENGTH_SIZE, REQUEST_N_SIZE,
};
use crate::error::{FrameError, Result};
use crate::frame_type::{FrameType, FLAG_COMPLETE, FLAG_FOLLOWS};

/// Smallest MTU a connection may configure (other than 0, which disables
/// fragmentation).
pub const MIN_MTU_SIZE: usize = 64;

/// Whether a payload of this shape must be fragmented under `mtu`.
pub fn is_fragmentable(
    mtu: usize,
    frame_type: FrameType,
    metadata_len: Option<usize>,
    data_len: usize,
) -> bool {
    mtu > 0
        && FRAME_LENGTH_SIZE + encoded_payload_len(frame_type, metadata_len, data_len) > mtu
}

/// Whether a payload can be sent at all.
///
/// With fragmentation enabled any size goes; otherwise the single frame must
/// fit `max_frame_length` including its length prefix.
pub fn is_valid(
    mtu: usize,
    max_frame_length: usize,
    frame_type: FrameType,
    metadata_len: Option<usize>,
    data_len: usize,
) -> bool {
    if metadata_len.is_some_and(|len| len > MAX_METADATA_LENGTH) {
        return false;
    }
    mtu > 0
        || FRAME_LENGTH_SIZE + encoded_payload_len(frame_type, metadata_len, data_len)
            <= max_frame_length
}

/// Iterator over the fragments of one payload.
///
/// Metadata and data are carved with `Bytes::split_to`, so fragments are
/// built from views of the caller's buffers and no intermediate copy of the
/// whole payload is made.
#[derive(Debug)]
pub struct Fragmenter {
    stream_id: u32,
    frame_type: FrameType,
    initial_request_n: u32,
    complete: bool,
    mtu: usize,
    metadata: Option<Bytes>,
    data: Bytes,
    first: bool,
    done: bool,
}

impl Fragmenter {
    /// Prepare to fragment a payload.
    ///
    /// `frame_type` is the type of the first fragment. `complete` asks for
    /// COMPLETE on the last fragment; NEXT_COMPLETE implies it.
    pub fn new(
        stream_id: u32,
        frame_type: FrameType,
        initial_request_n: u32,
        complete: bool,
        mtu: usize,
        metadata: Option<Bytes>,
        data: Bytes,
    ) -> Result<Self> {
        if !frame_type.is_fragmentable() {
            return Err(FrameError::NotFragmentable(frame_type.name()));
        }
        if !(MIN_MTU_SIZE..=MAX_FRAME_LENGTH).contains(&mtu) {
            return Err(FrameError::FragmentTooSmall {
                size: mtu,
                min: MIN_MTU_SIZE,
            });
        }
        let metadata_len = metadata.as_ref().map_or(0, Bytes::len);
        if metadata_len > MAX_METADATA_LENGTH {
            return Err(FrameError::MetadataTooLarge(metadata_len));
        }

        let complete = complete || frame_type == FrameType::NextComplete;
        Ok(Self {
            stream_id,
            frame_type: frame_type.with_complete(false),
            initial_request_n,
            complete,
            mtu,
            metadata,
            data,
            first: true,
            done: false,
        })
    }

    fn remaining(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| !m.is_empty()) || !self.data.is_empty()
    }

    fn frame_type_for(&self, first: bool, last: bool) -> (FrameType, u16) {
        let frame_type = if first {
            self.frame_type
        } else {
            FrameType::Next
        };
        match (last, self.complete) {
            (false, _) => (frame_type, FLAG_FOLLOWS),
            (true, false) => (frame_type, 0),
            (true, true) if frame_type == FrameType::RequestChannel => (frame_type, FLAG_COMPLETE),
            (true, true) => (frame_type.with_complete(true), 0),
        }
    }
}

impl Iterator for Fragmenter {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        let first = self.first;
        self.first = false;

        let mut budget = self.mtu - FRAME_OFFSET;
        if first && self.frame_type.has_initial_request_n() {
            budget -= REQUEST_N_SIZE;
        }

        let metadata = match self.metadata.as_mut() {
            Some(metadata) if first || !metadata.is_empty() => {
                budget -= METADATA_LENGTH_SIZE;
                let take = metadata.len().min(budget);
                budget -= take;
                Some(metadata.split_to(take))
            }
            _ => None,
        };
        let take = self.data.len().min(budget);
        let data = self.data.split_to(take);

        let last = !self.remaining();
        self.done = last;
        let (frame_type, flags) = self.frame_type_for(first, last);
        Some(Frame::payload_frame_unchecked(
            self.stream_id,
            frame_type,
            flags,
            self.initial_request_n,
            metadata.as_deref(),
            &data,
        ))
    }
}
