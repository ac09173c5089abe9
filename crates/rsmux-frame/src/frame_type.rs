//! Frame types, flag bits and error codes.
//!
//! NEXT, COMPLETE and NEXT_COMPLETE are logical types: on the wire they are a
//! PAYLOAD frame whose NEXT/COMPLETE flags distinguish them.

use std::fmt;

use crate::error::{FrameError, Result};

/// Frame may be ignored by a receiver that does not understand it.
pub const FLAG_IGNORE: u16 = 0b10_0000_0000;
/// Metadata is present.
pub const FLAG_METADATA: u16 = 0b01_0000_0000;
/// More fragments follow this one.
pub const FLAG_FOLLOWS: u16 = 0b00_1000_0000;
/// KEEPALIVE: the receiver must answer.
pub const FLAG_RESPOND: u16 = 0b00_1000_0000;
/// Stream completion (PAYLOAD, REQUEST_CHANNEL).
pub const FLAG_COMPLETE: u16 = 0b00_0100_0000;
/// SETUP: the sender honours leases.
pub const FLAG_LEASE: u16 = 0b00_0100_0000;
/// PAYLOAD carries a next element.
pub const FLAG_NEXT: u16 = 0b00_0010_0000;

/// All ten flag bits.
pub const FLAGS_MASK: u16 = 0b11_1111_1111;

/// Frame type, including the logical PAYLOAD variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Reserved,
    Setup,
    Lease,
    KeepAlive,
    RequestResponse,
    RequestFnf,
    RequestStream,
    RequestChannel,
    RequestN,
    Cancel,
    /// PAYLOAD with neither NEXT nor COMPLETE.
    Payload,
    Error,
    MetadataPush,
    Resume,
    ResumeOk,
    /// PAYLOAD with NEXT.
    Next,
    /// PAYLOAD with COMPLETE.
    Complete,
    /// PAYLOAD with NEXT and COMPLETE.
    NextComplete,
    Ext,
}

impl FrameType {
    /// The 6-bit type code written on the wire.
    pub fn encoded_type(self) -> u8 {
        match self {
            FrameType::Reserved => 0x00,
            FrameType::Setup => 0x01,
            FrameType::Lease => 0x02,
            FrameType::KeepAlive => 0x03,
            FrameType::RequestResponse => 0x04,
            FrameType::RequestFnf => 0x05,
            FrameType::RequestStream => 0x06,
            FrameType::RequestChannel => 0x07,
            FrameType::RequestN => 0x08,
            FrameType::Cancel => 0x09,
            FrameType::Payload
            | FrameType::Next
            | FrameType::Complete
            | FrameType::NextComplete => 0x0A,
            FrameType::Error => 0x0B,
            FrameType::MetadataPush => 0x0C,
            FrameType::Resume => 0x0D,
            FrameType::ResumeOk => 0x0E,
            FrameType::Ext => 0x3F,
        }
    }

    /// Flags implied by a logical type.
    pub fn implied_flags(self) -> u16 {
        match self {
            FrameType::Next => FLAG_NEXT,
            FrameType::Complete => FLAG_COMPLETE,
            FrameType::NextComplete => FLAG_NEXT | FLAG_COMPLETE,
            _ => 0,
        }
    }

    /// Resolve a wire type code plus flags into a frame type.
    pub fn from_encoded(code: u8, flags: u16) -> Result<Self> {
        let frame_type = match code {
            0x00 => FrameType::Reserved,
            0x01 => FrameType::Setup,
            0x02 => FrameType::Lease,
            0x03 => FrameType::KeepAlive,
            0x04 => FrameType::RequestResponse,
            0x05 => FrameType::RequestFnf,
            0x06 => FrameType::RequestStream,
            0x07 => FrameType::RequestChannel,
            0x08 => FrameType::RequestN,
            0x09 => FrameType::Cancel,
            0x0A => match (flags & FLAG_NEXT != 0, flags & FLAG_COMPLETE != 0) {
                (true, true) => FrameType::NextComplete,
                (true, false) => FrameType::Next,
                (false, true) => FrameType::Complete,
                (false, false) => FrameType::Payload,
            },
            0x0B => FrameType::Error,
            0x0C => FrameType::MetadataPush,
            0x0D => FrameType::Resume,
            0x0E => FrameType::ResumeOk,
            0x3F => FrameType::Ext,
            other => return Err(FrameError::UnknownFrameType(other)),
        };
        Ok(frame_type)
    }

    /// Whether the frame opens a new interaction.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            FrameType::RequestResponse
                | FrameType::RequestFnf
                | FrameType::RequestStream
                | FrameType::RequestChannel
        )
    }

    /// Whether a 4-byte initial request-n follows the header.
    pub fn has_initial_request_n(self) -> bool {
        matches!(self, FrameType::RequestStream | FrameType::RequestChannel)
    }

    /// Whether the frame carries a length-prefixed metadata section and data.
    pub fn carries_payload(self) -> bool {
        self.is_request()
            || matches!(
                self,
                FrameType::Payload
                    | FrameType::Next
                    | FrameType::Complete
                    | FrameType::NextComplete
            )
    }

    /// Whether a payload of this type may be split across fragments.
    pub fn is_fragmentable(self) -> bool {
        self.carries_payload() && self != FrameType::Complete
    }

    /// Whether the type is a logical PAYLOAD variant.
    pub fn is_payload(self) -> bool {
        self.encoded_type() == 0x0A
    }

    /// Swap the COMPLETE bit of a payload-like type.
    pub fn with_complete(self, complete: bool) -> Self {
        match (self, complete) {
            (FrameType::Next, true) => FrameType::NextComplete,
            (FrameType::Payload, true) => FrameType::Complete,
            (FrameType::NextComplete, false) => FrameType::Next,
            (FrameType::Complete, false) => FrameType::Payload,
            (other, _) => other,
        }
    }

    /// Upper-case protocol name.
    pub fn name(self) -> &'static str {
        match self {
            FrameType::Reserved => "RESERVED",
            FrameType::Setup => "SETUP",
            FrameType::Lease => "LEASE",
            FrameType::KeepAlive => "KEEPALIVE",
            FrameType::RequestResponse => "REQUEST_RESPONSE",
            FrameType::RequestFnf => "REQUEST_FNF",
            FrameType::RequestStream => "REQUEST_STREAM",
            FrameType::RequestChannel => "REQUEST_CHANNEL",
            FrameType::RequestN => "REQUEST_N",
            FrameType::Cancel => "CANCEL",
            FrameType::Payload => "PAYLOAD",
            FrameType::Error => "ERROR",
            FrameType::MetadataPush => "METADATA_PUSH",
            FrameType::Resume => "RESUME",
            FrameType::ResumeOk => "RESUME_OK",
            FrameType::Next => "NEXT",
            FrameType::Complete => "COMPLETE",
            FrameType::NextComplete => "NEXT_COMPLETE",
            FrameType::Ext => "EXT",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// ERROR frame codes.
pub mod error_code {
    pub const INVALID_SETUP: u32 = 0x0000_0001;
    pub const UNSUPPORTED_SETUP: u32 = 0x0000_0002;
    pub const REJECTED_SETUP: u32 = 0x0000_0003;
    pub const REJECTED_RESUME: u32 = 0x0000_0004;
    pub const CONNECTION_ERROR: u32 = 0x0000_0101;
    pub const CONNECTION_CLOSE: u32 = 0x0000_0102;
    pub const APPLICATION_ERROR: u32 = 0x0000_0201;
    pub const REJECTED: u32 = 0x0000_0202;
    pub const CANCELED: u32 = 0x0000_0203;
    pub const INVALID: u32 = 0x0000_0204;

    /// Human-readable name for an error code.
    pub fn name(code: u32) -> &'static str {
        match code {
            INVALID_SETUP => "INVALID_SETUP",
            UNSUPPORTED_SETUP => "UNSUPPORTED_SETUP",
            REJECTED_SETUP => "REJECTED_SETUP",
            REJECTED_RESUME => "REJECTED_RESUME",
            CONNECTION_ERROR => "CONNECTION_ERROR",
            CONNECTION_CLOSE => "CONNECTION_CLOSE",
            APPLICATION_ERROR => "APPLICATION_ERROR",
            REJECTED => "REJECTED",
            CANCELED => "CANCELED",
            INVALID => "INVALID",
            _ => "CUSTOM",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_variants_share_wire_code() {
        for ty in [
            FrameType::Payload,
            FrameType::Next,
            FrameType::Complete,
            FrameType::NextComplete,
        ] {
            assert_eq!(ty.encoded_type(), 0x0A);
            assert_eq!(FrameType::from_encoded(0x0A, ty.implied_flags()).unwrap(), ty);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(matches!(
            FrameType::from_encoded(0x20, 0),
            Err(FrameError::UnknownFrameType(0x20))
        ));
    }

    #[test]
    fn request_classification() {
        assert!(FrameType::RequestChannel.is_request());
        assert!(FrameType::RequestChannel.has_initial_request_n());
        assert!(!FrameType::RequestResponse.has_initial_request_n());
        assert!(!FrameType::Cancel.carries_payload());
        assert!(!FrameType::Complete.is_fragmentable());
        assert!(FrameType::Next.is_fragmentable());
    }

    #[test]
    fn with_complete_toggles_payload_variants_only() {
        assert_eq!(FrameType::Next.with_complete(true), FrameType::NextComplete);
        assert_eq!(FrameType::NextComplete.with_complete(false), FrameType::Next);
        assert_eq!(
            FrameType::RequestChannel.with_complete(true),
            FrameType::RequestChannel
        );
    }
}
