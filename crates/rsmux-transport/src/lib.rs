//! Duplex byte-stream transports for rsmux.
//!
//! The multiplexing engine needs exactly one thing from the transport: an
//! ordered, reliable, bidirectional byte stream. This crate provides that over
//! - Unix domain sockets (Linux/macOS)
//! - TCP
//!
//! This is the lowest layer of rsmux. Everything else builds on top of the
//! [`DuplexStream`] type provided here.

pub mod address;
pub mod error;
pub mod listener;
pub mod stream;

pub use address::Address;
pub use error::{Result, TransportError};
pub use listener::Listener;
pub use stream::DuplexStream;
