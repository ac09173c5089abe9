//! Multiplexed interactions over a single duplex connection.
//!
//! # Crate Structure
//!
//! - [`transport`]: Unix socket and TCP duplex streams
//! - [`frame`]: wire codec, fragmentation and reassembly
//! - [`mux`]: connections, requesters, responders and leases

/// Re-export transport types.
pub mod transport {
    pub use rsmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use rsmux_frame::*;
}

/// Re-export connection and interaction types.
pub mod mux {
    pub use rsmux_core::*;
}

pub use rsmux_core::{connect, Connection, ConnectionConfig, Payload, Requester};
