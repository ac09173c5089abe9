//! Multiplexed request/response interactions over one duplex connection.
//!
//! Four interaction models share a connection, each on its own stream id:
//! - fire-and-forget
//! - request/response
//! - request/stream (demand-driven, via REQUEST_N)
//! - request/channel (bidirectional, demand on both sides)
//!
//! Payloads above the connection MTU are fragmented and reassembled
//! transparently. With leases enabled a side may only issue as many requests
//! as the peer granted.
//!
//! ```no_run
//! use rsmux_core::{connect, Payload};
//!
//! let address = "unix:/tmp/rsmux.sock".parse()?;
//! let connection = connect(&address)?;
//! let reply = connection
//!     .requester()
//!     .request_response(Payload::new("ping"))
//!     .block()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod connection;
pub mod connector;
mod context;
mod credit;
pub mod error;
pub mod handler;
pub mod interceptor;
pub mod lease;
pub mod listener;
pub mod payload;
pub mod registry;
pub mod requester;
mod responder;
mod state;
mod streams;
pub mod subscription;
mod sync;
pub mod transport;

pub use config::{ConnectionConfig, LeaseConfig, DEFAULT_MAX_CONCURRENT_REQUESTS};
pub use connection::{Connection, ConnectionOptions};
pub use connector::{connect, connect_with_options};
pub use error::{MuxError, Result};
pub use handler::{EchoHandler, NoopHandler, RequestHandler};
pub use interceptor::{NoopInterceptor, RequestInterceptor};
pub use lease::{
    Lease, LeaseGrant, LeasePermitHandler, LeaseSource, RequesterLeaseTracker,
    ResponderLeaseTracker,
};
pub use listener::ConnectionListener;
pub use payload::Payload;
pub use registry::Role;
pub use requester::{FireAndForget, RequestChannel, RequestResponse, RequestStream, Requester};
pub use subscription::{PayloadSink, PayloadStream, ResponseSubscription};
pub use transport::{DuplexConnection, StreamTransport};
