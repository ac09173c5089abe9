use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rsmux_transport::{Address, Listener};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionOptions};
use crate::error::Result;
use crate::handler::{NoopHandler, RequestHandler};
use crate::interceptor::{NoopInterceptor, RequestInterceptor};
use crate::lease::LeaseSource;
use crate::registry::Role;

type LeaseSourceFactory = Box<dyn Fn() -> LeaseSource + Send + Sync>;

/// Accepts connections and runs them as the server side.
pub struct ConnectionListener {
    listener: Listener,
    config: ConnectionConfig,
    handler: Arc<dyn RequestHandler>,
    interceptor: Arc<dyn RequestInterceptor>,
    lease_source: Option<LeaseSourceFactory>,
    accepted: AtomicU64,
}

impl ConnectionListener {
    /// Bind to a Unix socket path or TCP address.
    pub fn bind(address: &Address) -> Result<Self> {
        let listener = Listener::bind(address)?;
        Ok(Self {
            listener,
            config: ConnectionConfig::default(),
            handler: Arc::new(NoopHandler),
            interceptor: Arc::new(NoopInterceptor),
            lease_source: None,
            accepted: AtomicU64::new(0),
        })
    }

    /// Configuration for every accepted connection.
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Handler shared by every accepted connection.
    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// Grant leases to every accepted connection from a fresh source.
    ///
    /// Only takes effect when the config enables leases.
    pub fn with_lease_source(
        mut self,
        factory: impl Fn() -> LeaseSource + Send + Sync + 'static,
    ) -> Self {
        self.lease_source = Some(Box::new(factory));
        self
    }

    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<Connection> {
        let stream = self.listener.accept()?;
        let count = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            transport = stream.transport_name(),
            connection = count,
            "connection accepted"
        );
        let options = ConnectionOptions {
            config: self.config.clone(),
            handler: Arc::clone(&self.handler),
            interceptor: Arc::clone(&self.interceptor),
            lease_source: self.lease_source.as_ref().map(|factory| factory()),
        };
        Connection::start(stream, Role::Server, options)
    }

    /// Bound address (TCP port 0 is resolved).
    pub fn local_address(&self) -> &Address {
        self.listener.local_address()
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("address", self.local_address())
            .field("config", &self.config)
            .field("accepted", &self.accepted())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::connector::connect;
    use crate::handler::EchoHandler;
    use crate::payload::Payload;

    #[test]
    fn tcp_listener_serves_echo() {
        let address: Address = "tcp:127.0.0.1:0".parse().expect("address should parse");
        let listener = ConnectionListener::bind(&address)
            .expect("listener should bind")
            .with_handler(Arc::new(EchoHandler::default()));
        let bound = listener.local_address().clone();

        let server = thread::spawn(move || {
            let connection = listener.accept().expect("listener should accept");
            assert_eq!(listener.accepted(), 1);
            connection.on_close();
        });

        let client = connect(&bound).expect("client should connect");
        let response = client
            .requester()
            .request_response(Payload::new("ping"))
            .block()
            .expect("request should succeed")
            .expect("echo should answer with a payload");
        assert_eq!(response.data().as_ref(), b"ping");

        drop(client);
        server.join().expect("server thread should finish");
    }
}
