use rsmux_transport::{Address, DuplexStream};

use crate::connection::{Connection, ConnectionOptions};
use crate::error::Result;
use crate::registry::Role;

/// Connect to a listening peer as the client side with default options.
pub fn connect(address: &Address) -> Result<Connection> {
    connect_with_options(address, ConnectionOptions::default())
}

/// Connect with explicit configuration, handler and interceptor.
pub fn connect_with_options(address: &Address, options: ConnectionOptions) -> Result<Connection> {
    let stream = DuplexStream::connect(address)?;
    tracing::info!(%address, transport = stream.transport_name(), "connected");
    Connection::start(stream, Role::Client, options)
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use super::*;
    use crate::listener::ConnectionListener;

    fn make_sock_path(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rsmux-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("connector.sock")
    }

    #[test]
    fn connect_convenience() {
        let address = Address::Unix(make_sock_path("connect"));
        let listener = ConnectionListener::bind(&address).expect("listener should bind");

        let server = thread::spawn(move || {
            let connection = listener.accept().expect("listener should accept");
            assert_eq!(connection.role(), Role::Server);
            connection.on_close()
        });

        let client = connect(&address).expect("client should connect");
        assert_eq!(client.role(), Role::Client);
        drop(client);
        let reason = server.join().expect("server thread should finish");
        assert!(reason.contains("peer closed"), "{reason}");

        if let Address::Unix(path) = &address {
            if let Some(parent) = path.parent() {
                let _ = std::fs::remove_dir_all(parent);
            }
        }
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let address = Address::Unix(make_sock_path("missing"));
        assert!(connect(&address).is_err());
    }
}
