use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rsmux_core::{ConnectionListener, EchoHandler, LeaseGrant, LeaseSource};
use rsmux_transport::{Address, DuplexStream};

use crate::cmd::{load_config, parse_duration, ServeArgs};
use crate::exit::{mux_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: ServeArgs, _format: OutputFormat) -> CliResult<i32> {
    let config = load_config(&args.connection, args.lease_requests.is_some())?;
    let mut listener = ConnectionListener::bind(&args.address)
        .map_err(|err| mux_error("bind failed", err))?
        .with_config(config)
        .with_handler(Arc::new(EchoHandler {
            stream_len: args.stream_len,
        }));

    if let Some(requests) = args.lease_requests {
        let ttl = parse_duration(&args.lease_ttl)?;
        listener = listener.with_lease_source(move || renewing_leases(requests, ttl));
    }

    let address = listener.local_address().clone();
    tracing::info!(%address, stream_len = args.stream_len, "serving");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), address)?;

    let mut workers = Vec::new();
    while running.load(Ordering::SeqCst) {
        let connection = listener
            .accept()
            .map_err(|err| mux_error("accept failed", err))?;
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let served = listener.accepted();
        tracing::info!(connection = served, role = ?connection.role(), "accepted");
        workers.push(thread::spawn(move || {
            let reason = connection.on_close();
            tracing::info!(connection = served, %reason, "connection finished");
        }));

        if args.max_connections.is_some_and(|max| served >= max) {
            for worker in workers.drain(..) {
                let _ = worker.join();
            }
            break;
        }
    }

    Ok(SUCCESS)
}

/// First grant immediately, then a fresh one each time the previous expires.
fn renewing_leases(requests: u32, ttl: Duration) -> LeaseSource {
    let mut first = true;
    Box::new(std::iter::from_fn(move || {
        if !first {
            thread::sleep(ttl);
        }
        first = false;
        Some(LeaseGrant::new(requests, ttl))
    }))
}

fn install_ctrlc_handler(running: Arc<AtomicBool>, address: Address) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        // Wake the blocking accept.
        let _ = DuplexStream::connect(&address);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_renew_with_the_same_budget() {
        let mut leases = renewing_leases(4, Duration::from_millis(1));
        let first = leases.next().expect("first grant");
        let second = leases.next().expect("renewed grant");
        assert_eq!(first.allowed_requests, 4);
        assert_eq!(second, first);
    }
}
