use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rsmux_core::{
    connect_with_options, ConnectionOptions, MuxError, Payload, PayloadStream, Requester,
};

use crate::cmd::{load_config, parse_duration, Interaction, RequestArgs};
use crate::exit::{
    io_error, mux_error, CliError, CliResult, DATA_INVALID, INTERNAL, SUCCESS, TIMEOUT,
};
use crate::output::{print_payload, OutputFormat};

pub fn run(args: RequestArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = load_config(&args.connection, false)?;
    let leased = config.leases_enabled();
    let data = resolve_payload(&args)?;
    let metadata = args.metadata.clone().map(Bytes::from);

    let connection = connect_with_options(
        &args.address,
        ConnectionOptions::default().with_config(config),
    )
    .map_err(|err| mux_error("connect failed", err))?;
    let requester = connection.requester();
    if leased {
        wait_for_lease(&requester, timeout)?;
    }

    let interaction = args.interaction;
    let payload = || build_payload(&data, metadata.as_ref());
    tracing::debug!(interaction = interaction.name(), size = data.len(), "sending");

    match interaction {
        Interaction::Fnf => requester
            .fire_and_forget(payload())
            .subscribe()
            .map_err(|err| mux_error("fire-and-forget failed", err))?,
        Interaction::Response => {
            let mut subscription = requester
                .request_response(payload())
                .subscribe()
                .map_err(|err| mux_error("request failed", err))?;
            if let Some(reply) = receive(timeout, |t| subscription.recv_timeout(t))? {
                print_payload(interaction.name(), 0, &reply, format);
            }
        }
        Interaction::Stream => {
            let mut stream = requester
                .request_stream(payload())
                .subscribe()
                .map_err(|err| mux_error("request failed", err))?;
            stream.request(u64::from(args.count));
            drain(&mut stream, args.count, interaction, timeout, format)?;
        }
        Interaction::Channel => {
            let (sink, mut inbound) = requester
                .request_channel(payload())
                .subscribe()
                .map_err(|err| mux_error("request failed", err))?;
            inbound.request(u64::from(args.count));

            let rest: Vec<Payload> = (1..args.count).map(|_| payload()).collect();
            let sender = thread::Builder::new()
                .name("rsmux-cli-sender".into())
                .spawn(move || -> Result<(), MuxError> {
                    for next in rest {
                        sink.send(next)?;
                    }
                    sink.complete()
                })
                .map_err(|err| io_error("sender thread failed", err))?;

            drain(&mut inbound, args.count, interaction, timeout, format)?;
            match sender.join() {
                Ok(result) => result.map_err(|err| mux_error("channel send failed", err))?,
                Err(_) => return Err(CliError::new(INTERNAL, "sender thread panicked")),
            }
        }
    }

    connection.close();
    Ok(SUCCESS)
}

/// Print up to `count` elements, stopping early if the responder completes.
fn drain(
    stream: &mut PayloadStream,
    count: u32,
    interaction: Interaction,
    timeout: Duration,
    format: OutputFormat,
) -> CliResult<()> {
    for index in 0..count as usize {
        match receive(timeout, |t| stream.recv_timeout(t))? {
            Some(payload) => print_payload(interaction.name(), index, &payload, format),
            None => break,
        }
    }
    Ok(())
}

fn receive(
    timeout: Duration,
    recv: impl FnOnce(Duration) -> rsmux_core::Result<Option<Payload>>,
) -> CliResult<Option<Payload>> {
    let started = Instant::now();
    recv(timeout).map_err(|err| {
        if started.elapsed() >= timeout {
            CliError::new(TIMEOUT, format!("no reply within {timeout:?}"))
        } else {
            mux_error("interaction failed", err)
        }
    })
}

fn wait_for_lease(requester: &Requester, timeout: Duration) -> CliResult<()> {
    let started = Instant::now();
    while requester.available_lease_requests().unwrap_or(0) == 0 {
        if started.elapsed() >= timeout {
            return Err(CliError::new(
                TIMEOUT,
                format!("no lease received within {timeout:?}"),
            ));
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

fn build_payload(data: &Bytes, metadata: Option<&Bytes>) -> Payload {
    match metadata {
        Some(metadata) => Payload::with_metadata(data.clone(), metadata.clone()),
        None => Payload::new(data.clone()),
    }
}

fn resolve_payload(args: &RequestArgs) -> CliResult<Bytes> {
    if let Some(json) = &args.json {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|err| CliError::new(DATA_INVALID, format!("invalid --json payload: {err}")))?;
        let encoded = serde_json::to_vec(&value)
            .map_err(|err| CliError::new(DATA_INVALID, format!("json encode failed: {err}")))?;
        return Ok(Bytes::from(encoded));
    }
    if let Some(data) = &args.data {
        return Ok(Bytes::from(data.clone()));
    }
    if let Some(path) = &args.file {
        let bytes = std::fs::read(path)
            .map_err(|err| io_error(&format!("read {}", path.display()), err))?;
        return Ok(Bytes::from(bytes));
    }
    Ok(Bytes::new())
}
