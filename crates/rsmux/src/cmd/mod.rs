use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use rsmux_core::{ConnectionConfig, LeaseConfig};
use rsmux_frame::DEFAULT_MAX_FRAME_LENGTH;
use rsmux_transport::Address;

use crate::exit::{mux_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod decode;
pub mod request;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and answer every interaction with an echo.
    Serve(ServeArgs),
    /// Run one interaction against a server and print what comes back.
    Request(RequestArgs),
    /// Decode hex-encoded, length-prefixed frames.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Request(args) => request::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Connection settings shared by `serve` and `request`.
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// JSON connection config file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Fragment payloads into frames of at most this many bytes (0 disables).
    #[arg(long)]
    pub mtu: Option<usize>,
    /// Enable leases on this side of the connection.
    #[arg(long)]
    pub lease: bool,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind (unix:<path> or tcp:<host>:<port>).
    pub address: Address,
    #[command(flatten)]
    pub connection: ConnectionArgs,
    /// Number of elements each request/stream produces.
    #[arg(long, default_value = "3")]
    pub stream_len: usize,
    /// Grant this many requests per lease to every connection (implies --lease).
    #[arg(long)]
    pub lease_requests: Option<u32>,
    /// Lease time-to-live; a new lease is granted when the previous one expires.
    #[arg(long, default_value = "5s")]
    pub lease_ttl: String,
    /// Exit once this many connections have been served.
    #[arg(long)]
    pub max_connections: Option<u64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Interaction {
    /// Fire-and-forget.
    Fnf,
    /// Request/response.
    Response,
    /// Request/stream.
    Stream,
    /// Request/channel.
    Channel,
}

impl Interaction {
    pub fn name(self) -> &'static str {
        match self {
            Interaction::Fnf => "fnf",
            Interaction::Response => "response",
            Interaction::Stream => "stream",
            Interaction::Channel => "channel",
        }
    }
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Address to connect to (unix:<path> or tcp:<host>:<port>).
    pub address: Address,
    /// Interaction model.
    #[arg(value_enum)]
    pub interaction: Interaction,
    #[command(flatten)]
    pub connection: ConnectionArgs,
    /// JSON payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub json: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["json", "file"])]
    pub data: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["json", "data"])]
    pub file: Option<PathBuf>,
    /// Metadata string attached to every payload.
    #[arg(long)]
    pub metadata: Option<String>,
    /// Elements to request (stream) or payloads to send (channel).
    #[arg(long, default_value = "1")]
    pub count: u32,
    /// Maximum time to wait for each reply (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Hex-encoded frames, length prefix included. Whitespace is ignored.
    #[arg(conflicts_with = "file")]
    pub hex: Option<String>,
    /// Read raw (binary) frames from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
    /// Largest frame accepted, without the length prefix.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LENGTH)]
    pub max_frame_length: usize,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Build the connection config from a file and command-line overrides.
pub fn load_config(args: &ConnectionArgs, force_lease: bool) -> CliResult<ConnectionConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => read_config(path)?,
        None => ConnectionConfig::default(),
    };
    if let Some(mtu) = args.mtu {
        config.mtu = mtu;
    }
    if (args.lease || force_lease) && config.lease.is_none() {
        config.lease = Some(LeaseConfig::default());
    }
    config
        .validate()
        .map_err(|err| mux_error("invalid connection settings", err))?;
    Ok(config)
}

fn read_config(path: &Path) -> CliResult<ConnectionConfig> {
    ConnectionConfig::load(path).map_err(|err| mux_error("config load failed", err))
}

/// Parse `5s`, `150ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
