use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use rsmux_core::Payload;
use rsmux_frame::{error_code, Frame, FrameType};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PayloadOutput<'a> {
    interaction: &'a str,
    index: usize,
    data_size: usize,
    data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<String>,
    timestamp: String,
}

/// Print one payload received by an interaction.
pub fn print_payload(interaction: &str, index: usize, payload: &Payload, format: OutputFormat) {
    let metadata = payload.metadata().map(|m| preview(m.as_ref()));
    match format {
        OutputFormat::Json => {
            let out = PayloadOutput {
                interaction,
                index,
                data_size: payload.data().len(),
                data: preview(payload.data().as_ref()),
                metadata,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["INTERACTION", "#", "SIZE", "METADATA", "DATA"])
                .add_row(vec![
                    interaction.to_string(),
                    index.to_string(),
                    payload.data().len().to_string(),
                    metadata.unwrap_or_default(),
                    preview(payload.data().as_ref()),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => match metadata {
            Some(metadata) => println!(
                "{interaction}[{index}] size={} metadata={metadata} data={}",
                payload.data().len(),
                preview(payload.data().as_ref())
            ),
            None => println!(
                "{interaction}[{index}] size={} data={}",
                payload.data().len(),
                preview(payload.data().as_ref())
            ),
        },
        OutputFormat::Raw => print_raw(payload.data().as_ref()),
    }
}

#[derive(Serialize)]
struct FrameOutput {
    stream_id: u32,
    frame_type: &'static str,
    flags: String,
    length: usize,
    metadata_size: Option<usize>,
    data_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    data: String,
}

impl FrameOutput {
    fn from_frame(frame: &Frame) -> Self {
        let frame_type = frame.frame_type();
        let data = frame.data();
        Self {
            stream_id: frame.stream_id(),
            frame_type: frame_type.name(),
            flags: format!("0x{:03x}", frame.flags()),
            length: frame.len(),
            metadata_size: frame.metadata().map(|m| m.len()),
            data_size: data.len(),
            request_n: frame.request_n(),
            error: frame.error_code().map(|code| {
                format!("{} ({})", error_code::name(code), frame.error_message())
            }),
            data: if frame_type == FrameType::Error {
                String::new()
            } else {
                preview(data.as_ref())
            },
        }
    }
}

/// Print decoded frames, one record per frame.
pub fn print_frames(frames: &[Frame], format: OutputFormat) {
    let rows: Vec<FrameOutput> = frames.iter().map(FrameOutput::from_frame).collect();
    match format {
        OutputFormat::Json => {
            for row in &rows {
                println!(
                    "{}",
                    serde_json::to_string(row).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["STREAM", "TYPE", "FLAGS", "LENGTH", "DETAIL"]);
            for row in &rows {
                table.add_row(vec![
                    row.stream_id.to_string(),
                    row.frame_type.to_string(),
                    row.flags.clone(),
                    row.length.to_string(),
                    detail(row),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for row in &rows {
                println!(
                    "stream={} type={} flags={} length={} {}",
                    row.stream_id,
                    row.frame_type,
                    row.flags,
                    row.length,
                    detail(row)
                );
            }
        }
    }
}

fn detail(row: &FrameOutput) -> String {
    if let Some(error) = &row.error {
        return error.clone();
    }
    let mut parts = Vec::new();
    if let Some(n) = row.request_n {
        parts.push(format!("request_n={n}"));
    }
    if let Some(size) = row.metadata_size {
        parts.push(format!("metadata={size}B"));
    }
    parts.push(format!("data={}", row.data));
    parts.join(" ")
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn preview(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", bytes.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
