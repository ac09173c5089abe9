use bytes::BytesMut;
use rsmux_frame::{decode_frame, Frame};

use crate::cmd::DecodeArgs;
use crate::exit::{frame_error, io_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_frames, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let bytes = match (&args.hex, &args.file) {
        (Some(hex), _) => parse_hex(hex)?,
        (None, Some(path)) => std::fs::read(path)
            .map_err(|err| io_error(&format!("read {}", path.display()), err))?,
        (None, None) => return Err(CliError::new(USAGE, "pass hex frames or --file")),
    };

    let frames = decode_all(&bytes, args.max_frame_length)?;
    print_frames(&frames, format);
    Ok(SUCCESS)
}

fn decode_all(bytes: &[u8], max_frame_length: usize) -> CliResult<Vec<Frame>> {
    let mut buf = BytesMut::from(bytes);
    let mut frames = Vec::new();
    while let Some(frame) =
        decode_frame(&mut buf, max_frame_length).map_err(|err| frame_error("decode failed", err))?
    {
        frames.push(frame);
    }
    if !buf.is_empty() {
        return Err(CliError::new(
            DATA_INVALID,
            format!("{} trailing bytes do not form a complete frame", buf.len()),
        ));
    }
    Ok(frames)
}

fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return Err(CliError::new(USAGE, "hex input has an odd number of digits"));
    }
    digits
        .chunks(2)
        .map(|pair| match (hex_value(pair[0]), hex_value(pair[1])) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(CliError::new(
                USAGE,
                format!("invalid hex digits: {}", String::from_utf8_lossy(pair)),
            )),
        })
        .collect()
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}
