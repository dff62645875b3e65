//! Deadline propagation via the `grpc-timeout` metadata value.
//!
//! Follows the [gRPC over HTTP2 protocol](https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md):
//! a timeout is at most 8 ascii digits followed by a single unit character.

use std::time::Duration;

use http::header::{HeaderName, HeaderValue, InvalidHeaderValue};

use crate::metadata::MetadataMap;

/// Name of the metadata entry carrying the timeout of a call.
pub const GRPC_TIMEOUT_HEADER: HeaderName = HeaderName::from_static("grpc-timeout");

const MAX_TIMEOUT_VALUE: u128 = 99_999_999;

/// Tries to parse the `grpc-timeout` metadata value if it is present. If we fail to parse, returns
/// the value we attempted to parse.
pub fn try_parse_grpc_timeout(metadata: &MetadataMap) -> Result<Option<Duration>, &HeaderValue> {
    let Some(val) = metadata.get(GRPC_TIMEOUT_HEADER) else {
        return Ok(None);
    };

    let (timeout_value, timeout_unit) = val
        .to_str()
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or(val)?
        // `to_str` only succeeds for ascii, so splitting one byte
        // from the (non-empty) end never lands inside a character.
        .split_at(val.len() - 1);

    // at most 8 digits, which also rules out any overflow
    if timeout_value.len() > 8 {
        return Err(val);
    }

    let timeout_value: u64 = timeout_value.parse().ok().ok_or(val)?;

    let duration = match timeout_unit {
        "H" => Duration::from_hours(timeout_value),
        "M" => Duration::from_mins(timeout_value),
        "S" => Duration::from_secs(timeout_value),
        "m" => Duration::from_millis(timeout_value),
        "u" => Duration::from_micros(timeout_value),
        "n" => Duration::from_nanos(timeout_value),
        _ => return Err(val),
    };

    Ok(Some(duration))
}

/// Encode a [`Duration`] as `grpc-timeout` value, using the finest unit
/// which still fits in 8 digits. Durations too large for hours are capped.
pub fn encode_grpc_timeout(timeout: Duration) -> Result<HeaderValue, InvalidHeaderValue> {
    const UNITS: [(u128, char); 6] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60 * 1_000_000_000, 'M'),
        (60 * 60 * 1_000_000_000, 'H'),
    ];

    let nanos = timeout.as_nanos();
    let (value, unit) = UNITS
        .iter()
        .map(|(divisor, unit)| (nanos / divisor, *unit))
        .find(|(value, _)| *value <= MAX_TIMEOUT_VALUE)
        .unwrap_or((MAX_TIMEOUT_VALUE, 'H'));

    HeaderValue::from_str(&format!("{value}{unit}"))
}

/// Parse the client timeout from the request metadata and combine it with
/// the (optional) server timeout: the shorter of the two durations, if either is set.
pub(crate) fn effective_timeout(
    metadata: &MetadataMap,
    server_timeout: Option<Duration>,
) -> Option<Duration> {
    let client_timeout = try_parse_grpc_timeout(metadata).unwrap_or_else(|value| {
        tracing::trace!("error parsing `grpc-timeout` metadata value {value:?}");
        None
    });

    match (client_timeout, server_timeout) {
        (None, None) => None,
        (Some(dur), None) | (None, Some(dur)) => Some(dur),
        (Some(header), Some(server)) => Some(std::cmp::min(header, server)),
    }
}
