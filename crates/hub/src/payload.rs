//! Decoding of the sensor node's text payload.
//!
//! The node publishes comma-separated `key:value` tokens with device-native
//! key names, e.g.
//!
//! ```text
//! suhu:28.5,kelembapan:55,cahaya_analog:1800,hujan:tidak hujan,waktu:2025-06-24 21:28:44
//! ```
//!
//! Conversion is per field: a bad value drops that field only.

use std::sync::OnceLock;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::{debug, warn};

use crate::error::{ParseFieldError, PayloadError};
use crate::state::{Field, TelemetryRecord};

/// Key carrying the device clock reading.
const TIMESTAMP_KEY: &str = "waktu";

/// Rain values that mean "dry"; anything else counts as rain.
const NO_RAIN_VALUES: &[&str] = &["tidak hujan", "false", "0"];

// ---------------------------------------------------------------------------
// Parsed payload
// ---------------------------------------------------------------------------

/// Canonical fields found in one payload. `None` means the key was absent or
/// its value failed conversion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryFields {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light: Option<i64>,
    pub rain: Option<bool>,
}

impl TelemetryFields {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.humidity.is_none()
            && self.light.is_none()
            && self.rain.is_none()
    }

    /// Canonical fields the payload did not provide.
    pub fn missing(&self) -> Vec<Field> {
        let mut missing = Vec::new();
        if self.temperature.is_none() {
            missing.push(Field::Temperature);
        }
        if self.humidity.is_none() {
            missing.push(Field::Humidity);
        }
        if self.light.is_none() {
            missing.push(Field::Light);
        }
        if self.rain.is_none() {
            missing.push(Field::Rain);
        }
        missing
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPayload {
    pub fields: TelemetryFields,
    pub raw_timestamp: Option<String>,
    pub errors: Vec<ParseFieldError>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Split a payload into canonical fields. Never fails as a whole: unknown
/// keys are skipped and unconvertible values are collected in `errors`.
pub fn parse_payload(payload: &str) -> ParsedPayload {
    let mut parsed = ParsedPayload::default();

    for token in payload.split(',') {
        // split at the first ':' only; timestamps contain more of them
        let Some((key, value)) = token.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();

        if key == TIMESTAMP_KEY {
            parsed.raw_timestamp = Some(value.to_string());
            continue;
        }

        let result = match key.as_str() {
            "suhu" => parse_real(&key, value).map(|v| parsed.fields.temperature = Some(v)),
            "kelembapan" => parse_real(&key, value).map(|v| parsed.fields.humidity = Some(v)),
            "cahaya_analog" => parse_integer(&key, value).map(|v| parsed.fields.light = Some(v)),
            "hujan" => {
                parsed.fields.rain = Some(parse_rain(value));
                Ok(())
            }
            // Reported by the node but not part of the canonical record.
            "heat_index" | "dew_point" => parse_real(&key, value).map(|_| ()),
            _ => {
                debug!(key = %key, "ignoring unknown payload key");
                Ok(())
            }
        };

        if let Err(e) = result {
            parsed.errors.push(e);
        }
    }

    parsed
}

fn parse_real(key: &str, value: &str) -> Result<f64, ParseFieldError> {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(_) => Err(field_error(key, value, "not a finite number")),
        Err(e) => Err(field_error(key, value, &e.to_string())),
    }
}

fn parse_integer(key: &str, value: &str) -> Result<i64, ParseFieldError> {
    value
        .parse::<i64>()
        .map_err(|e| field_error(key, value, &e.to_string()))
}

/// Case-insensitive; only the explicit "dry" spellings resolve to `false`.
pub fn parse_rain(value: &str) -> bool {
    let lowered = value.trim().to_lowercase();
    !NO_RAIN_VALUES.contains(&lowered.as_str())
}

fn field_error(key: &str, value: &str, reason: &str) -> ParseFieldError {
    ParseFieldError {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Try the device clock layouts in order; the first match wins.
pub fn parse_timestamp(raw: &str) -> Option<PrimitiveDateTime> {
    let layouts = [
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        format_description!("[day]/[month]/[year] [hour]:[minute]:[second]"),
        format_description!("[hour]:[minute]:[second] [day]-[month]-[year]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    ];
    let raw = raw.trim();
    layouts
        .iter()
        .find_map(|layout| PrimitiveDateTime::parse(raw, layout).ok())
}

static LOCAL_OFFSET: OnceLock<UtcOffset> = OnceLock::new();

/// Record the local UTC offset. Must run before any other thread exists:
/// the offset cannot be read safely from a multi-threaded process on Unix.
pub fn capture_local_offset() -> Option<UtcOffset> {
    let offset = UtcOffset::current_local_offset().ok()?;
    Some(*LOCAL_OFFSET.get_or_init(|| offset))
}

/// Current wall-clock time in the captured local offset, UTC if none was
/// captured.
pub fn local_now() -> PrimitiveDateTime {
    let offset = LOCAL_OFFSET.get().copied().unwrap_or(UtcOffset::UTC);
    let now = OffsetDateTime::now_utc().to_offset(offset);
    PrimitiveDateTime::new(now.date(), now.time())
}

// ---------------------------------------------------------------------------
// Record construction
// ---------------------------------------------------------------------------

/// Decode a raw telemetry message into a record, using `now` when the
/// device clock is absent or unreadable.
pub fn decode_telemetry(
    payload: &[u8],
    now: PrimitiveDateTime,
) -> Result<TelemetryRecord, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|_| PayloadError::NotUtf8)?;
    let parsed = parse_payload(text);

    for e in &parsed.errors {
        warn!(key = %e.key, value = %e.value, "dropping telemetry field: {}", e.reason);
    }

    if parsed.fields.is_empty() {
        return Err(PayloadError::NoTelemetryFields);
    }

    let (timestamp, clock_fallback) = match parsed.raw_timestamp.as_deref() {
        Some(raw) => match parse_timestamp(raw) {
            Some(ts) => (ts, false),
            None => {
                warn!(raw = %raw, "unrecognised device time, using local clock");
                (now, true)
            }
        },
        None => {
            warn!("no device time in payload, using local clock");
            (now, true)
        }
    };

    Ok(TelemetryRecord::new(&parsed.fields, timestamp, clock_fallback))
}

// ===========================================================================
// Tests
// ===========================================================================
