//! # Record Codec
//!
//! Serializes a single [`HistoryRecord`] to bytes and back.
//!
//! ## Wire Format (v1)
//! One JSON object per record:
//! ```text
//! {"v":1,"identity":"a1","origin_machine":"A",
//!  "created_at":"2026-01-24T08:00:00.000000Z",
//!  "payload":{"count":{"type":"integer","value":5}}}
//! ```
//!
//! `created_at` is always written with six fractional digits and a `Z`
//! suffix, so timestamps sort lexicographically in storage.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{normalize_timestamp, FieldValue, HistoryRecord, MachineId, Payload, RecordId};

/// Codec version written into every encoded record.
pub const CODEC_VERSION: u32 = 1;

#[derive(Serialize)]
struct WireRecordRef<'a> {
    v: u32,
    identity: &'a RecordId,
    origin_machine: &'a MachineId,
    created_at: String,
    payload: &'a Payload,
}

#[derive(Deserialize)]
struct WireRecord {
    v: u32,
    identity: RecordId,
    origin_machine: MachineId,
    created_at: String,
    payload: Payload,
}

/// Encodes a record into its wire bytes (no trailing newline).
///
/// ## Errors
/// `MalformedRecord` for a non-finite float, or a timestamp outside years
/// 1 to 9999 (RFC 3339 has no notation for them).
pub fn encode(record: &HistoryRecord) -> CoreResult<Vec<u8>> {
    check_ts_range("created_at", record.created_at)?;
    for (name, value) in &record.payload {
        match value {
            FieldValue::Float(f) if !f.is_finite() => {
                return Err(CoreError::malformed(format!(
                    "field '{}' is not a finite number",
                    name
                )));
            }
            FieldValue::Timestamp(at) => check_ts_range(name, *at)?,
            _ => {}
        }
    }

    let wire = WireRecordRef {
        v: CODEC_VERSION,
        identity: &record.identity,
        origin_machine: &record.origin_machine,
        created_at: format_ts(record.created_at),
        payload: &record.payload,
    };

    serde_json::to_vec(&wire).map_err(|e| CoreError::malformed(e.to_string()))
}

/// Decodes wire bytes into a record.
///
/// ## Errors
/// `MalformedRecord` when the bytes are not JSON, carry an unknown codec
/// version, or miss / mistype a field.
pub fn decode(bytes: &[u8]) -> CoreResult<HistoryRecord> {
    let wire: WireRecord =
        serde_json::from_slice(bytes).map_err(|e| CoreError::malformed(e.to_string()))?;

    if wire.v != CODEC_VERSION {
        return Err(CoreError::malformed(format!(
            "unsupported codec version {}",
            wire.v
        )));
    }

    let created_at = parse_ts(&wire.created_at)?;

    Ok(HistoryRecord::new(
        wire.identity,
        wire.origin_machine,
        created_at,
        wire.payload,
    ))
}

fn check_ts_range(field: &str, at: DateTime<Utc>) -> CoreResult<()> {
    if (1..=9999).contains(&at.year()) {
        Ok(())
    } else {
        Err(CoreError::malformed(format!(
            "field '{}' has a timestamp outside years 1-9999",
            field
        )))
    }
}

/// Returns the deduplication key of a record.
pub fn identity_of(record: &HistoryRecord) -> &RecordId {
    &record.identity
}

/// Formats a timestamp the way every store and batch file writes it.
pub fn format_ts(at: DateTime<Utc>) -> String {
    normalize_timestamp(at).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp.
pub fn parse_ts(value: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| normalize_timestamp(dt.with_timezone(&Utc)))
        .map_err(|e| CoreError::malformed(format!("bad timestamp '{}': {}", value, e)))
}
