//! # Domain Types
//!
//! Core types shared by every history crate.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ HistoryRecord   │   │   NewRecord     │   │    BatchId      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  identity       │   │  identity       │   │  machine        │       │
//! │  │  origin_machine │   │  payload        │   │  seq            │       │
//! │  │  created_at     │   │  created_at?    │   │  "A-0001"       │       │
//! │  │  payload        │   │  origin?        │   └─────────────────┘       │
//! │  └─────────────────┘   └─────────────────┘                             │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   RecordId      │   │   MachineId     │   │  FieldValue     │       │
//! │  │  dedup key      │   │  file-name safe │   │  Integer/Float  │       │
//! │  │  never reused   │   │  immutable      │   │  Text/Timestamp │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity Rule
//! For a given `RecordId` the payload and origin never change anywhere in the
//! system. Stores append once per identity and never update in place.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::validation::{validate_machine_id, validate_record_id, ValidationResult};

// =============================================================================
// Machine Id
// =============================================================================

/// Identifier of a machine taking part in sync.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MachineId(String);

impl MachineId {
    /// Creates a validated machine id.
    pub fn new(id: impl Into<String>) -> ValidationResult<Self> {
        let id = id.into();
        validate_machine_id(&id)?;
        Ok(MachineId(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MachineId {
    type Error = crate::error::ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        MachineId::new(value)
    }
}

impl From<MachineId> for String {
    fn from(id: MachineId) -> Self {
        id.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for MachineId {
    type Err = crate::error::ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MachineId::new(s)
    }
}

// =============================================================================
// Record Id
// =============================================================================

/// Stable, globally unique identity of a history record.
///
/// ## Construction Strategies
/// - [`RecordId::new`] - caller supplied key (e.g. a report save id)
/// - [`RecordId::from_parts`] - composite key joined with `/`
/// - [`RecordId::sequential`] - `<machine>:<local sequence>`
/// - [`RecordId::content_hash`] - SHA-256 over origin and payload
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    /// Creates a validated record id.
    pub fn new(id: impl Into<String>) -> ValidationResult<Self> {
        let id = id.into();
        validate_record_id(&id)?;
        Ok(RecordId(id))
    }

    /// Builds a composite identity from ordered key parts.
    ///
    /// ## Example
    /// ```rust
    /// use history_core::RecordId;
    ///
    /// let id = RecordId::from_parts(&["save-42", "1", "2", ""]).unwrap();
    /// assert_eq!(id.as_str(), "save-42/1/2/");
    /// ```
    pub fn from_parts(parts: &[&str]) -> ValidationResult<Self> {
        RecordId::new(parts.join("/"))
    }

    /// Builds an identity from the originating machine and its local sequence.
    pub fn sequential(machine: &MachineId, seq: u64) -> Self {
        RecordId(format!("{}:{}", machine, seq))
    }

    /// Builds an identity from a SHA-256 digest of origin and payload.
    ///
    /// Same origin and same payload always give the same identity.
    pub fn content_hash(origin: &MachineId, payload: &Payload) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(origin.as_str().as_bytes());
        hasher.update([0u8]);
        // BTreeMap serializes in key order, so the digest input is canonical.
        if let Ok(bytes) = serde_json::to_vec(payload) {
            hasher.update(&bytes);
        }
        let digest = hasher.finalize();

        let mut hex = String::with_capacity(7 + digest.len() * 2);
        hex.push_str("sha256:");
        for byte in digest {
            hex.push_str(&format!("{:02x}", byte));
        }
        RecordId(hex)
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RecordId {
    type Error = crate::error::ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RecordId::new(value)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Field Values
// =============================================================================

/// One scalar metric value in a record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Integer(i64),
    /// Must be finite; NaN and infinities do not survive encoding.
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Timestamp(v) => f.write_str(&v.to_rfc3339()),
        }
    }
}

/// Ordered field name → value mapping.
pub type Payload = BTreeMap<String, FieldValue>;

// =============================================================================
// History Record
// =============================================================================

/// One reported entry as stored and replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Dedup key, immutable once created.
    pub identity: RecordId,

    /// Machine that first created the record.
    pub origin_machine: MachineId,

    /// Assigned at local append time, microsecond precision.
    pub created_at: DateTime<Utc>,

    /// Reported metrics.
    pub payload: Payload,
}

impl HistoryRecord {
    /// Creates a record, truncating `created_at` to microseconds so it
    /// survives a round trip through SQLite text columns unchanged.
    pub fn new(
        identity: RecordId,
        origin_machine: MachineId,
        created_at: DateTime<Utc>,
        payload: Payload,
    ) -> Self {
        HistoryRecord {
            identity,
            origin_machine,
            created_at: normalize_timestamp(created_at),
            payload,
        }
    }

    /// Returns a payload value by field name.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.payload.get(name)
    }
}

/// A record submitted for append, before the store stamps it.
///
/// ## Example
/// ```rust
/// use history_core::{NewRecord, RecordId};
///
/// let draft = NewRecord::new(RecordId::new("a1").unwrap())
///     .field("count", 5)
///     .field("line", "LU22");
/// assert_eq!(draft.payload.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub identity: RecordId,
    pub payload: Payload,
    /// Assigned by the store when `None`.
    pub created_at: Option<DateTime<Utc>>,
    /// Defaults to the store's own machine when `None`.
    pub origin_machine: Option<MachineId>,
}

impl NewRecord {
    /// Creates an empty draft for the given identity.
    pub fn new(identity: RecordId) -> Self {
        NewRecord {
            identity,
            payload: Payload::new(),
            created_at: None,
            origin_machine: None,
        }
    }

    /// Adds one payload field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    /// Sets the full payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Pins the creation time instead of letting the store assign it.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(normalize_timestamp(at));
        self
    }

    /// Sets the origin machine (used when migrating foreign rows).
    pub fn origin(mut self, machine: MachineId) -> Self {
        self.origin_machine = Some(machine);
        self
    }

    /// Completes the draft with the given defaults.
    pub fn into_record(self, default_origin: &MachineId, now: DateTime<Utc>) -> HistoryRecord {
        HistoryRecord::new(
            self.identity,
            self.origin_machine
                .unwrap_or_else(|| default_origin.clone()),
            self.created_at.unwrap_or(now),
            self.payload,
        )
    }
}

impl From<HistoryRecord> for NewRecord {
    fn from(record: HistoryRecord) -> Self {
        NewRecord {
            identity: record.identity,
            payload: record.payload,
            created_at: Some(record.created_at),
            origin_machine: Some(record.origin_machine),
        }
    }
}

// =============================================================================
// Query Filter
// =============================================================================

/// Filter for `query`: date range on `created_at` and/or origin machine.
///
/// `from` is inclusive, `until` is exclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub origin: Option<MachineId>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to `created_at >= from`.
    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    /// Restricts to `created_at < until`.
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Restricts to records first created by `origin`.
    pub fn origin(mut self, origin: MachineId) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Caps the number of records returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Checks a record against the filter (limit is not considered).
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        if let Some(from) = self.from {
            if record.created_at < from {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at >= until {
                return false;
            }
        }
        if let Some(ref origin) = self.origin {
            if &record.origin_machine != origin {
                return false;
            }
        }
        true
    }
}

// =============================================================================
// Batches
// =============================================================================

/// Identity of an exported batch: author machine + export sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchId {
    pub machine: MachineId,
    pub seq: u64,
}

impl BatchId {
    pub fn new(machine: MachineId, seq: u64) -> Self {
        BatchId { machine, seq }
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:04}", self.machine, self.seq)
    }
}

/// What a batch contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    /// Records appended since the previous export.
    Incremental,
    /// Every record the exporting store holds (onboarding a new machine).
    Snapshot,
}

impl BatchKind {
    /// Tag used in file names.
    pub fn file_tag(&self) -> &'static str {
        match self {
            BatchKind::Incremental => "batch",
            BatchKind::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_tag())
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Truncates a timestamp to the precision stores keep (microseconds).
pub fn normalize_timestamp(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn machine(id: &str) -> MachineId {
        MachineId::new(id).unwrap()
    }

    #[test]
    fn test_ids_reject_invalid_input() {
        assert!(MachineId::new("").is_err());
        assert!(RecordId::new("").is_err());
        assert!("A".parse::<MachineId>().is_ok());
    }

    #[test]
    fn test_sequential_identity() {
        let id = RecordId::sequential(&machine("PC-1"), 17);
        assert_eq!(id.as_str(), "PC-1:17");
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        let mut payload = Payload::new();
        payload.insert("count".into(), FieldValue::Integer(5));
        payload.insert("line".into(), FieldValue::Text("LU22".into()));

        let a = RecordId::content_hash(&machine("A"), &payload);
        let b = RecordId::content_hash(&machine("A"), &payload);
        let c = RecordId::content_hash(&machine("B"), &payload);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("sha256:"));
        assert_eq!(a.as_str().len(), 7 + 64);
    }

    #[test]
    fn test_new_record_defaults() {
        let now = Utc.with_ymd_and_hms(2026, 1, 24, 8, 0, 0).unwrap();
        let record = NewRecord::new(RecordId::new("a1").unwrap())
            .field("count", 5)
            .into_record(&machine("A"), now);

        assert_eq!(record.origin_machine, machine("A"));
        assert_eq!(record.created_at, now);
        assert_eq!(record.field("count"), Some(&FieldValue::Integer(5)));
    }

    #[test]
    fn test_created_at_truncated_to_micros() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let record = HistoryRecord::new(
            RecordId::new("a1").unwrap(),
            machine("A"),
            at,
            Payload::new(),
        );
        assert_eq!(record.created_at.timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn test_filter_matches() {
        let t = |h| Utc.with_ymd_and_hms(2026, 1, 24, h, 0, 0).unwrap();
        let record = HistoryRecord::new(
            RecordId::new("a1").unwrap(),
            machine("A"),
            t(10),
            Payload::new(),
        );

        assert!(HistoryFilter::all().matches(&record));
        assert!(HistoryFilter::all().from(t(10)).matches(&record));
        assert!(!HistoryFilter::all().until(t(10)).matches(&record));
        assert!(HistoryFilter::all().from(t(9)).until(t(11)).matches(&record));
        assert!(!HistoryFilter::all().origin(machine("B")).matches(&record));
    }

    #[test]
    fn test_batch_id_display() {
        let id = BatchId::new(machine("A"), 1);
        assert_eq!(id.to_string(), "A-0001");
        assert_eq!(BatchId::new(machine("A"), 12345).to_string(), "A-12345");
    }
}
