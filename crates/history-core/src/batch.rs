//! # Batch Files
//!
//! Line-oriented container for a set of encoded records. A batch is written
//! once by its author and never modified afterwards.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │ line 1    {"format":"daily-report-history","v":1,"machine":"A",...}     │ header
//! │ line 2    {"v":1,"identity":"a1",...}                                   │ record
//! │ ...                                                                     │
//! │ line N+1  {"v":1,"identity":"a9",...}                                   │ record
//! │ line N+2  {"end":true,"records":N,"sha256":"…"}                         │ trailer
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The trailer digest covers every byte before the trailer line. A missing
//! trailer or a digest mismatch means the file is torn (still being copied by
//! the file-sync tool) and the whole batch is unreadable for now. A record
//! line that fails to decode under a valid digest was written that way and
//! is skipped as malformed.
//!
//! ## File Names
//! `<machine>-<seq:04>.batch.jsonl` for incremental batches and
//! `<machine>-<seq:04>.snapshot.jsonl` for full snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec;
use crate::error::{CoreError, CoreResult};
use crate::types::{BatchId, BatchKind, HistoryRecord, MachineId};

/// Format tag in every batch header.
pub const BATCH_FORMAT: &str = "daily-report-history";

/// Batch container version.
pub const BATCH_VERSION: u32 = 1;

/// File suffix shared by all batch kinds.
pub const BATCH_SUFFIX: &str = ".jsonl";

// =============================================================================
// Header / Trailer
// =============================================================================

/// First line of a batch file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub format: String,
    pub v: u32,
    pub machine: MachineId,
    pub seq: u64,
    pub kind: BatchKind,
    pub created_at: DateTime<Utc>,
    /// Local sequence range on the author's store. Incremental only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_local_seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_local_seq: Option<i64>,
}

impl BatchHeader {
    /// Creates a header for the given batch.
    pub fn new(id: &BatchId, kind: BatchKind, created_at: DateTime<Utc>) -> Self {
        BatchHeader {
            format: BATCH_FORMAT.to_string(),
            v: BATCH_VERSION,
            machine: id.machine.clone(),
            seq: id.seq,
            kind,
            created_at,
            first_local_seq: None,
            last_local_seq: None,
        }
    }

    /// Records the author's local sequence range covered by the batch.
    pub fn with_local_range(mut self, first: i64, last: i64) -> Self {
        self.first_local_seq = Some(first);
        self.last_local_seq = Some(last);
        self
    }

    /// Returns the batch id.
    pub fn batch_id(&self) -> BatchId {
        BatchId::new(self.machine.clone(), self.seq)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchTrailer {
    end: bool,
    records: usize,
    sha256: String,
}

/// Result of decoding a complete batch file.
#[derive(Debug, Clone)]
pub struct DecodedBatch {
    pub header: BatchHeader,
    pub records: Vec<HistoryRecord>,
    /// One reason per record line that failed to decode.
    pub malformed: Vec<String>,
}

// =============================================================================
// Encode / Decode
// =============================================================================

/// Encodes a header plus records into batch file bytes.
pub fn encode_batch(header: &BatchHeader, records: &[HistoryRecord]) -> CoreResult<Vec<u8>> {
    let mut out = serde_json::to_vec(header).map_err(|e| CoreError::malformed(e.to_string()))?;
    out.push(b'\n');

    for record in records {
        out.extend_from_slice(&codec::encode(record)?);
        out.push(b'\n');
    }

    let trailer = BatchTrailer {
        end: true,
        records: records.len(),
        sha256: sha256_hex(&out),
    };
    let trailer =
        serde_json::to_vec(&trailer).map_err(|e| CoreError::malformed(e.to_string()))?;
    out.extend_from_slice(&trailer);
    out.push(b'\n');

    Ok(out)
}

/// Decodes batch file bytes.
///
/// ## Errors
/// `BatchUnreadable` when the file is incomplete or its digest does not
/// match. Individual bad record lines are reported in
/// [`DecodedBatch::malformed`] instead.
pub fn decode_batch(bytes: &[u8]) -> CoreResult<DecodedBatch> {
    if bytes.is_empty() {
        return Err(CoreError::unreadable("empty file"));
    }
    if bytes.last() != Some(&b'\n') {
        return Err(CoreError::unreadable("missing final newline"));
    }

    // Trailer is the last line; the digest covers everything before it.
    let body = &bytes[..bytes.len() - 1];
    let trailer_start = body
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|i| i + 1)
        .ok_or_else(|| CoreError::unreadable("missing header or trailer"))?;

    let trailer: BatchTrailer = serde_json::from_slice(&body[trailer_start..])
        .map_err(|_| CoreError::unreadable("missing or garbled trailer"))?;
    if !trailer.end {
        return Err(CoreError::unreadable("trailer not marked as end"));
    }

    let covered = &bytes[..trailer_start];
    if sha256_hex(covered) != trailer.sha256 {
        return Err(CoreError::unreadable("digest mismatch"));
    }

    let mut lines = covered[..covered.len() - 1].split(|b| *b == b'\n');
    let header_line = lines
        .next()
        .ok_or_else(|| CoreError::unreadable("missing header"))?;
    let header = parse_header(header_line)?;

    let record_lines: Vec<&[u8]> = lines.collect();
    if record_lines.len() != trailer.records {
        return Err(CoreError::unreadable(format!(
            "trailer announces {} records, found {}",
            trailer.records,
            record_lines.len()
        )));
    }

    let mut records = Vec::with_capacity(record_lines.len());
    let mut malformed = Vec::new();
    for (index, line) in record_lines.into_iter().enumerate() {
        match codec::decode(line) {
            Ok(record) => records.push(record),
            Err(e) => malformed.push(format!("line {}: {}", index + 2, e)),
        }
    }

    Ok(DecodedBatch {
        header,
        records,
        malformed,
    })
}

/// Reads only the header from the start of a batch file.
///
/// Used to recover export progress without decoding whole batches.
pub fn decode_header(bytes: &[u8]) -> CoreResult<BatchHeader> {
    let end = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| CoreError::unreadable("missing header line"))?;
    parse_header(&bytes[..end])
}

fn parse_header(line: &[u8]) -> CoreResult<BatchHeader> {
    let header: BatchHeader = serde_json::from_slice(line)
        .map_err(|e| CoreError::unreadable(format!("garbled header: {}", e)))?;

    if header.format != BATCH_FORMAT {
        return Err(CoreError::unreadable(format!(
            "unknown batch format '{}'",
            header.format
        )));
    }
    if header.v != BATCH_VERSION {
        return Err(CoreError::unreadable(format!(
            "unsupported batch version {}",
            header.v
        )));
    }

    Ok(header)
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

// =============================================================================
// File Names
// =============================================================================

/// Builds the file name for a batch.
///
/// ## Example
/// ```rust
/// use history_core::{batch_file_name, BatchId, BatchKind, MachineId};
///
/// let id = BatchId::new(MachineId::new("A").unwrap(), 1);
/// assert_eq!(batch_file_name(&id, BatchKind::Incremental), "A-0001.batch.jsonl");
/// ```
pub fn batch_file_name(id: &BatchId, kind: BatchKind) -> String {
    format!("{}.{}{}", id, kind.file_tag(), BATCH_SUFFIX)
}

/// Parses a batch file name. Returns `None` for anything else in the folder
/// (temp files, conflict copies, foreign files).
pub fn parse_batch_file_name(name: &str) -> Option<(BatchId, BatchKind)> {
    let stem = name.strip_suffix(BATCH_SUFFIX)?;
    let (id_part, tag) = stem.rsplit_once('.')?;
    let kind = match tag {
        "batch" => BatchKind::Incremental,
        "snapshot" => BatchKind::Snapshot,
        _ => return None,
    };

    let (machine, seq) = id_part.rsplit_once('-')?;
    if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seq: u64 = seq.parse().ok()?;
    let machine = MachineId::new(machine).ok()?;

    Some((BatchId::new(machine, seq), kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewRecord, RecordId};
    use chrono::TimeZone;

    fn machine() -> MachineId {
        MachineId::new("A").unwrap()
    }

    fn records(n: usize) -> Vec<HistoryRecord> {
        let at = Utc.with_ymd_and_hms(2026, 1, 24, 8, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                NewRecord::new(RecordId::new(format!("a{}", i)).unwrap())
                    .field("count", i as i64)
                    .into_record(&machine(), at)
            })
            .collect()
    }

    fn header() -> BatchHeader {
        BatchHeader::new(
            &BatchId::new(machine(), 1),
            BatchKind::Incremental,
            Utc.with_ymd_and_hms(2026, 1, 24, 9, 0, 0).unwrap(),
        )
        .with_local_range(1, 3)
    }

    #[test]
    fn test_complete_batch_decodes() {
        let bytes = encode_batch(&header(), &records(3)).unwrap();
        let decoded = decode_batch(&bytes).unwrap();

        assert_eq!(decoded.header, header());
        assert_eq!(decoded.records, records(3));
        assert!(decoded.malformed.is_empty());
    }

    #[test]
    fn test_empty_batch_is_valid() {
        let bytes = encode_batch(&header(), &[]).unwrap();
        let decoded = decode_batch(&bytes).unwrap();
        assert!(decoded.records.is_empty());
    }

    #[test]
    fn test_truncated_batch_is_unreadable() {
        let bytes = encode_batch(&header(), &records(3)).unwrap();

        for cut in [1, bytes.len() / 3, bytes.len() / 2, bytes.len() - 1] {
            let err = decode_batch(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(err, CoreError::BatchUnreadable { .. }),
                "cut at {} gave {:?}",
                cut,
                err
            );
        }
    }

    #[test]
    fn test_tampered_body_is_unreadable() {
        let mut bytes = encode_batch(&header(), &records(2)).unwrap();
        let pos = bytes.iter().position(|b| *b == b'5').unwrap_or(40);
        bytes[pos] = b'6';
        assert!(matches!(
            decode_batch(&bytes),
            Err(CoreError::BatchUnreadable { .. })
        ));
    }

    #[test]
    fn test_malformed_line_under_valid_digest() {
        // Build a file by hand whose second record line is garbage but whose
        // trailer is consistent with it.
        let good = records(1);
        let mut body = serde_json::to_vec(&header()).unwrap();
        body.push(b'\n');
        body.extend_from_slice(&codec::encode(&good[0]).unwrap());
        body.push(b'\n');
        body.extend_from_slice(b"{\"v\":1,\"identity\":");
        body.push(b'\n');
        let trailer = BatchTrailer {
            end: true,
            records: 2,
            sha256: sha256_hex(&body),
        };
        body.extend_from_slice(&serde_json::to_vec(&trailer).unwrap());
        body.push(b'\n');

        let decoded = decode_batch(&body).unwrap();
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.malformed.len(), 1);
        assert!(decoded.malformed[0].starts_with("line 3"));
    }

    #[test]
    fn test_decode_header_only() {
        let bytes = encode_batch(&header(), &records(2)).unwrap();
        let parsed = decode_header(&bytes).unwrap();
        assert_eq!(parsed.batch_id().to_string(), "A-0001");
        assert_eq!(parsed.last_local_seq, Some(3));
    }

    #[test]
    fn test_file_names() {
        let id = BatchId::new(MachineId::new("pc.lu-22").unwrap(), 7);
        let name = batch_file_name(&id, BatchKind::Snapshot);
        assert_eq!(name, "pc.lu-22-0007.snapshot.jsonl");
        assert_eq!(parse_batch_file_name(&name), Some((id, BatchKind::Snapshot)));

        assert_eq!(parse_batch_file_name("A-0001.batch.json"), None);
        assert_eq!(parse_batch_file_name(".tmpXyZ"), None);
        assert_eq!(parse_batch_file_name("A-00x1.batch.jsonl"), None);
        assert_eq!(parse_batch_file_name("A-0001.other.jsonl"), None);
        assert_eq!(
            parse_batch_file_name("A-0001 (conflict).batch.jsonl"),
            None
        );
    }
}
