//! # Legacy Row Reader
//!
//! Reads the flat `history_rows` table written by the first generation of
//! the report tool, so its contents can be migrated into a [`LocalStore`].
//!
//! ## Row Mapping
//! ```text
//! history_rows                          HistoryRecord
//! ─────────────────────────────         ─────────────────────────────────
//! save_id, card_index,            ───►  identity "save/card/detail/action"
//! detail_index, action_index
//! saved_at                        ───►  created_at (naive local → UTC)
//! link_up, func_location, ...     ───►  payload (text fields, NULLs skipped)
//! (none)                          ───►  origin_machine (configured)
//! ```
//!
//! [`LocalStore`]: crate::LocalStore

use chrono::{DateTime, NaiveDateTime, Utc};
use history_core::{CoreError, FieldValue, HistoryRecord, MachineId, Payload, RecordId};
use sqlx::{Row, SqlitePool};

use crate::error::DbResult;

/// Table name used by the first generation of the tool.
pub const LEGACY_TABLE: &str = "history_rows";

/// Columns copied into the payload.
const PAYLOAD_COLUMNS: [&str; 8] = [
    "link_up",
    "func_location",
    "date_field",
    "shift",
    "user",
    "issue",
    "detail",
    "action",
];

/// Checks whether a table exists in the database.
pub async fn has_table(pool: &SqlitePool, table: &str) -> DbResult<bool> {
    let found: Option<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table)
            .fetch_optional(pool)
            .await?;
    Ok(found.is_some())
}

/// Reads one page of legacy rows with `row_id > after_row_id`.
///
/// Returns `(row_id, record)` pairs in `row_id` order. `fallback_at` is used
/// when `saved_at` is empty or unparseable.
pub async fn read_legacy_page(
    pool: &SqlitePool,
    after_row_id: i64,
    limit: usize,
    origin: &MachineId,
    fallback_at: DateTime<Utc>,
) -> DbResult<Vec<(i64, HistoryRecord)>> {
    let rows = sqlx::query(
        r#"
        SELECT row_id, save_id, saved_at,
               CAST(card_index AS TEXT) AS card_index,
               CAST(detail_index AS TEXT) AS detail_index,
               CAST(action_index AS TEXT) AS action_index,
               link_up, func_location, date_field, shift, user, issue, detail, action
        FROM history_rows
        WHERE row_id > ?1
        ORDER BY row_id ASC
        LIMIT ?2
        "#,
    )
    .bind(after_row_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let row_id: i64 = row.try_get("row_id")?;
        let text = |col: &str| -> DbResult<String> {
            let value: Option<String> = row.try_get(col)?;
            Ok(value.unwrap_or_default())
        };

        let identity = RecordId::from_parts(&[
            &text("save_id")?,
            &text("card_index")?,
            &text("detail_index")?,
            &text("action_index")?,
        ])
        .map_err(CoreError::from)?;

        let mut payload = Payload::new();
        for col in PAYLOAD_COLUMNS {
            let value: Option<String> = row.try_get(col)?;
            if let Some(value) = value {
                payload.insert(col.to_string(), FieldValue::Text(value));
            }
        }

        let created_at = parse_saved_at(&text("saved_at")?).unwrap_or(fallback_at);

        out.push((
            row_id,
            HistoryRecord::new(identity, origin.clone(), created_at, payload),
        ));
    }

    Ok(out)
}

/// Parses a `saved_at` value. The tool wrote naive local ISO timestamps
/// (`2026-01-24T08:00:00`); they are taken as UTC.
pub fn parse_saved_at(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}
