//! # Repository Module
//!
//! SQL access for the history stores.
//!
//! ## Available Repositories
//!
//! - [`HistoryRepository`](history::HistoryRepository) - append-once rows in `history_records`
//! - [`legacy`] - read-only access to the original `history_rows` table

pub mod history;
pub mod legacy;
