//! # history-core: Records, Identities and Codecs
//!
//! Pure types shared by the local store, the sync engine and the CLI.
//! Nothing in this crate touches a file, a socket or a database.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Daily Report History                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    history-cli / host app                       │   │
//! │  │     append ──► query ──► sync ──► status ──► migrate-legacy     │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                 history-sync (export / import)                  │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ history-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   codec   │  │   batch   │  │ validation│  │   │
//! │  │   │  Record   │  │  encode   │  │  header   │  │  machine  │  │   │
//! │  │   │  RecordId │  │  decode   │  │  trailer  │  │  identity │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                history-db (SQLite stores)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Records, ids, filters, batch ids
//! - [`codec`] - Single record wire format
//! - [`batch`] - Batch file container and file naming
//! - [`error`] - Codec and validation errors
//! - [`validation`] - Identifier rules
//!
//! ## Example Usage
//!
//! ```rust
//! use history_core::{codec, MachineId, NewRecord, RecordId};
//! use chrono::Utc;
//!
//! let record = NewRecord::new(RecordId::new("a1").unwrap())
//!     .field("count", 5)
//!     .into_record(&MachineId::new("A").unwrap(), Utc::now());
//!
//! let bytes = codec::encode(&record).unwrap();
//! assert_eq!(codec::decode(&bytes).unwrap(), record);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod batch;
pub mod codec;
pub mod error;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use batch::{
    batch_file_name, decode_batch, decode_header, encode_batch, parse_batch_file_name,
    BatchHeader, DecodedBatch,
};
pub use error::{CoreError, CoreResult, ValidationError};
pub use types::*;
