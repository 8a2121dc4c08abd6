//! rollcall-store: SQLite implementation of the roster store.
//!
//! Holds students and their reference photos, precomputed signatures,
//! attendance records and (optionally) archived captures. The schema is
//! versioned through `PRAGMA user_version`.

mod error;
mod migrations;
mod store;

pub use error::StoreError;
pub use migrations::CURRENT_SCHEMA_VERSION;
pub use store::{AttendanceRecord, NewStudent, SqliteStore, StudentSummary};
