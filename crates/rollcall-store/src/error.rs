use rollcall_core::RosterError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database connection: {0}")]
    Connection(#[from] tokio_rusqlite::Error),
    #[error("database schema v{found} is newer than supported v{supported}")]
    SchemaTooNew { found: i32, supported: i32 },
    #[error("no migration for schema v{0}")]
    UnknownMigration(i32),
    #[error("corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Errors that will fail the same way on retry.
    pub fn is_permanent(&self) -> bool {
        let sqlite = match self {
            StoreError::SchemaTooNew { .. }
            | StoreError::UnknownMigration(_)
            | StoreError::Corrupt { .. } => return true,
            StoreError::Sqlite(err) => err,
            StoreError::Connection(tokio_rusqlite::Error::Rusqlite(err)) => err,
            _ => return false,
        };
        matches!(
            sqlite.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ConstraintViolation)
        )
    }
}

impl From<StoreError> for RosterError {
    fn from(err: StoreError) -> Self {
        if err.is_permanent() {
            RosterError::Rejected(err.to_string())
        } else {
            RosterError::Unavailable(err.to_string())
        }
    }
}
