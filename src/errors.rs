use sea_orm::error::DbErr;

use crate::config::AppConfigError;

/// Errors raised by the repair and migration procedures.
///
/// Structural failures (retypes, rewrites, constraint restoration, verification)
/// surface through this type and abort the run. Diagnostic paths log and carry on
/// instead of returning one of these.
#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Sequence value {value} for table {table} does not fit in {width} digits")]
    SequenceOverflow {
        table: String,
        value: i64,
        width: usize,
    },

    #[error("Identifier collision in table {table}: {id} would be assigned more than once")]
    IdentifierCollision { table: String, id: String },

    #[error("Found {count} orphaned rows; re-run with an explicit orphan policy after reviewing them")]
    OrphansDetected { count: usize },

    #[error("Verification failed: {0}")]
    VerificationError(String),

    #[error("No identifier map recorded: {0}")]
    MissingIdentifierMap(String),

    #[error("Missing table: {0}")]
    MissingTable(String),

    #[error("Rewrite of {table} touched {rewritten} rows, expected {planned}")]
    RewriteMismatch {
        table: String,
        planned: u64,
        rewritten: u64,
    },

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<AppConfigError> for RepairError {
    fn from(err: AppConfigError) -> Self {
        RepairError::ConfigError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl RepairError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        RepairError::DatabaseError(error.into_db_err())
    }

    /// Short machine-readable code used in JSON reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::ConnectionError(_) => "connection_error",
            Self::ConfigError(_) => "config_error",
            Self::SequenceOverflow { .. } => "sequence_overflow",
            Self::IdentifierCollision { .. } => "identifier_collision",
            Self::OrphansDetected { .. } => "orphans_detected",
            Self::VerificationError(_) => "verification_failed",
            Self::MissingIdentifierMap(_) => "missing_identifier_map",
            Self::MissingTable(_) => "missing_table",
            Self::RewriteMismatch { .. } => "rewrite_mismatch",
            Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(
            RepairError::OrphansDetected { count: 3 }.code(),
            "orphans_detected"
        );
        assert_eq!(
            RepairError::db_error("boom").code(),
            "database_error"
        );
        assert_eq!(
            RepairError::SequenceOverflow {
                table: "customers".into(),
                value: 10_000_000,
                width: 7,
            }
            .code(),
            "sequence_overflow"
        );
    }

    #[test]
    fn messages_name_the_table() {
        let err = RepairError::IdentifierCollision {
            table: "payments".into(),
            id: "TRX-0000000042".into(),
        };
        let message = err.to_string();
        assert!(message.contains("payments"));
        assert!(message.contains("TRX-0000000042"));
    }

    #[test]
    fn string_errors_become_custom_db_errors() {
        match RepairError::db_error(String::from("lost connection")) {
            RepairError::DatabaseError(DbErr::Custom(msg)) => assert_eq!(msg, "lost connection"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
