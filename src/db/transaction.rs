/*!
 * Transaction Helper Utilities
 *
 * The repair runs hold the transaction open across many phases, so instead of
 * a closure-scoped helper the caller begins the transaction, threads it
 * through every phase and hands the outcome to `finish`.
 */

use crate::errors::RepairError;
use metrics::{counter, histogram};
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use std::time::Instant;
use tracing::{debug, error, warn};

/// What to do with a transaction whose body succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Commit,
    /// Discard the changes anyway (dry runs)
    Rollback,
}

/// Begins a transaction on the session connection
pub async fn begin(conn: &DatabaseConnection) -> Result<DatabaseTransaction, RepairError> {
    debug!("Starting database transaction");
    counter!("laundry_repair_db.transaction.started", 1);
    conn.begin().await.map_err(RepairError::from)
}

/// Commits or rolls back depending on the body's result
///
/// A failed body always rolls back and its error is returned unchanged; a
/// failing rollback is only logged so the original cause stays visible.
pub async fn finish<T>(
    txn: DatabaseTransaction,
    result: Result<T, RepairError>,
    completion: Completion,
) -> Result<T, RepairError> {
    let start = Instant::now();

    let outcome = match (result, completion) {
        (Ok(value), Completion::Commit) => {
            txn.commit().await?;
            counter!("laundry_repair_db.transaction.committed", 1);
            debug!("Transaction committed");
            Ok(value)
        }
        (Ok(value), Completion::Rollback) => {
            txn.rollback().await?;
            counter!("laundry_repair_db.transaction.rolled_back", 1);
            debug!("Transaction rolled back on request");
            Ok(value)
        }
        (Err(err), _) => {
            counter!("laundry_repair_db.transaction.rolled_back", 1);
            warn!(error = %err, "Rolling back transaction");
            if let Err(rollback_err) = txn.rollback().await {
                error!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    };

    histogram!("laundry_repair_db.transaction.finish_duration", start.elapsed());
    outcome
}
