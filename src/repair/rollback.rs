//! Restores the original identifiers from the identifier map.

use super::identifiers::{apply_map, dependent_columns, Direction};
use super::normalizer::{columns_to_normalize, ColumnTarget};
use super::{checkpoint, ensure_tables_exist, inspector, lock_tables, restorer, table_exists};
use crate::db::sql::qualified;
use crate::db::{begin, execute, fetch_count, finish, Completion, Session};
use crate::errors::RepairError;
use crate::report::{RollbackReport, TableRollback};
use crate::schema::{ID_MAP_TABLE, MIGRATION_ORDER, SEQUENCE_COLUMN, TARGET_TABLES};
use metrics::counter;
use sea_orm::ConnectionTrait;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackOptions {
    /// Retype key columns back to UUID when every value parses
    pub restore_uuid_type: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            restore_uuid_type: true,
        }
    }
}

/// Runs the rollback on `db`, which should be a transaction
pub async fn rollback<C>(
    db: &C,
    schema: &str,
    options: RollbackOptions,
) -> Result<RollbackReport, RepairError>
where
    C: ConnectionTrait,
{
    let started = Instant::now();

    if !table_exists(db, schema, ID_MAP_TABLE).await? {
        return Err(RepairError::MissingIdentifierMap(format!(
            "table {}.{} does not exist",
            schema, ID_MAP_TABLE
        )));
    }
    let mapped = fetch_count(
        db,
        &format!(
            "SELECT COUNT(*) AS count FROM {}",
            qualified(schema, ID_MAP_TABLE)
        ),
        Vec::new(),
    )
    .await?;
    if mapped == 0 {
        return Err(RepairError::MissingIdentifierMap(format!(
            "{}.{} is empty",
            schema, ID_MAP_TABLE
        )));
    }

    ensure_tables_exist(db, schema, &TARGET_TABLES).await?;
    execute(db, "SET CONSTRAINTS ALL DEFERRED", Vec::new()).await?;
    lock_tables(db, schema, &TARGET_TABLES).await?;

    let records = inspector::discover(db, schema, &TARGET_TABLES).await?;
    inspector::drop_all(db, schema, &records).await?;

    let mut tables = Vec::new();
    for table in MIGRATION_ORDER.iter().rev() {
        let restored = apply_map(
            db,
            schema,
            table.name,
            &ColumnTarget::new(table.name, "id"),
            Direction::Reverse,
        )
        .await?;

        let mut dependents = Vec::new();
        for dependent in dependent_columns(table.name, &records) {
            let rows = apply_map(db, schema, table.name, &dependent, Direction::Reverse).await?;
            dependents.push(format!("{} ({} rows)", dependent, rows));
        }

        info!(table = table.name, rows = restored, "Restored original identifiers");
        tables.push(TableRollback {
            table: table.name.to_string(),
            restored,
            dependents,
        });
    }

    let uuid_type_restored = if options.restore_uuid_type {
        super::normalizer::restore_uuid(db, schema, &columns_to_normalize(&records)).await?
    } else {
        info!("Keeping key columns as VARCHAR(255)");
        false
    };

    let restore = restorer::restore(db, schema, &records).await?;

    let map_rows_cleared = execute(
        db,
        &format!("DELETE FROM {}", qualified(schema, ID_MAP_TABLE)),
        Vec::new(),
    )
    .await?;
    let checkpoints_cleared = checkpoint::clear(db, schema).await?;

    execute(db, "SET CONSTRAINTS ALL IMMEDIATE", Vec::new()).await?;

    let sequence_columns_kept: Vec<String> = MIGRATION_ORDER
        .iter()
        .map(|t| format!("{}.{}", t.name, SEQUENCE_COLUMN))
        .collect();
    info!(
        columns = ?sequence_columns_kept,
        "Keeping sequence columns so a later migration reproduces the same identifiers"
    );

    Ok(RollbackReport {
        dropped_constraints: records.len(),
        tables,
        uuid_type_restored,
        restore,
        map_rows_cleared,
        checkpoints_cleared,
        sequence_columns_kept,
        duration_ms: started.elapsed().as_millis(),
    })
}

/// Runs [`rollback`] in a transaction on the session
pub async fn rollback_identifiers(
    session: &Session,
    options: RollbackOptions,
) -> Result<RollbackReport, RepairError> {
    info!(
        restore_uuid_type = options.restore_uuid_type,
        "Starting identifier rollback"
    );
    let txn = begin(session.connection()).await?;
    let result = rollback(&txn, session.schema(), options).await;
    let outcome = finish(txn, result, Completion::Commit).await;
    match &outcome {
        Ok(_) => counter!("laundry_repair.rollback.succeeded", 1),
        Err(e) => {
            counter!("laundry_repair.rollback.failed", 1);
            warn!(error = %e, "Identifier rollback failed");
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use sea_orm::{DatabaseBackend, MockDatabase, Value};
    use std::collections::BTreeMap;

    fn count(n: i64) -> Vec<BTreeMap<&'static str, Value>> {
        vec![BTreeMap::from([("count", Value::BigInt(Some(n)))])]
    }

    #[tokio::test]
    async fn refuses_without_map_table() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([count(0)])
            .into_connection();

        assert_matches!(
            rollback(&conn, "public", RollbackOptions::default()).await,
            Err(RepairError::MissingIdentifierMap(msg)) if msg.contains("does not exist")
        );
    }

    #[tokio::test]
    async fn refuses_with_empty_map() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([count(1), count(0)])
            .into_connection();

        assert_matches!(
            rollback(&conn, "public", RollbackOptions::default()).await,
            Err(RepairError::MissingIdentifierMap(msg)) if msg.contains("is empty")
        );
    }
}
