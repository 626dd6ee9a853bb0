//! Post-migration checks run inside the migration transaction.

use crate::db::sql::{qualified, quote_ident};
use crate::db::{fetch_count, fetch_one};
use crate::errors::RepairError;
use crate::schema::{ForeignKeySpec, TargetTable, BASELINE_FOREIGN_KEYS, MIGRATION_ORDER};
use sea_orm::{ConnectionTrait, Value};
use serde::Serialize;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub checks: Vec<Check>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> Vec<&Check> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }
}

pub fn duplicate_id_sql(schema: &str, table: &str) -> String {
    format!(
        "SELECT id::text AS id FROM {} GROUP BY id HAVING COUNT(*) > 1 ORDER BY id LIMIT 1",
        qualified(schema, table)
    )
}

pub fn malformed_id_sql(schema: &str, table: &str) -> String {
    format!(
        "SELECT COUNT(*) AS count FROM {} WHERE id::text !~ $1",
        qualified(schema, table)
    )
}

pub fn dangling_reference_sql(schema: &str, fk: &ForeignKeySpec) -> String {
    let col = quote_ident(fk.column);
    format!(
        "SELECT COUNT(*) AS count FROM {child} AS c WHERE c.{col} IS NOT NULL \
         AND NOT EXISTS (SELECT 1 FROM {parent} AS p WHERE p.{pk} = c.{col})",
        child = qualified(schema, fk.table),
        col = col,
        parent = qualified(schema, fk.referenced_table),
        pk = quote_ident(fk.referenced_column)
    )
}

async fn check_format<C>(db: &C, schema: &str, table: TargetTable) -> Result<Check, RepairError>
where
    C: ConnectionTrait,
{
    let malformed = fetch_count(
        db,
        &malformed_id_sql(schema, table.name),
        vec![Value::from(table.format.sql_pattern())],
    )
    .await?;
    Ok(Check {
        name: format!("{}.id format", table.name),
        passed: malformed == 0,
        detail: format!(
            "{} ids not matching {}",
            malformed,
            table.format.sql_pattern()
        ),
    })
}

async fn check_references<C>(db: &C, schema: &str, fk: &ForeignKeySpec) -> Result<Check, RepairError>
where
    C: ConnectionTrait,
{
    let dangling = fetch_count(db, &dangling_reference_sql(schema, fk), Vec::new()).await?;
    Ok(Check {
        name: format!("{}.{} references {}", fk.table, fk.column, fk.referenced_table),
        passed: dangling == 0,
        detail: format!("{} dangling references", dangling),
    })
}

/// Uniqueness, format and referential integrity of the migrated tables.
///
/// A duplicate id fails with [`RepairError::IdentifierCollision`]; any other
/// failed check fails with [`RepairError::VerificationError`].
pub async fn verify<C>(db: &C, schema: &str) -> Result<VerificationReport, RepairError>
where
    C: ConnectionTrait,
{
    let mut report = VerificationReport::default();

    for table in MIGRATION_ORDER {
        if let Some(row) = fetch_one(db, &duplicate_id_sql(schema, table.name), Vec::new()).await? {
            let id: String = row.try_get("", "id")?;
            error!(table = table.name, id = %id, "Duplicate identifier after migration");
            return Err(RepairError::IdentifierCollision {
                table: table.name.to_string(),
                id,
            });
        }
        report.checks.push(Check {
            name: format!("{}.id unique", table.name),
            passed: true,
            detail: "COUNT(*) = COUNT(DISTINCT id)".to_string(),
        });
        report.checks.push(check_format(db, schema, table).await?);
    }

    for fk in BASELINE_FOREIGN_KEYS.iter() {
        report.checks.push(check_references(db, schema, fk).await?);
    }

    let failures = report.failures();
    if !failures.is_empty() {
        let summary = failures
            .iter()
            .map(|c| format!("{}: {}", c.name, c.detail))
            .collect::<Vec<_>>()
            .join("; ");
        error!(failures = failures.len(), "Verification failed");
        return Err(RepairError::VerificationError(summary));
    }

    info!(checks = report.checks.len(), "Verification passed");
    Ok(report)
}
