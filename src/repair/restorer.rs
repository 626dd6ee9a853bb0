//! Re-creates dropped foreign keys from their captured definitions and makes
//! sure the baseline relations exist afterwards.

use crate::db::sql::{qualified, quote_ident};
use crate::db::{execute, fetch_count};
use crate::errors::RepairError;
use crate::repair::inspector::{self, ForeignKeyConstraintRecord};
use crate::schema::{ForeignKeySpec, BASELINE_FOREIGN_KEYS, TARGET_TABLES};
use sea_orm::{ConnectionTrait, Value};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub restored: Vec<String>,
    pub already_present: Vec<String>,
    pub baseline_created: Vec<String>,
}

pub const CONSTRAINT_EXISTS_SQL: &str = "SELECT COUNT(*) AS count FROM pg_constraint con \
     JOIN pg_class rel ON rel.oid = con.conrelid \
     JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace \
     WHERE nsp.nspname = $1 AND rel.relname = $2 AND con.conname = $3";

pub fn add_constraint_sql(schema: &str, table: &str, name: &str, definition: &str) -> String {
    format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {}",
        qualified(schema, table),
        quote_ident(name),
        definition
    )
}

fn exists_values(schema: &str, table: &str, name: &str) -> Vec<Value> {
    vec![Value::from(schema), Value::from(table), Value::from(name)]
}

/// Whether an existing foreign key already covers the baseline relation
pub fn has_equivalent(existing: &[ForeignKeyConstraintRecord], spec: &ForeignKeySpec) -> bool {
    existing.iter().any(|r| {
        r.owning_table == spec.table
            && r.column_name == spec.column
            && r.referenced_table == spec.referenced_table
    })
}

/// Restores every recorded constraint, then adds any missing baseline foreign key
pub async fn restore<C>(
    db: &C,
    schema: &str,
    records: &[ForeignKeyConstraintRecord],
) -> Result<RestoreOutcome, RepairError>
where
    C: ConnectionTrait,
{
    let mut outcome = RestoreOutcome::default();

    for record in records {
        let label = format!("{}.{}", record.owning_table, record.constraint_name);
        let present = fetch_count(
            db,
            CONSTRAINT_EXISTS_SQL,
            exists_values(schema, &record.owning_table, &record.constraint_name),
        )
        .await?
            > 0;

        if present {
            outcome.already_present.push(label);
            continue;
        }

        execute(
            db,
            &add_constraint_sql(
                schema,
                &record.owning_table,
                &record.constraint_name,
                &record.definition_or_synthesized(schema),
            ),
            Vec::new(),
        )
        .await?;
        info!(
            table = %record.owning_table,
            constraint = %record.constraint_name,
            "Restored foreign key"
        );
        outcome.restored.push(label);
    }

    let existing = inspector::discover(db, schema, &TARGET_TABLES).await?;
    for spec in BASELINE_FOREIGN_KEYS.iter() {
        if has_equivalent(&existing, spec) {
            continue;
        }
        execute(
            db,
            &add_constraint_sql(schema, spec.table, spec.name, &spec.definition(schema)),
            Vec::new(),
        )
        .await?;
        info!(
            table = spec.table,
            constraint = spec.name,
            "Created baseline foreign key"
        );
        outcome
            .baseline_created
            .push(format!("{}.{}", spec.table, spec.name));
    }

    Ok(outcome)
}
