//! Foreign key discovery and idempotent removal around the key column retype.

use crate::db::sql::{placeholders, qualified, quote_ident};
use crate::db::{execute, fetch_all};
use crate::errors::RepairError;
use sea_orm::{ConnectionTrait, FromQueryResult, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A foreign key touching one of the target tables, captured before it is dropped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromQueryResult)]
pub struct ForeignKeyConstraintRecord {
    pub constraint_name: String,
    pub owning_table: String,
    pub column_name: String,
    pub referenced_table: String,
    pub referenced_column: String,
    /// Body as printed by `pg_get_constraintdef`
    pub definition: Option<String>,
}

impl ForeignKeyConstraintRecord {
    /// Captured definition, or a single-column one rebuilt from the record
    /// with the referenced table qualified by `schema`
    pub fn definition_or_synthesized(&self, schema: &str) -> String {
        match self.definition.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(def) => def.to_string(),
            None => format!(
                "FOREIGN KEY ({}) REFERENCES {}({})",
                quote_ident(&self.column_name),
                qualified(schema, &self.referenced_table),
                quote_ident(&self.referenced_column)
            ),
        }
    }

    pub fn references(&self, table: &str, column: &str) -> bool {
        self.referenced_table == table && self.referenced_column == column
    }
}

fn information_schema_sql(table_count: usize) -> String {
    let tables = placeholders(2, table_count);
    format!(
        "SELECT tc.constraint_name::text AS constraint_name, \
         tc.table_name::text AS owning_table, \
         kcu.column_name::text AS column_name, \
         ccu.table_name::text AS referenced_table, \
         ccu.column_name::text AS referenced_column, \
         NULL::text AS definition \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
         ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
         JOIN information_schema.constraint_column_usage ccu \
         ON ccu.constraint_name = tc.constraint_name AND ccu.constraint_schema = tc.table_schema \
         WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1 \
         AND (tc.table_name::text IN ({tables}) OR ccu.table_name::text IN ({tables}))",
        tables = tables
    )
}

fn pg_catalog_sql(table_count: usize) -> String {
    let tables = placeholders(2, table_count);
    format!(
        "SELECT con.conname::text AS constraint_name, \
         rel.relname::text AS owning_table, \
         att.attname::text AS column_name, \
         frel.relname::text AS referenced_table, \
         fatt.attname::text AS referenced_column, \
         pg_get_constraintdef(con.oid) AS definition \
         FROM pg_constraint con \
         JOIN pg_class rel ON rel.oid = con.conrelid \
         JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace \
         JOIN pg_class frel ON frel.oid = con.confrelid \
         JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = con.conkey[1] \
         JOIN pg_attribute fatt ON fatt.attrelid = con.confrelid AND fatt.attnum = con.confkey[1] \
         WHERE con.contype = 'f' AND nsp.nspname = $1 \
         AND (rel.relname::text IN ({tables}) OR frel.relname::text IN ({tables})) \
         ORDER BY rel.relname, con.conname",
        tables = tables
    )
}

fn discovery_values(schema: &str, tables: &[&str]) -> Vec<Value> {
    std::iter::once(Value::from(schema))
        .chain(tables.iter().map(|t| Value::from(*t)))
        .collect()
}

/// `ALTER TABLE .. DROP CONSTRAINT IF EXISTS ..`
pub fn drop_statement(schema: &str, record: &ForeignKeyConstraintRecord) -> String {
    format!(
        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
        qualified(schema, &record.owning_table),
        quote_ident(&record.constraint_name)
    )
}

/// Merges both discovery passes by `(owning_table, constraint_name)`.
///
/// The catalog pass supplies the definition; the result is ordered by owning
/// table, then constraint name.
pub fn merge(
    information_schema: Vec<ForeignKeyConstraintRecord>,
    catalog: Vec<ForeignKeyConstraintRecord>,
) -> Vec<ForeignKeyConstraintRecord> {
    let mut merged: BTreeMap<(String, String), ForeignKeyConstraintRecord> = BTreeMap::new();

    for record in information_schema {
        merged
            .entry((record.owning_table.clone(), record.constraint_name.clone()))
            .or_insert(record);
    }

    for record in catalog {
        let key = (record.owning_table.clone(), record.constraint_name.clone());
        match merged.get_mut(&key) {
            Some(existing) => {
                if record.definition.is_some() {
                    existing.definition = record.definition;
                }
            }
            None => {
                merged.insert(key, record);
            }
        }
    }

    merged.into_values().collect()
}

async fn run_pass<C>(
    db: &C,
    sql: &str,
    values: Vec<Value>,
) -> Result<Vec<ForeignKeyConstraintRecord>, RepairError>
where
    C: ConnectionTrait,
{
    fetch_all(db, sql, values)
        .await?
        .iter()
        .map(|row| ForeignKeyConstraintRecord::from_query_result(row, "").map_err(RepairError::from))
        .collect()
}

/// Enumerates every foreign key owned by or pointing at one of `tables`.
///
/// Either pass failing aborts discovery.
pub async fn discover<C>(
    db: &C,
    schema: &str,
    tables: &[&str],
) -> Result<Vec<ForeignKeyConstraintRecord>, RepairError>
where
    C: ConnectionTrait,
{
    let values = discovery_values(schema, tables);
    let first = run_pass(db, &information_schema_sql(tables.len()), values.clone()).await?;
    let second = run_pass(db, &pg_catalog_sql(tables.len()), values).await?;

    debug!(
        information_schema = first.len(),
        pg_catalog = second.len(),
        "Foreign key discovery passes finished"
    );

    let records = merge(first, second);
    info!(count = records.len(), "Discovered foreign key constraints");
    Ok(records)
}

/// Like [`discover`], but a failing pass is logged and the other pass is used alone
pub async fn list<C>(
    db: &C,
    schema: &str,
    tables: &[&str],
) -> Result<Vec<ForeignKeyConstraintRecord>, RepairError>
where
    C: ConnectionTrait,
{
    let values = discovery_values(schema, tables);

    let first = run_pass(db, &information_schema_sql(tables.len()), values.clone())
        .await
        .map_err(|e| warn!(error = %e, "information_schema discovery failed"))
        .ok();
    let second = run_pass(db, &pg_catalog_sql(tables.len()), values)
        .await
        .map_err(|e| warn!(error = %e, "pg_catalog discovery failed"))
        .ok();

    match (first, second) {
        (None, None) => Err(RepairError::Other(anyhow::anyhow!(
            "both foreign key discovery passes failed"
        ))),
        (first, second) => Ok(merge(
            first.unwrap_or_default(),
            second.unwrap_or_default(),
        )),
    }
}

/// Drops every recorded constraint; an already-absent constraint is a no-op
pub async fn drop_all<C>(
    db: &C,
    schema: &str,
    records: &[ForeignKeyConstraintRecord],
) -> Result<usize, RepairError>
where
    C: ConnectionTrait,
{
    for record in records {
        execute(db, &drop_statement(schema, record), Vec::new()).await?;
        info!(
            table = %record.owning_table,
            constraint = %record.constraint_name,
            "Dropped foreign key"
        );
    }
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, Transaction};
    use std::collections::BTreeMap;

    const TABLES: [&str; 4] = ["customers", "orders", "payments", "order_items"];

    fn row(
        name: &str,
        owner: &str,
        column: &str,
        referenced: &str,
        definition: Option<&str>,
    ) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([
            ("constraint_name", Value::from(name)),
            ("owning_table", Value::from(owner)),
            ("column_name", Value::from(column)),
            ("referenced_table", Value::from(referenced)),
            ("referenced_column", Value::from("id")),
            (
                "definition",
                Value::String(definition.map(|d| Box::new(d.to_string()))),
            ),
        ])
    }

    fn record(name: &str, owner: &str, column: &str, referenced: &str) -> ForeignKeyConstraintRecord {
        ForeignKeyConstraintRecord {
            constraint_name: name.into(),
            owning_table: owner.into(),
            column_name: column.into(),
            referenced_table: referenced.into(),
            referenced_column: "id".into(),
            definition: None,
        }
    }

    #[test]
    fn merge_prefers_catalog_definition_and_sorts() {
        let first = vec![
            record("fk_payments_order_id", "payments", "order_id", "orders"),
            record("fk_orders_customer_id", "orders", "customer_id", "customers"),
        ];
        let mut with_def = record("fk_orders_customer_id", "orders", "customer_id", "customers");
        with_def.definition = Some("FOREIGN KEY (customer_id) REFERENCES customers(id)".into());
        let second = vec![
            with_def,
            record("fk_order_items_order_id", "order_items", "order_id", "orders"),
        ];

        let merged = merge(first, second);
        let names: Vec<_> = merged.iter().map(|r| r.constraint_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "fk_order_items_order_id",
                "fk_orders_customer_id",
                "fk_payments_order_id"
            ]
        );
        assert_eq!(
            merged[1].definition.as_deref(),
            Some("FOREIGN KEY (customer_id) REFERENCES customers(id)")
        );
        assert_eq!(merged[2].definition, None);
    }

    #[test]
    fn synthesizes_missing_definition() {
        let r = record("fk_payments_order_id", "payments", "order_id", "orders");
        assert_eq!(
            r.definition_or_synthesized("laundry"),
            "FOREIGN KEY (\"order_id\") REFERENCES \"laundry\".\"orders\"(\"id\")"
        );
    }

    #[test]
    fn drop_uses_if_exists() {
        let r = record("fk_orders_customer_id", "orders", "customer_id", "customers");
        assert_eq!(
            drop_statement("public", &r),
            "ALTER TABLE \"public\".\"orders\" DROP CONSTRAINT IF EXISTS \"fk_orders_customer_id\""
        );
    }

    #[tokio::test]
    async fn discovers_then_drops_every_constraint() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([
                vec![
                    row("fk_orders_customer_id", "orders", "customer_id", "customers", None),
                    row("fk_payments_order_id", "payments", "order_id", "orders", None),
                ],
                vec![
                    row(
                        "fk_orders_customer_id",
                        "orders",
                        "customer_id",
                        "customers",
                        Some("FOREIGN KEY (customer_id) REFERENCES customers(id)"),
                    ),
                    row(
                        "fk_order_items_order_id",
                        "order_items",
                        "order_id",
                        "orders",
                        Some("FOREIGN KEY (order_id) REFERENCES orders(id) ON DELETE CASCADE"),
                    ),
                ],
            ])
            .append_exec_results([
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                },
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                },
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                },
            ])
            .into_connection();

        let records = discover(&conn, "public", &TABLES).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(drop_all(&conn, "public", &records).await.unwrap(), 3);

        let values = discovery_values("public", &TABLES);
        let mut expected = vec![
            Transaction::from_sql_and_values(
                DatabaseBackend::Postgres,
                &information_schema_sql(4),
                values.clone(),
            ),
            Transaction::from_sql_and_values(
                DatabaseBackend::Postgres,
                &pg_catalog_sql(4),
                values,
            ),
        ];
        expected.extend(records.iter().map(|r| {
            Transaction::from_sql_and_values(
                DatabaseBackend::Postgres,
                &drop_statement("public", r),
                [],
            )
        }));

        assert_eq!(conn.into_transaction_log(), expected);
    }

    #[tokio::test]
    async fn discovery_failure_propagates() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_errors([sea_orm::DbErr::Custom("permission denied".into())])
            .into_connection();

        let err = discover(&conn, "public", &TABLES).await.unwrap_err();
        assert!(matches!(err, RepairError::DatabaseError(_)));
    }
}
