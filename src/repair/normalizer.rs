//! Retypes key columns to `VARCHAR(255)` so they can hold formatted identifiers,
//! and back to `UUID` for rollback.

use crate::db::sql::{qualified, quote_ident};
use crate::db::{execute, fetch_count, fetch_one};
use crate::errors::RepairError;
use crate::repair::inspector::ForeignKeyConstraintRecord;
use crate::schema::{MIGRATION_ORDER, KEY_COLUMNS};
use sea_orm::{ConnectionTrait, FromQueryResult, Value};
use serde::Serialize;
use tracing::{info, warn};

pub const TARGET_LENGTH: i32 = 255;

const UUID_PATTERN: &str =
    "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$";

/// `table.column` pair to retype
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ColumnTarget {
    pub table: String,
    pub column: String,
}

impl ColumnTarget {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

impl std::fmt::Display for ColumnTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct ColumnType {
    pub data_type: String,
    pub character_maximum_length: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnAction {
    Retype,
    AlreadyNormalized,
    Missing,
}

/// Decides whether a column needs retyping to `VARCHAR(255)`
pub fn varchar_action(current: Option<&ColumnType>) -> ColumnAction {
    match current {
        None => ColumnAction::Missing,
        Some(ct) if ct.data_type == "text" => ColumnAction::AlreadyNormalized,
        Some(ct)
            if ct.data_type == "character varying"
                && ct
                    .character_maximum_length
                    .map_or(true, |len| len >= TARGET_LENGTH) =>
        {
            ColumnAction::AlreadyNormalized
        }
        Some(_) => ColumnAction::Retype,
    }
}

/// Key columns plus every recorded foreign key column pointing at a migrated primary key
pub fn columns_to_normalize(records: &[ForeignKeyConstraintRecord]) -> Vec<ColumnTarget> {
    let mut columns: Vec<ColumnTarget> = KEY_COLUMNS
        .iter()
        .map(|c| ColumnTarget::new(c.table, c.column))
        .collect();

    for record in records {
        let points_at_target = MIGRATION_ORDER
            .iter()
            .any(|t| record.references(t.name, "id"));
        let target = ColumnTarget::new(&record.owning_table, &record.column_name);
        if points_at_target && !columns.contains(&target) {
            columns.push(target);
        }
    }

    columns
}

pub fn to_varchar_statement(schema: &str, target: &ColumnTarget) -> String {
    let column = quote_ident(&target.column);
    format!(
        "ALTER TABLE {} ALTER COLUMN {} TYPE VARCHAR({}) USING {}::text",
        qualified(schema, &target.table),
        column,
        TARGET_LENGTH,
        column
    )
}

/// Statements retyping a column back to `UUID`; primary keys get their generated default back
pub fn to_uuid_statements(schema: &str, target: &ColumnTarget) -> Vec<String> {
    let table = qualified(schema, &target.table);
    let column = quote_ident(&target.column);
    let mut statements = vec![
        format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", table, column),
        format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE UUID USING {}::uuid",
            table, column, column
        ),
    ];
    if target.column == "id" {
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT gen_random_uuid()",
            table, column
        ));
    }
    statements
}

pub async fn column_type<C>(
    db: &C,
    schema: &str,
    target: &ColumnTarget,
) -> Result<Option<ColumnType>, RepairError>
where
    C: ConnectionTrait,
{
    let row = fetch_one(
        db,
        "SELECT data_type::text AS data_type, character_maximum_length::int4 AS character_maximum_length \
         FROM information_schema.columns \
         WHERE table_schema = $1 AND table_name = $2 AND column_name = $3",
        vec![
            Value::from(schema),
            Value::from(target.table.as_str()),
            Value::from(target.column.as_str()),
        ],
    )
    .await?;

    row.map(|r| ColumnType::from_query_result(&r, "").map_err(RepairError::from))
        .transpose()
}

/// Retyped columns and the ones left alone
#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeOutcome {
    pub retyped: Vec<String>,
    pub already_normalized: Vec<String>,
    pub missing: Vec<String>,
}

/// Retypes every column that is not already wide enough text
pub async fn normalize<C>(
    db: &C,
    schema: &str,
    columns: &[ColumnTarget],
) -> Result<NormalizeOutcome, RepairError>
where
    C: ConnectionTrait,
{
    let mut outcome = NormalizeOutcome::default();

    for target in columns {
        let current = column_type(db, schema, target).await?;
        match varchar_action(current.as_ref()) {
            ColumnAction::Missing => {
                warn!(table = %target.table, column = %target.column, "Column not found, skipping retype");
                outcome.missing.push(target.to_string());
            }
            ColumnAction::AlreadyNormalized => {
                info!(table = %target.table, column = %target.column, "Column already text, skipping");
                outcome.already_normalized.push(target.to_string());
            }
            ColumnAction::Retype => {
                execute(db, &to_varchar_statement(schema, target), Vec::new()).await?;
                info!(
                    table = %target.table,
                    column = %target.column,
                    from = current.as_ref().map(|c| c.data_type.as_str()).unwrap_or("unknown"),
                    "Retyped column to VARCHAR(255)"
                );
                outcome.retyped.push(target.to_string());
            }
        }
    }

    Ok(outcome)
}

/// Number of non-NULL values in the column that do not parse as a UUID
pub async fn non_uuid_values<C>(
    db: &C,
    schema: &str,
    target: &ColumnTarget,
) -> Result<i64, RepairError>
where
    C: ConnectionTrait,
{
    let column = quote_ident(&target.column);
    let sql = format!(
        "SELECT COUNT(*) AS count FROM {} WHERE {} IS NOT NULL AND {}::text !~ $1",
        qualified(schema, &target.table),
        column,
        column
    );
    fetch_count(db, &sql, vec![Value::from(UUID_PATTERN)]).await
}

/// Retypes the columns back to `UUID` when every value in every column parses.
///
/// Returns `false` and leaves all columns as text otherwise, since a foreign key
/// needs matching types on both ends.
pub async fn restore_uuid<C>(
    db: &C,
    schema: &str,
    columns: &[ColumnTarget],
) -> Result<bool, RepairError>
where
    C: ConnectionTrait,
{
    let mut present = Vec::new();
    for target in columns {
        match column_type(db, schema, target).await? {
            None => continue,
            Some(ct) if ct.data_type == "uuid" => continue,
            Some(_) => {}
        }
        let bad = non_uuid_values(db, schema, target).await?;
        if bad > 0 {
            warn!(
                table = %target.table,
                column = %target.column,
                rows = bad,
                "Values that are not UUIDs remain, keeping key columns as VARCHAR"
            );
            return Ok(false);
        }
        present.push(target);
    }

    for target in present {
        for sql in to_uuid_statements(schema, target) {
            execute(db, &sql, Vec::new()).await?;
        }
        info!(table = %target.table, column = %target.column, "Retyped column back to UUID");
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ct(data_type: &str, len: Option<i32>) -> ColumnType {
        ColumnType {
            data_type: data_type.into(),
            character_maximum_length: len,
        }
    }

    #[rstest]
    #[case(Some(ct("uuid", None)), ColumnAction::Retype)]
    #[case(Some(ct("character varying", Some(36))), ColumnAction::Retype)]
    #[case(Some(ct("character varying", Some(255))), ColumnAction::AlreadyNormalized)]
    #[case(Some(ct("character varying", Some(512))), ColumnAction::AlreadyNormalized)]
    #[case(Some(ct("character varying", None)), ColumnAction::AlreadyNormalized)]
    #[case(Some(ct("text", None)), ColumnAction::AlreadyNormalized)]
    #[case(None, ColumnAction::Missing)]
    fn decides_varchar_action(#[case] current: Option<ColumnType>, #[case] expected: ColumnAction) {
        assert_eq!(varchar_action(current.as_ref()), expected);
    }

    #[test]
    fn adds_discovered_columns_pointing_at_target_keys() {
        let records = vec![
            ForeignKeyConstraintRecord {
                constraint_name: "fk_invoices_customer".into(),
                owning_table: "invoices".into(),
                column_name: "customer_id".into(),
                referenced_table: "customers".into(),
                referenced_column: "id".into(),
                definition: None,
            },
            ForeignKeyConstraintRecord {
                constraint_name: "fk_order_items_service_id".into(),
                owning_table: "order_items".into(),
                column_name: "service_id".into(),
                referenced_table: "services".into(),
                referenced_column: "id".into(),
                definition: None,
            },
            ForeignKeyConstraintRecord {
                constraint_name: "fk_orders_customer_id".into(),
                owning_table: "orders".into(),
                column_name: "customer_id".into(),
                referenced_table: "customers".into(),
                referenced_column: "id".into(),
                definition: None,
            },
        ];

        let columns = columns_to_normalize(&records);
        assert_eq!(columns.len(), KEY_COLUMNS.len() + 1);
        assert_eq!(columns.last(), Some(&ColumnTarget::new("invoices", "customer_id")));
        assert!(!columns.contains(&ColumnTarget::new("order_items", "service_id")));
    }

    #[test]
    fn builds_retype_statements() {
        let target = ColumnTarget::new("orders", "customer_id");
        assert_eq!(
            to_varchar_statement("public", &target),
            "ALTER TABLE \"public\".\"orders\" ALTER COLUMN \"customer_id\" TYPE VARCHAR(255) USING \"customer_id\"::text"
        );

        let back = to_uuid_statements("public", &ColumnTarget::new("customers", "id"));
        assert_eq!(back.len(), 3);
        assert!(back[1].ends_with("TYPE UUID USING \"id\"::uuid"));
        assert!(back[2].contains("gen_random_uuid()"));
        assert_eq!(to_uuid_statements("public", &target).len(), 2);
    }
}
