//! Sequence assignment, identifier planning and the set-based rewrite of
//! primary keys and the foreign keys that point at them.

use crate::db::sql::{qualified, quote_ident, values_placeholders};
use crate::db::{execute, fetch_all, fetch_count};
use crate::errors::RepairError;
use crate::repair::inspector::ForeignKeyConstraintRecord;
use crate::repair::normalizer::ColumnTarget;
use crate::schema::{TargetTable, BASELINE_FOREIGN_KEYS, ID_MAP_TABLE, SEQUENCE_COLUMN};
use metrics::counter;
use rand::rngs::StdRng;
use rand::Rng;
use sea_orm::{ConnectionTrait, FromQueryResult, Value};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
pub struct IdentifierRow {
    pub id: String,
    pub id_sequence: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedId {
    pub old_id: String,
    pub new_id: String,
    /// Derived from a random number because the row had no sequence value
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewritePlan {
    pub table: String,
    pub entries: Vec<PlannedId>,
    pub already_formatted: usize,
    /// Old ids that were neither formatted nor UUIDs
    pub legacy_ids: usize,
}

impl RewritePlan {
    pub fn fallback_count(&self) -> usize {
        self.entries.iter().filter(|e| e.fallback).count()
    }
}

/// Which way the identifier map is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `old_id -> new_id`
    Forward,
    /// `new_id -> old_id`, used by rollback
    Reverse,
}

/// Plans the new identifier of every row not already in the target format.
///
/// Every planned id is checked against the ids already in the format and
/// against the rest of the plan; any duplicate rejects the whole plan.
pub fn plan<R>(
    table: TargetTable,
    rows: &[IdentifierRow],
    rng: &mut R,
) -> Result<RewritePlan, RepairError>
where
    R: Rng,
{
    let format = table.format;
    let taken: HashSet<&str> = rows
        .iter()
        .filter(|r| format.matches(&r.id))
        .map(|r| r.id.as_str())
        .collect();
    let already_formatted = taken.len();

    let mut planned: HashSet<String> = HashSet::new();
    let mut entries = Vec::new();
    let mut legacy_ids = 0;

    for row in rows.iter().filter(|r| !format.matches(&r.id)) {
        if Uuid::parse_str(&row.id).is_err() {
            legacy_ids += 1;
        }

        let (new_id, fallback) = match row.id_sequence {
            Some(sequence) => {
                let id = format
                    .format(sequence)
                    .ok_or_else(|| RepairError::SequenceOverflow {
                        table: table.name.to_string(),
                        value: sequence,
                        width: format.width,
                    })?;
                (id, false)
            }
            None => {
                let sequence = rng.gen_range(1..=format.max_sequence());
                warn!(
                    table = table.name,
                    old_id = %row.id,
                    sequence,
                    "Row has no sequence value, using a random identifier"
                );
                let id = format
                    .format(sequence)
                    .ok_or_else(|| RepairError::SequenceOverflow {
                        table: table.name.to_string(),
                        value: sequence,
                        width: format.width,
                    })?;
                (id, true)
            }
        };

        if taken.contains(new_id.as_str()) || !planned.insert(new_id.clone()) {
            return Err(RepairError::IdentifierCollision {
                table: table.name.to_string(),
                id: new_id,
            });
        }

        entries.push(PlannedId {
            old_id: row.id.clone(),
            new_id,
            fallback,
        });
    }

    Ok(RewritePlan {
        table: table.name.to_string(),
        entries,
        already_formatted,
        legacy_ids,
    })
}

pub fn add_sequence_column_sql(schema: &str, table: &str) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} BIGINT",
        qualified(schema, table),
        quote_ident(SEQUENCE_COLUMN)
    )
}

/// Formatted rows without a sequence take the number their id already encodes
pub fn sync_formatted_sequences_sql(schema: &str, table: TargetTable) -> String {
    let seq = quote_ident(SEQUENCE_COLUMN);
    format!(
        "UPDATE {t} SET {seq} = {value} WHERE {seq} IS NULL AND id::text ~ $1",
        t = qualified(schema, table.name),
        seq = seq,
        value = table.format.sequence_sql("id")
    )
}

/// Numbers rows without a sequence after the current maximum; existing values stay put
pub fn assign_sequences_sql(schema: &str, table: &str) -> String {
    let t = qualified(schema, table);
    let seq = quote_ident(SEQUENCE_COLUMN);
    format!(
        "WITH numbered AS (\
         SELECT id, ROW_NUMBER() OVER (ORDER BY created_at, id) AS rn \
         FROM {t} WHERE {seq} IS NULL) \
         UPDATE {t} AS target \
         SET {seq} = (SELECT COALESCE(MAX({seq}), 0) FROM {t}) + numbered.rn \
         FROM numbered WHERE target.id = numbered.id",
        t = t,
        seq = seq
    )
}

pub fn sequence_index_sql(schema: &str, table: &str) -> String {
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&format!("idx_{}_{}", table, SEQUENCE_COLUMN)),
        qualified(schema, table),
        quote_ident(SEQUENCE_COLUMN)
    )
}

pub fn select_rows_sql(schema: &str, table: &str) -> String {
    format!(
        "SELECT id::text AS id, {seq} AS id_sequence FROM {t} ORDER BY {seq} NULLS LAST, id",
        seq = quote_ident(SEQUENCE_COLUMN),
        t = qualified(schema, table)
    )
}

pub fn insert_map_sql(schema: &str, rows: usize) -> String {
    format!(
        "INSERT INTO {} (table_name, old_id, new_id) VALUES {} \
         ON CONFLICT (table_name, old_id) DO UPDATE SET new_id = EXCLUDED.new_id",
        qualified(schema, ID_MAP_TABLE),
        values_placeholders(rows, 3)
    )
}

/// One set-based update of `target` from the map rows recorded for `map_table`
pub fn apply_map_sql(schema: &str, target: &ColumnTarget, direction: Direction) -> String {
    let (from, to) = match direction {
        Direction::Forward => ("old_id", "new_id"),
        Direction::Reverse => ("new_id", "old_id"),
    };
    let column = quote_ident(&target.column);
    format!(
        "UPDATE {t} AS t SET {col} = m.{to} FROM {map} AS m \
         WHERE m.table_name = $1 AND t.{col}::text = m.{from}",
        t = qualified(schema, &target.table),
        col = column,
        to = to,
        map = qualified(schema, ID_MAP_TABLE),
        from = from
    )
}

pub fn unformatted_count_sql(schema: &str, table: &str) -> String {
    format!(
        "SELECT COUNT(*) AS count FROM {} WHERE id::text !~ $1",
        qualified(schema, table)
    )
}

/// Columns holding references to `table.id`: the baseline relations plus recorded constraints
pub fn dependent_columns(table: &str, records: &[ForeignKeyConstraintRecord]) -> Vec<ColumnTarget> {
    let mut columns: Vec<ColumnTarget> = BASELINE_FOREIGN_KEYS
        .iter()
        .filter(|fk| fk.referenced_table == table)
        .map(|fk| ColumnTarget::new(fk.table, fk.column))
        .collect();

    for record in records.iter().filter(|r| r.references(table, "id")) {
        let target = ColumnTarget::new(&record.owning_table, &record.column_name);
        if !columns.contains(&target) {
            columns.push(target);
        }
    }

    columns
}

/// Rows still carrying an identifier outside the table's format
pub async fn unformatted_count<C>(db: &C, schema: &str, table: TargetTable) -> Result<i64, RepairError>
where
    C: ConnectionTrait,
{
    fetch_count(
        db,
        &unformatted_count_sql(schema, table.name),
        vec![Value::from(table.format.sql_pattern())],
    )
    .await
}

/// Adds the sequence column if missing and numbers every row lacking a value.
///
/// Rows already carrying a formatted id keep the number in that id, so freshly
/// numbered rows continue after them instead of colliding.
pub async fn ensure_sequences<C>(db: &C, schema: &str, table: TargetTable) -> Result<u64, RepairError>
where
    C: ConnectionTrait,
{
    execute(db, &add_sequence_column_sql(schema, table.name), Vec::new()).await?;
    let recovered = execute(
        db,
        &sync_formatted_sequences_sql(schema, table),
        vec![Value::from(table.format.sql_pattern())],
    )
    .await?;
    let assigned = execute(db, &assign_sequences_sql(schema, table.name), Vec::new()).await?;
    execute(db, &sequence_index_sql(schema, table.name), Vec::new()).await?;
    if recovered > 0 {
        info!(table = table.name, rows = recovered, "Recovered sequence values from formatted ids");
    }
    if assigned > 0 {
        info!(table = table.name, rows = assigned, "Assigned sequence values");
    }
    Ok(recovered + assigned)
}

pub async fn load_rows<C>(db: &C, schema: &str, table: &str) -> Result<Vec<IdentifierRow>, RepairError>
where
    C: ConnectionTrait,
{
    fetch_all(db, &select_rows_sql(schema, table), Vec::new())
        .await?
        .iter()
        .map(|row| IdentifierRow::from_query_result(row, "").map_err(RepairError::from))
        .collect()
}

/// Persists the plan into the identifier map in batches of `batch_size`
pub async fn write_map<C>(
    db: &C,
    schema: &str,
    plan: &RewritePlan,
    batch_size: usize,
) -> Result<u64, RepairError>
where
    C: ConnectionTrait,
{
    let mut written = 0;
    for chunk in plan.entries.chunks(batch_size.max(1)) {
        let values: Vec<Value> = chunk
            .iter()
            .flat_map(|entry| {
                [
                    Value::from(plan.table.as_str()),
                    Value::from(entry.old_id.as_str()),
                    Value::from(entry.new_id.as_str()),
                ]
            })
            .collect();
        written += execute(db, &insert_map_sql(schema, chunk.len()), values).await?;
    }
    debug!(table = %plan.table, rows = written, "Identifier map written");
    Ok(written)
}

/// Applies the map recorded for `map_table` to one column
pub async fn apply_map<C>(
    db: &C,
    schema: &str,
    map_table: &str,
    target: &ColumnTarget,
    direction: Direction,
) -> Result<u64, RepairError>
where
    C: ConnectionTrait,
{
    execute(
        db,
        &apply_map_sql(schema, target, direction),
        vec![Value::from(map_table)],
    )
    .await
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependentRewrite {
    pub column: String,
    pub rows: u64,
}

/// Outcome of rewriting one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRewrite {
    pub table: String,
    pub sequences_assigned: u64,
    pub rewritten: u64,
    pub already_formatted: usize,
    pub fallback_ids: usize,
    pub legacy_ids: usize,
    pub dependents: Vec<DependentRewrite>,
}

/// Rewrites the primary key of `table` and every column that references it
pub async fn rewrite_table<C>(
    db: &C,
    schema: &str,
    table: TargetTable,
    records: &[ForeignKeyConstraintRecord],
    batch_size: usize,
    rng: &mut StdRng,
) -> Result<TableRewrite, RepairError>
where
    C: ConnectionTrait,
{
    info!(table = table.name, "Rewriting identifiers");

    let sequences_assigned = ensure_sequences(db, schema, table).await?;
    let rows = load_rows(db, schema, table.name).await?;
    let plan = plan(table, &rows, rng)?;

    if plan.legacy_ids > 0 {
        warn!(
            table = table.name,
            rows = plan.legacy_ids,
            "Identifiers that are neither UUIDs nor formatted will be rewritten"
        );
    }

    let mut report = TableRewrite {
        table: table.name.to_string(),
        sequences_assigned,
        rewritten: 0,
        already_formatted: plan.already_formatted,
        fallback_ids: plan.fallback_count(),
        legacy_ids: plan.legacy_ids,
        dependents: Vec::new(),
    };

    if plan.entries.is_empty() {
        info!(
            table = table.name,
            already_formatted = plan.already_formatted,
            "Every identifier already formatted"
        );
        return Ok(report);
    }

    write_map(db, schema, &plan, batch_size).await?;

    report.rewritten = apply_map(
        db,
        schema,
        table.name,
        &ColumnTarget::new(table.name, "id"),
        Direction::Forward,
    )
    .await?;

    if report.rewritten != plan.entries.len() as u64 {
        return Err(RepairError::RewriteMismatch {
            table: table.name.to_string(),
            planned: plan.entries.len() as u64,
            rewritten: report.rewritten,
        });
    }

    for dependent in dependent_columns(table.name, records) {
        let rows = apply_map(db, schema, table.name, &dependent, Direction::Forward).await?;
        info!(
            table = %dependent.table,
            column = %dependent.column,
            rows,
            "Rewrote dependent foreign key column"
        );
        report.dependents.push(DependentRewrite {
            column: dependent.to_string(),
            rows,
        });
    }

    counter!("laundry_repair.identifiers.rewritten", report.rewritten);
    info!(
        table = table.name,
        rows = report.rewritten,
        already_formatted = report.already_formatted,
        "Identifiers rewritten"
    );

    Ok(report)
}
