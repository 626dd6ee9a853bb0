//! Null/Default Backfill Pass.
//!
//! Runs outside any transaction: a failing statement on one column must not
//! poison the rest of the pass, so every column is fixed and verified on its own.

pub mod strategies;

use crate::config::AppConfig;
use crate::db::{execute, fetch_all, fetch_count, fetch_one};
use crate::errors::RepairError;
use crate::report::Summary;
use crate::schema::METADATA_TABLES;
use chrono::Utc;
use metrics::counter;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sea_orm::{ConnectionTrait, FromQueryResult, Value};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use strategies::{FillStrategy, DEFAULT_CATEGORY_NAME};
use strum::Display;
use tracing::{debug, info, warn};

const CODE_BATCH: usize = 500;

/// Stages of the pass; `Report` is always reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillState {
    Scan,
    FixKnown,
    SkipUnknown,
    Verify,
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingAction {
    /// No NULLs found
    Clean,
    Fixed,
    /// NULLs in a column without a fill strategy
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnFinding {
    pub table: String,
    pub column: String,
    pub nullable: bool,
    pub strategy: Option<FillStrategy>,
    pub nulls_before: Option<i64>,
    pub action: FindingAction,
    pub rows_fixed: u64,
    pub nulls_after: Option<i64>,
    pub default_set: bool,
    pub not_null_enforced: bool,
    pub error: Option<String>,
}

impl ColumnFinding {
    fn label(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }

    fn has_nulls(&self) -> bool {
        self.nulls_before.unwrap_or(0) > 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub states: Vec<BackfillState>,
    pub columns: Vec<ColumnFinding>,
    pub rows_fixed: u64,
    pub remaining_violations: Vec<String>,
    pub scan_error: Option<String>,
    pub duration_ms: u128,
}

impl BackfillReport {
    /// Columns that had NULLs when the pass started
    pub fn findings(&self) -> impl Iterator<Item = &ColumnFinding> {
        self.columns.iter().filter(|c| c.has_nulls())
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnFinding> {
        self.columns
            .iter()
            .find(|c| c.table == table && c.column == column)
    }
}

impl Summary for BackfillReport {
    fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "NULL backfill: {} columns scanned, {} rows fixed",
            self.columns.len(),
            self.rows_fixed
        )];
        if let Some(err) = &self.scan_error {
            lines.push(format!("Scan failed: {}", err));
        }
        for f in self.findings() {
            lines.push(format!(
                "  {}: {} NULL -> {} ({:?}, {} rows fixed{})",
                f.label(),
                f.nulls_before.unwrap_or(0),
                f.nulls_after
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                f.action,
                f.rows_fixed,
                f.error
                    .as_deref()
                    .map(|e| format!(", error: {}", e))
                    .unwrap_or_default()
            ));
        }
        for f in self.columns.iter().filter(|c| c.default_set || c.not_null_enforced) {
            if f.default_set {
                lines.push(format!("  {}: default set to '{{}}'", f.label()));
            }
            if f.not_null_enforced {
                lines.push(format!("  {}: NOT NULL enforced", f.label()));
            }
        }
        if self.remaining_violations.is_empty() {
            lines.push("Remaining violations: none".to_string());
        } else {
            lines.push(format!(
                "Remaining violations: {}",
                self.remaining_violations.join(", ")
            ));
        }
        lines
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillOptions {
    /// Re-apply `SET NOT NULL` on known columns left without NULLs
    pub enforce_not_null: bool,
    pub excluded_tables: Vec<String>,
}

impl BackfillOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            enforce_not_null: cfg.enforce_not_null,
            excluded_tables: cfg.excluded_tables(),
        }
    }

    fn is_excluded(&self, table: &str) -> bool {
        METADATA_TABLES.contains(&table) || self.excluded_tables.iter().any(|t| t == table)
    }
}

#[derive(Debug, Clone, FromQueryResult)]
struct ScannedColumn {
    table_name: String,
    column_name: String,
    is_nullable: String,
}

const LIST_COLUMNS_SQL: &str = "SELECT c.table_name::text AS table_name, \
     c.column_name::text AS column_name, \
     c.is_nullable::text AS is_nullable \
     FROM information_schema.columns c \
     JOIN information_schema.tables t \
     ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
     WHERE c.table_schema = $1 AND t.table_type = 'BASE TABLE' \
     ORDER BY c.table_name, c.ordinal_position";

const COLUMN_DEFAULT_SQL: &str = "SELECT column_default::text AS column_default \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2 AND column_name = $3";

/// SCAN -> FIX_KNOWN -> SKIP_UNKNOWN -> VERIFY -> REPORT over one connection
pub struct NullBackfill<'a, C> {
    db: &'a C,
    schema: &'a str,
    options: BackfillOptions,
}

impl<'a, C> NullBackfill<'a, C>
where
    C: ConnectionTrait,
{
    pub fn new(db: &'a C, schema: &'a str, options: BackfillOptions) -> Self {
        Self { db, schema, options }
    }

    /// Walks every state; per-column failures are recorded, never returned
    pub async fn run(&self) -> BackfillReport {
        let started = Instant::now();
        let mut report = BackfillReport::default();
        let mut state = BackfillState::Scan;

        loop {
            report.states.push(state);
            debug!(state = %state, "Backfill state");
            state = match state {
                BackfillState::Scan => {
                    match self.scan().await {
                        Ok(columns) => report.columns = columns,
                        Err(e) => {
                            warn!(error = %e, "Column scan failed");
                            report.scan_error = Some(e.to_string());
                        }
                    }
                    BackfillState::FixKnown
                }
                BackfillState::FixKnown => {
                    self.fix_known(&mut report.columns).await;
                    BackfillState::SkipUnknown
                }
                BackfillState::SkipUnknown => {
                    for finding in report
                        .columns
                        .iter_mut()
                        .filter(|f| f.strategy.is_none() && f.has_nulls())
                    {
                        warn!(
                            table = %finding.table,
                            column = %finding.column,
                            rows = finding.nulls_before.unwrap_or(0),
                            "NULLs in column without a fill strategy, reporting only"
                        );
                        finding.action = FindingAction::Skipped;
                    }
                    BackfillState::Verify
                }
                BackfillState::Verify => {
                    self.verify(&mut report.columns).await;
                    BackfillState::Report
                }
                BackfillState::Report => break,
            };
        }

        report.rows_fixed = report.columns.iter().map(|c| c.rows_fixed).sum();
        report.remaining_violations = report
            .columns
            .iter()
            .filter(|c| c.nulls_after.unwrap_or(0) > 0)
            .map(|c| c.label())
            .collect();
        report.duration_ms = started.elapsed().as_millis();

        counter!("laundry_repair.backfill.rows_fixed", report.rows_fixed);
        if report.remaining_violations.is_empty() {
            info!(rows = report.rows_fixed, "NULL backfill finished cleanly");
        } else {
            warn!(
                rows = report.rows_fixed,
                remaining = ?report.remaining_violations,
                "NULL backfill finished with remaining violations"
            );
        }

        report
    }

    async fn scan(&self) -> Result<Vec<ColumnFinding>, RepairError> {
        let rows = fetch_all(self.db, LIST_COLUMNS_SQL, vec![Value::from(self.schema)]).await?;

        let mut findings = Vec::new();
        for row in rows {
            let col = ScannedColumn::from_query_result(&row, "")?;
            if self.options.is_excluded(&col.table_name) {
                continue;
            }

            let strategy = strategies::strategy_for(&col.table_name, &col.column_name);
            let nullable = col.is_nullable.eq_ignore_ascii_case("YES");
            if nullable && strategy.is_none() {
                continue;
            }

            let mut finding = ColumnFinding {
                table: col.table_name,
                column: col.column_name,
                nullable,
                strategy,
                nulls_before: None,
                action: FindingAction::Clean,
                rows_fixed: 0,
                nulls_after: None,
                default_set: false,
                not_null_enforced: false,
                error: None,
            };

            match self.count_nulls(&finding.table, &finding.column).await {
                Ok(n) => finding.nulls_before = Some(n),
                Err(e) => {
                    warn!(table = %finding.table, column = %finding.column, error = %e, "NULL count failed");
                    finding.action = FindingAction::Failed;
                    finding.error = Some(e.to_string());
                }
            }
            findings.push(finding);
        }

        findings.sort_by_key(|f| strategies::fix_order(&f.table, &f.column));
        info!(
            columns = findings.len(),
            with_nulls = findings.iter().filter(|f| f.has_nulls()).count(),
            "Scan finished"
        );
        Ok(findings)
    }

    async fn count_nulls(&self, table: &str, column: &str) -> Result<i64, RepairError> {
        fetch_count(
            self.db,
            &strategies::null_count_sql(self.schema, table, column),
            Vec::new(),
        )
        .await
    }

    async fn fix_known(&self, findings: &mut [ColumnFinding]) {
        for finding in findings.iter_mut() {
            let Some(strategy) = finding.strategy else {
                continue;
            };
            if finding.action == FindingAction::Failed {
                continue;
            }

            if strategy == FillStrategy::EmptyJsonObject {
                match self.ensure_json_default(&finding.table, &finding.column).await {
                    Ok(changed) => finding.default_set = changed,
                    Err(e) => {
                        warn!(table = %finding.table, column = %finding.column, error = %e, "Setting column default failed");
                        finding.error = Some(e.to_string());
                    }
                }
            }

            if !finding.has_nulls() {
                continue;
            }

            match self.apply(strategy, &finding.table, &finding.column).await {
                Ok(rows) => {
                    info!(table = %finding.table, column = %finding.column, rows, "Filled NULLs");
                    finding.rows_fixed = rows;
                    finding.action = FindingAction::Fixed;
                }
                Err(e) => {
                    warn!(table = %finding.table, column = %finding.column, error = %e, "Fill failed");
                    finding.action = FindingAction::Failed;
                    finding.error = Some(e.to_string());
                }
            }
        }
    }

    async fn apply(
        &self,
        strategy: FillStrategy,
        table: &str,
        column: &str,
    ) -> Result<u64, RepairError> {
        let schema = self.schema;
        match strategy {
            FillStrategy::Literal { sql } => {
                execute(
                    self.db,
                    &strategies::literal_fill_sql(schema, table, column, sql),
                    Vec::new(),
                )
                .await
            }
            FillStrategy::EmptyJsonObject => {
                execute(
                    self.db,
                    &strategies::literal_fill_sql(schema, table, column, "'{}'"),
                    Vec::new(),
                )
                .await
            }
            FillStrategy::ServicePrice => {
                execute(self.db, &strategies::service_price_sql(schema), Vec::new()).await
            }
            FillStrategy::PriceTimesQuantity => {
                execute(self.db, &strategies::subtotal_sql(schema), Vec::new()).await
            }
            FillStrategy::FirstCategory => self.assign_first_category().await,
            FillStrategy::UniqueCode { prefix } => self.assign_codes(prefix, table, column).await,
        }
    }

    /// Returns whether the default had to be changed
    async fn ensure_json_default(&self, table: &str, column: &str) -> Result<bool, RepairError> {
        let current = match fetch_one(
            self.db,
            COLUMN_DEFAULT_SQL,
            vec![
                Value::from(self.schema),
                Value::from(table),
                Value::from(column),
            ],
        )
        .await?
        {
            Some(row) => row.try_get::<Option<String>>("", "column_default")?,
            None => None,
        };

        if current.as_deref().map_or(false, |d| d.starts_with("'{}'")) {
            return Ok(false);
        }

        execute(
            self.db,
            &strategies::json_default_sql(self.schema, table, column),
            Vec::new(),
        )
        .await?;
        info!(table, column, "Set column default to '{{}}'");
        Ok(true)
    }

    async fn assign_first_category(&self) -> Result<u64, RepairError> {
        let existing = fetch_one(self.db, &strategies::first_category_sql(self.schema), Vec::new()).await?;
        let category_id: String = match existing {
            Some(row) => row.try_get("", "id")?,
            None => {
                let created = fetch_one(
                    self.db,
                    &strategies::create_category_sql(self.schema),
                    vec![
                        Value::from(DEFAULT_CATEGORY_NAME),
                        Value::from("Created by the NULL backfill for uncategorized services"),
                    ],
                )
                .await?
                .ok_or_else(|| {
                    RepairError::Other(anyhow::anyhow!("category insert returned no row"))
                })?;
                let id: String = created.try_get("", "id")?;
                info!(category_id = %id, name = DEFAULT_CATEGORY_NAME, "Created default service category");
                id
            }
        };

        execute(
            self.db,
            &strategies::assign_category_sql(self.schema),
            vec![Value::from(category_id)],
        )
        .await
    }

    async fn assign_codes(
        &self,
        prefix: &str,
        table: &str,
        column: &str,
    ) -> Result<u64, RepairError> {
        let today = Utc::now().date_naive();
        let day_pattern = format!("{}-{}-%", prefix, today.format("%Y%m%d"));

        let mut taken: HashSet<String> = HashSet::new();
        for row in fetch_all(
            self.db,
            &strategies::codes_for_day_sql(self.schema, table, column),
            vec![Value::from(day_pattern)],
        )
        .await?
        {
            taken.insert(row.try_get("", "code")?);
        }

        let mut ids = Vec::new();
        for row in fetch_all(
            self.db,
            &strategies::null_ids_sql(self.schema, table, column),
            Vec::new(),
        )
        .await?
        {
            ids.push(row.try_get::<String>("", "id")?);
        }

        let mut rng = StdRng::from_entropy();
        let mut assigned = 0;
        for chunk in ids.chunks(CODE_BATCH) {
            let mut values = Vec::with_capacity(chunk.len() * 2);
            for id in chunk {
                let code = strategies::unique_code(prefix, today, &mut taken, &mut rng)
                    .ok_or_else(|| {
                        RepairError::Other(anyhow::anyhow!(
                            "no free {} code left for {}",
                            prefix,
                            today
                        ))
                    })?;
                values.push(Value::from(id.as_str()));
                values.push(Value::from(code));
            }
            assigned += execute(
                self.db,
                &strategies::assign_codes_sql(self.schema, table, column, chunk.len()),
                values,
            )
            .await?;
        }

        Ok(assigned)
    }

    async fn verify(&self, findings: &mut [ColumnFinding]) {
        for finding in findings.iter_mut() {
            match self.count_nulls(&finding.table, &finding.column).await {
                Ok(n) => finding.nulls_after = Some(n),
                Err(e) => {
                    warn!(table = %finding.table, column = %finding.column, error = %e, "NULL recount failed");
                    if finding.error.is_none() {
                        finding.error = Some(e.to_string());
                    }
                    continue;
                }
            }

            let enforce = self.options.enforce_not_null
                && finding.strategy.is_some()
                && finding.nullable
                && finding.nulls_after == Some(0);
            if !enforce {
                continue;
            }

            match execute(
                self.db,
                &strategies::set_not_null_sql(self.schema, &finding.table, &finding.column),
                Vec::new(),
            )
            .await
            {
                Ok(_) => {
                    info!(table = %finding.table, column = %finding.column, "NOT NULL enforced");
                    finding.not_null_enforced = true;
                }
                Err(e) => {
                    warn!(table = %finding.table, column = %finding.column, error = %e, "Could not enforce NOT NULL");
                    finding.error = Some(e.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};
    use std::collections::BTreeMap;

    fn column(table: &str, column: &str, nullable: &str) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([
            ("table_name", Value::from(table)),
            ("column_name", Value::from(column)),
            ("is_nullable", Value::from(nullable)),
        ])
    }

    fn count(n: i64) -> Vec<BTreeMap<&'static str, Value>> {
        vec![BTreeMap::from([("count", Value::BigInt(Some(n)))])]
    }

    #[test]
    fn metadata_and_configured_tables_are_excluded() {
        let options = BackfillOptions {
            enforce_not_null: false,
            excluded_tables: vec!["audit_log".into()],
        };
        assert!(options.is_excluded("seaql_migrations"));
        assert!(options.is_excluded("schema_repair_id_map"));
        assert!(options.is_excluded("audit_log"));
        assert!(!options.is_excluded("customers"));
    }

    #[test]
    fn states_print_in_upper_case() {
        assert_eq!(BackfillState::FixKnown.to_string(), "FIX_KNOWN");
    }

    #[tokio::test]
    async fn fixes_known_and_reports_unknown() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([
                vec![
                    column("customers", "name", "YES"),
                    column("customers", "email", "YES"),
                    column("invoices", "total", "YES"),
                    column("invoices", "code", "NO"),
                    column("seaql_migrations", "version", "NO"),
                ],
                // scan: customers.name, invoices.code
                count(2),
                count(3),
                // verify
                count(0),
                count(3),
            ])
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 2,
            }])
            .into_connection();

        let backfill = NullBackfill::new(&conn, "public", BackfillOptions::default());
        let report = backfill.run().await;

        assert_eq!(
            report.states,
            vec![
                BackfillState::Scan,
                BackfillState::FixKnown,
                BackfillState::SkipUnknown,
                BackfillState::Verify,
                BackfillState::Report
            ]
        );
        assert_eq!(report.columns.len(), 2);
        assert_eq!(report.rows_fixed, 2);

        let name = report.column("customers", "name").unwrap();
        assert_eq!(name.action, FindingAction::Fixed);
        assert_eq!(name.nulls_after, Some(0));

        let code = report.column("invoices", "code").unwrap();
        assert_eq!(code.action, FindingAction::Skipped);
        assert_eq!(report.remaining_violations, vec!["invoices.code"]);
    }

    #[tokio::test]
    async fn scan_failure_still_reaches_report() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_errors([sea_orm::DbErr::Custom("no access".into())])
            .into_connection();

        let report = NullBackfill::new(&conn, "public", BackfillOptions::default())
            .run()
            .await;
        assert!(report.scan_error.is_some());
        assert_eq!(report.states.last(), Some(&BackfillState::Report));
        assert!(report.columns.is_empty());
    }
}
