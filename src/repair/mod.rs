//! The identifier migration: constraint inspect/drop, column retype,
//! identifier rewrite and constraint restore, run as one transaction.

pub mod checkpoint;
pub mod identifiers;
pub mod inspector;
pub mod normalizer;
pub mod orphans;
pub mod restorer;
pub mod rollback;
pub mod verify;

use crate::config::AppConfig;
use crate::db::sql::qualified;
use crate::db::{begin, execute, fetch_count, finish, Completion, Session};
use crate::errors::RepairError;
use crate::report::{InspectionReport, MigrationReport, MigrationStatus, PendingTable};
use crate::schema::{MIGRATION_ORDER, TARGET_TABLES};
use checkpoint::Phase;
use metrics::{counter, histogram};
use orphans::OrphanPolicy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sea_orm::{ConnectionTrait, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Run everything, then roll back instead of committing
    pub dry_run: bool,
    pub orphan_policy: OrphanPolicy,
    /// Rows per identifier map insert
    pub batch_size: usize,
}

impl MigrationOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            dry_run: false,
            orphan_policy: cfg.orphan_policy,
            batch_size: cfg.batch_size,
        }
    }
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            orphan_policy: OrphanPolicy::Abort,
            batch_size: 500,
        }
    }
}

/// Fails with [`RepairError::MissingTable`] for the first table not present in `schema`
pub async fn ensure_tables_exist<C>(db: &C, schema: &str, tables: &[&str]) -> Result<(), RepairError>
where
    C: ConnectionTrait,
{
    for table in tables {
        if !table_exists(db, schema, table).await? {
            return Err(RepairError::MissingTable(format!("{}.{}", schema, table)));
        }
    }
    Ok(())
}

pub async fn table_exists<C>(db: &C, schema: &str, table: &str) -> Result<bool, RepairError>
where
    C: ConnectionTrait,
{
    let count = fetch_count(
        db,
        "SELECT COUNT(*) AS count FROM information_schema.tables \
         WHERE table_schema = $1 AND table_name = $2",
        vec![Value::from(schema), Value::from(table)],
    )
    .await?;
    Ok(count > 0)
}

/// Blocks concurrent writers for the rest of the transaction
pub async fn lock_tables<C>(db: &C, schema: &str, tables: &[&str]) -> Result<(), RepairError>
where
    C: ConnectionTrait,
{
    let list: Vec<String> = tables.iter().map(|t| qualified(schema, t)).collect();
    execute(
        db,
        &format!("LOCK TABLE {} IN ACCESS EXCLUSIVE MODE", list.join(", ")),
        Vec::new(),
    )
    .await?;
    Ok(())
}

/// Runs the identifier migration on `db`, which should be a transaction.
pub async fn migrate<C>(
    db: &C,
    schema: &str,
    options: &MigrationOptions,
) -> Result<MigrationReport, RepairError>
where
    C: ConnectionTrait,
{
    let started = Instant::now();

    ensure_tables_exist(db, schema, &TARGET_TABLES).await?;
    checkpoint::ensure_tool_tables(db, schema).await?;
    lock_tables(db, schema, &TARGET_TABLES).await?;

    let mut completed = checkpoint::completed(db, schema).await?;
    let mut pending: BTreeMap<&str, i64> = BTreeMap::new();
    for table in MIGRATION_ORDER {
        pending.insert(
            table.name,
            identifiers::unformatted_count(db, schema, table).await?,
        );
    }
    let outstanding: i64 = pending.values().sum();

    if completed.contains(&Phase::Verified) {
        if outstanding == 0 {
            info!("Identifier migration already applied");
            return Ok(MigrationReport::new(MigrationStatus::AlreadyApplied));
        }
        warn!(
            rows = outstanding,
            "Unformatted identifiers appeared after the last verified run, starting over"
        );
        checkpoint::clear(db, schema).await?;
        completed.clear();
    }

    let status = if options.dry_run {
        MigrationStatus::DryRun
    } else {
        MigrationStatus::Applied
    };
    let mut report = MigrationReport::new(status);

    report.orphans = Some(orphans::handle(db, schema, options.orphan_policy).await?);

    let records = inspector::discover(db, schema, &TARGET_TABLES).await?;
    inspector::drop_all(db, schema, &records).await?;
    report.dropped_constraints = records
        .iter()
        .map(|r| format!("{}.{}", r.owning_table, r.constraint_name))
        .collect();
    checkpoint::record(db, schema, Phase::ConstraintsDropped).await?;

    let columns = normalizer::columns_to_normalize(&records);
    report.normalized = Some(normalizer::normalize(db, schema, &columns).await?);
    checkpoint::record(db, schema, Phase::ColumnsNormalized).await?;

    let mut rng = StdRng::from_entropy();
    for table in MIGRATION_ORDER {
        let Some(phase) = Phase::rewritten(table.name) else {
            continue;
        };
        let unformatted = pending.get(table.name).copied().unwrap_or(0);
        if completed.contains(&phase) && unformatted == 0 {
            info!(table = table.name, phase = %phase, "Rewrite already recorded, skipping");
            report.skipped_phases.push(phase);
            continue;
        }

        let rewrite = identifiers::rewrite_table(
            db,
            schema,
            table,
            &records,
            options.batch_size,
            &mut rng,
        )
        .await?;
        report.tables.push(rewrite);
        checkpoint::record(db, schema, phase).await?;
    }

    report.restore = Some(restorer::restore(db, schema, &records).await?);
    checkpoint::record(db, schema, Phase::ConstraintsRestored).await?;

    report.verification = Some(verify::verify(db, schema).await?);
    checkpoint::record(db, schema, Phase::Verified).await?;

    report.duration_ms = started.elapsed().as_millis();
    Ok(report)
}

/// Drives [`migrate`] inside a transaction on the session
pub struct IdentifierMigration<'a> {
    session: &'a Session,
    options: MigrationOptions,
}

impl<'a> IdentifierMigration<'a> {
    pub fn new(session: &'a Session, options: MigrationOptions) -> Self {
        Self { session, options }
    }

    /// Commits on success, or rolls back for dry runs and on any error
    pub async fn run(&self) -> Result<MigrationReport, RepairError> {
        let started = Instant::now();
        info!(
            dry_run = self.options.dry_run,
            orphan_policy = %self.options.orphan_policy,
            "Starting identifier migration"
        );

        let txn = begin(self.session.connection()).await?;
        let result = migrate(&txn, self.session.schema(), &self.options).await;
        let completion = if self.options.dry_run {
            Completion::Rollback
        } else {
            Completion::Commit
        };

        let outcome = finish(txn, result, completion).await;
        histogram!("laundry_repair.migration.duration", started.elapsed());
        match &outcome {
            Ok(report) => {
                counter!("laundry_repair.migration.succeeded", 1);
                info!(
                    status = %report.status,
                    rows = report.rows_rewritten(),
                    "Identifier migration finished"
                );
            }
            Err(_) => counter!("laundry_repair.migration.failed", 1),
        }
        outcome
    }
}

/// Read-only view of constraints, recorded phases and outstanding rows.
///
/// Diagnostic: failures of individual queries are logged and skipped.
pub async fn inspect<C>(db: &C, schema: &str) -> Result<InspectionReport, RepairError>
where
    C: ConnectionTrait,
{
    let constraints = inspector::list(db, schema, &TARGET_TABLES).await?;

    let checkpoints = if table_exists(db, schema, crate::schema::CHECKPOINT_TABLE).await? {
        checkpoint::completed(db, schema)
            .await
            .map_err(|e| warn!(error = %e, "Could not read checkpoints"))
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut pending = Vec::new();
    for table in MIGRATION_ORDER {
        match identifiers::unformatted_count(db, schema, table).await {
            Ok(unformatted) => pending.push(PendingTable {
                table: table.name.to_string(),
                unformatted,
            }),
            Err(e) => warn!(table = table.name, error = %e, "Could not count unformatted ids"),
        }
    }

    Ok(InspectionReport {
        constraints,
        checkpoints,
        pending,
    })
}
