//! Operator-facing reports for every command, rendered as text or JSON.

use crate::errors::RepairError;
use crate::repair::checkpoint::Phase;
use crate::repair::identifiers::TableRewrite;
use crate::repair::inspector::ForeignKeyConstraintRecord;
use crate::repair::normalizer::NormalizeOutcome;
use crate::repair::orphans::OrphanReport;
use crate::repair::restorer::RestoreOutcome;
use crate::repair::verify::VerificationReport;
use serde::Serialize;
use strum::Display;

/// Human-readable rendering of a report
pub trait Summary {
    fn summary_lines(&self) -> Vec<String>;
}

/// Renders a report as pretty JSON or as summary lines
pub fn render<T>(report: &T, json: bool) -> Result<String, serde_json::Error>
where
    T: Serialize + Summary,
{
    if json {
        serde_json::to_string_pretty(report)
    } else {
        Ok(report.summary_lines().join("\n"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MigrationStatus {
    Applied,
    DryRun,
    AlreadyApplied,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub status: MigrationStatus,
    pub orphans: Option<OrphanReport>,
    pub dropped_constraints: Vec<String>,
    pub normalized: Option<NormalizeOutcome>,
    pub tables: Vec<TableRewrite>,
    pub skipped_phases: Vec<Phase>,
    pub restore: Option<RestoreOutcome>,
    pub verification: Option<VerificationReport>,
    pub duration_ms: u128,
}

impl MigrationReport {
    pub fn new(status: MigrationStatus) -> Self {
        Self {
            status,
            orphans: None,
            dropped_constraints: Vec::new(),
            normalized: None,
            tables: Vec::new(),
            skipped_phases: Vec::new(),
            restore: None,
            verification: None,
            duration_ms: 0,
        }
    }

    pub fn rows_rewritten(&self) -> u64 {
        self.tables.iter().map(|t| t.rewritten).sum()
    }
}

impl Summary for MigrationReport {
    fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Identifier migration: {}", self.status)];

        if self.status == MigrationStatus::AlreadyApplied {
            lines.push("Nothing to do; every identifier is already formatted.".to_string());
            return lines;
        }

        if let Some(orphans) = &self.orphans {
            lines.push(format!(
                "Orphans: {} found, {} reassigned (policy {})",
                orphans.count(),
                orphans.reassigned(),
                orphans.policy
            ));
        }

        lines.push(format!(
            "Constraints dropped: {}",
            self.dropped_constraints.len()
        ));

        if let Some(normalized) = &self.normalized {
            lines.push(format!(
                "Columns retyped: {} (already text: {}, missing: {})",
                normalized.retyped.len(),
                normalized.already_normalized.len(),
                normalized.missing.len()
            ));
        }

        for table in &self.tables {
            lines.push(format!(
                "  {}: {} rewritten, {} already formatted, {} random fallback",
                table.table, table.rewritten, table.already_formatted, table.fallback_ids
            ));
            for dependent in &table.dependents {
                lines.push(format!("    {} -> {} rows", dependent.column, dependent.rows));
            }
        }

        for phase in &self.skipped_phases {
            lines.push(format!("  skipped {} (already recorded)", phase));
        }

        if let Some(restore) = &self.restore {
            lines.push(format!(
                "Constraints restored: {} (already present: {}, baseline created: {})",
                restore.restored.len(),
                restore.already_present.len(),
                restore.baseline_created.len()
            ));
        }

        if let Some(verification) = &self.verification {
            lines.push(format!(
                "Verification: {} checks passed",
                verification.checks.len()
            ));
        }

        if self.status == MigrationStatus::DryRun {
            lines.push("Dry run: all changes rolled back.".to_string());
        }

        lines.push(format!("Finished in {} ms", self.duration_ms));
        lines
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TableRollback {
    pub table: String,
    pub restored: u64,
    pub dependents: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub dropped_constraints: usize,
    pub tables: Vec<TableRollback>,
    pub uuid_type_restored: bool,
    pub restore: RestoreOutcome,
    pub map_rows_cleared: u64,
    pub checkpoints_cleared: u64,
    /// Sequence columns and their unique indexes stay, so re-migrating yields the same ids
    pub sequence_columns_kept: Vec<String>,
    pub duration_ms: u128,
}

impl Summary for RollbackReport {
    fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec!["Identifier rollback: applied".to_string()];
        lines.push(format!("Constraints dropped: {}", self.dropped_constraints));
        for table in &self.tables {
            lines.push(format!(
                "  {}: {} ids restored; dependents: {}",
                table.table,
                table.restored,
                if table.dependents.is_empty() {
                    "none".to_string()
                } else {
                    table.dependents.join(", ")
                }
            ));
        }
        lines.push(format!(
            "Key columns: {}",
            if self.uuid_type_restored {
                "UUID"
            } else {
                "VARCHAR(255)"
            }
        ));
        lines.push(format!(
            "Constraints restored: {} (baseline created: {})",
            self.restore.restored.len(),
            self.restore.baseline_created.len()
        ));
        lines.push(format!(
            "Cleared {} map rows and {} checkpoints",
            self.map_rows_cleared, self.checkpoints_cleared
        ));
        if !self.sequence_columns_kept.is_empty() {
            lines.push(format!(
                "Kept sequence columns: {}",
                self.sequence_columns_kept.join(", ")
            ));
        }
        lines.push(format!("Finished in {} ms", self.duration_ms));
        lines
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingTable {
    pub table: String,
    pub unformatted: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectionReport {
    pub constraints: Vec<ForeignKeyConstraintRecord>,
    pub checkpoints: Vec<Phase>,
    pub pending: Vec<PendingTable>,
}

impl Summary for InspectionReport {
    fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Foreign keys touching target tables: {}",
            self.constraints.len()
        )];
        for c in &self.constraints {
            lines.push(format!(
                "  {}.{} ({}) -> {}.{}: {}",
                c.owning_table,
                c.constraint_name,
                c.column_name,
                c.referenced_table,
                c.referenced_column,
                c.definition.as_deref().unwrap_or("<definition unavailable>")
            ));
        }
        if self.checkpoints.is_empty() {
            lines.push("Checkpoints: none".to_string());
        } else {
            let names: Vec<String> = self.checkpoints.iter().map(|p| p.to_string()).collect();
            lines.push(format!("Checkpoints: {}", names.join(", ")));
        }
        for p in &self.pending {
            lines.push(format!("  {}: {} unformatted ids", p.table, p.unformatted));
        }
        lines
    }
}

/// Failure rendered in place of a report when `--json` is requested
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub message: String,
}

impl From<&RepairError> for ErrorReport {
    fn from(err: &RepairError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl Summary for ErrorReport {
    fn summary_lines(&self) -> Vec<String> {
        vec![format!("Error ({}): {}", self.code, self.message)]
    }
}
