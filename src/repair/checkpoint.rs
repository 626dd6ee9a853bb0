//! Tool-owned bookkeeping: the phase log and the identifier map table.

use crate::db::sql::qualified;
use crate::db::{execute, fetch_all};
use crate::errors::RepairError;
use crate::schema::{CHECKPOINT_TABLE, ID_MAP_TABLE};
use sea_orm::{ConnectionTrait, Value};
use serde::Serialize;
use std::collections::BTreeSet;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tracing::{debug, warn};

/// Migration phases, recorded as they complete
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    ConstraintsDropped,
    ColumnsNormalized,
    CustomersRewritten,
    OrdersRewritten,
    PaymentsRewritten,
    ConstraintsRestored,
    Verified,
}

impl Phase {
    /// Phase marking the primary key rewrite of a migrated table
    pub fn rewritten(table: &str) -> Option<Phase> {
        match table {
            "customers" => Some(Phase::CustomersRewritten),
            "orders" => Some(Phase::OrdersRewritten),
            "payments" => Some(Phase::PaymentsRewritten),
            _ => None,
        }
    }
}

pub fn create_checkpoint_table_sql(schema: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         phase VARCHAR(64) PRIMARY KEY, \
         completed_at TIMESTAMPTZ NOT NULL DEFAULT now())",
        qualified(schema, CHECKPOINT_TABLE)
    )
}

pub fn create_id_map_table_sql(schema: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\
         table_name VARCHAR(64) NOT NULL, \
         old_id VARCHAR(255) NOT NULL, \
         new_id VARCHAR(255) NOT NULL, \
         created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
         PRIMARY KEY (table_name, old_id))",
        qualified(schema, ID_MAP_TABLE)
    )
}

/// Creates the checkpoint and identifier map tables if missing
pub async fn ensure_tool_tables<C>(db: &C, schema: &str) -> Result<(), RepairError>
where
    C: ConnectionTrait,
{
    execute(db, &create_checkpoint_table_sql(schema), Vec::new()).await?;
    execute(db, &create_id_map_table_sql(schema), Vec::new()).await?;
    Ok(())
}

/// Phases recorded so far; unknown phase names are ignored
pub async fn completed<C>(db: &C, schema: &str) -> Result<BTreeSet<Phase>, RepairError>
where
    C: ConnectionTrait,
{
    let sql = format!(
        "SELECT phase FROM {} ORDER BY completed_at",
        qualified(schema, CHECKPOINT_TABLE)
    );
    let mut phases = BTreeSet::new();
    for row in fetch_all(db, &sql, Vec::new()).await? {
        let name: String = row.try_get("", "phase")?;
        match Phase::from_str(&name) {
            Ok(phase) => {
                phases.insert(phase);
            }
            Err(_) => warn!(phase = %name, "Ignoring unknown checkpoint"),
        }
    }
    Ok(phases)
}

/// Records a completed phase, refreshing the timestamp on re-runs
pub async fn record<C>(db: &C, schema: &str, phase: Phase) -> Result<(), RepairError>
where
    C: ConnectionTrait,
{
    let sql = format!(
        "INSERT INTO {} (phase, completed_at) VALUES ($1, now()) \
         ON CONFLICT (phase) DO UPDATE SET completed_at = EXCLUDED.completed_at",
        qualified(schema, CHECKPOINT_TABLE)
    );
    execute(db, &sql, vec![Value::from(phase.as_ref())]).await?;
    debug!(phase = %phase, "Checkpoint recorded");
    Ok(())
}

/// Forgets every recorded phase
pub async fn clear<C>(db: &C, schema: &str) -> Result<u64, RepairError>
where
    C: ConnectionTrait,
{
    let sql = format!("DELETE FROM {}", qualified(schema, CHECKPOINT_TABLE));
    execute(db, &sql, Vec::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase};
    use std::collections::BTreeMap;
    use strum::IntoEnumIterator;

    #[test]
    fn phase_names_are_snake_case() {
        let names: Vec<String> = Phase::iter().map(|p| p.to_string()).collect();
        assert_eq!(
            names,
            vec![
                "constraints_dropped",
                "columns_normalized",
                "customers_rewritten",
                "orders_rewritten",
                "payments_rewritten",
                "constraints_restored",
                "verified"
            ]
        );
        assert_eq!(Phase::from_str("verified").unwrap(), Phase::Verified);
    }

    #[test]
    fn maps_tables_to_rewrite_phases() {
        assert_eq!(Phase::rewritten("orders"), Some(Phase::OrdersRewritten));
        assert_eq!(Phase::rewritten("order_items"), None);
    }

    #[tokio::test]
    async fn completed_skips_unknown_rows() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![
                BTreeMap::from([("phase", Value::from("constraints_dropped"))]),
                BTreeMap::from([("phase", Value::from("something_else"))]),
                BTreeMap::from([("phase", Value::from("verified"))]),
            ]])
            .into_connection();

        let phases = completed(&conn, "public").await.unwrap();
        assert_eq!(
            phases.into_iter().collect::<Vec<_>>(),
            vec![Phase::ConstraintsDropped, Phase::Verified]
        );
    }
}
