//! Child rows whose parent reference is NULL, empty or dangling.

use crate::db::sql::{qualified, quote_ident};
use crate::db::{execute, fetch_all, fetch_one};
use crate::errors::RepairError;
use crate::schema::{ForeignKeySpec, ORPHAN_RELATIONS};
use sea_orm::{ConnectionTrait, FromQueryResult};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::{info, warn};

/// What the identifier migration does when orphans exist
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OrphanPolicy {
    /// Fail before anything is changed
    #[default]
    Abort,
    /// Point each orphan at the oldest existing parent
    AssignFirstParent,
    /// Leave orphans alone and list them
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    Null,
    Empty,
    Dangling,
}

#[derive(Debug, Clone, PartialEq, Eq, FromQueryResult)]
struct OrphanRow {
    id: String,
    parent_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Orphan {
    pub table: String,
    pub column: String,
    pub id: String,
    pub parent_ref: Option<String>,
    pub reason: OrphanReason,
    /// Parent assigned under [`OrphanPolicy::AssignFirstParent`]
    pub reassigned_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub policy: OrphanPolicy,
    pub orphans: Vec<Orphan>,
}

impl OrphanReport {
    pub fn count(&self) -> usize {
        self.orphans.len()
    }

    pub fn reassigned(&self) -> usize {
        self.orphans
            .iter()
            .filter(|o| o.reassigned_to.is_some())
            .count()
    }
}

fn classify(parent_ref: Option<&str>) -> OrphanReason {
    match parent_ref {
        None => OrphanReason::Null,
        Some(r) if r.trim().is_empty() => OrphanReason::Empty,
        Some(_) => OrphanReason::Dangling,
    }
}

/// The `WHERE` predicate selecting orphans of `relation`, with the child aliased `c`
fn orphan_predicate(schema: &str, relation: &ForeignKeySpec) -> String {
    let col = quote_ident(relation.column);
    format!(
        "c.{col} IS NULL OR c.{col}::text = '' OR NOT EXISTS (\
         SELECT 1 FROM {parent} AS p WHERE p.{pk}::text = c.{col}::text)",
        col = col,
        parent = qualified(schema, relation.referenced_table),
        pk = quote_ident(relation.referenced_column)
    )
}

pub fn detect_sql(schema: &str, relation: &ForeignKeySpec) -> String {
    format!(
        "SELECT c.id::text AS id, c.{col}::text AS parent_ref FROM {child} AS c WHERE {pred} ORDER BY c.id",
        col = quote_ident(relation.column),
        child = qualified(schema, relation.table),
        pred = orphan_predicate(schema, relation)
    )
}

pub fn first_parent_sql(schema: &str, relation: &ForeignKeySpec) -> String {
    format!(
        "SELECT {pk}::text AS id FROM {parent} ORDER BY created_at, {pk} LIMIT 1",
        pk = quote_ident(relation.referenced_column),
        parent = qualified(schema, relation.referenced_table)
    )
}

/// Set-based reassignment; the parent id is selected in place so the column type never matters
pub fn assign_first_parent_sql(schema: &str, relation: &ForeignKeySpec) -> String {
    format!(
        "UPDATE {child} AS c SET {col} = (\
         SELECT p.{pk} FROM {parent} AS p ORDER BY p.created_at, p.{pk} LIMIT 1) \
         WHERE {pred}",
        child = qualified(schema, relation.table),
        col = quote_ident(relation.column),
        pk = quote_ident(relation.referenced_column),
        parent = qualified(schema, relation.referenced_table),
        pred = orphan_predicate(schema, relation)
    )
}

/// Finds orphans across every checked relation
pub async fn detect<C>(db: &C, schema: &str) -> Result<Vec<Orphan>, RepairError>
where
    C: ConnectionTrait,
{
    let mut orphans = Vec::new();
    for relation in ORPHAN_RELATIONS.iter() {
        for row in fetch_all(db, &detect_sql(schema, relation), Vec::new()).await? {
            let row = OrphanRow::from_query_result(&row, "")?;
            orphans.push(Orphan {
                table: relation.table.to_string(),
                column: relation.column.to_string(),
                reason: classify(row.parent_ref.as_deref()),
                id: row.id,
                parent_ref: row.parent_ref,
                reassigned_to: None,
            });
        }
    }
    Ok(orphans)
}

/// Detects orphans and applies `policy` to them
pub async fn handle<C>(db: &C, schema: &str, policy: OrphanPolicy) -> Result<OrphanReport, RepairError>
where
    C: ConnectionTrait,
{
    let mut orphans = detect(db, schema).await?;

    for orphan in &orphans {
        warn!(
            table = %orphan.table,
            column = %orphan.column,
            id = %orphan.id,
            parent_ref = orphan.parent_ref.as_deref().unwrap_or("NULL"),
            reason = ?orphan.reason,
            "Orphaned row"
        );
    }

    if orphans.is_empty() {
        info!("No orphaned rows found");
        return Ok(OrphanReport { policy, orphans });
    }

    match policy {
        OrphanPolicy::Abort => {
            return Err(RepairError::OrphansDetected {
                count: orphans.len(),
            })
        }
        OrphanPolicy::Report => {
            warn!(
                count = orphans.len(),
                "Leaving orphans in place; constraint restore fails on dangling references"
            );
        }
        OrphanPolicy::AssignFirstParent => {
            for relation in ORPHAN_RELATIONS.iter() {
                if !orphans.iter().any(|o| o.table == relation.table) {
                    continue;
                }

                let parent = match fetch_one(db, &first_parent_sql(schema, relation), Vec::new()).await? {
                    Some(row) => row.try_get::<String>("", "id")?,
                    None => {
                        warn!(
                            table = relation.referenced_table,
                            "No parent row exists to assign orphans to"
                        );
                        return Err(RepairError::OrphansDetected {
                            count: orphans.len(),
                        });
                    }
                };

                let rows = execute(db, &assign_first_parent_sql(schema, relation), Vec::new()).await?;
                for orphan in orphans.iter_mut().filter(|o| o.table == relation.table) {
                    warn!(
                        table = %orphan.table,
                        id = %orphan.id,
                        parent = %parent,
                        "Reassigned orphan to first parent"
                    );
                    orphan.reassigned_to = Some(parent.clone());
                }
                info!(table = relation.table, rows, parent = %parent, "Orphans reassigned");
            }
        }
    }

    Ok(OrphanReport { policy, orphans })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FK_ORDERS_CUSTOMER;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use sea_orm::{DatabaseBackend, MockDatabase, Value};
    use std::collections::BTreeMap;
    use std::str::FromStr;

    #[rstest]
    #[case("abort", OrphanPolicy::Abort)]
    #[case("assign-first-parent", OrphanPolicy::AssignFirstParent)]
    #[case("report", OrphanPolicy::Report)]
    fn parses_policy_names(#[case] name: &str, #[case] expected: OrphanPolicy) {
        assert_eq!(OrphanPolicy::from_str(name).unwrap(), expected);
        assert_eq!(expected.to_string(), name);
    }

    #[rstest]
    #[case(None, OrphanReason::Null)]
    #[case(Some(""), OrphanReason::Empty)]
    #[case(Some("  "), OrphanReason::Empty)]
    #[case(Some("b0d4ce5d-2757-4699-948c-cfa72ba94f86"), OrphanReason::Dangling)]
    fn classifies_reasons(#[case] parent: Option<&str>, #[case] expected: OrphanReason) {
        assert_eq!(classify(parent), expected);
    }

    #[test]
    fn detection_covers_null_empty_and_dangling() {
        let sql = detect_sql("public", &FK_ORDERS_CUSTOMER);
        assert!(sql.contains("c.\"customer_id\" IS NULL"));
        assert!(sql.contains("c.\"customer_id\"::text = ''"));
        assert!(sql.contains("NOT EXISTS (SELECT 1 FROM \"public\".\"customers\" AS p"));
    }

    fn orphan_row(id: &str, parent: Option<&str>) -> BTreeMap<&'static str, Value> {
        BTreeMap::from([
            ("id", Value::from(id)),
            (
                "parent_ref",
                Value::String(parent.map(|p| Box::new(p.to_string()))),
            ),
        ])
    }

    #[tokio::test]
    async fn abort_policy_fails_with_count() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([
                vec![orphan_row("o1", None), orphan_row("o2", Some("gone"))],
                vec![orphan_row("p1", Some(""))],
            ])
            .into_connection();

        let err = handle(&conn, "public", OrphanPolicy::Abort).await.unwrap_err();
        assert_matches!(err, RepairError::OrphansDetected { count: 3 });
    }

    #[tokio::test]
    async fn report_policy_lists_orphans() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![orphan_row("o1", None)], vec![]])
            .into_connection();

        let report = handle(&conn, "public", OrphanPolicy::Report).await.unwrap();
        assert_eq!(report.count(), 1);
        assert_eq!(report.orphans[0].reason, OrphanReason::Null);
        assert_eq!(report.reassigned(), 0);
    }
}
