pub mod sql;
pub mod transaction;

use crate::config::AppConfig;
use crate::errors::RepairError;
use futures::future::BoxFuture;
use metrics::{counter, gauge, histogram};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, QueryResult,
    Statement, Value,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub use transaction::{begin, finish, Completion};

/// Configuration for the repair session's connection
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Schema holding the laundry tables
    pub schema: String,
    /// Connection timeout duration
    pub connect_timeout: Duration,
    /// Acquire connection timeout
    pub acquire_timeout: Duration,
    /// Log every statement through sqlx
    pub log_statements: bool,
}

impl DbConfig {
    pub fn from_app_config(cfg: &AppConfig) -> Result<Self, RepairError> {
        Ok(Self {
            url: cfg.database_url()?,
            schema: cfg.db_schema.clone(),
            connect_timeout: cfg.connect_timeout(),
            acquire_timeout: cfg.acquire_timeout(),
            log_statements: cfg.db_log_statements,
        })
    }
}

/// One exclusive database session.
///
/// The pool is pinned to a single connection so every statement of a run goes
/// over the same backend, one after the other.
#[derive(Debug)]
pub struct Session {
    conn: DatabaseConnection,
    schema: String,
}

impl Session {
    /// Wraps an existing connection, e.g. a mock connection in tests
    pub fn new(conn: DatabaseConnection, schema: impl Into<String>) -> Self {
        Self {
            conn,
            schema: schema.into(),
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Executes statements in order, stopping at the first failure
    pub async fn run(&self, statements: &[String]) -> Result<u64, RepairError> {
        let mut affected = 0;
        for sql in statements {
            affected += execute(&self.conn, sql, Vec::new()).await?;
        }
        Ok(affected)
    }

    /// Closes the underlying connection
    pub async fn close(self) -> Result<(), RepairError> {
        info!("Closing database session");
        self.conn.close().await.map_err(RepairError::from)
    }
}

/// Opens the session; connection failures are reported before any statement runs
pub async fn establish_session(config: &DbConfig) -> Result<Session, RepairError> {
    debug!(
        schema = %config.schema,
        connect_timeout = ?config.connect_timeout,
        "Configuring database session"
    );

    let mut opt = ConnectOptions::new(config.url.clone());
    opt.max_connections(1)
        .min_connections(1)
        .connect_timeout(config.connect_timeout)
        .acquire_timeout(config.acquire_timeout)
        .sqlx_logging(config.log_statements);

    let start = Instant::now();
    let conn = Database::connect(opt).await.map_err(|e| {
        counter!("laundry_repair_db.connection_failures", 1);
        RepairError::ConnectionError(e.to_string())
    })?;

    let session = Session::new(conn, config.schema.clone());
    check_connection(session.connection()).await?;

    gauge!(
        "laundry_repair_db.connect_latency_ms",
        start.elapsed().as_millis() as f64
    );
    info!("Database session established");

    Ok(session)
}

/// Runs `f` inside a fresh session and closes the session on every exit path
pub async fn with_session<F, T>(config: &AppConfig, f: F) -> Result<T, RepairError>
where
    F: for<'a> FnOnce(&'a Session) -> BoxFuture<'a, Result<T, RepairError>>,
{
    let db_config = DbConfig::from_app_config(config)?;
    info!(url = %config.redacted_database_url(), "Connecting to database");

    let session = establish_session(&db_config).await?;
    let result = f(&session).await;

    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close database session cleanly");
    }

    result
}

/// Checks if the database connection is active
pub async fn check_connection(conn: &DatabaseConnection) -> Result<(), RepairError> {
    debug!("Checking database connection");
    let start = Instant::now();

    let result = conn
        .ping()
        .await
        .map_err(|e| RepairError::ConnectionError(e.to_string()));

    let elapsed = start.elapsed();
    match &result {
        Ok(_) => {
            debug!("Database connection check successful in {:?}", elapsed);
        }
        Err(e) => {
            error!(
                "Database connection check failed after {:?}: {}",
                elapsed, e
            );
            counter!("laundry_repair_db.connection_failures", 1);
        }
    }

    result
}

/// Builds a Postgres statement
pub fn statement(sql: &str, values: Vec<Value>) -> Statement {
    Statement::from_sql_and_values(DbBackend::Postgres, sql, values)
}

/// Executes one statement and returns the affected row count
pub async fn execute<C>(db: &C, sql: &str, values: Vec<Value>) -> Result<u64, RepairError>
where
    C: ConnectionTrait,
{
    let start = Instant::now();
    debug!(sql = %sql, "Executing statement");

    let result = db.execute(statement(sql, values)).await.map_err(|e| {
        error!(sql = %sql, error = %e, "Statement failed");
        counter!("laundry_repair_db.statement.error", 1);
        RepairError::db_error(e)
    })?;

    histogram!(
        "laundry_repair_db.statement.duration",
        start.elapsed()
    );
    counter!("laundry_repair_db.statement.executed", 1);

    Ok(result.rows_affected())
}

/// Runs a query and returns every row
pub async fn fetch_all<C>(
    db: &C,
    sql: &str,
    values: Vec<Value>,
) -> Result<Vec<QueryResult>, RepairError>
where
    C: ConnectionTrait,
{
    let start = Instant::now();
    debug!(sql = %sql, "Running query");

    let rows = db.query_all(statement(sql, values)).await.map_err(|e| {
        error!(sql = %sql, error = %e, "Query failed");
        counter!("laundry_repair_db.query.error", 1);
        RepairError::db_error(e)
    })?;

    histogram!("laundry_repair_db.query.duration", start.elapsed());

    Ok(rows)
}

/// Runs a query expected to return at most one row
pub async fn fetch_one<C>(
    db: &C,
    sql: &str,
    values: Vec<Value>,
) -> Result<Option<QueryResult>, RepairError>
where
    C: ConnectionTrait,
{
    Ok(fetch_all(db, sql, values).await?.into_iter().next())
}

/// Runs a single-column `BIGINT` query such as `SELECT COUNT(*) AS count`
pub async fn fetch_count<C>(db: &C, sql: &str, values: Vec<Value>) -> Result<i64, RepairError>
where
    C: ConnectionTrait,
{
    match fetch_one(db, sql, values).await? {
        Some(row) => Ok(row.try_get::<Option<i64>>("", "count")?.unwrap_or(0)),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, Transaction};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn run_executes_statements_in_order() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 2,
                },
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 3,
                },
            ])
            .into_connection();
        let session = Session::new(conn, "public");

        let affected = session
            .run(&["UPDATE a SET x = 1".to_string(), "UPDATE b SET y = 2".to_string()])
            .await
            .unwrap();
        assert_eq!(affected, 5);

        let Session { conn, .. } = session;
        assert_eq!(
            conn.into_transaction_log(),
            vec![
                Transaction::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    "UPDATE a SET x = 1",
                    []
                ),
                Transaction::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    "UPDATE b SET y = 2",
                    []
                ),
            ]
        );
    }

    #[tokio::test]
    async fn fetch_count_reads_count_column() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![BTreeMap::from([("count", Value::BigInt(Some(7)))])]])
            .into_connection();

        let count = fetch_count(&conn, "SELECT COUNT(*) AS count FROM customers", vec![])
            .await
            .unwrap();
        assert_eq!(count, 7);
    }

    #[tokio::test]
    async fn failed_statement_maps_to_database_error() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_errors([sea_orm::DbErr::Custom("boom".into())])
            .into_connection();

        let err = execute(&conn, "DROP TABLE nope", vec![]).await.unwrap_err();
        assert!(matches!(err, RepairError::DatabaseError(_)));
    }
}
