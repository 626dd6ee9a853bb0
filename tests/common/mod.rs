//! Shared harness for tests that run against a live Postgres database.
//!
//! Every test gets a freshly migrated schema (`public` unless it asks for
//! another) on the database named by `DATABASE_URL`; run them with
//! `--features postgres-tests`.
#![allow(dead_code)]

use laundry_repair::db::Session;
use migrations::{Migrator, MigratorTrait};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement, Value,
};

pub const SCHEMA: &str = "public";

pub struct TestDb {
    /// Connection whose `search_path` points at `schema`; used for seeding and assertions
    pub conn: DatabaseConnection,
    /// Connection with the server's default `search_path`, handed to the tool
    pub tool_conn: DatabaseConnection,
    pub schema: String,
}

impl TestDb {
    /// Drops and recreates `public`, then applies the base migrations.
    pub async fn new() -> Self {
        Self::in_schema(SCHEMA).await
    }

    /// Same as [`TestDb::new`] for another schema. The tool's session keeps the
    /// default `search_path`, so every statement it issues must qualify names.
    pub async fn in_schema(schema: &str) -> Self {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must point at a scratch Postgres database");
        let tool_conn = Database::connect(&url)
            .await
            .expect("failed to connect to test database");

        tool_conn
            .execute_unprepared(&format!(
                "DROP SCHEMA IF EXISTS \"{schema}\" CASCADE; CREATE SCHEMA \"{schema}\";"
            ))
            .await
            .expect("failed to reset schema");

        let conn = if schema == SCHEMA {
            tool_conn.clone()
        } else {
            let mut opt = ConnectOptions::new(url);
            opt.set_schema_search_path(schema.to_string());
            Database::connect(opt)
                .await
                .expect("failed to connect with schema search path")
        };

        Migrator::up(&conn, None)
            .await
            .expect("failed to apply base migrations");

        Self {
            conn,
            tool_conn,
            schema: schema.to_string(),
        }
    }

    pub fn session(&self) -> Session {
        Session::new(self.tool_conn.clone(), self.schema.as_str())
    }

    pub async fn exec(&self, sql: &str) {
        self.conn
            .execute_unprepared(sql)
            .await
            .unwrap_or_else(|e| panic!("statement failed: {sql}: {e}"));
    }

    /// First column of every row, read as text
    pub async fn strings(&self, sql: &str) -> Vec<String> {
        self.conn
            .query_all(Statement::from_string(DbBackend::Postgres, sql.to_string()))
            .await
            .unwrap_or_else(|e| panic!("query failed: {sql}: {e}"))
            .iter()
            .map(|row| row.try_get_by_index::<String>(0).expect("text column"))
            .collect()
    }

    pub async fn count(&self, sql: &str) -> i64 {
        let row = self
            .conn
            .query_one(Statement::from_string(DbBackend::Postgres, sql.to_string()))
            .await
            .unwrap_or_else(|e| panic!("query failed: {sql}: {e}"))
            .expect("count query returned no row");
        row.try_get_by_index::<i64>(0).expect("bigint column")
    }

    pub async fn column_type(&self, table: &str, column: &str) -> String {
        self.column_info("data_type", table, column).await
    }

    pub async fn is_nullable(&self, table: &str, column: &str) -> String {
        self.column_info("is_nullable", table, column).await
    }

    async fn column_info(&self, field: &str, table: &str, column: &str) -> String {
        let values = self
            .strings(&format!(
                "SELECT {field}::text FROM information_schema.columns \
                 WHERE table_schema = '{schema}' AND table_name = '{table}' \
                 AND column_name = '{column}'",
                schema = self.schema
            ))
            .await;
        assert_eq!(values.len(), 1, "{table}.{column} in {}", self.schema);
        values.into_iter().next().expect("column exists")
    }

    /// `table.constraint` for every foreign key in the schema
    pub async fn foreign_keys(&self) -> Vec<String> {
        self.strings(&format!(
            "SELECT rel.relname::text || '.' || con.conname::text FROM pg_constraint con \
             JOIN pg_class rel ON rel.oid = con.conrelid \
             WHERE con.contype = 'f' AND con.connamespace = '{}'::regnamespace ORDER BY 1",
            self.schema
        ))
        .await
    }

    /// `table -> referenced schema.table` for one foreign key of the schema
    pub async fn referenced_table(&self, table: &str, constraint: &str) -> String {
        self.strings(&format!(
            "SELECT fns.nspname::text || '.' || frel.relname::text FROM pg_constraint con \
             JOIN pg_class rel ON rel.oid = con.conrelid \
             JOIN pg_class frel ON frel.oid = con.confrelid \
             JOIN pg_namespace fns ON fns.oid = frel.relnamespace \
             WHERE con.connamespace = '{schema}'::regnamespace \
             AND rel.relname = '{table}' AND con.conname = '{constraint}'",
            schema = self.schema
        ))
        .await
        .into_iter()
        .next()
        .expect("constraint exists")
    }

    /// Inserts a customer created `minutes_ago` minutes in the past and returns its id
    pub async fn customer(&self, name: &str, minutes_ago: i32) -> String {
        self.insert_returning(
            "INSERT INTO customers (name, created_at) \
             VALUES ($1, now() - make_interval(mins => $2)) RETURNING id::text",
            vec![name.into(), minutes_ago.into()],
        )
        .await
    }

    pub async fn order(&self, customer_id: &str, number: &str, minutes_ago: i32) -> String {
        self.insert_returning(
            "INSERT INTO orders (order_number, customer_id, created_at) \
             VALUES ($1, $2::uuid, now() - make_interval(mins => $3)) RETURNING id::text",
            vec![number.into(), customer_id.into(), minutes_ago.into()],
        )
        .await
    }

    pub async fn payment(&self, order_id: &str, reference: &str, minutes_ago: i32) -> String {
        self.insert_returning(
            "INSERT INTO payments (order_id, amount, reference_number, created_at) \
             VALUES ($1::uuid, 25.00, $2, now() - make_interval(mins => $3)) RETURNING id::text",
            vec![order_id.into(), reference.into(), minutes_ago.into()],
        )
        .await
    }

    pub async fn category(&self, name: &str) -> String {
        self.insert_returning(
            "INSERT INTO service_categories (name) VALUES ($1) RETURNING id::text",
            vec![name.into()],
        )
        .await
    }

    pub async fn service(&self, category_id: &str, name: &str, price: f64) -> String {
        self.insert_returning(
            "INSERT INTO services (name, category_id, price, unit) \
             VALUES ($1, $2::uuid, $3::numeric, 'kg') RETURNING id::text",
            vec![name.into(), category_id.into(), price.into()],
        )
        .await
    }

    pub async fn order_item(&self, order_id: &str, service_id: &str, quantity: i32) -> String {
        self.insert_returning(
            "INSERT INTO order_items (order_id, service_id, quantity, weight, price, subtotal) \
             VALUES ($1::uuid, $2::uuid, $3, 1.5, 10.00, 10.00 * $3) RETURNING id::text",
            vec![order_id.into(), service_id.into(), quantity.into()],
        )
        .await
    }

    async fn insert_returning(&self, sql: &str, values: Vec<Value>) -> String {
        let row = self
            .conn
            .query_one(Statement::from_sql_and_values(DbBackend::Postgres, sql, values))
            .await
            .unwrap_or_else(|e| panic!("insert failed: {sql}: {e}"))
            .expect("insert returned no row");
        row.try_get_by_index::<String>(0).expect("text id")
    }
}

/// Three customers, each with one order, one payment and one line item.
pub struct Fixture {
    pub service: String,
    pub customers: Vec<String>,
    pub orders: Vec<String>,
    pub payments: Vec<String>,
}

pub async fn seed(db: &TestDb) -> Fixture {
    let category = db.category("Wash").await;
    let service = db.service(&category, "Wash and fold", 12.5).await;

    let mut fixture = Fixture {
        service: service.clone(),
        customers: Vec::new(),
        orders: Vec::new(),
        payments: Vec::new(),
    };
    for (n, name) in ["Ana", "Budi", "Citra"].iter().enumerate() {
        let age = 300 - (n as i32) * 60;
        let customer = db.customer(name, age).await;
        let order = db.order(&customer, &format!("LEGACY-{n}"), age - 10).await;
        let payment = db.payment(&order, &format!("PAY-{n}"), age - 20).await;
        db.order_item(&order, &service, 2).await;
        fixture.customers.push(customer);
        fixture.orders.push(order);
        fixture.payments.push(payment);
    }
    fixture
}
