#![cfg(feature = "postgres-tests")]

mod common;

use assert_matches::assert_matches;
use common::{seed, TestDb};
use laundry_repair::{
    rollback_identifiers, IdentifierMigration, MigrationOptions, RepairError, RollbackOptions,
};
use serial_test::serial;

#[tokio::test]
#[serial]
async fn rollback_restores_original_uuids() {
    let db = TestDb::new().await;
    let fixture = seed(&db).await;
    let foreign_keys = db.foreign_keys().await;
    let session = db.session();

    IdentifierMigration::new(&session, MigrationOptions::default())
        .run()
        .await
        .expect("migration should succeed");

    let report = rollback_identifiers(&session, RollbackOptions::default())
        .await
        .expect("rollback should succeed");
    assert!(report.uuid_type_restored);
    assert_eq!(report.map_rows_cleared, 9);

    let customers = db.strings("SELECT id::text FROM customers ORDER BY created_at").await;
    assert_eq!(customers, fixture.customers);
    let orders = db.strings("SELECT id::text FROM orders ORDER BY created_at").await;
    assert_eq!(orders, fixture.orders);
    let payments = db.strings("SELECT id::text FROM payments ORDER BY created_at").await;
    assert_eq!(payments, fixture.payments);

    let owners = db
        .strings("SELECT customer_id::text FROM orders ORDER BY created_at")
        .await;
    assert_eq!(owners, fixture.customers);

    assert_eq!(db.column_type("customers", "id").await, "uuid");
    assert_eq!(db.column_type("order_items", "order_id").await, "uuid");
    assert_eq!(db.foreign_keys().await, foreign_keys);
    assert_eq!(db.count("SELECT COUNT(*) FROM schema_repair_id_map").await, 0);

    // Sequence columns survive so a later migration reproduces the same ids
    assert_eq!(
        report.sequence_columns_kept,
        vec!["customers.id_sequence", "orders.id_sequence", "payments.id_sequence"]
    );
    assert_eq!(db.column_type("customers", "id_sequence").await, "bigint");
    assert_eq!(
        db.count("SELECT COUNT(*) FROM customers WHERE id_sequence IS NULL").await,
        0
    );
}

#[tokio::test]
#[serial]
async fn keep_varchar_leaves_text_columns() {
    let db = TestDb::new().await;
    let fixture = seed(&db).await;
    let session = db.session();

    IdentifierMigration::new(&session, MigrationOptions::default())
        .run()
        .await
        .expect("migration should succeed");

    let report = rollback_identifiers(
        &session,
        RollbackOptions {
            restore_uuid_type: false,
        },
    )
    .await
    .expect("rollback should succeed");
    assert!(!report.uuid_type_restored);

    assert_eq!(db.column_type("customers", "id").await, "character varying");
    let customers = db.strings("SELECT id FROM customers ORDER BY created_at").await;
    assert_eq!(customers, fixture.customers);
}

#[tokio::test]
#[serial]
async fn rollback_without_a_map_is_refused() {
    let db = TestDb::new().await;
    seed(&db).await;
    let session = db.session();

    let err = rollback_identifiers(&session, RollbackOptions::default())
        .await
        .expect_err("nothing to roll back");
    assert_matches!(err, RepairError::MissingIdentifierMap(_));
}

#[tokio::test]
#[serial]
async fn migration_can_run_again_after_rollback() {
    let db = TestDb::new().await;
    seed(&db).await;
    let session = db.session();

    IdentifierMigration::new(&session, MigrationOptions::default())
        .run()
        .await
        .expect("first migration should succeed");
    rollback_identifiers(&session, RollbackOptions::default())
        .await
        .expect("rollback should succeed");
    IdentifierMigration::new(&session, MigrationOptions::default())
        .run()
        .await
        .expect("second migration should succeed");

    let ids = db.strings("SELECT id FROM orders ORDER BY created_at").await;
    assert_eq!(ids, vec!["ORD-0000001", "ORD-0000002", "ORD-0000003"]);
}
