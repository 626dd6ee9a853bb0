pub use sea_orm_migration::prelude::*;

mod m20240301_000001_create_customers_table;
mod m20240301_000002_create_service_categories_table;
mod m20240301_000003_create_services_table;
mod m20240301_000004_create_orders_table;
mod m20240301_000005_create_order_items_table;
mod m20240301_000006_create_payments_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_customers_table::Migration),
            Box::new(m20240301_000002_create_service_categories_table::Migration),
            Box::new(m20240301_000003_create_services_table::Migration),
            Box::new(m20240301_000004_create_orders_table::Migration),
            Box::new(m20240301_000005_create_order_items_table::Migration),
            Box::new(m20240301_000006_create_payments_table::Migration),
        ]
    }
}
