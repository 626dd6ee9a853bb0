use sea_orm_migration::prelude::*;

use super::m20240301_000002_create_service_categories_table::ServiceCategories;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Services are priced per unit (kg for wash-and-fold, piece for dry cleaning)
        manager
            .create_table(
                Table::create()
                    .table(Services::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Services::Id)
                            .uuid()
                            .not_null()
                            .primary_key()
                            .extra("DEFAULT gen_random_uuid()"),
                    )
                    .col(ColumnDef::new(Services::Name).string().not_null())
                    .col(ColumnDef::new(Services::CategoryId).uuid().not_null())
                    .col(
                        ColumnDef::new(Services::Price)
                            .decimal_len(12, 2)
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Services::Unit).string_len(16).not_null())
                    .col(
                        ColumnDef::new(Services::AdditionalRequirements)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(Services::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Services::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_services_category_id")
                            .from(Services::Table, Services::CategoryId)
                            .to(ServiceCategories::Table, ServiceCategories::Id),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Services::Table).if_exists().to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Services {
    Table,
    Id,
    Name,
    CategoryId,
    Price,
    Unit,
    AdditionalRequirements,
    IsActive,
    CreatedAt,
}
