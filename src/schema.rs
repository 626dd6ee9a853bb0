//! The tables the repair operates on and the identifier formats they migrate to.

use crate::db::sql::{qualified, quote_ident};

/// Column holding the per-table sequence number used to derive formatted ids
pub const SEQUENCE_COLUMN: &str = "id_sequence";

/// Tool-owned table recording completed migration phases
pub const CHECKPOINT_TABLE: &str = "schema_repair_checkpoints";

/// Tool-owned table recording `old_id -> new_id` pairs per table
pub const ID_MAP_TABLE: &str = "schema_repair_id_map";

/// sea-orm's migration bookkeeping table
pub const MIGRATIONS_TABLE: &str = "seaql_migrations";

/// Tables never scanned by the NULL backfill
pub const METADATA_TABLES: [&str; 3] = [MIGRATIONS_TABLE, CHECKPOINT_TABLE, ID_MAP_TABLE];

/// Prefix plus zero-padded sequence, e.g. `CUST-0000001`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierFormat {
    pub prefix: &'static str,
    pub width: usize,
}

impl IdentifierFormat {
    pub const fn new(prefix: &'static str, width: usize) -> Self {
        Self { prefix, width }
    }

    /// Largest sequence value that fits in the width
    pub fn max_sequence(&self) -> i64 {
        10_i64.saturating_pow(self.width as u32) - 1
    }

    /// Formats a sequence value, or `None` when it does not fit
    pub fn format(&self, sequence: i64) -> Option<String> {
        if !(0..=self.max_sequence()).contains(&sequence) {
            return None;
        }
        Some(format!(
            "{}{:0width$}",
            self.prefix,
            sequence,
            width = self.width
        ))
    }

    /// Whether `id` is already in this format
    pub fn matches(&self, id: &str) -> bool {
        id.strip_prefix(self.prefix)
            .map(|digits| digits.len() == self.width && digits.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    }

    /// SQL expression reading the sequence number back out of a formatted `column`
    pub fn sequence_sql(&self, column: &str) -> String {
        format!(
            "substring({}::text FROM {})::bigint",
            column,
            self.prefix.len() + 1
        )
    }

    /// POSIX regex for use with Postgres' `~` operator
    pub fn sql_pattern(&self) -> String {
        format!("^{}[0-9]{{{}}}$", self.prefix, self.width)
    }
}

/// A table whose primary key is rewritten to formatted identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetTable {
    pub name: &'static str,
    pub format: IdentifierFormat,
}

pub const CUSTOMERS: TargetTable = TargetTable {
    name: "customers",
    format: IdentifierFormat::new("CUST-", 7),
};

pub const ORDERS: TargetTable = TargetTable {
    name: "orders",
    format: IdentifierFormat::new("ORD-", 7),
};

pub const PAYMENTS: TargetTable = TargetTable {
    name: "payments",
    format: IdentifierFormat::new("TRX-", 10),
};

pub const ORDER_ITEMS: &str = "order_items";

/// Parents before children
pub const MIGRATION_ORDER: [TargetTable; 3] = [CUSTOMERS, ORDERS, PAYMENTS];

/// Every table whose foreign keys are inspected and dropped
pub const TARGET_TABLES: [&str; 4] = [CUSTOMERS.name, ORDERS.name, PAYMENTS.name, ORDER_ITEMS];

/// Looks up a migrated table by name
pub fn target_table(name: &str) -> Option<TargetTable> {
    MIGRATION_ORDER.iter().copied().find(|t| t.name == name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: &'static str,
    pub column: &'static str,
}

/// Key columns always retyped to `VARCHAR(255)`
pub const KEY_COLUMNS: [ColumnRef; 6] = [
    ColumnRef {
        table: "customers",
        column: "id",
    },
    ColumnRef {
        table: "orders",
        column: "id",
    },
    ColumnRef {
        table: "orders",
        column: "customer_id",
    },
    ColumnRef {
        table: "payments",
        column: "id",
    },
    ColumnRef {
        table: "payments",
        column: "order_id",
    },
    ColumnRef {
        table: "order_items",
        column: "order_id",
    },
];

/// A foreign key the application schema must always have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKeySpec {
    pub name: &'static str,
    pub table: &'static str,
    pub column: &'static str,
    pub referenced_table: &'static str,
    pub referenced_column: &'static str,
    pub on_delete: Option<&'static str>,
}

impl ForeignKeySpec {
    /// Constraint body with the referenced table qualified by `schema`
    pub fn definition(&self, schema: &str) -> String {
        let mut def = format!(
            "FOREIGN KEY ({}) REFERENCES {}({})",
            quote_ident(self.column),
            qualified(schema, self.referenced_table),
            quote_ident(self.referenced_column)
        );
        if let Some(action) = self.on_delete {
            def.push_str(" ON DELETE ");
            def.push_str(action);
        }
        def
    }
}

pub const FK_ORDERS_CUSTOMER: ForeignKeySpec = ForeignKeySpec {
    name: "fk_orders_customer_id",
    table: "orders",
    column: "customer_id",
    referenced_table: "customers",
    referenced_column: "id",
    on_delete: None,
};

pub const FK_PAYMENTS_ORDER: ForeignKeySpec = ForeignKeySpec {
    name: "fk_payments_order_id",
    table: "payments",
    column: "order_id",
    referenced_table: "orders",
    referenced_column: "id",
    on_delete: None,
};

pub const FK_ORDER_ITEMS_ORDER: ForeignKeySpec = ForeignKeySpec {
    name: "fk_order_items_order_id",
    table: "order_items",
    column: "order_id",
    referenced_table: "orders",
    referenced_column: "id",
    on_delete: Some("CASCADE"),
};

/// Foreign keys re-created after restore when nothing equivalent exists
pub const BASELINE_FOREIGN_KEYS: [ForeignKeySpec; 3] =
    [FK_ORDERS_CUSTOMER, FK_PAYMENTS_ORDER, FK_ORDER_ITEMS_ORDER];

/// Child references checked for orphans before the migration mutates anything
pub const ORPHAN_RELATIONS: [ForeignKeySpec; 2] = [FK_ORDERS_CUSTOMER, FK_PAYMENTS_ORDER];
