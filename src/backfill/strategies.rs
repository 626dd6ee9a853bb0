//! Fill strategies for the columns the backfill knows how to repair.

use crate::db::sql::{qualified, quote_ident, quote_literal};
use chrono::NaiveDate;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;

/// How NULLs in a known column are filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FillStrategy {
    /// `<prefix>-<YYYYMMDD>-<5 random digits>`, unique across the column
    UniqueCode { prefix: &'static str },
    /// A fixed SQL literal
    Literal { sql: &'static str },
    /// `'{}'`, also installed as the column default
    EmptyJsonObject,
    /// The oldest service category, created if none exists
    FirstCategory,
    /// Price of the related service, else zero
    ServicePrice,
    /// `price * quantity`, else zero
    PriceTimesQuantity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KnownColumn {
    pub table: &'static str,
    pub column: &'static str,
    pub strategy: FillStrategy,
}

/// Columns with a fill strategy, in the order they are fixed
pub const KNOWN_COLUMNS: [KnownColumn; 9] = [
    KnownColumn {
        table: "orders",
        column: "order_number",
        strategy: FillStrategy::UniqueCode { prefix: "ORD" },
    },
    KnownColumn {
        table: "payments",
        column: "reference_number",
        strategy: FillStrategy::UniqueCode { prefix: "REF" },
    },
    KnownColumn {
        table: "customers",
        column: "name",
        strategy: FillStrategy::Literal {
            sql: "'Unknown Customer'",
        },
    },
    KnownColumn {
        table: "services",
        column: "additional_requirements",
        strategy: FillStrategy::EmptyJsonObject,
    },
    KnownColumn {
        table: "services",
        column: "category_id",
        strategy: FillStrategy::FirstCategory,
    },
    KnownColumn {
        table: "order_items",
        column: "notes",
        strategy: FillStrategy::Literal { sql: "''" },
    },
    KnownColumn {
        table: "order_items",
        column: "weight",
        strategy: FillStrategy::Literal { sql: "0" },
    },
    KnownColumn {
        table: "order_items",
        column: "price",
        strategy: FillStrategy::ServicePrice,
    },
    KnownColumn {
        table: "order_items",
        column: "subtotal",
        strategy: FillStrategy::PriceTimesQuantity,
    },
];

pub const CATEGORY_TABLE: &str = "service_categories";
pub const DEFAULT_CATEGORY_NAME: &str = "General";
pub const SERVICES_TABLE: &str = "services";

const CODE_ATTEMPTS: usize = 1_000;

pub fn strategy_for(table: &str, column: &str) -> Option<FillStrategy> {
    KNOWN_COLUMNS
        .iter()
        .find(|k| k.table == table && k.column == column)
        .map(|k| k.strategy)
}

/// Position of a column in the fix order; unknown columns sort last
pub fn fix_order(table: &str, column: &str) -> usize {
    KNOWN_COLUMNS
        .iter()
        .position(|k| k.table == table && k.column == column)
        .unwrap_or(KNOWN_COLUMNS.len())
}

/// Draws a code not in `taken` and reserves it
pub fn unique_code<R: Rng>(
    prefix: &str,
    date: NaiveDate,
    taken: &mut HashSet<String>,
    rng: &mut R,
) -> Option<String> {
    let day = date.format("%Y%m%d");
    for _ in 0..CODE_ATTEMPTS {
        let code = format!("{}-{}-{:05}", prefix, day, rng.gen_range(0..100_000));
        if taken.insert(code.clone()) {
            return Some(code);
        }
    }
    None
}

pub fn null_count_sql(schema: &str, table: &str, column: &str) -> String {
    format!(
        "SELECT COUNT(*) AS count FROM {} WHERE {} IS NULL",
        qualified(schema, table),
        quote_ident(column)
    )
}

pub fn literal_fill_sql(schema: &str, table: &str, column: &str, literal: &str) -> String {
    let col = quote_ident(column);
    format!(
        "UPDATE {} SET {} = {} WHERE {} IS NULL",
        qualified(schema, table),
        col,
        literal,
        col
    )
}

pub fn json_default_sql(schema: &str, table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
        qualified(schema, table),
        quote_ident(column),
        quote_literal("{}")
    )
}

pub fn service_price_sql(schema: &str) -> String {
    format!(
        "UPDATE {items} AS oi SET \"price\" = COALESCE(\
         (SELECT s.\"price\" FROM {services} AS s WHERE s.id = oi.\"service_id\"), 0) \
         WHERE oi.\"price\" IS NULL",
        items = qualified(schema, "order_items"),
        services = qualified(schema, SERVICES_TABLE)
    )
}

pub fn subtotal_sql(schema: &str) -> String {
    format!(
        "UPDATE {} SET \"subtotal\" = COALESCE(\"price\" * \"quantity\", 0) WHERE \"subtotal\" IS NULL",
        qualified(schema, "order_items")
    )
}

pub fn first_category_sql(schema: &str) -> String {
    format!(
        "SELECT id::text AS id FROM {} ORDER BY created_at, id LIMIT 1",
        qualified(schema, CATEGORY_TABLE)
    )
}

pub fn create_category_sql(schema: &str) -> String {
    format!(
        "INSERT INTO {} (name, description) VALUES ($1, $2) RETURNING id::text AS id",
        qualified(schema, CATEGORY_TABLE)
    )
}

pub fn assign_category_sql(schema: &str) -> String {
    format!(
        "UPDATE {services} AS s SET \"category_id\" = c.id FROM {categories} AS c \
         WHERE c.id::text = $1 AND s.\"category_id\" IS NULL",
        services = qualified(schema, SERVICES_TABLE),
        categories = qualified(schema, CATEGORY_TABLE)
    )
}

/// Existing codes for one day, so new codes can avoid them
pub fn codes_for_day_sql(schema: &str, table: &str, column: &str) -> String {
    format!(
        "SELECT {col}::text AS code FROM {t} WHERE {col}::text LIKE $1",
        col = quote_ident(column),
        t = qualified(schema, table)
    )
}

pub fn null_ids_sql(schema: &str, table: &str, column: &str) -> String {
    format!(
        "SELECT id::text AS id FROM {} WHERE {} IS NULL ORDER BY id",
        qualified(schema, table),
        quote_ident(column)
    )
}

/// Batched `UPDATE .. FROM (VALUES ..)` assigning one code per row id
pub fn assign_codes_sql(schema: &str, table: &str, column: &str, rows: usize) -> String {
    let col = quote_ident(column);
    format!(
        "UPDATE {t} AS t SET {col} = v.code FROM (VALUES {values}) AS v(id, code) \
         WHERE t.id::text = v.id AND t.{col} IS NULL",
        t = qualified(schema, table),
        col = col,
        values = crate::db::sql::values_placeholders(rows, 2)
    )
}

pub fn set_not_null_sql(schema: &str, table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
        qualified(schema, table),
        quote_ident(column)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    #[rstest]
    #[case("orders", "order_number", Some(FillStrategy::UniqueCode { prefix: "ORD" }))]
    #[case("payments", "reference_number", Some(FillStrategy::UniqueCode { prefix: "REF" }))]
    #[case("customers", "name", Some(FillStrategy::Literal { sql: "'Unknown Customer'" }))]
    #[case("services", "additional_requirements", Some(FillStrategy::EmptyJsonObject))]
    #[case("services", "category_id", Some(FillStrategy::FirstCategory))]
    #[case("order_items", "notes", Some(FillStrategy::Literal { sql: "''" }))]
    #[case("order_items", "weight", Some(FillStrategy::Literal { sql: "0" }))]
    #[case("order_items", "price", Some(FillStrategy::ServicePrice))]
    #[case("order_items", "subtotal", Some(FillStrategy::PriceTimesQuantity))]
    #[case("customers", "email", None)]
    fn looks_up_strategies(
        #[case] table: &str,
        #[case] column: &str,
        #[case] expected: Option<FillStrategy>,
    ) {
        assert_eq!(strategy_for(table, column), expected);
    }

    #[test]
    fn price_is_fixed_before_subtotal() {
        assert!(fix_order("order_items", "price") < fix_order("order_items", "subtotal"));
        assert_eq!(fix_order("customers", "email"), KNOWN_COLUMNS.len());
    }

    #[test]
    fn codes_are_dated_and_unique() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut taken = HashSet::new();
        let mut rng = StdRng::seed_from_u64(1);
        let re = regex::Regex::new(r"^ORD-20240301-\d{5}$").unwrap();

        for _ in 0..500 {
            let code = unique_code("ORD", date, &mut taken, &mut rng).unwrap();
            assert!(re.is_match(&code), "{}", code);
        }
        assert_eq!(taken.len(), 500);
    }

    #[test]
    fn exhausted_code_space_gives_none() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut taken: HashSet<String> = HashSet::new();
        let mut same = rand::rngs::mock::StepRng::new(0, 0);
        assert!(unique_code("REF", date, &mut taken, &mut same).is_some());
        assert!(unique_code("REF", date, &mut taken, &mut same).is_none());
    }

    #[test]
    fn fill_statements_only_touch_nulls() {
        assert_eq!(
            literal_fill_sql("public", "customers", "name", "'Unknown Customer'"),
            "UPDATE \"public\".\"customers\" SET \"name\" = 'Unknown Customer' WHERE \"name\" IS NULL"
        );
        assert!(subtotal_sql("public").ends_with("WHERE \"subtotal\" IS NULL"));
        assert!(service_price_sql("public").ends_with("WHERE oi.\"price\" IS NULL"));
        assert_eq!(
            json_default_sql("public", "services", "additional_requirements"),
            "ALTER TABLE \"public\".\"services\" ALTER COLUMN \"additional_requirements\" SET DEFAULT '{}'"
        );
    }
}
