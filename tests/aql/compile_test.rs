use std::sync::Arc;

use insta::assert_snapshot;
use serde_json::{json, Value};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tally::aql::{
    compile_query, q, CompileErrorKind, CompiledQuery, ErrorCategory, FrameKind, Query, ValueType,
};
use tally::schema::{DefaultSchemaConfig, Schema, SchemaConfig, ViewContext};

fn budget_schema() -> Arc<Schema> {
    let schema = json!({
        "transactions": {
            "id": {"type": "id"},
            "amount": {"type": "integer"},
            "notes": {"type": "string"},
            "date": {"type": "date"},
            "payee": {"type": "id", "ref": "payees"},
            "tombstone": {"type": "boolean"}
        },
        "payees": {
            "id": {"type": "id"},
            "name": {"type": "string"},
            "category": {"type": "id", "ref": "categories"}
        },
        "categories": {
            "id": {"type": "id"},
            "name": {"type": "string"}
        }
    });
    Arc::new(Schema::from_json(&schema.to_string()).unwrap())
}

fn compile(query: &Query) -> CompiledQuery {
    compile_query(query, &budget_schema(), &DefaultSchemaConfig).unwrap()
}

/// Parse with the SQLite dialect to make sure the emitted statement is valid.
fn validate_sql(sql: &str) {
    if let Err(e) = Parser::parse_sql(&SQLiteDialect {}, sql) {
        panic!("Invalid SQL: {}\nSQL: {}", e, sql);
    }
}

// ============================================================================
// Select and joins
// ============================================================================

#[test]
fn test_path_select_joins_once() {
    let compiled = compile(&q("transactions").select(json!(["amount", "payee.name"])));

    assert_eq!(
        compiled.pieces.select,
        "transactions.id AS id, transactions.amount AS amount, payees1.name AS \"payee.name\""
    );
    assert_eq!(
        compiled.pieces.joins,
        "LEFT JOIN payees AS payees1 ON payees1.id = transactions.payee"
    );
    assert_eq!(compiled.dependencies(), ["transactions", "payees"]);
    assert_eq!(
        compiled.output_types().get("payee.name"),
        Some(&ValueType::String)
    );
}

#[test]
fn test_full_statement() {
    let compiled = compile(
        &q("transactions")
            .filter(json!({"amount": {"$gte": 100}}))
            .select(json!(["amount", "payee.name"]))
            .order_by(json!({"date": "desc"}))
            .limit(10),
    );
    let sql = compiled.sql();
    assert_snapshot!(sql, @r#"
SELECT transactions.id AS id, transactions.amount AS amount, payees1.name AS "payee.name" FROM transactions
LEFT JOIN payees AS payees1 ON payees1.id = transactions.payee
WHERE (transactions.amount >= 100) AND transactions.tombstone = 0
ORDER BY transactions.date desc
LIMIT 10
"#);
    validate_sql(&sql);
}

#[test]
fn test_nested_paths_share_prefix_join() {
    let compiled = compile(
        &q("transactions").select(json!(["payee.name", "payee.category.name"])),
    );
    assert_eq!(
        compiled.pieces.joins,
        "LEFT JOIN payees AS payees1 ON payees1.id = transactions.payee\n\
         LEFT JOIN categories AS categories2 ON categories2.id = payees1.category"
    );
    assert_eq!(
        compiled.dependencies(),
        ["transactions", "payees", "categories"]
    );
    validate_sql(&compiled.sql());
}

#[test]
fn test_selecting_ref_validates_target_row() {
    let compiled = compile(&q("transactions").select(json!(["payee"])));
    assert_eq!(
        compiled.pieces.select,
        "transactions.id AS id, payees1.id AS payee"
    );

    let raw = compile(&q("transactions").select(json!(["payee"])).without_validated_refs());
    assert_eq!(
        raw.pieces.select,
        "transactions.id AS id, transactions.payee AS payee"
    );
    assert!(raw.pieces.joins.is_empty());
}

#[test]
fn test_aliased_id_replaces_implicit_id() {
    let compiled = compile(&q("transactions").select(json!([{"id": "payee"}, "amount"])));
    assert_eq!(
        compiled.pieces.select,
        "payees1.id AS id, transactions.amount AS amount"
    );
    assert_eq!(compiled.output_types().get("id"), Some(&ValueType::Id));
    validate_sql(&compiled.sql());
}

#[test]
fn test_compile_is_repeatable() {
    let query = q("transactions").select(json!(["payee.name"]));
    let first = compile(&query);
    let second = compile(&query);
    assert_eq!(first.sql(), second.sql());
    assert_eq!(first.pieces, second.pieces);
}

// ============================================================================
// Filters
// ============================================================================

#[test]
fn test_comparison_filter() {
    let compiled = compile(&q("transactions").filter(json!({"amount": {"$gte": 100}})));
    assert_eq!(
        compiled.pieces.where_clause,
        "WHERE (transactions.amount >= 100)"
    );
}

#[test]
fn test_filters_are_anded() {
    let compiled = compile(
        &q("transactions")
            .filter(json!({"amount": {"$gt": 0}}))
            .filter(json!({"notes": {"$like": "%rent%"}})),
    );
    assert_eq!(
        compiled.pieces.where_clause,
        "WHERE (transactions.amount > 0\n  AND transactions.notes LIKE '%rent%')"
    );
}

#[test]
fn test_or_filter() {
    let compiled = compile(&q("transactions").filter(json!({
        "$or": [{"amount": 1}, {"amount": 2}]
    })));
    assert_eq!(
        compiled.pieces.where_clause,
        "WHERE ((transactions.amount = 1\n  OR transactions.amount = 2))"
    );
    validate_sql(&compiled.sql());
}

#[test]
fn test_one_of_dedupes() {
    let compiled = compile(&q("transactions").filter(json!({
        "notes": {"$oneof": ["a", "a", "b"]}
    })));
    assert_eq!(
        compiled.pieces.where_clause,
        "WHERE (transactions.notes IN ('a','b'))"
    );
}

#[test]
fn test_one_of_empty_matches_nothing() {
    let compiled = compile(&q("transactions").filter(json!({"notes": {"$oneof": []}})));
    assert_eq!(compiled.pieces.where_clause, "WHERE (0)");
}

#[test]
fn test_null_equality() {
    let compiled = compile(&q("transactions").filter(json!({"notes": null})));
    assert_eq!(
        compiled.pieces.where_clause,
        "WHERE (transactions.notes IS NULL)"
    );
}

#[test]
fn test_eq_param_binds_twice() {
    let compiled = compile(
        &q("transactions")
            .filter(json!({"amount": ":amount"}))
            .filter(json!({"notes": {"$like": ":pattern"}})),
    );
    assert_eq!(
        compiled.pieces.where_clause,
        "WHERE (CASE WHEN transactions.amount IS NULL THEN ? IS NULL ELSE transactions.amount = ? END\n  \
         AND transactions.notes LIKE ?)"
    );

    let params: Vec<(&str, Option<ValueType>)> = compiled
        .named_parameters()
        .iter()
        .map(|p| (p.name.as_str(), p.param_type))
        .collect();
    assert_eq!(
        params,
        vec![
            ("amount", Some(ValueType::Integer)),
            ("amount", Some(ValueType::Integer)),
            ("pattern", Some(ValueType::String)),
        ]
    );
    validate_sql(&compiled.sql());
}

#[test]
fn test_date_literal_and_transform() {
    let compiled = compile(&q("transactions").filter(json!({
        "date": {"$transform": "$month", "$eq": "2024-03"}
    })));
    let where_clause = &compiled.pieces.where_clause;
    assert!(where_clause.contains("202403"), "{}", where_clause);
}

#[test]
fn test_with_dead_drops_tombstone_guard() {
    let live = compile(&q("transactions"));
    assert!(live.sql().ends_with("AND transactions.tombstone = 0"));

    let dead = compile(&q("transactions").with_dead());
    assert!(!dead.sql().contains("tombstone"));
}

// ============================================================================
// Aggregates
// ============================================================================

#[test]
fn test_aggregate_query_has_no_implicit_id() {
    let compiled = compile(
        &q("transactions")
            .calculate(json!({"$sum": "$amount"})),
    );
    assert_eq!(compiled.pieces.select, "SUM(transactions.amount) AS result");
    assert!(compiled.is_calculation());

    let grouped = compile(
        &q("transactions")
            .select(json!([{"total": {"$sum": "$amount"}}]))
            .group_by(json!(["notes"])),
    );
    assert_eq!(grouped.pieces.select, "SUM(transactions.amount) AS total");
    assert_eq!(grouped.pieces.group_by, "GROUP BY transactions.notes");
    assert_eq!(
        grouped.output_types().get("total"),
        Some(&ValueType::Integer)
    );
    validate_sql(&grouped.sql());
}

#[test]
fn test_running_total_uses_query_order() {
    let compiled = compile(
        &q("transactions")
            .select(json!([{"balance": {"$sumOver": "$amount"}}]))
            .order_by(json!([{"date": "desc"}])),
    );
    assert!(compiled
        .pieces
        .select
        .contains("OVER (ORDER BY transactions.date desc ROWS BETWEEN CURRENT ROW AND UNBOUNDED FOLLOWING)"));
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_unknown_table() {
    let err = compile_query(&q("budgets"), &budget_schema(), &DefaultSchemaConfig).unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::UnknownTable("budgets".into()));
    assert_eq!(err.category(), ErrorCategory::Schema);
}

#[test]
fn test_not_joinable() {
    let err = compile_query(
        &q("transactions").select(json!(["notes.name"])),
        &budget_schema(),
        &DefaultSchemaConfig,
    )
    .unwrap_err();
    assert_eq!(
        err.kind.to_string(),
        "Field not joinable on table transactions: \"notes\""
    );
    assert_eq!(err.category(), ErrorCategory::Path);
}

#[test]
fn test_error_stack_runs_inner_to_root() {
    let err = compile_query(
        &q("transactions").filter(json!({"amount": {"$gt": {"$abs": "$nope"}}})),
        &budget_schema(),
        &DefaultSchemaConfig,
    )
    .unwrap_err();

    let kinds: Vec<FrameKind> = err.trail.iter().map(|f| f.kind).collect();
    assert_eq!(
        kinds,
        vec![
            FrameKind::Expr,
            FrameKind::Function,
            FrameKind::Expr,
            FrameKind::Op,
            FrameKind::Filter,
        ]
    );
    assert_eq!(
        err.to_string(),
        "Field \"nope\" does not exist in table \"transactions\"\n\n\
         Expression stack:\n  \
         function: {\"$abs\":\"$nope\"}\n  \
         expr: {\"$abs\":\"$nope\"}\n  \
         op: amount {\"$gt\":{\"$abs\":\"$nope\"}}\n  \
         filter: [{\"amount\":{\"$gt\":{\"$abs\":\"$nope\"}}}]"
    );
}

#[test]
fn test_unknown_function_and_operator() {
    let schema = budget_schema();
    let err = compile_query(
        &q("transactions").select(json!([{"x": {"$avg": "$amount"}}])),
        &schema,
        &DefaultSchemaConfig,
    )
    .unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::UnknownFunction("$avg".into()));

    let err = compile_query(
        &q("transactions").filter(json!({"amount": {"$between": [1, 2]}})),
        &schema,
        &DefaultSchemaConfig,
    )
    .unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::UnknownOperator("$between".into()));
    assert_eq!(err.category(), ErrorCategory::Syntax);
}

#[test]
fn test_arity() {
    let err = compile_query(
        &q("transactions").select(json!([{"x": {"$substr": ["$notes"]}}])),
        &budget_schema(),
        &DefaultSchemaConfig,
    )
    .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Arity);
}

// ============================================================================
// Schema hooks
// ============================================================================

struct ViewConfig;

impl SchemaConfig for ViewConfig {
    fn table_view(&self, table: &str, ctx: &ViewContext<'_>) -> Option<String> {
        match (table, ctx.is_join) {
            ("transactions", false) => Some("v_transactions".into()),
            ("payees", true) => Some("v_payees".into()),
            _ => None,
        }
    }

    fn table_filters(&self, table: &str) -> Vec<Value> {
        match table {
            "payees" => vec![json!({"name": {"$like": "A%"}})],
            _ => Vec::new(),
        }
    }
}

#[test]
fn test_views_and_join_filters() {
    let compiled = compile_query(
        &q("transactions").select(json!(["payee.name"])),
        &budget_schema(),
        &ViewConfig,
    )
    .unwrap();

    assert_eq!(compiled.pieces.from, "v_transactions");
    assert_eq!(
        compiled.pieces.select,
        "v_transactions.id AS id, payees1.name AS \"payee.name\""
    );
    assert_eq!(
        compiled.pieces.joins,
        "LEFT JOIN v_payees AS payees1 ON payees1.id = v_transactions.payee AND (payees1.name LIKE 'A%')"
    );
    validate_sql(&compiled.sql());
}

#[test]
fn test_raw_mode_skips_table_filters() {
    let compiled = compile_query(
        &q("transactions").select(json!(["payee.name"])).raw(),
        &budget_schema(),
        &ViewConfig,
    )
    .unwrap();
    assert!(!compiled.pieces.joins.contains("LIKE"));
}
