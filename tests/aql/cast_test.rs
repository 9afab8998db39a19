use std::sync::Arc;

use serde_json::json;
use tally::aql::{
    cast_input, compile_query, q, CompileErrorKind, CompilerState, ErrorCategory, Typed, ValueType,
};
use tally::schema::{DefaultSchemaConfig, FieldDesc, FieldType, Schema, TableSchema};

fn schema() -> Arc<Schema> {
    Arc::new(
        Schema::new().with_table(
            "accounts",
            TableSchema::new()
                .with_field("id", FieldDesc::id())
                .with_field("balance", FieldDesc::new(FieldType::Float))
                .with_field("count", FieldDesc::new(FieldType::Integer))
                .with_field("name", FieldDesc::new(FieldType::String))
                .with_field("opened", FieldDesc::new(FieldType::Date))
                .with_field("closed", FieldDesc::new(FieldType::Boolean)),
        ),
    )
}

fn state() -> CompilerState {
    CompilerState::new(schema(), "accounts", "accounts", true)
}

#[test]
fn test_integer_widens_to_float() {
    let mut s = state();
    let cast = cast_input(&mut s, &Typed::literal("5", ValueType::Integer), ValueType::Float).unwrap();
    assert_eq!(cast.ty, ValueType::Float);
    assert_eq!(cast.sql, "5");
}

#[test]
fn test_float_does_not_narrow_to_integer() {
    let mut s = state();
    let err = cast_input(&mut s, &Typed::literal("1.5", ValueType::Float), ValueType::Integer)
        .unwrap_err();
    assert_eq!(
        err.kind,
        CompileErrorKind::CannotConvert {
            from: ValueType::Float,
            to: ValueType::Integer
        }
    );
    assert_eq!(err.category(), ErrorCategory::Cast);
}

#[test]
fn test_asymmetry_through_filters() {
    let ok = compile_query(
        &q("accounts").filter(json!({"balance": {"$gt": 10}})),
        &schema(),
        &DefaultSchemaConfig,
    )
    .unwrap();
    assert_eq!(ok.pieces.where_clause, "WHERE (accounts.balance > 10)");

    let err = compile_query(
        &q("accounts").filter(json!({"count": {"$gt": 1.5}})),
        &schema(),
        &DefaultSchemaConfig,
    )
    .unwrap_err();
    assert!(matches!(err.kind, CompileErrorKind::CannotConvert { .. }));
}

#[test]
fn test_string_literals_become_dates() {
    let compiled = compile_query(
        &q("accounts").filter(json!({"opened": {"$lt": "2024-02-01"}})),
        &schema(),
        &DefaultSchemaConfig,
    )
    .unwrap();
    assert_eq!(compiled.pieces.where_clause, "WHERE (accounts.opened < 20240201)");
}

#[test]
fn test_bad_date_literal() {
    let err = compile_query(
        &q("accounts").filter(json!({"opened": "next tuesday"})),
        &schema(),
        &DefaultSchemaConfig,
    )
    .unwrap_err();
    assert!(matches!(err.kind, CompileErrorKind::InvalidDate(_)));
}

#[test]
fn test_string_field_to_date_rejected() {
    let err = compile_query(
        &q("accounts").filter(json!({"opened": {"$gt": "$name"}})),
        &schema(),
        &DefaultSchemaConfig,
    )
    .unwrap_err();
    assert_eq!(err.kind, CompileErrorKind::StringFieldToDate);
}

#[test]
fn test_null_literal_against_boolean_is_false() {
    let mut s = state();
    let cast = cast_input(&mut s, &Typed::literal("NULL", ValueType::Null), ValueType::Boolean)
        .unwrap();
    assert_eq!(cast.sql, "0");
}

#[test]
fn test_param_type_conflict() {
    let err = compile_query(
        &q("accounts")
            .filter(json!({"count": {"$gt": ":n"}}))
            .filter(json!({"opened": {"$gt": ":n"}})),
        &schema(),
        &DefaultSchemaConfig,
    )
    .unwrap_err();
    assert!(matches!(err.kind, CompileErrorKind::ParamConflict { .. }));
}

#[test]
fn test_param_reuse_keeps_first_type() {
    let compiled = compile_query(
        &q("accounts")
            .filter(json!({"balance": {"$gt": ":n"}}))
            .filter(json!({"count": {"$lt": ":n"}})),
        &schema(),
        &DefaultSchemaConfig,
    );
    // a float parameter used where an integer is expected narrows; refused
    assert!(compiled.is_err());

    let compiled = compile_query(
        &q("accounts")
            .filter(json!({"count": {"$gt": ":n"}}))
            .filter(json!({"balance": {"$lt": ":n"}})),
        &schema(),
        &DefaultSchemaConfig,
    )
    .unwrap();
    let types: Vec<Option<ValueType>> = compiled
        .named_parameters()
        .iter()
        .map(|p| p.param_type)
        .collect();
    assert_eq!(types, vec![Some(ValueType::Integer), Some(ValueType::Float)]);
}
