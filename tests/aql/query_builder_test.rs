use serde_json::json;
use tally::aql::{q, Query, QueryState};

#[test]
fn test_builder_returns_new_queries() {
    let base = q("transactions");
    let filtered = base.filter(json!({"amount": {"$gt": 0}}));

    assert!(base.state().filter_expressions.is_empty());
    assert_eq!(filtered.state().filter_expressions.len(), 1);
    assert!(!base.ptr_eq(&filtered));
    assert!(base.ptr_eq(&base.clone()));
}

#[test]
fn test_untouched_lists_are_shared() {
    let base = q("transactions").select(json!(["amount"]));
    let ordered = base.order_by("date");
    assert!(std::sync::Arc::ptr_eq(
        &base.state().select_expressions,
        &ordered.state().select_expressions
    ));
}

#[test]
fn test_group_and_order_append() {
    let query = q("transactions")
        .group_by("payee")
        .group_by(json!(["category", "month"]))
        .order_by(json!({"date": "desc"}));
    assert_eq!(
        query.state().group_expressions.as_ref(),
        &vec![json!("payee"), json!("category"), json!("month")]
    );
    assert_eq!(
        query.state().order_expressions.as_ref(),
        &vec![json!({"date": "desc"})]
    );
}

#[test]
fn test_select_replaces_and_calculate_marks() {
    let query = q("transactions")
        .select(json!(["amount"]))
        .select("notes");
    assert_eq!(query.state().select_expressions.as_ref(), &vec![json!("notes")]);
    assert!(!query.state().calculation);

    let calc = query.calculate(json!({"$sum": "$amount"}));
    assert!(calc.state().calculation);
    assert_eq!(
        calc.state().select_expressions.as_ref(),
        &vec![json!({"result": {"$sum": "$amount"}})]
    );

    // selecting again drops calculation mode
    assert!(!calc.select("amount").state().calculation);
}

#[test]
fn test_unfilter() {
    let query = q("transactions")
        .filter(json!({"amount": 1}))
        .filter(json!({"notes": "x"}))
        .unfilter(&["amount"]);
    assert_eq!(
        query.state().filter_expressions.as_ref(),
        &vec![json!({"notes": "x"})]
    );
}

#[test]
fn test_flags() {
    let query = q("transactions")
        .raw()
        .with_dead()
        .without_validated_refs()
        .limit(5)
        .offset(10)
        .options(json!({"splits": "grouped"}));
    let state = query.state();
    assert!(state.raw_mode);
    assert!(state.with_dead);
    assert!(!state.validate_refs);
    assert_eq!(state.limit, Some(5));
    assert_eq!(state.offset, Some(10));
    assert_eq!(state.table_options, Some(json!({"splits": "grouped"})));
}

#[test]
fn test_serialized_form() {
    let query = q("transactions")
        .filter(json!({"amount": {"$gt": 0}}))
        .select(json!(["amount"]))
        .limit(1);
    assert_eq!(
        query.serialize(),
        json!({
            "table": "transactions",
            "filterExpressions": [{"amount": {"$gt": 0}}],
            "selectExpressions": ["amount"],
            "groupExpressions": [],
            "orderExpressions": [],
            "calculation": false,
            "rawMode": false,
            "withDead": false,
            "validateRefs": true,
            "limit": 1
        })
    );

    let back: Query = serde_json::from_value(query.serialize()).unwrap();
    assert_eq!(back, query);
}

#[test]
fn test_minimal_description_defaults() {
    let state: QueryState = serde_json::from_value(json!({"table": "payees"})).unwrap();
    assert!(state.validate_refs);
    assert!(state.select_expressions.is_empty());
    assert_eq!(state.limit, None);
}
