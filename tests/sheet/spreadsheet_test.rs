use std::cell::{Cell as Counter, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::{json, Value};
use tally::aql::{q, CompiledQuery};
use tally::cache::CellCache;
use tally::schema::{DefaultSchemaConfig, Schema};
use tally::sheet::{
    CacheStatus, CellError, CellResult, CellsChanged, Computed, DynamicCell, GraphError,
    Spreadsheet, TableChanges,
};

fn schema() -> Arc<Schema> {
    let schema = json!({
        "transactions": {
            "id": {"type": "id"},
            "amount": {"type": "integer"},
            "payee": {"type": "id", "ref": "payees"}
        },
        "payees": {
            "id": {"type": "id"},
            "name": {"type": "string"}
        },
        "accounts": {
            "id": {"type": "id"},
            "name": {"type": "string"}
        }
    });
    Arc::new(Schema::from_json(&schema.to_string()).unwrap())
}

fn sheet() -> Spreadsheet {
    Spreadsheet::new(schema(), Arc::new(DefaultSchemaConfig))
}

fn sum_inputs(args: &[Value]) -> CellResult<Computed> {
    Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()).into())
}

/// Records every "cells changed" notification.
fn record_changes(s: &mut Spreadsheet) -> Rc<RefCell<Vec<Vec<String>>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    s.subscribe(move |event: &CellsChanged| sink.borrow_mut().push(event.names.clone()));
    log
}

fn changes(tables: &[&str]) -> TableChanges {
    tables
        .iter()
        .map(|t| {
            let mut rows = HashMap::new();
            rows.insert("row-1".to_string(), json!({"id": "row-1"}));
            (t.to_string(), rows)
        })
        .collect()
}

// ============================================================================
// Query cells
// ============================================================================

#[test]
fn test_table_change_recomputes_query_cell() {
    let runs = Rc::new(Counter::new(0));
    let counter = Rc::clone(&runs);
    let mut s = sheet().with_executor(move |_: &CompiledQuery| -> CellResult<Computed> {
        counter.set(counter.get() + 1);
        Ok(json!(counter.get() * 100).into())
    });
    let log = record_changes(&mut s);

    s.create_query("budget", "spent", q("transactions").calculate(json!({"$sum": "$amount"})))
        .unwrap();
    assert_eq!(s.get_value("budget!spent"), json!(100));
    assert_eq!(*log.borrow(), vec![vec!["budget!spent".to_string()]]);

    s.trigger_database_changes(&HashMap::new(), &changes(&["transactions"]));
    assert_eq!(runs.get(), 2);
    assert_eq!(s.get_value("budget!spent"), json!(200));
    assert_eq!(log.borrow().len(), 2);
    assert_eq!(log.borrow()[1], vec!["budget!spent".to_string()]);
}

#[test]
fn test_unrelated_table_change_is_ignored() {
    let runs = Rc::new(Counter::new(0));
    let counter = Rc::clone(&runs);
    let mut s = sheet().with_executor(move |_: &CompiledQuery| -> CellResult<Computed> {
        counter.set(counter.get() + 1);
        Ok(Value::Null.into())
    });

    s.create_query("budget", "spent", q("transactions").select(json!(["payee.name"])))
        .unwrap();
    assert_eq!(runs.get(), 1);

    s.trigger_database_changes(&changes(&["accounts"]), &HashMap::new());
    assert_eq!(runs.get(), 1);

    // joined tables count as dependencies
    s.trigger_database_changes(&changes(&["payees"]), &HashMap::new());
    assert_eq!(runs.get(), 2);
}

#[test]
fn test_rebinding_same_query_skips_compile_but_recomputes() {
    let runs = Rc::new(Counter::new(0));
    let counter = Rc::clone(&runs);
    let mut s = sheet().with_executor(move |_: &CompiledQuery| -> CellResult<Computed> {
        counter.set(counter.get() + 1);
        Ok(Value::Null.into())
    });

    let query = q("transactions");
    s.create_query("", "rows", query.clone()).unwrap();
    s.create_query("", "rows", query).unwrap();
    assert_eq!(runs.get(), 2);
}

#[test]
fn test_query_cell_compile_error() {
    let mut s = sheet();
    let err = s.create_query("", "bad", q("budgets")).unwrap_err();
    assert_eq!(err.kind.to_string(), "Table \"budgets\" does not exist in the schema");
    assert!(!s.has_cell("bad"));
}

#[test]
fn test_query_cell_without_executor_fails_batch() {
    let mut s = sheet();
    s.create_query("", "rows", q("transactions")).unwrap();
    assert!(matches!(s.last_error(), Some(CellError::NoExecutor(_))));
    assert!(!s.is_running());
}

// ============================================================================
// Dynamic cells and transactions
// ============================================================================

#[test]
fn test_dynamic_chain() {
    let mut s = sheet();
    s.create_static("budget", "income", json!(1000));
    s.create_static("budget", "rent", json!(-600));
    s.create_dynamic("budget", "left", DynamicCell::new(&["income", "rent"], sum_inputs))
        .unwrap();
    s.create_dynamic(
        "report",
        "double",
        DynamicCell::new(&["budget!left"], |args: &[Value]| {
            Ok(json!(args[0].as_i64().unwrap_or(0) * 2).into())
        }),
    )
    .unwrap();
    assert_eq!(s.get_value("report!double"), json!(800));

    s.set("budget!rent", json!(-700));
    assert_eq!(s.get_value("budget!left"), json!(300));
    assert_eq!(s.get_value("report!double"), json!(600));
}

#[test]
fn test_nested_transactions_compute_once() {
    let runs = Rc::new(Counter::new(0));
    let counter = Rc::clone(&runs);
    let mut s = sheet();
    s.create_static("", "a", json!(1));
    s.create_static("", "b", json!(2));
    s.create_dynamic(
        "",
        "total",
        DynamicCell::new(&["a", "b"], move |args: &[Value]| {
            counter.set(counter.get() + 1);
            sum_inputs(args)
        }),
    )
    .unwrap();
    assert_eq!(runs.get(), 1);

    s.start_transaction();
    s.transaction(|s| {
        s.set("a", json!(10));
        s.set("b", json!(20));
    });
    assert_eq!(runs.get(), 1);
    s.end_transaction();

    assert_eq!(runs.get(), 2);
    assert_eq!(s.get_value("total"), json!(30));
}

#[test]
fn test_one_notification_per_batch() {
    let mut s = sheet();
    s.create_static("", "a", json!(1));
    s.create_dynamic("", "b", DynamicCell::new(&["a"], sum_inputs)).unwrap();
    s.create_dynamic("", "c", DynamicCell::new(&["a", "b"], sum_inputs)).unwrap();
    let log = record_changes(&mut s);

    s.set("a", json!(5));
    assert_eq!(
        *log.borrow(),
        vec![vec!["a".to_string(), "b".to_string(), "c".to_string()]]
    );
    assert_eq!(s.get_value("c"), json!(10));
}

#[test]
fn test_cycle_rejected() {
    let mut s = sheet();
    s.create_dynamic("", "a", DynamicCell::new(&["b"], sum_inputs)).unwrap();
    let err = s
        .create_dynamic("", "b", DynamicCell::new(&["a"], sum_inputs))
        .unwrap_err();
    assert!(matches!(err, CellError::Graph(GraphError::Cycle { .. })));

    let err = s
        .create_dynamic("", "c", DynamicCell::new(&["c"], sum_inputs))
        .unwrap_err();
    assert!(matches!(err, CellError::Graph(GraphError::Cycle { .. })));
}

#[test]
fn test_rebind_requires_refresh() {
    let mut s = sheet();
    s.create_static("", "a", json!(1));
    s.create_dynamic("", "x", DynamicCell::new(&["a"], sum_inputs)).unwrap();
    s.create_dynamic("", "x", DynamicCell::new(&["a"], |_: &[Value]| Ok(json!(99).into())))
        .unwrap();
    assert_eq!(s.get_value("x"), json!(1));

    s.create_dynamic(
        "",
        "x",
        DynamicCell::new(&["a"], |_: &[Value]| Ok(json!(99).into())).with_refresh(),
    )
    .unwrap();
    assert_eq!(s.get_value("x"), json!(99));
}

#[test]
fn test_add_and_remove_dependencies() {
    let mut s = sheet();
    s.create_static("", "a", json!(1));
    s.create_static("", "b", json!(2));
    s.create_dynamic("", "sum", DynamicCell::new(&["a"], sum_inputs)).unwrap();

    s.add_dependencies("", "sum", &["b"]).unwrap();
    assert_eq!(s.get_value("sum"), json!(3));
    assert_eq!(s.get("sum").unwrap().dependencies, vec!["a", "b"]);

    s.remove_dependencies("", "sum", &["a"]).unwrap();
    assert_eq!(s.get_value("sum"), json!(2));

    s.set("a", json!(100));
    assert_eq!(s.get_value("sum"), json!(2));
}

#[test]
fn test_failure_discards_rest_of_queue() {
    let downstream_runs = Rc::new(Counter::new(0));
    let counter = Rc::clone(&downstream_runs);
    let mut s = sheet();
    s.create_static("", "a", json!(1));
    s.create_dynamic(
        "",
        "after",
        DynamicCell::new(&["bad"], move |_: &[Value]| {
            counter.set(counter.get() + 1);
            Ok(json!("ran").into())
        }),
    )
    .unwrap();
    assert_eq!(downstream_runs.get(), 1);

    s.create_dynamic(
        "",
        "bad",
        DynamicCell::new(&["a"], |_: &[Value]| Err(CellError::computation("bad", "boom"))),
    )
    .unwrap();
    assert_eq!(downstream_runs.get(), 1);
    assert!(!s.is_running());
    assert_eq!(s.get_value("after"), json!("ran"));

    // the queue is free for the next batch
    s.set("x", json!(1));
    assert_eq!(s.get_value("x"), json!(1));
}

// ============================================================================
// Deferred values
// ============================================================================

#[tokio::test]
async fn test_deferred_value_suspends_queue() {
    let (tx, rx) = tokio::sync::oneshot::channel::<i64>();
    let slot = Rc::new(RefCell::new(Some(rx)));

    let mut s = sheet();
    s.create_dynamic(
        "budget",
        "remote",
        DynamicCell::new(&[], move |_: &[Value]| {
            let rx = slot.borrow_mut().take();
            Ok(Computed::deferred(async move {
                match rx {
                    Some(rx) => rx
                        .await
                        .map(|v| json!(v))
                        .map_err(|_| CellError::computation("budget!remote", "sender dropped")),
                    None => Ok(Value::Null),
                }
            }))
        }),
    )
    .unwrap();
    s.create_dynamic("budget", "double", DynamicCell::new(&["remote", "remote"], sum_inputs))
        .unwrap();

    assert!(s.is_running());
    assert_eq!(s.get_value("budget!double"), Value::Null);

    // joins the in-flight queue instead of starting another
    s.set("budget!other", json!(7));
    assert_eq!(s.get_value("budget!other"), json!(7));
    assert!(s.is_running());

    tx.send(21).unwrap();
    s.wait_for_computations().await.unwrap();

    assert!(!s.is_running());
    assert_eq!(s.get_value("budget!remote"), json!(21));
    assert_eq!(s.get_value("budget!double"), json!(42));
}

#[tokio::test]
async fn test_deferred_failure_is_reported() {
    let mut s = sheet();
    s.create_dynamic(
        "",
        "slow",
        DynamicCell::new(&[], |_: &[Value]| {
            Ok(Computed::deferred(async {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                Err(CellError::computation("slow", "timed out upstream"))
            }))
        }),
    )
    .unwrap();

    let err = s.wait_for_computations().await.unwrap_err();
    assert!(matches!(err, CellError::Computation { .. }));
    assert!(!s.is_running());
    assert!(s.wait_for_computations().await.is_ok());
}

// ============================================================================
// Cache
// ============================================================================

#[test]
fn test_cache_barrier_holds_status_dirty() {
    let statuses = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&statuses);
    let mut s = sheet();
    s.on_cache_status(move |status| sink.borrow_mut().push(status));

    s.start_cache_barrier();
    s.set("a", json!(1));
    s.set("b", json!(2));
    assert_eq!(*statuses.borrow(), vec![CacheStatus::Dirty]);
    assert_eq!(s.cache_status(), CacheStatus::Dirty);

    s.end_cache_barrier();
    assert_eq!(*statuses.borrow(), vec![CacheStatus::Dirty, CacheStatus::Clean]);
}

#[test]
fn test_cache_barrier_alone_leaves_status() {
    let statuses = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&statuses);
    let mut s = sheet();
    s.on_cache_status(move |status| sink.borrow_mut().push(status));

    s.start_cache_barrier();
    assert_eq!(s.cache_status(), CacheStatus::Clean);
    s.end_cache_barrier();
    assert_eq!(s.cache_status(), CacheStatus::Clean);
    assert!(statuses.borrow().is_empty());
}

#[test]
fn test_saved_values_prewarm_next_session() {
    let cache = Rc::new(CellCache::open_in_memory().unwrap());

    let mut first = sheet();
    let store = Rc::clone(&cache);
    first.on_save_cache(move |cells| store.save_cells(cells).unwrap());
    first.create_static("budget", "a", json!(4));
    first
        .create_dynamic("budget", "sq", DynamicCell::new(&["a"], |args: &[Value]| {
            let n = args[0].as_i64().unwrap_or(0);
            Ok(json!(n * n).into())
        }))
        .unwrap();
    assert_eq!(cache.get("budget!sq").unwrap(), Some(json!(16)));

    let runs = Rc::new(Counter::new(0));
    let counter = Rc::clone(&runs);
    let mut second = sheet();
    second.load_cache(cache.load_cells().unwrap());
    second
        .create_dynamic("budget", "sq", DynamicCell::new(&["a"], move |_: &[Value]| {
            counter.set(counter.get() + 1);
            Ok(json!(0).into())
        }))
        .unwrap();
    assert_eq!(runs.get(), 0);
    assert_eq!(second.get_value("budget!sq"), json!(16));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_unbind_void_delete() {
    let mut s = sheet();
    s.create_static("", "a", json!(1));
    s.create_dynamic("", "b", DynamicCell::new(&["a"], sum_inputs)).unwrap();

    s.unbind("b");
    s.set("a", json!(5));
    assert_eq!(s.get_value("b"), json!(1));

    s.void_cell("b");
    assert_eq!(s.get_value("b"), Value::Null);
    assert!(s.has_cell("b"));

    s.delete_cell("b");
    assert!(!s.has_cell("b"));
    assert!(matches!(s.get("b"), Err(CellError::UnknownCell(_))));
}

#[test]
fn test_clear_sheet() {
    let mut s = sheet();
    s.create_static("budget", "a", json!(1));
    s.create_static("budget", "b", json!(2));
    s.create_static("report", "a", json!(3));
    assert_eq!(s.get_cell_names("budget"), vec!["budget!a", "budget!b"]);

    s.clear_sheet("budget");
    assert!(s.get_cell_names("budget").is_empty());
    assert_eq!(s.get_cell_names("report"), vec!["report!a"]);
}

#[test]
fn test_dot_export() {
    let mut s = sheet();
    s.create_static("budget", "a", json!(1));
    s.create_dynamic("budget", "b", DynamicCell::new(&["a"], sum_inputs)).unwrap();
    assert_eq!(s.generate_dot(), "digraph G {\n  budget_a -> {budget_b}\n}");
}
