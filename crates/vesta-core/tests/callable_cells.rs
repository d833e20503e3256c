//! Integration tests for invoking cells outside the reactive flow.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use vesta_core::{
    CellRecord, Error, FnCompiler, NotebookSession, RuntimeConfig, async_body, sync_body,
};

// =============================================================================
// Test Helpers
// =============================================================================

struct Counters {
    a: Arc<AtomicUsize>,
    b: Arc<AtomicUsize>,
}

fn chain(counters: &Counters) -> FnCompiler {
    let a_runs = counters.a.clone();
    let b_runs = counters.b.clone();
    FnCompiler::new()
        .with(
            "a",
            sync_body(move |s| {
                a_runs.fetch_add(1, Ordering::SeqCst);
                s.define("x", json!(1))
            }),
        )
        .with(
            "b",
            sync_body(move |s| {
                b_runs.fetch_add(1, Ordering::SeqCst);
                let x: i64 = s.get_as("x")?;
                if x < 0 {
                    return Err("x must be positive".into());
                }
                s.define("y", json!(x + 1))
            }),
        )
        .with(
            "c",
            sync_body(|s| {
                let y: i64 = s.get_as("y")?;
                s.print(format!("y = {}", y));
                s.define("z", json!(y * 10))
            }),
        )
}

fn records() -> Vec<CellRecord> {
    vec![
        CellRecord::new(0, "a", "").with_contract(&[], &["x"]),
        CellRecord::new(1, "b", "").with_contract(&["x"], &["y"]),
        CellRecord::new(2, "c", "").with_contract(&["y"], &["z"]),
    ]
}

async fn loaded(counters: &Counters) -> NotebookSession {
    let (session, _rx) = NotebookSession::new(RuntimeConfig::default(), chain(counters)).unwrap();
    session.load(records()).await.unwrap();
    session
}

fn counters() -> Counters {
    Counters {
        a: Arc::new(AtomicUsize::new(0)),
        b: Arc::new(AtomicUsize::new(0)),
    }
}

// =============================================================================
// Invocation
// =============================================================================

#[tokio::test]
async fn test_override_skips_upstream_producers() {
    let counters = counters();
    let session = loaded(&counters).await;
    let registry = session.registry().unwrap();

    let c = registry.get("c").unwrap();
    assert_eq!(c.parameters(), vec!["y".to_string()]);

    let invocation = c.invoke([("y", json!(5))]).await.unwrap();
    assert_eq!(invocation.definitions["z"], json!(50));
    assert_eq!(invocation.output, "y = 5\n");
    assert_eq!(counters.a.load(Ordering::SeqCst), 0);
    assert_eq!(counters.b.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invocation_runs_upstream_in_isolation() {
    let counters = counters();
    let session = loaded(&counters).await;
    let registry = session.registry().unwrap();

    let invocation = registry
        .get("c")
        .unwrap()
        .invoke(Vec::<(String, serde_json::Value)>::new())
        .await
        .unwrap();
    assert_eq!(invocation.definitions["z"], json!(20));
    assert_eq!(counters.a.load(Ordering::SeqCst), 1);

    // The live namespace is untouched
    assert!(session.definitions().is_empty());
}

#[tokio::test]
async fn test_override_of_deeper_name_still_runs_nearer_producer() {
    let counters = counters();
    let session = loaded(&counters).await;

    let invocation = session
        .registry()
        .unwrap()
        .get("c")
        .unwrap()
        .invoke([("x", json!(7))])
        .await
        .unwrap();
    assert_eq!(invocation.definitions["z"], json!(80));
    assert_eq!(counters.a.load(Ordering::SeqCst), 0);
    assert_eq!(counters.b.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invocation_reads_live_values() {
    let counters = counters();
    let session = loaded(&counters).await;
    session.run().await.unwrap();
    let before = session.definitions();

    let invocation = session
        .registry()
        .unwrap()
        .get("c")
        .unwrap()
        .invoke(Vec::<(String, serde_json::Value)>::new())
        .await
        .unwrap();
    assert_eq!(invocation.definitions["z"], json!(20));
    assert_eq!(session.definitions(), before);
}

#[tokio::test]
async fn test_upstream_failure_is_an_execution_error() {
    let counters = counters();
    let session = loaded(&counters).await;

    let err = session
        .registry()
        .unwrap()
        .get("c")
        .unwrap()
        .invoke([("x", json!(-1))])
        .await
        .unwrap_err();
    match err {
        Error::Execution { cell, message } => {
            assert_eq!(cell, "b");
            assert_eq!(message, "x must be positive");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unknown_name_has_no_callable() {
    let counters = counters();
    let session = loaded(&counters).await;
    let registry = session.registry().unwrap();
    assert!(registry.get("missing").is_none());
    assert_eq!(registry.names(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_isolated_setter_does_not_touch_live_state() {
    let compiler = FnCompiler::new()
        .with(
            "a",
            sync_body(|s| {
                s.state("count", json!(0))?;
                Ok(())
            }),
        )
        .with(
            "bump",
            sync_body(|s| {
                let count = s.holder("count")?;
                s.set_state(&count, json!(99))?;
                s.define("bumped", json!(true))
            }),
        );
    let (session, _rx) = NotebookSession::new(RuntimeConfig::default(), compiler).unwrap();
    session
        .load(vec![
            CellRecord::new(0, "a", "").with_contract(&[], &["count"]),
            CellRecord::new(1, "bump", "").with_contract(&["count"], &["bumped"]),
        ])
        .await
        .unwrap();

    let invocation = session
        .registry()
        .unwrap()
        .get("bump")
        .unwrap()
        .invoke(Vec::<(String, serde_json::Value)>::new())
        .await
        .unwrap();
    assert_eq!(invocation.definitions["bumped"], json!(true));
    // Holders created by the isolated run of `a` are never registered
    assert!(session.holder_named("count").is_none());
}

#[tokio::test]
async fn test_async_upstream_is_awaited() {
    let compiler = FnCompiler::new()
        .with(
            "fetch",
            async_body(|s| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    s.define("rows", json!([1, 2, 3]))
                })
            }),
        )
        .with(
            "total",
            sync_body(|s| {
                let rows: Vec<i64> = s.get_as("rows")?;
                s.define("sum", json!(rows.iter().sum::<i64>()))
            }),
        );
    let (session, _rx) = NotebookSession::new(RuntimeConfig::default(), compiler).unwrap();
    session
        .load(vec![
            CellRecord::new(0, "fetch", "").with_contract(&[], &["rows"]),
            CellRecord::new(1, "total", "").with_contract(&["rows"], &["sum"]),
        ])
        .await
        .unwrap();

    let invocation = session
        .registry()
        .unwrap()
        .get("total")
        .unwrap()
        .invoke(Vec::<(String, serde_json::Value)>::new())
        .await
        .unwrap();
    assert_eq!(invocation.definitions["sum"], json!(6));
    assert!(session.value("rows").is_none());
}

#[tokio::test]
async fn test_panic_message_is_kept() {
    let compiler = FnCompiler::new().with("p", sync_body(|_| panic!("bad input")));
    let (session, _rx) = NotebookSession::new(RuntimeConfig::default(), compiler).unwrap();
    session
        .load(vec![CellRecord::new(0, "p", "").with_contract(&[], &["out"])])
        .await
        .unwrap();

    let err = session
        .registry()
        .unwrap()
        .get("p")
        .unwrap()
        .invoke(Vec::<(String, serde_json::Value)>::new())
        .await
        .unwrap_err();
    match err {
        Error::Execution { cell, message } => {
            assert_eq!(cell, "p");
            assert_eq!(message, "cell panicked: bad input");
        }
        other => panic!("unexpected error: {other}"),
    }
}
