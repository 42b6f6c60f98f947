//! Integration tests for the Dump Fetcher.
//!
//! A ScriptedProvider stands in for the network so retry, rejection,
//! cancellation and concurrency behaviour can be checked deterministically.

mod common;

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::{entry, history_csv, ScriptedProvider};
use stockdump_core::data::{
    parse_payload, Credentials, DumpStore, FailureKind, FetchError, FetchWindow, Manifest,
};
use stockdump_core::domain::{Secret, Symbol};
use stockdump_runner::{
    fetch_plan, plan_fetch, run_fetch, ExitStatus, FetchOptions, FetchRunError, RetryPolicy,
    SilentProgress,
};
use tempfile::TempDir;

fn fast_options(concurrency: usize) -> FetchOptions {
    FetchOptions {
        concurrency,
        retry: RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..FetchOptions::default()
    }
}

fn sym(s: &str) -> Symbol {
    Symbol::parse(s).unwrap()
}

fn new_store(dir: &TempDir, name: &str) -> DumpStore {
    let store = DumpStore::new(dir.path().join(name));
    store.ensure_root().unwrap();
    store
}

#[test]
fn transient_failures_then_success_match_immediate_success() {
    let dir = TempDir::new().unwrap();
    let flaky_store = new_store(&dir, "flaky");
    let clean_store = new_store(&dir, "clean");

    let flaky = ScriptedProvider::new().fail_then_succeed(
        "AAPL",
        vec![FetchError::Timeout, FetchError::ServerError { status: 503 }],
    );
    let clean = ScriptedProvider::new();

    let plan = plan_fetch(vec![entry("AAPL")]);
    let a = fetch_plan(plan.clone(), &flaky_store, &flaky, &fast_options(2), &SilentProgress, None)
        .unwrap();
    let b = fetch_plan(plan, &clean_store, &clean, &fast_options(2), &SilentProgress, None).unwrap();

    assert_eq!(a.exit_status(), ExitStatus::Success);
    assert_eq!(a.succeeded[0].attempts, 3);
    assert_eq!(b.succeeded[0].attempts, 1);
    assert_eq!(flaky.calls_for("AAPL"), 3);

    let payload_a = flaky_store.read_payload(&sym("AAPL"), None).unwrap();
    let payload_b = clean_store.read_payload(&sym("AAPL"), None).unwrap();
    assert_eq!(payload_a, payload_b);
    assert_eq!(payload_a, history_csv("AAPL").into_bytes());
}

#[test]
fn rejection_is_recorded_without_retry_and_siblings_succeed() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, "raw");
    let provider = ScriptedProvider::new().always_fail("NOPE", FetchError::SymbolNotFound);

    let plan = plan_fetch(vec![entry("AAPL"), entry("NOPE"), entry("MSFT")]);
    let summary =
        fetch_plan(plan, &store, &provider, &fast_options(4), &SilentProgress, None).unwrap();

    assert_eq!(summary.exit_status(), ExitStatus::Partial);
    let ok: Vec<&str> = summary.succeeded.iter().map(|s| s.symbol.as_str()).collect();
    assert_eq!(ok, vec!["AAPL", "MSFT"]);

    assert_eq!(summary.failed.len(), 1);
    let failure = &summary.failed[0];
    assert_eq!(failure.symbol, sym("NOPE"));
    assert_eq!(failure.kind, FailureKind::FetchRejected);
    assert_eq!(failure.attempts, 1);
    assert_eq!(provider.calls_for("NOPE"), 1);

    assert!(!store.path_for(&sym("NOPE")).exists());
    assert!(store.path_for(&sym("AAPL")).is_file());
}

#[test]
fn exhausted_retries_are_a_transient_failure() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, "raw");
    let provider = ScriptedProvider::new().always_fail("SLOW", FetchError::Timeout);

    let options = fast_options(1);
    let summary = fetch_plan(
        plan_fetch(vec![entry("SLOW")]),
        &store,
        &provider,
        &options,
        &SilentProgress,
        None,
    )
    .unwrap();

    assert_eq!(summary.failed[0].kind, FailureKind::FetchTransient);
    assert_eq!(summary.failed[0].attempts, options.retry.max_attempts());
    assert_eq!(provider.calls_for("SLOW"), 4);
    assert!(!store.path_for(&sym("SLOW")).exists());
}

#[test]
fn results_do_not_depend_on_worker_count() {
    let symbols = ["AAPL", "AMZN", "GOOG", "META", "MSFT", "NVDA", "TSLA", "SPY", "QQQ", "IWM"];
    let dir = TempDir::new().unwrap();

    let mut runs = Vec::new();
    for (i, concurrency) in [1usize, 8].into_iter().enumerate() {
        let store = new_store(&dir, &format!("run{i}"));
        let provider = ScriptedProvider::new()
            .always_fail("META", FetchError::AuthRejected { status: 401 })
            .fail_then_succeed("NVDA", vec![FetchError::RateLimited { retry_after_secs: 0 }]);
        let plan = plan_fetch(symbols.iter().map(|s| entry(s)).collect());
        let summary = fetch_plan(
            plan,
            &store,
            &provider,
            &fast_options(concurrency),
            &SilentProgress,
            None,
        )
        .unwrap();

        let ok: Vec<String> = summary.succeeded.iter().map(|s| s.symbol.to_string()).collect();
        let failed: Vec<String> = summary.failed.iter().map(|s| s.symbol.to_string()).collect();
        let records: Vec<_> = summary
            .succeeded
            .iter()
            .map(|s| {
                let body = store.read_payload(&s.symbol, None).unwrap();
                parse_payload(&s.symbol, &body, None).unwrap()
            })
            .collect();
        runs.push((ok, failed, records));
    }

    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0].1, vec!["META".to_string()]);
    assert_eq!(runs[0].0.len(), 9);
}

#[test]
fn cancelled_run_issues_no_requests() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, "raw");
    let provider = ScriptedProvider::new();
    let cancel = AtomicBool::new(true);

    let summary = fetch_plan(
        plan_fetch(vec![entry("AAPL"), entry("MSFT")]),
        &store,
        &provider,
        &fast_options(2),
        &SilentProgress,
        Some(&cancel),
    )
    .unwrap();

    assert_eq!(provider.total_calls(), 0);
    assert_eq!(summary.skipped.len(), 2);
    assert!(summary.skipped.iter().all(|s| s.reason == "interrupted"));
    assert_eq!(summary.exit_status(), ExitStatus::Partial);
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn expired_run_deadline_skips_everything() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, "raw");
    let provider = ScriptedProvider::new();
    let options = FetchOptions {
        run_timeout: Some(Duration::ZERO),
        ..fast_options(2)
    };

    let summary = fetch_plan(
        plan_fetch(vec![entry("AAPL")]),
        &store,
        &provider,
        &options,
        &SilentProgress,
        None,
    )
    .unwrap();

    assert_eq!(provider.total_calls(), 0);
    assert_eq!(summary.skipped[0].reason, "run timeout reached");
}

#[test]
fn run_fetch_reads_manifest_and_collapses_days() {
    let dir = TempDir::new().unwrap();
    let manifest = Manifest::new(dir.path().join("manifests").join("yahoo.jsonl"));
    let creds = Credentials {
        crumb: Secret::new("crumbCRUMB"),
        cookie: Secret::new("A3=d=AQAB"),
    };
    let window = FetchWindow::trailing_year(chrono::NaiveDate::from_ymd_opt(2025, 3, 2).unwrap());
    let day1 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    let day2 = Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap();
    manifest.append(&["AAPL", "MSFT"], &creds, window, day1).unwrap();
    manifest.append(&["AAPL"], &creds, window, day2).unwrap();

    let store = DumpStore::new(dir.path().join("raw"));
    let provider = ScriptedProvider::new();
    let summary = run_fetch(
        &manifest,
        &store,
        &provider,
        &fast_options(4),
        &SilentProgress,
        None,
    )
    .unwrap();

    assert_eq!(summary.superseded, 1);
    assert_eq!(summary.succeeded.len(), 2);
    assert_eq!(provider.calls_for("AAPL"), 1);
    assert_eq!(store.list().unwrap().len(), 2);
}

#[test]
fn missing_manifest_is_fatal_before_any_request() {
    let dir = TempDir::new().unwrap();
    let manifest = Manifest::new(dir.path().join("absent.jsonl"));
    let store = DumpStore::new(dir.path().join("raw"));
    let provider = ScriptedProvider::new();

    let err = run_fetch(
        &manifest,
        &store,
        &provider,
        &fast_options(1),
        &SilentProgress,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, FetchRunError::Manifest(_)));
    assert_eq!(provider.total_calls(), 0);
    assert!(!store.root().exists());
}

#[test]
fn unusable_dump_directory_is_fatal() {
    let dir = TempDir::new().unwrap();
    let manifest = Manifest::new(dir.path().join("yahoo.jsonl"));
    let creds = Credentials {
        crumb: Secret::new("crumbCRUMB"),
        cookie: Secret::new("A3=d=AQAB"),
    };
    let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    manifest
        .append(&["SPY"], &creds, FetchWindow::trailing_year(now.date_naive()), now)
        .unwrap();

    // A regular file where the dump directory should be.
    let blocker = dir.path().join("raw");
    std::fs::write(&blocker, b"not a dir").unwrap();
    let store = DumpStore::new(&blocker);
    let provider = ScriptedProvider::new();

    let err = run_fetch(
        &manifest,
        &store,
        &provider,
        &fast_options(1),
        &SilentProgress,
        None,
    )
    .unwrap_err();
    assert!(matches!(err, FetchRunError::Store(_)));
    assert_eq!(provider.total_calls(), 0);
}
