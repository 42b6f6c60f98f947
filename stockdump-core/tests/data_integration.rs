//! Integration tests for the data layer: dump store → parser → table.

use chrono::NaiveDate;
use stockdump_core::data::{
    parse_payload, ConsolidatedTable, DumpStore, StoreError, SymbolOutcome, TableBuilder,
    TableFormat,
};
use stockdump_core::domain::Symbol;
use tempfile::TempDir;

fn sym(s: &str) -> Symbol {
    Symbol::parse(s).unwrap()
}

fn chart(timestamps: &[i64], closes: &[Option<f64>]) -> String {
    let ts: Vec<String> = timestamps.iter().map(|t| t.to_string()).collect();
    let cl: Vec<String> = closes
        .iter()
        .map(|c| c.map_or("null".to_string(), |v| v.to_string()))
        .collect();
    format!(
        r#"{{"chart":{{"result":[{{"meta":{{"gmtoffset":-18000}},"timestamp":[{ts}],
        "indicators":{{"quote":[{{"open":[{cl}],"high":[{cl}],"low":[{cl}],"close":[{cl}],
        "volume":[{vol}]}}],"adjclose":[{{"adjclose":[{cl}]}}]}}}}],"error":null}}}}"#,
        ts = ts.join(","),
        cl = cl.join(","),
        vol = vec!["1000"; timestamps.len()].join(","),
    )
}

/// 2024-01-02 and 2024-01-03, 14:30 UTC.
const JAN2: i64 = 1_704_205_800;
const JAN3: i64 = 1_704_292_200;

fn consolidate(store: &DumpStore) -> TableBuilder {
    let mut builder = TableBuilder::new();
    for dump in store.list().unwrap() {
        let outcome = match store
            .read_payload(&dump.symbol, None)
            .map_err(|e| e.to_string())
            .and_then(|body| parse_payload(&dump.symbol, &body, None).map_err(|e| e.to_string()))
        {
            Ok(records) => SymbolOutcome::Parsed {
                symbol: dump.symbol,
                records,
            },
            Err(reason) => SymbolOutcome::Skipped {
                symbol: dump.symbol,
                reason,
            },
        };
        builder.push(outcome);
    }
    builder
}

#[test]
fn store_to_table_orders_rows_and_survives_corruption() {
    let dir = TempDir::new().unwrap();
    let store = DumpStore::new(dir.path().join("raw"));
    store.ensure_root().unwrap();

    let aapl = chart(&[JAN2, JAN3], &[Some(185.64), Some(184.25)]);
    let msft = chart(&[JAN2], &[Some(370.87)]);
    store.write_dump(&sym("MSFT"), msft.as_bytes(), 3).unwrap();
    store.write_dump(&sym("AAPL"), aapl.as_bytes(), 3).unwrap();

    // Truncated compressed stream for a third symbol.
    let good = std::fs::read(store.path_for(&sym("MSFT"))).unwrap();
    std::fs::write(store.path_for(&sym("TSLA")), &good[..good.len() / 2]).unwrap();

    let build = consolidate(&store).finish();
    let keys: Vec<(String, NaiveDate)> = build
        .table
        .rows()
        .iter()
        .map(|r| (r.symbol.to_string(), r.date))
        .collect();

    assert_eq!(
        keys,
        vec![
            ("AAPL".to_string(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            ("AAPL".to_string(), NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()),
            ("MSFT".to_string(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
        ]
    );
    assert_eq!(build.skipped.len(), 1);
    assert_eq!(build.skipped[0].symbol, sym("TSLA"));
}

#[test]
fn consolidating_twice_gives_identical_records() {
    let dir = TempDir::new().unwrap();
    let store = DumpStore::new(dir.path().join("raw"));
    store.ensure_root().unwrap();
    store
        .write_dump(&sym("SPY"), chart(&[JAN2, JAN3], &[Some(472.65), None]).as_bytes(), 3)
        .unwrap();

    let out = dir.path().join("dump.parquet");
    let first = consolidate(&store).finish().table;
    first.write(&out, TableFormat::Parquet).unwrap();
    let read_first = ConsolidatedTable::read(&out, TableFormat::Parquet).unwrap();

    let second = consolidate(&store).finish().table;
    second.write(&out, TableFormat::Parquet).unwrap();
    let read_second = ConsolidatedTable::read(&out, TableFormat::Parquet).unwrap();

    assert_eq!(read_first, read_second);
    assert_eq!(read_first.rows()[1].close, None);
}

#[test]
fn zero_byte_dump_is_corrupt_not_fatal() {
    let dir = TempDir::new().unwrap();
    let store = DumpStore::new(dir.path());
    std::fs::write(store.path_for(&sym("EMPTY")), b"").unwrap();

    let err = store.read_payload(&sym("EMPTY"), None).unwrap_err();
    assert!(matches!(err, StoreError::CorruptDump { .. }));

    let build = consolidate(&store).finish();
    assert!(build.table.is_empty());
    assert_eq!(build.skipped.len(), 1);
}
