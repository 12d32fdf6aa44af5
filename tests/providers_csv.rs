// tests/providers_csv.rs
mod common;

use std::fs;
use std::sync::Arc;

use common::{build, test_config};
use crypto_market_etl::ingest::checkpoint::CheckpointStatus;
use crypto_market_etl::ingest::providers::CsvFileAdapter;
use crypto_market_etl::ingest::types::{RunStatus, SourceId};
use crypto_market_etl::storage::{MemoryStorage, Storage};
use crypto_market_etl::SourceAdapter;

const SNAPSHOT: &str = "\
coin_id,symbol,name,price,market_cap,volume,change_24h,rank
bitcoin,btc,Bitcoin,\"$64,000.50\",1260000000000,31000000000,-1.2,1
ethereum,eth,Ethereum,3100,370000000000,15000000000,0.8,2
tether,usdt,Tether,,,,,
broken,brk,Broken,-5,,,,9
";

#[tokio::test]
async fn snapshot_file_loads_with_bad_rows_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("crypto_data.csv");
    fs::write(&file, SNAPSHOT).unwrap();

    let storage = Arc::new(MemoryStorage::new());
    let (orch, _tx) = build(
        &test_config(3, 60),
        storage.clone(),
        vec![Arc::new(CsvFileAdapter::new(file.clone())) as Arc<dyn SourceAdapter>],
    );

    let run = orch.run_one(SourceId::Csv).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.records_extracted, 4);
    assert_eq!(run.records_loaded, 3);
    assert_eq!(run.records_rejected, 1);

    let tether = storage.get_coin("tether").await.unwrap().unwrap();
    assert_eq!(tether.symbol, "USDT");
    assert_eq!(tether.price_usd, None);
    assert_eq!(tether.market_rank, None);
    let btc = storage.get_coin("bitcoin").await.unwrap().unwrap();
    assert_eq!(btc.price_usd, Some(64000.5));
    assert_eq!(btc.price_change_24h_pct, Some(-1.2));

    let cp = storage.load_checkpoint(SourceId::Csv).await.unwrap();
    assert_eq!(cp.last_status, CheckpointStatus::Success);
    assert_eq!(cp.cursor, None);

    // edit one price and re-run: one update, the rest unchanged
    fs::write(&file, SNAPSHOT.replace(",3100,", ",3150,")).unwrap();
    let rerun = orch.run_one(SourceId::Csv).await.unwrap();
    assert_eq!(rerun.records_loaded, 1);
    assert_eq!(rerun.records_unchanged, 2);
    assert_eq!(
        storage.get_coin("ethereum").await.unwrap().unwrap().price_usd,
        Some(3150.0)
    );
}

#[tokio::test]
async fn missing_file_is_an_empty_successful_run() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("crypto_data.csv");
    let storage = Arc::new(MemoryStorage::new());
    let (orch, _tx) = build(
        &test_config(3, 60),
        storage.clone(),
        vec![Arc::new(CsvFileAdapter::new(file.clone())) as Arc<dyn SourceAdapter>],
    );

    let run = orch.run_one(SourceId::Csv).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.records_extracted, 0);
    assert_eq!(run.batches_loaded, 0);
    assert_eq!(storage.coin_count(), 0);
    let cp = storage.load_checkpoint(SourceId::Csv).await.unwrap();
    assert_eq!(cp.last_success_at, None, "nothing was loaded");

    // a real load, then the file disappears: the success mark stays put
    fs::write(&file, SNAPSHOT).unwrap();
    let loaded = orch.run_one(SourceId::Csv).await.unwrap();
    assert_eq!(loaded.batches_loaded, 1);
    fs::remove_file(&file).unwrap();

    let empty = orch.run_one(SourceId::Csv).await.unwrap();
    assert_eq!(empty.status, RunStatus::Success);
    assert_eq!(empty.batches_loaded, 0);
    let cp = storage.load_checkpoint(SourceId::Csv).await.unwrap();
    assert_eq!(cp.last_success_at, Some(loaded.ended_at));
    assert_eq!(storage.coin_count(), 3);
}
