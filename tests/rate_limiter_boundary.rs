// tests/rate_limiter_boundary.rs
mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use common::{build, page_of, test_config, ScriptedAdapter};
use crypto_market_etl::error::EtlError;
use crypto_market_etl::ingest::rate_limiter::{RateLimitPolicy, TokenBucket, WaitMode};
use crypto_market_etl::ingest::types::{RunStatus, SourceId};
use crypto_market_etl::storage::MemoryStorage;
use crypto_market_etl::SourceAdapter;

fn one_per_second(mode: WaitMode, max_wait_ms: u64) -> RateLimitPolicy {
    RateLimitPolicy {
        capacity: 1,
        refill_tokens: 1,
        refill_interval_ms: 1_000,
        max_wait_ms,
        mode,
    }
}

#[tokio::test(start_paused = true)]
async fn second_call_waits_a_full_refill_interval() {
    let bucket = TokenBucket::new(SourceId::CoinGecko, one_per_second(WaitMode::Block, 10_000));
    let t0 = Instant::now();
    bucket.acquire().await.unwrap();
    assert_eq!(t0.elapsed(), Duration::ZERO);

    bucket.acquire().await.unwrap();
    assert!(t0.elapsed() >= Duration::from_secs(1), "elapsed {:?}", t0.elapsed());
}

#[tokio::test(start_paused = true)]
async fn fail_fast_and_max_wait_surface_rate_limit_errors() {
    let fast = TokenBucket::new(SourceId::CoinGecko, one_per_second(WaitMode::FailFast, 10_000));
    fast.acquire().await.unwrap();
    assert!(matches!(
        fast.acquire().await,
        Err(EtlError::RateLimitExceeded { source_id: SourceId::CoinGecko, .. })
    ));

    let impatient = TokenBucket::new(SourceId::CoinPaprika, one_per_second(WaitMode::Block, 200));
    impatient.acquire().await.unwrap();
    let err = impatient.acquire().await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test(start_paused = true)]
async fn sources_do_not_share_tokens() {
    let gecko = TokenBucket::new(SourceId::CoinGecko, one_per_second(WaitMode::FailFast, 0));
    let paprika = TokenBucket::new(SourceId::CoinPaprika, one_per_second(WaitMode::FailFast, 0));
    gecko.acquire().await.unwrap();
    assert!(gecko.acquire().await.is_err());
    paprika.acquire().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn paginated_run_is_paced_by_its_bucket() {
    let mut cfg = test_config(3, 60);
    cfg.sources
        .get_mut(&SourceId::CoinGecko)
        .unwrap()
        .rate_limit = Some(one_per_second(WaitMode::Block, 10_000));
    let adapter = Arc::new(ScriptedAdapter::paginated(
        SourceId::CoinGecko,
        vec![page_of("a", 1), page_of("b", 1)],
    ));
    let (orch, _tx) = build(
        &cfg,
        Arc::new(MemoryStorage::new()),
        vec![adapter.clone() as Arc<dyn SourceAdapter>],
    );

    let t0 = Instant::now();
    let run = orch.run_one(SourceId::CoinGecko).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    // pages 1, 2 and the terminating empty page 3 each took a token
    assert_eq!(adapter.fetch_log(), vec![1, 2, 3]);
    assert!(t0.elapsed() >= Duration::from_secs(2));
}
