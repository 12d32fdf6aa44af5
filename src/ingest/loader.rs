// src/ingest/loader.rs
//! Writes validated candidates into the shared coin table.
//!
//! The loader is the only writer of coins. Every candidate is one atomic
//! upsert; no lock is held across candidates, so sources load concurrently.

use std::sync::Arc;

use metrics::counter;

use crate::error::EtlError;
use crate::ingest::types::{Coin, LoadCounts, RawRecord, SourceId};
use crate::storage::Storage;

/// Position inside a batch being loaded. A retried load resumes after the
/// last committed candidate, so counts stay exact across retries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadProgress {
    pub next: usize,
    pub counts: LoadCounts,
}

#[derive(Clone)]
pub struct Loader {
    storage: Arc<dyn Storage>,
}

impl Loader {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Append to the audit trail. Failures are logged and swallowed.
    pub async fn record_raw(&self, source: SourceId, records: &[RawRecord]) {
        if records.is_empty() {
            return;
        }
        if let Err(e) = self.storage.append_raw(records).await {
            tracing::warn!(error = %e, source = %source, records = records.len(), "audit write failed");
            counter!("etl_audit_failures_total", "source" => source.as_str()).increment(1);
        }
    }

    /// Upsert `candidates[progress.next..]`, advancing `progress` after
    /// each committed write.
    pub async fn load(
        &self,
        candidates: &[Coin],
        progress: &mut LoadProgress,
    ) -> Result<(), EtlError> {
        while let Some(coin) = candidates.get(progress.next) {
            let outcome = self
                .storage
                .upsert_coin(coin)
                .await
                .map_err(EtlError::Load)?;
            progress.counts.record(outcome);
            progress.next += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use chrono::Utc;

    fn coin(id: &str) -> Coin {
        Coin {
            canonical_id: id.into(),
            symbol: id.to_ascii_uppercase(),
            name: id.into(),
            price_usd: Some(1.0),
            market_cap_usd: None,
            volume_24h_usd: None,
            price_change_24h_pct: None,
            market_rank: None,
            source: SourceId::Csv,
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_load_is_all_unchanged() {
        let loader = Loader::new(Arc::new(MemoryStorage::new()));
        let batch = vec![coin("a"), coin("b")];

        let mut first = LoadProgress::default();
        loader.load(&batch, &mut first).await.unwrap();
        assert_eq!(first.counts.inserted, 2);

        let mut second = LoadProgress::default();
        loader.load(&batch, &mut second).await.unwrap();
        assert_eq!(second.counts.unchanged, 2);
        assert_eq!(second.counts.loaded(), 0);
    }
}
