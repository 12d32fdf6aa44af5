// src/ingest/providers/coinpaprika.rs
use async_trait::async_trait;
use chrono::Utc;
use metrics::histogram;

use crate::error::{EtlError, TransformError};
use crate::ingest::normalize::FieldMap;
use crate::ingest::providers::{http::HttpClient, transform_json_array, SourceAdapter};
use crate::ingest::types::{
    BatchRequest, RawBatch, RawPayload, SourceId, SourceKind, TransformedBatch,
};

const FIELDS: FieldMap = FieldMap {
    id: &["/id"],
    symbol: &["/symbol"],
    name: &["/name"],
    price_usd: &["/quotes/USD/price"],
    market_cap_usd: &["/quotes/USD/market_cap"],
    volume_24h_usd: &["/quotes/USD/volume_24h"],
    price_change_24h_pct: &["/quotes/USD/percent_change_24h"],
    market_rank: &["/rank"],
};

/// `/tickers`, the whole listing in a single call.
pub struct CoinPaprikaAdapter {
    http: HttpClient,
    base_url: String,
    limit: u32,
}

impl CoinPaprikaAdapter {
    pub fn new(http: HttpClient, base_url: &str, limit: u32) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            limit,
        }
    }
}

#[async_trait]
impl SourceAdapter for CoinPaprikaAdapter {
    fn source(&self) -> SourceId {
        SourceId::CoinPaprika
    }

    fn kind(&self) -> SourceKind {
        SourceKind::SimpleApi
    }

    async fn fetch(&self, request: BatchRequest) -> Result<Option<RawBatch>, EtlError> {
        let url = format!("{}/tickers", self.base_url);
        let t0 = std::time::Instant::now();
        let body = self
            .http
            .get_text(&url, &[("limit", self.limit.to_string())], &[])
            .await?;
        histogram!("etl_fetch_ms", "source" => "coinpaprika").record(t0.elapsed().as_secs_f64() * 1_000.0);

        Ok(Some(RawBatch {
            source: SourceId::CoinPaprika,
            page: request.page,
            fetched_at: Utc::now(),
            payload: RawPayload::Json(body),
        }))
    }

    fn transform(&self, batch: &RawBatch) -> Result<TransformedBatch, TransformError> {
        transform_json_array(batch, &FIELDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn nested_usd_quotes_are_mapped() {
        let http = HttpClient::new(Duration::from_secs(1)).unwrap();
        let a = CoinPaprikaAdapter::new(http, "http://localhost/v1", 10);
        let batch = RawBatch {
            source: SourceId::CoinPaprika,
            page: 1,
            fetched_at: Utc::now(),
            payload: RawPayload::Json(
                r#"[{"id":"btc-bitcoin","symbol":"BTC","name":"Bitcoin","rank":1,
                     "quotes":{"USD":{"price":64000.0,"market_cap":1.2e12,"volume_24h":2.0e10,
                     "percent_change_24h":0.5}}},
                    {"id":"eth-ethereum","symbol":"ETH","name":"Ethereum","rank":2,
                     "quotes":{"USD":{"price":-1}}}]"#
                    .to_string(),
            ),
        };
        let out = a.transform(&batch).unwrap();
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].canonical_id, "bitcoin");
        assert_eq!(out.candidates[0].price_usd, Some(64000.0));
        assert_eq!(out.rejections.len(), 1);
        assert_eq!(out.rejections[0].field, "price_usd");
        // no second page for a simple source
        assert_eq!(a.next(BatchRequest::first(), &batch), None);
    }
}
