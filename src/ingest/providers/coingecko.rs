// src/ingest/providers/coingecko.rs
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
    price_usd: &["/current_price"],
    market_cap_usd: &["/market_cap"],
    volume_24h_usd: &["/total_volume"],
    price_change_24h_pct: &["/price_change_percentage_24h"],
    market_rank: &["/market_cap_rank"],
};

/// `/coins/markets`, one page per batch.
pub struct CoinGeckoAdapter {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
    per_page: u32,
    max_pages: u32,
}

impl CoinGeckoAdapter {
    pub fn new(
        http: HttpClient,
        base_url: &str,
        api_key: Option<String>,
        per_page: u32,
        max_pages: u32,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            per_page,
            max_pages,
        }
    }
}

#[async_trait]
impl SourceAdapter for CoinGeckoAdapter {
    fn source(&self) -> SourceId {
        SourceId::CoinGecko
    }

    fn kind(&self) -> SourceKind {
        SourceKind::PaginatedApi
    }

    async fn fetch(&self, request: BatchRequest) -> Result<Option<RawBatch>, EtlError> {
        if request.page > self.max_pages {
            return Ok(None);
        }
        let url = format!("{}/coins/markets", self.base_url);
        let query = [
            ("vs_currency", "usd".to_string()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", self.per_page.to_string()),
            ("page", request.page.to_string()),
            ("sparkline", "false".to_string()),
        ];
        let mut headers = Vec::new();
        if let Some(key) = self.api_key.as_deref() {
            headers.push(("x-cg-demo-api-key", key));
        }

        let t0 = std::time::Instant::now();
        let body = self.http.get_text(&url, &query, &headers).await?;
        histogram!("etl_fetch_ms", "source" => "coingecko").record(t0.elapsed().as_secs_f64() * 1_000.0);

        // an empty page ends the sequence
        if body.trim() == "[]" {
            return Ok(None);
        }
        Ok(Some(RawBatch {
            source: SourceId::CoinGecko,
            page: request.page,
            fetched_at: Utc::now(),
            payload: RawPayload::Json(body),
        }))
    }

    fn next(&self, request: BatchRequest, _batch: &RawBatch) -> Option<BatchRequest> {
        (request.page < self.max_pages).then(|| request.next())
    }

    fn transform(&self, batch: &RawBatch) -> Result<TransformedBatch, TransformError> {
        transform_json_array(batch, &FIELDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn adapter(max_pages: u32) -> CoinGeckoAdapter {
        let http = HttpClient::new(Duration::from_secs(1)).unwrap();
        CoinGeckoAdapter::new(http, "http://localhost/api/v3/", None, 2, max_pages)
    }

    fn batch(body: &str) -> RawBatch {
        RawBatch {
            source: SourceId::CoinGecko,
            page: 1,
            fetched_at: Utc::now(),
            payload: RawPayload::Json(body.to_string()),
        }
    }

    #[test]
    fn pages_stop_at_max() {
        let a = adapter(2);
        let b = batch("[]");
        assert_eq!(a.next(BatchRequest::first(), &b), Some(BatchRequest { page: 2 }));
        assert_eq!(a.next(BatchRequest { page: 2 }, &b), None);
    }

    #[test]
    fn maps_market_fields() {
        let a = adapter(1);
        let out = a
            .transform(&batch(
                r#"[{"id":"bitcoin","symbol":"btc","name":"Bitcoin","current_price":64000.5,
                    "market_cap":1.2e12,"total_volume":3.1e10,"price_change_percentage_24h":-1.25,
                    "market_cap_rank":1,"last_updated":"2025-01-01T00:00:00Z"}]"#,
            ))
            .unwrap();
        assert!(out.rejections.is_empty());
        let c = &out.candidates[0];
        assert_eq!(c.canonical_id, "bitcoin");
        assert_eq!(c.symbol, "BTC");
        assert_eq!(c.volume_24h_usd, Some(3.1e10));
        assert_eq!(c.price_change_24h_pct, Some(-1.25));
        assert_eq!(c.market_rank, Some(1));
    }

    #[test]
    fn non_array_body_is_a_transform_error() {
        let a = adapter(1);
        assert!(a.transform(&batch(r#"{"error":"rate limited"}"#)).is_err());
        assert!(a.transform(&batch("<html>")).is_err());
    }
}
