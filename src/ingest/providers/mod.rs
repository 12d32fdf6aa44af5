// src/ingest/providers/mod.rs
pub mod coingecko;
pub mod coinpaprika;
pub mod csv_file;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{EtlConfig, SourceConfig};
use crate::error::{EtlError, TransformError};
use crate::ingest::checkpoint::Checkpoint;
use crate::ingest::normalize::{transform_records, FieldMap};
use crate::ingest::rate_limiter::TokenBucket;
use crate::ingest::types::{
    BatchRequest, RawBatch, RawPayload, SourceId, SourceKind, TransformedBatch,
};

pub use coingecko::CoinGeckoAdapter;
pub use coinpaprika::CoinPaprikaAdapter;
pub use csv_file::CsvFileAdapter;
pub use http::HttpClient;

/// Uniform extract/transform contract over every source kind.
///
/// `fetch` must be repeatable: fetching the same request against an
/// unchanged upstream yields an equivalent batch, so a failed batch can be
/// retried or re-run from the checkpoint.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceId;

    fn kind(&self) -> SourceKind;

    /// First request of a run. Only paginated sources resume from the cursor.
    fn start(&self, checkpoint: &Checkpoint) -> BatchRequest {
        match self.kind() {
            SourceKind::PaginatedApi => checkpoint.resume_request(),
            SourceKind::SimpleApi | SourceKind::StaticFile => BatchRequest::first(),
        }
    }

    /// One raw batch, or `None` once the source has nothing more to give.
    async fn fetch(&self, request: BatchRequest) -> Result<Option<RawBatch>, EtlError>;

    /// Request following a successfully fetched batch, if any.
    fn next(&self, _request: BatchRequest, _batch: &RawBatch) -> Option<BatchRequest> {
        None
    }

    fn transform(&self, batch: &RawBatch) -> Result<TransformedBatch, TransformError>;
}

/// Lazy, finite sequence of raw batches for one run.
///
/// Each step takes a rate-limit token first (remote sources only). A failed
/// step leaves the position untouched, so calling `next_batch` again retries
/// the same request.
pub struct Extraction<'a> {
    adapter: &'a dyn SourceAdapter,
    limiter: Option<&'a TokenBucket>,
    pending: Option<BatchRequest>,
}

impl<'a> Extraction<'a> {
    pub fn new(
        adapter: &'a dyn SourceAdapter,
        limiter: Option<&'a TokenBucket>,
        checkpoint: &Checkpoint,
    ) -> Self {
        Self {
            adapter,
            limiter,
            pending: Some(adapter.start(checkpoint)),
        }
    }

    /// Request the next call will make.
    pub fn pending(&self) -> Option<BatchRequest> {
        self.pending
    }

    pub async fn next_batch(&mut self) -> Option<Result<RawBatch, EtlError>> {
        let request = self.pending?;
        if self.adapter.kind().is_remote() {
            if let Some(bucket) = self.limiter {
                if let Err(e) = bucket.acquire().await {
                    return Some(Err(e));
                }
            }
        }
        match self.adapter.fetch(request).await {
            Ok(Some(batch)) => {
                self.pending = self.adapter.next(request, &batch);
                Some(Ok(batch))
            }
            Ok(None) => {
                self.pending = None;
                None
            }
            Err(e) => Some(Err(e)),
        }
    }

    pub fn stop(&mut self) {
        self.pending = None;
    }
}

/// Decode a JSON array body and validate each element.
pub(crate) fn transform_json_array(
    batch: &RawBatch,
    map: &FieldMap,
) -> Result<TransformedBatch, TransformError> {
    let body = match &batch.payload {
        RawPayload::Json(body) => body,
        RawPayload::Rows(_) => {
            return Err(TransformError(format!(
                "{}: expected a JSON payload, got rows",
                batch.source
            )))
        }
    };
    let value: Value = serde_json::from_str(body)
        .map_err(|e| TransformError(format!("{}: invalid JSON: {e}", batch.source)))?;
    let Value::Array(records) = value else {
        return Err(TransformError(format!(
            "{}: expected a JSON array at the top level",
            batch.source
        )));
    };
    Ok(transform_records(batch.source, records, map, batch.fetched_at))
}

/// One adapter per enabled source, selected by configuration.
pub fn build_adapters(config: &EtlConfig) -> Result<Vec<Arc<dyn SourceAdapter>>, EtlError> {
    let http = HttpClient::new(Duration::from_secs(config.http_timeout_secs))?;
    Ok(config
        .enabled_sources()
        .map(|src| build_adapter(src, &http))
        .collect())
}

pub fn build_adapter(src: &SourceConfig, http: &HttpClient) -> Arc<dyn SourceAdapter> {
    match src.id {
        SourceId::CoinGecko => Arc::new(CoinGeckoAdapter::new(
            http.clone(),
            &src.base_url,
            src.api_key.clone(),
            src.page_size,
            src.max_pages,
        )),
        SourceId::CoinPaprika => Arc::new(CoinPaprikaAdapter::new(
            http.clone(),
            &src.base_url,
            src.page_size,
        )),
        SourceId::Csv => Arc::new(CsvFileAdapter::new(src.path.clone())),
    }
}
