// src/ingest/providers/csv_file.rs
use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::error::{EtlError, ExtractionError, TransformError};
use crate::ingest::normalize::{transform_records, FieldMap};
use crate::ingest::providers::SourceAdapter;
use crate::ingest::types::{
    BatchRequest, RawBatch, RawPayload, SourceId, SourceKind, TransformedBatch,
};

const FIELDS: FieldMap = FieldMap {
    id: &["/coin_id", "/id"],
    symbol: &["/symbol"],
    name: &["/name"],
    price_usd: &["/price", "/current_price"],
    market_cap_usd: &["/market_cap"],
    volume_24h_usd: &["/volume", "/volume_24h"],
    price_change_24h_pct: &["/change_24h", "/price_change_24h"],
    market_rank: &["/rank"],
};

/// Local CSV file, read whole once per run.
pub struct CsvFileAdapter {
    path: PathBuf,
}

impl CsvFileAdapter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

/// Header-keyed rows. Headers are trimmed and lower-cased.
pub fn parse_rows(content: &str) -> Result<Vec<BTreeMap<String, String>>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_ascii_lowercase())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

#[async_trait]
impl SourceAdapter for CsvFileAdapter {
    fn source(&self) -> SourceId {
        SourceId::Csv
    }

    fn kind(&self) -> SourceKind {
        SourceKind::StaticFile
    }

    async fn fetch(&self, request: BatchRequest) -> Result<Option<RawBatch>, EtlError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.path.display(), "csv file not found, nothing to ingest");
                return Ok(None);
            }
            Err(e) => {
                return Err(ExtractionError::permanent(format!(
                    "reading {}: {e}",
                    self.path.display()
                ))
                .into())
            }
        };
        let rows = parse_rows(&content).map_err(|e| {
            ExtractionError::permanent(format!("parsing {}: {e}", self.path.display()))
        })?;
        Ok(Some(RawBatch {
            source: SourceId::Csv,
            page: request.page,
            fetched_at: Utc::now(),
            payload: RawPayload::Rows(rows),
        }))
    }

    fn transform(&self, batch: &RawBatch) -> Result<TransformedBatch, TransformError> {
        let RawPayload::Rows(rows) = &batch.payload else {
            return Err(TransformError("csv: expected tabular rows".into()));
        };
        let records = rows
            .iter()
            .map(|row| {
                Value::Object(
                    row.iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                )
            })
            .collect();
        Ok(transform_records(SourceId::Csv, records, &FIELDS, batch.fetched_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_normalised_and_aliases_resolve() {
        let rows = parse_rows("Coin_ID, Symbol ,Name,Price,Volume,Rank\nbitcoin,btc,Bitcoin,\"$64,000.50\",\"1,000\",1.0\n").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["coin_id"], "bitcoin");
        assert_eq!(rows[0]["price"], "$64,000.50");

        let a = CsvFileAdapter::new(PathBuf::from("unused.csv"));
        let out = a
            .transform(&RawBatch {
                source: SourceId::Csv,
                page: 1,
                fetched_at: Utc::now(),
                payload: RawPayload::Rows(rows),
            })
            .unwrap();
        let c = &out.candidates[0];
        assert_eq!(c.canonical_id, "bitcoin");
        assert_eq!(c.symbol, "BTC");
        assert_eq!(c.price_usd, Some(64000.5));
        assert_eq!(c.volume_24h_usd, Some(1000.0));
        assert_eq!(c.market_rank, Some(1));
    }

    #[tokio::test]
    async fn missing_file_yields_no_batch() {
        let a = CsvFileAdapter::new(PathBuf::from("/nonexistent/dir/coins.csv"));
        assert!(a.fetch(BatchRequest::first()).await.unwrap().is_none());
    }
}
