// src/ingest/normalize.rs
//! Typed field parsing from loosely-typed source payloads.
//!
//! Every field goes through an explicit parser that yields either a typed
//! value or a [`RejectReason`]. A record with any rejected field becomes a
//! [`Rejection`]; the rest of its batch is unaffected.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::ingest::types::{Coin, RawRecord, RejectReason, Rejection, SourceId, TransformedBatch};

/// JSON pointers for each unified field, tried in order. The first one that
/// resolves to a non-null value wins.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub id: &'static [&'static str],
    pub symbol: &'static [&'static str],
    pub name: &'static [&'static str],
    pub price_usd: &'static [&'static str],
    pub market_cap_usd: &'static [&'static str],
    pub volume_24h_usd: &'static [&'static str],
    pub price_change_24h_pct: &'static [&'static str],
    pub market_rank: &'static [&'static str],
}

fn lookup<'v>(record: &'v Value, paths: &[&str]) -> Option<&'v Value> {
    paths
        .iter()
        .filter_map(|p| record.pointer(p))
        .find(|v| !v.is_null())
}

fn scalar_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Required, non-empty text field.
pub fn required_str(v: Option<&Value>) -> Result<String, RejectReason> {
    let v = v.ok_or(RejectReason::Missing)?;
    match scalar_text(v) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(RejectReason::Empty),
    }
}

/// Optional number. Absent, null and blank cells are `None`; currency
/// signs and thousands separators are tolerated in strings.
pub fn parse_number(v: Option<&Value>) -> Result<Option<f64>, RejectReason> {
    let n = match v {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64().ok_or(RejectReason::NotNumeric)?,
        Some(Value::String(s)) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !matches!(c, '$' | ','))
                .collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            cleaned
                .parse::<f64>()
                .map_err(|_| RejectReason::NotNumeric)?
        }
        Some(_) => return Err(RejectReason::NotNumeric),
    };
    if n.is_finite() {
        Ok(Some(n))
    } else {
        Err(RejectReason::NotNumeric)
    }
}

/// Optional non-negative amount (price, market cap, volume).
pub fn parse_amount(v: Option<&Value>) -> Result<Option<f64>, RejectReason> {
    match parse_number(v)? {
        Some(n) if n < 0.0 => Err(RejectReason::Negative),
        other => Ok(other),
    }
}

/// Optional market rank. `"100.0"` is accepted; zero means unranked.
pub fn parse_rank(v: Option<&Value>) -> Result<Option<u32>, RejectReason> {
    let Some(n) = parse_number(v)? else {
        return Ok(None);
    };
    if n < 0.0 {
        return Err(RejectReason::Negative);
    }
    if n.fract() != 0.0 || n > f64::from(u32::MAX) {
        return Err(RejectReason::NotInteger);
    }
    let rank = n as u32;
    Ok((rank > 0).then_some(rank))
}

/// Stable cross-source id. CoinPaprika prefixes its ids with the symbol
/// (`btc-bitcoin`); that prefix is dropped so every source agrees on `bitcoin`.
pub fn canonical_id(source: SourceId, native_id: &str, symbol: &str) -> String {
    let id = native_id.trim().to_ascii_lowercase();
    if source == SourceId::CoinPaprika {
        let prefix = symbol.trim().to_ascii_lowercase();
        if let Some(rest) = id.strip_prefix(&prefix).and_then(|r| r.strip_prefix('-')) {
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }
    id
}

fn field<T>(
    native_id: Option<&str>,
    name: &str,
    parsed: Result<T, RejectReason>,
) -> Result<T, Rejection> {
    parsed.map_err(|reason| Rejection::new(native_id, name, reason))
}

/// Build one validated coin from a JSON object.
pub fn coin_from_record(
    source: SourceId,
    record: &Value,
    map: &FieldMap,
    now: DateTime<Utc>,
) -> Result<Coin, Rejection> {
    if !record.is_object() {
        return Err(Rejection::new(None, "record", RejectReason::NotAnObject));
    }
    let native_id = field(None, "id", required_str(lookup(record, map.id)))?;
    let id = Some(native_id.as_str());
    let symbol = field(id, "symbol", required_str(lookup(record, map.symbol)))?.to_ascii_uppercase();
    let name = field(id, "name", required_str(lookup(record, map.name)))?;

    Ok(Coin {
        canonical_id: canonical_id(source, &native_id, &symbol),
        price_usd: field(id, "price_usd", parse_amount(lookup(record, map.price_usd)))?,
        market_cap_usd: field(id, "market_cap_usd", parse_amount(lookup(record, map.market_cap_usd)))?,
        volume_24h_usd: field(id, "volume_24h_usd", parse_amount(lookup(record, map.volume_24h_usd)))?,
        price_change_24h_pct: field(
            id,
            "price_change_24h_pct",
            parse_number(lookup(record, map.price_change_24h_pct)),
        )?,
        market_rank: field(id, "market_rank", parse_rank(lookup(record, map.market_rank)))?,
        symbol,
        name,
        source,
        last_updated: now,
    })
}

/// Validate a list of records, keeping every as-received record for the
/// audit trail whether or not it passed.
pub fn transform_records(
    source: SourceId,
    records: Vec<Value>,
    map: &FieldMap,
    now: DateTime<Utc>,
) -> TransformedBatch {
    let mut out = TransformedBatch::default();
    for record in records {
        match coin_from_record(source, &record, map, now) {
            Ok(coin) => out.candidates.push(coin),
            Err(rejection) => {
                tracing::debug!(source = %source, %rejection, "record rejected");
                out.rejections.push(rejection);
            }
        }
        let native_id = lookup(&record, map.id)
            .and_then(scalar_text)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        out.raw.push(RawRecord {
            source,
            native_id,
            ingested_at: now,
            payload: record,
        });
    }
    out
}
