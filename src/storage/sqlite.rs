// src/storage/sqlite.rs
//! Durable store on SQLite via `sqlx`.
//!
//! Each coin write is one `INSERT … ON CONFLICT DO UPDATE … WHERE` statement,
//! so concurrent writers to the same id settle on the last committed row
//! without any lock held across statements. `revision` tells the three
//! outcomes apart: 1 is a fresh insert, anything higher is an update, and
//! no returned row means the stored content already matched.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;

use crate::error::StorageError;
use crate::ingest::checkpoint::{Checkpoint, CheckpointStatus};
use crate::ingest::types::{
    Coin, CoinPage, CoinQuery, EtlRun, RawRecord, RunFilter, RunStatus, SourceId, UpsertOutcome,
};
use crate::storage::Storage;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS coins (
        canonical_id         TEXT PRIMARY KEY,
        symbol               TEXT NOT NULL,
        name                 TEXT NOT NULL,
        price_usd            REAL,
        market_cap_usd       REAL,
        volume_24h_usd       REAL,
        price_change_24h_pct REAL,
        market_rank          INTEGER,
        source               TEXT NOT NULL,
        last_updated         TEXT NOT NULL,
        revision             INTEGER NOT NULL DEFAULT 1
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_coins_rank ON coins (market_rank)",
    "CREATE INDEX IF NOT EXISTS idx_coins_symbol ON coins (symbol)",
    r#"
    CREATE TABLE IF NOT EXISTS raw_records (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        source      TEXT NOT NULL,
        native_id   TEXT NOT NULL,
        ingested_at TEXT NOT NULL,
        payload     TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_raw_source ON raw_records (source, ingested_at)",
    r#"
    CREATE TABLE IF NOT EXISTS checkpoints (
        source          TEXT PRIMARY KEY,
        last_success_at TEXT,
        last_failure_at TEXT,
        last_status     TEXT NOT NULL,
        cursor          TEXT,
        last_error      TEXT,
        records_loaded  INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS etl_runs (
        run_id            TEXT PRIMARY KEY,
        source            TEXT NOT NULL,
        started_at        TEXT NOT NULL,
        ended_at          TEXT NOT NULL,
        status            TEXT NOT NULL,
        records_extracted INTEGER NOT NULL,
        records_loaded    INTEGER NOT NULL,
        records_unchanged INTEGER NOT NULL,
        records_rejected  INTEGER NOT NULL,
        batches_loaded    INTEGER NOT NULL,
        batches_failed    INTEGER NOT NULL,
        error_summary     TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_source ON etl_runs (source, started_at)",
];

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse_source(raw: &str) -> Result<SourceId, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::Corrupt(format!("unknown source {raw:?}")))
}

fn to_u64(v: i64, col: &str) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Corrupt(format!("negative {col}: {v}")))
}

fn to_u32(v: i64, col: &str) -> Result<u32, StorageError> {
    u32::try_from(v).map_err(|_| StorageError::Corrupt(format!("{col} out of range: {v}")))
}

fn coin_from_row(row: &SqliteRow) -> Result<Coin, StorageError> {
    let source: String = row.try_get("source")?;
    let rank: Option<i64> = row.try_get("market_rank")?;
    Ok(Coin {
        canonical_id: row.try_get("canonical_id")?,
        symbol: row.try_get("symbol")?,
        name: row.try_get("name")?,
        price_usd: row.try_get("price_usd")?,
        market_cap_usd: row.try_get("market_cap_usd")?,
        volume_24h_usd: row.try_get("volume_24h_usd")?,
        price_change_24h_pct: row.try_get("price_change_24h_pct")?,
        market_rank: rank.map(|r| to_u32(r, "market_rank")).transpose()?,
        source: parse_source(&source)?,
        last_updated: row.try_get("last_updated")?,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, StorageError> {
    let source: String = row.try_get("source")?;
    let status: String = row.try_get("last_status")?;
    Ok(Checkpoint {
        source: parse_source(&source)?,
        last_success_at: row.try_get("last_success_at")?,
        last_failure_at: row.try_get("last_failure_at")?,
        last_status: CheckpointStatus::parse(&status)
            .ok_or_else(|| StorageError::Corrupt(format!("unknown checkpoint status {status:?}")))?,
        cursor: row.try_get("cursor")?,
        last_error: row.try_get("last_error")?,
        records_loaded: to_u64(row.try_get("records_loaded")?, "records_loaded")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<EtlRun, StorageError> {
    let source: String = row.try_get("source")?;
    let status: String = row.try_get("status")?;
    Ok(EtlRun {
        run_id: row.try_get("run_id")?,
        source: parse_source(&source)?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        status: RunStatus::from_str(&status)
            .map_err(|s| StorageError::Corrupt(format!("unknown run status {s:?}")))?,
        records_extracted: to_u64(row.try_get("records_extracted")?, "records_extracted")?,
        records_loaded: to_u64(row.try_get("records_loaded")?, "records_loaded")?,
        records_unchanged: to_u64(row.try_get("records_unchanged")?, "records_unchanged")?,
        records_rejected: to_u64(row.try_get("records_rejected")?, "records_rejected")?,
        batches_loaded: to_u32(row.try_get("batches_loaded")?, "batches_loaded")?,
        batches_failed: to_u32(row.try_get("batches_failed")?, "batches_failed")?,
        error_summary: row.try_get("error_summary")?,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn upsert_coin(&self, coin: &Coin) -> Result<UpsertOutcome, StorageError> {
        let revision: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO coins (canonical_id, symbol, name, price_usd, market_cap_usd,
                               volume_24h_usd, price_change_24h_pct, market_rank, source,
                               last_updated, revision)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)
            ON CONFLICT(canonical_id) DO UPDATE SET
                symbol = excluded.symbol,
                name = excluded.name,
                price_usd = excluded.price_usd,
                market_cap_usd = excluded.market_cap_usd,
                volume_24h_usd = excluded.volume_24h_usd,
                price_change_24h_pct = excluded.price_change_24h_pct,
                market_rank = excluded.market_rank,
                source = excluded.source,
                last_updated = excluded.last_updated,
                revision = coins.revision + 1
            WHERE coins.symbol IS NOT excluded.symbol
               OR coins.name IS NOT excluded.name
               OR coins.price_usd IS NOT excluded.price_usd
               OR coins.market_cap_usd IS NOT excluded.market_cap_usd
               OR coins.volume_24h_usd IS NOT excluded.volume_24h_usd
               OR coins.price_change_24h_pct IS NOT excluded.price_change_24h_pct
               OR coins.market_rank IS NOT excluded.market_rank
               OR coins.source IS NOT excluded.source
            RETURNING revision
            "#,
        )
        .bind(&coin.canonical_id)
        .bind(&coin.symbol)
        .bind(&coin.name)
        .bind(coin.price_usd)
        .bind(coin.market_cap_usd)
        .bind(coin.volume_24h_usd)
        .bind(coin.price_change_24h_pct)
        .bind(coin.market_rank.map(i64::from))
        .bind(coin.source.as_str())
        .bind(coin.last_updated)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match revision {
            None => UpsertOutcome::Unchanged,
            Some(1) => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
        })
    }

    async fn append_raw(&self, records: &[RawRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for r in records {
            let payload = serde_json::to_string(&r.payload)?;
            sqlx::query(
                "INSERT INTO raw_records (source, native_id, ingested_at, payload) VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(r.source.as_str())
            .bind(&r.native_id)
            .bind(r.ingested_at)
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_checkpoint(&self, source: SourceId) -> Result<Checkpoint, StorageError> {
        let row = sqlx::query("SELECT * FROM checkpoints WHERE source = ?1")
            .bind(source.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => checkpoint_from_row(&row),
            None => Ok(Checkpoint::never_run(source)),
        }
    }

    async fn save_checkpoint(&self, cp: &Checkpoint) -> Result<(), StorageError> {
        let records_loaded = i64::try_from(cp.records_loaded).unwrap_or(i64::MAX);
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, last_success_at, last_failure_at, last_status,
                                     cursor, last_error, records_loaded)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(source) DO UPDATE SET
                last_success_at = excluded.last_success_at,
                last_failure_at = excluded.last_failure_at,
                last_status = excluded.last_status,
                cursor = excluded.cursor,
                last_error = excluded.last_error,
                records_loaded = excluded.records_loaded
            "#,
        )
        .bind(cp.source.as_str())
        .bind(cp.last_success_at)
        .bind(cp.last_failure_at)
        .bind(cp.last_status.as_str())
        .bind(&cp.cursor)
        .bind(&cp.last_error)
        .bind(records_loaded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_run(&self, run: &EtlRun) -> Result<(), StorageError> {
        let count = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
        sqlx::query(
            r#"
            INSERT INTO etl_runs (run_id, source, started_at, ended_at, status,
                                  records_extracted, records_loaded, records_unchanged,
                                  records_rejected, batches_loaded, batches_failed, error_summary)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&run.run_id)
        .bind(run.source.as_str())
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.status.as_str())
        .bind(count(run.records_extracted))
        .bind(count(run.records_loaded))
        .bind(count(run.records_unchanged))
        .bind(count(run.records_rejected))
        .bind(i64::from(run.batches_loaded))
        .bind(i64::from(run.batches_failed))
        .bind(&run.error_summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<EtlRun>, StorageError> {
        let limit = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let rows = sqlx::query(
            r#"
            SELECT * FROM etl_runs
            WHERE (?1 IS NULL OR source = ?1)
            ORDER BY started_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )
        .bind(filter.source.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        let rows = sqlx::query("SELECT * FROM checkpoints ORDER BY source")
            .fetch_all(&self.pool)
            .await?;
        let mut out = rows
            .iter()
            .map(checkpoint_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        out.sort_by_key(|c| c.source);
        Ok(out)
    }

    async fn get_coin(&self, canonical_id: &str) -> Result<Option<Coin>, StorageError> {
        let row = sqlx::query("SELECT * FROM coins WHERE canonical_id = ?1")
            .bind(canonical_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(coin_from_row).transpose()
    }

    async fn query_coins(&self, query: &CoinQuery) -> Result<CoinPage, StorageError> {
        let q = query.normalized();
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM coins
            WHERE (?1 IS NULL OR source = ?1) AND (?2 IS NULL OR symbol = ?2)
            "#,
        )
        .bind(&q.source)
        .bind(&q.symbol)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM coins
            WHERE (?1 IS NULL OR source = ?1) AND (?2 IS NULL OR symbol = ?2)
            ORDER BY market_rank IS NULL, market_rank ASC, canonical_id ASC
            LIMIT ?3 OFFSET ?4
            "#,
        )
        .bind(&q.source)
        .bind(&q.symbol)
        .bind(i64::from(q.page_size))
        .bind(i64::try_from(q.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(CoinPage {
            items: rows.iter().map(coin_from_row).collect::<Result<_, _>>()?,
            total: to_u64(total, "count")?,
        })
    }

    async fn count_raw(&self, source: Option<SourceId>) -> Result<u64, StorageError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM raw_records WHERE (?1 IS NULL OR source = ?1)",
        )
        .bind(source.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;
        to_u64(n, "count")
    }
}
