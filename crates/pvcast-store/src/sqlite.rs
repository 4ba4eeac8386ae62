//! SQLite forecast store.
//!
//! Each site's horizons are written in a single transaction, so a reader
//! sees either the previous forecast for a key or the new one, never a mix.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::schema::SCHEMA_SQL;
use crate::types::*;
use pvcast_core::{Error, InitTime, Quantiles, ReconciledForecast, Result, SiteId};

/// SQLite store holding the `forecasts` table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Database(format!("bad timestamp '{}': {}", s, e)))
}

impl SqliteStore {
    /// Open or create the store at `db_path`, creating parent directories.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        info!(
            "SqliteStore initialized: {} forecast rows, path={}",
            store.count_rows()?,
            store.db_path.display()
        );
        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(|e| Error::Database(e.to_string()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    /// Upsert every horizon of `forecast` and delete horizons at or beyond
    /// its horizon count for the same key, in one transaction. Returns the
    /// number of rows written.
    pub fn upsert_forecast(&self, forecast: &ReconciledForecast) -> Result<usize> {
        let init_time = timestamp(forecast.init_time.timestamp());
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Database(e.to_string()))?;

        {
            let mut upsert = tx
                .prepare_cached(
                    "INSERT INTO forecasts
                        (site_id, model_set, init_time, horizon, valid_time, value, quantiles_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT (site_id, model_set, init_time, horizon) DO UPDATE SET
                        valid_time = excluded.valid_time,
                        value = excluded.value,
                        quantiles_json = excluded.quantiles_json",
                )
                .map_err(|e| Error::Database(e.to_string()))?;

            for point in &forecast.points {
                let quantiles = point
                    .quantiles
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                upsert
                    .execute(params![
                        forecast.site_id,
                        forecast.model_set,
                        init_time,
                        point.horizon as i64,
                        timestamp(point.valid_time),
                        point.value,
                        quantiles,
                    ])
                    .map_err(|e| Error::Database(e.to_string()))?;
            }
        }

        let stale = tx
            .execute(
                "DELETE FROM forecasts
                 WHERE site_id = ?1 AND model_set = ?2 AND init_time = ?3 AND horizon >= ?4",
                params![
                    forecast.site_id,
                    forecast.model_set,
                    init_time,
                    forecast.points.len() as i64
                ],
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        tx.commit().map_err(|e| Error::Database(e.to_string()))?;

        if stale > 0 {
            debug!(
                "Site {}: removed {} stale horizons for {}",
                forecast.site_id, stale, forecast.model_set
            );
        }
        Ok(forecast.points.len())
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// All horizons stored for one key, in horizon order.
    pub fn get_forecast(
        &self,
        site_id: SiteId,
        model_set: &str,
        init_time: InitTime,
    ) -> Result<Vec<ForecastRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT site_id, model_set, init_time, horizon, valid_time, value, quantiles_json
                 FROM forecasts
                 WHERE site_id = ?1 AND model_set = ?2 AND init_time = ?3
                 ORDER BY horizon",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let raw = stmt
            .query_map(
                params![site_id, model_set, timestamp(init_time.timestamp())],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<f64>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;

        raw.into_iter()
            .map(
                |(site_id, model_set, init_time, horizon, valid_time, value, quantiles)| {
                    Ok(ForecastRow {
                        site_id,
                        model_set,
                        init_time: parse_timestamp(&init_time)?,
                        horizon: horizon as usize,
                        valid_time: parse_timestamp(&valid_time)?,
                        value,
                        quantiles: quantiles
                            .map(|q| serde_json::from_str::<Quantiles>(&q))
                            .transpose()?,
                    })
                },
            )
            .collect()
    }

    /// Model sets with rows for a site at an init time.
    pub fn model_sets(&self, site_id: SiteId, init_time: InitTime) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT DISTINCT model_set FROM forecasts
                 WHERE site_id = ?1 AND init_time = ?2 ORDER BY model_set",
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        let sets = stmt
            .query_map(params![site_id, timestamp(init_time.timestamp())], |row| {
                row.get(0)
            })
            .map_err(|e| Error::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(sets)
    }

    pub fn count_rows(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM forecasts", [], |row| row.get(0))
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Get store statistics.
    pub fn get_stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock();
        let (total_rows, sites, init_times): (i64, i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT site_id), COUNT(DISTINCT init_time) FROM forecasts",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|e| Error::Database(e.to_string()))?;
        drop(conn);

        let db_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StoreStats {
            total_rows,
            sites,
            init_times,
            db_path: self.db_path.to_string_lossy().to_string(),
            db_size_mb: db_size as f64 / (1024.0 * 1024.0),
        })
    }
}
