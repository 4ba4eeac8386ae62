//! Forecast store schema.

/// One row per (site, model set, init time, horizon). `value` is NULL when no
/// model produced a value for the horizon. Rows carry no write timestamps so
/// that rewriting the same forecast leaves the table byte-for-byte unchanged.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS forecasts (
    site_id INTEGER NOT NULL,
    model_set TEXT NOT NULL,
    init_time TEXT NOT NULL,
    horizon INTEGER NOT NULL,
    valid_time TEXT NOT NULL,
    value REAL,
    quantiles_json TEXT,
    PRIMARY KEY (site_id, model_set, init_time, horizon)
);

CREATE INDEX IF NOT EXISTS idx_forecasts_init_time ON forecasts(init_time);
CREATE INDEX IF NOT EXISTS idx_forecasts_valid_time ON forecasts(site_id, valid_time);
"#;
