//! pvcast Store: forecast writer and SQLite forecast store.

pub mod schema;
pub mod sqlite;
pub mod types;
pub mod writer;

pub use sqlite::SqliteStore;
pub use types::*;
pub use writer::{ForecastStore, ForecastWriter};
