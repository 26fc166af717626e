pub mod configs;
pub mod dashboard;
pub mod results;
pub mod retrieval;
pub mod sessions;
pub mod surveys;
pub mod users;

pub use configs::*;
pub use dashboard::*;
pub use results::*;
pub use retrieval::*;
pub use sessions::*;
pub use surveys::*;
pub use users::*;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use sqlx::{Pool, Sqlite, Transaction};

use crate::error::AppError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection options shared by the server and the file-backed tests.
pub fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, AppError> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT))
}

/// Starts a transaction that takes the write lock at `BEGIN`, so concurrent
/// writers queue on the busy timeout and their read-then-insert checks see
/// each other's commits.
pub async fn begin_write(pool: &Pool<Sqlite>) -> Result<Transaction<'static, Sqlite>, AppError> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}
