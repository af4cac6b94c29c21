use std::path::Path;
use tokio::sync::Mutex;
use turso::{Builder, Connection};

// Custom error type for database operations
pub type DbResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub mod app_state;
pub mod apps;
pub mod object_cache;
pub mod transfers;

pub use apps::{AppProvider, NewStorageApp, StorageApp};
pub use transfers::{spawn_record_sync, TransferRecord, TransferStore, TransferView};

/// Handle to the local database.
///
/// The connection sits behind a Mutex so every statement is serialized:
/// turso has race conditions in its page cache when a connection is used
/// concurrently, and status updates from completing tasks must not interleave.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and ensure every table exists.
    pub async fn open(db_path: &Path) -> DbResult<Self> {
        let path = db_path
            .to_str()
            .ok_or("Database path is not valid UTF-8")?;
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let db = Builder::new_local(path).build().await?;
        let conn = db.connect()?;

        conn.execute_batch(&format!(
            "{}{}{}{}",
            transfers::get_table_sql(),
            app_state::get_table_sql(),
            object_cache::get_table_sql(),
            apps::get_table_sql(),
        ))
        .await?;

        log::debug!("database ready at {}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn connection(&self) -> &Mutex<Connection> {
        &self.conn
    }
}

/// Number of rows touched by the last statement on `conn`.
pub(crate) async fn changes(conn: &Connection) -> DbResult<i64> {
    let mut rows = conn.query("SELECT changes()", ()).await?;
    if let Some(row) = rows.next().await? {
        Ok(row.get(0)?)
    } else {
        Ok(0)
    }
}
