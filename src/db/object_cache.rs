use super::{Database, DbResult};
use crate::providers::ObjectEntry;

/// Batch size for database inserts
const DB_BATCH_SIZE: usize = 500;

/// Get SQL for creating the bucket listing cache tables
pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS object_cache (
        bucket TEXT NOT NULL,
        key TEXT NOT NULL,
        size INTEGER NOT NULL,
        last_modified INTEGER NOT NULL,
        meta TEXT,
        PRIMARY KEY (bucket, key)
    );

    CREATE TABLE IF NOT EXISTS sync_meta (
        bucket TEXT PRIMARY KEY,
        last_sync INTEGER NOT NULL,
        file_count INTEGER NOT NULL
    );
    "
}

impl Database {
    /// Replace the cached flat listing of `bucket`.
    pub async fn store_bucket_listing(&self, bucket: &str, objects: &[ObjectEntry]) -> DbResult<()> {
        let conn = self.connection().lock().await;
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "DELETE FROM object_cache WHERE bucket = ?1",
            turso::params![bucket],
        )
        .await?;

        for chunk in objects.chunks(DB_BATCH_SIZE) {
            let placeholders: Vec<String> = chunk
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    let b = i * 5;
                    format!("(?{}, ?{}, ?{}, ?{}, ?{})", b + 1, b + 2, b + 3, b + 4, b + 5)
                })
                .collect();

            let sql = format!(
                "INSERT OR REPLACE INTO object_cache (bucket, key, size, last_modified, meta)
                 VALUES {}",
                placeholders.join(", ")
            );

            let mut params: Vec<turso::Value> = Vec::with_capacity(chunk.len() * 5);
            for object in chunk {
                params.push(bucket.to_string().into());
                params.push(object.key.clone().into());
                params.push((object.size as i64).into());
                params.push(object.last_modified.into());
                params.push(if object.meta.is_null() {
                    turso::Value::Null
                } else {
                    serde_json::to_string(&object.meta)?.into()
                });
            }

            conn.execute(&sql, params).await?;
        }

        conn.execute(
            "INSERT INTO sync_meta (bucket, last_sync, file_count) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket) DO UPDATE SET last_sync = ?2, file_count = ?3",
            turso::params![bucket, now, objects.len() as i64],
        )
        .await?;

        Ok(())
    }

    /// The cached listing of `bucket`, or `None` if it was never synced.
    pub async fn cached_bucket_listing(&self, bucket: &str) -> DbResult<Option<Vec<ObjectEntry>>> {
        let conn = self.connection().lock().await;

        let mut meta = conn
            .query(
                "SELECT last_sync FROM sync_meta WHERE bucket = ?1",
                turso::params![bucket],
            )
            .await?;
        if meta.next().await?.is_none() {
            return Ok(None);
        }

        let mut rows = conn
            .query(
                "SELECT key, size, last_modified, meta FROM object_cache
                 WHERE bucket = ?1 ORDER BY key ASC",
                turso::params![bucket],
            )
            .await?;

        let mut objects = Vec::new();
        while let Some(row) = rows.next().await? {
            let size: i64 = row.get(1)?;
            let meta: Option<String> = row.get(3)?;
            objects.push(ObjectEntry {
                key: row.get(0)?,
                size: size.max(0) as u64,
                last_modified: row.get(2)?,
                meta: match meta {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => serde_json::Value::Null,
                },
            });
        }
        Ok(Some(objects))
    }

    pub async fn clear_bucket_listing(&self, bucket: &str) -> DbResult<()> {
        let conn = self.connection().lock().await;
        conn.execute(
            "DELETE FROM object_cache WHERE bucket = ?1",
            turso::params![bucket],
        )
        .await?;
        conn.execute(
            "DELETE FROM sync_meta WHERE bucket = ?1",
            turso::params![bucket],
        )
        .await?;
        Ok(())
    }
}
