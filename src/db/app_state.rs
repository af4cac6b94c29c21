use super::{Database, DbResult};

/// Get SQL for creating app_state table
pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS app_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "
}

// ============ App State Functions ============

impl Database {
    pub async fn get_app_state(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.connection().lock().await;
        let mut rows = conn
            .query("SELECT value FROM app_state WHERE key = ?1", turso::params![key])
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub async fn set_app_state(&self, key: &str, value: &str) -> DbResult<()> {
        let conn = self.connection().lock().await;
        conn.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = ?2",
            turso::params![key, value],
        )
        .await?;
        Ok(())
    }

    pub async fn delete_app_state(&self, key: &str) -> DbResult<()> {
        let conn = self.connection().lock().await;
        conn.execute("DELETE FROM app_state WHERE key = ?1", turso::params![key])
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn app_state_upserts_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("state.db")).await.unwrap();

        assert_eq!(db.get_app_state("layout").await.unwrap(), None);
        db.set_app_state("layout", "grid").await.unwrap();
        db.set_app_state("layout", "table").await.unwrap();
        assert_eq!(
            db.get_app_state("layout").await.unwrap().as_deref(),
            Some("table")
        );

        db.delete_app_state("layout").await.unwrap();
        assert_eq!(db.get_app_state("layout").await.unwrap(), None);
    }
}
