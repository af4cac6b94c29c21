//! Saved storage connections ("apps") the user can switch between

use super::{changes, Database, DbResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppProvider {
    Aws,
    R2,
    Minio,
    Local,
}

impl std::fmt::Display for AppProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppProvider::Aws => write!(f, "aws"),
            AppProvider::R2 => write!(f, "r2"),
            AppProvider::Minio => write!(f, "minio"),
            AppProvider::Local => write!(f, "local"),
        }
    }
}

impl std::str::FromStr for AppProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(AppProvider::Aws),
            "r2" => Ok(AppProvider::R2),
            "minio" => Ok(AppProvider::Minio),
            "local" => Ok(AppProvider::Local),
            other => Err(format!("Unsupported provider: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageApp {
    pub id: String,
    pub name: Option<String>,
    pub provider: AppProvider,
    /// R2 account id; unused by other providers.
    pub account_id: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: Option<String>,
    pub endpoint_scheme: Option<String>,
    /// Endpoint host for S3-compatible providers, root directory for `Local`.
    pub endpoint_host: Option<String>,
    pub force_path_style: bool,
    /// Public domains serving this app's buckets, shown next to listings.
    pub domains: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for `Database::create_app`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewStorageApp {
    pub name: Option<String>,
    pub provider: String,
    pub account_id: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: Option<String>,
    pub endpoint_scheme: Option<String>,
    pub endpoint_host: Option<String>,
    pub force_path_style: Option<bool>,
    #[serde(default)]
    pub domains: Vec<String>,
}

pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS apps (
        id TEXT PRIMARY KEY,
        name TEXT,
        provider TEXT NOT NULL,
        account_id TEXT,
        access_key_id TEXT NOT NULL,
        secret_access_key TEXT NOT NULL,
        region TEXT,
        endpoint_scheme TEXT,
        endpoint_host TEXT,
        force_path_style INTEGER NOT NULL DEFAULT 0,
        domains TEXT NOT NULL DEFAULT '[]',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_apps_created ON apps(created_at);
    "
}

fn app_from_row(row: &turso::Row) -> DbResult<StorageApp> {
    let provider: String = row.get(2)?;
    let force_path_style: i64 = row.get(9)?;
    let domains: String = row.get(10)?;
    Ok(StorageApp {
        id: row.get(0)?,
        name: row.get(1)?,
        provider: provider.parse::<AppProvider>()?,
        account_id: row.get(3)?,
        access_key_id: row.get(4)?,
        secret_access_key: row.get(5)?,
        region: row.get(6)?,
        endpoint_scheme: row.get(7)?,
        endpoint_host: row.get(8)?,
        force_path_style: force_path_style != 0,
        domains: serde_json::from_str(&domains)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

const SELECT_APP: &str = "SELECT id, name, provider, account_id, access_key_id, secret_access_key,
        region, endpoint_scheme, endpoint_host, force_path_style, domains, created_at, updated_at
     FROM apps";

impl Database {
    pub async fn create_app(&self, input: &NewStorageApp) -> DbResult<StorageApp> {
        let provider: AppProvider = input.provider.parse()?;
        let now = chrono::Utc::now().timestamp();
        let app = StorageApp {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name.clone(),
            provider,
            account_id: input.account_id.clone(),
            access_key_id: input.access_key_id.clone(),
            secret_access_key: input.secret_access_key.clone(),
            region: input.region.clone(),
            endpoint_scheme: input.endpoint_scheme.clone(),
            endpoint_host: input.endpoint_host.clone(),
            force_path_style: input
                .force_path_style
                .unwrap_or(provider == AppProvider::Minio),
            domains: input.domains.clone(),
            created_at: now,
            updated_at: now,
        };

        let conn = self.connection().lock().await;
        conn.execute(
            "INSERT INTO apps
             (id, name, provider, account_id, access_key_id, secret_access_key, region,
              endpoint_scheme, endpoint_host, force_path_style, domains, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            turso::params![
                app.id.clone(),
                app.name.clone(),
                app.provider.to_string(),
                app.account_id.clone(),
                app.access_key_id.clone(),
                app.secret_access_key.clone(),
                app.region.clone(),
                app.endpoint_scheme.clone(),
                app.endpoint_host.clone(),
                if app.force_path_style { 1i64 } else { 0i64 },
                serde_json::to_string(&app.domains)?,
                app.created_at,
                app.updated_at,
            ],
        )
        .await?;

        Ok(app)
    }

    pub async fn get_app(&self, id: &str) -> DbResult<Option<StorageApp>> {
        let conn = self.connection().lock().await;
        let mut rows = conn
            .query(&format!("{} WHERE id = ?1", SELECT_APP), turso::params![id])
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(app_from_row(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn list_apps(&self) -> DbResult<Vec<StorageApp>> {
        let conn = self.connection().lock().await;
        let mut rows = conn
            .query(&format!("{} ORDER BY created_at ASC, id ASC", SELECT_APP), ())
            .await?;

        let mut apps = Vec::new();
        while let Some(row) = rows.next().await? {
            apps.push(app_from_row(&row)?);
        }
        Ok(apps)
    }

    pub async fn delete_app(&self, id: &str) -> DbResult<bool> {
        let conn = self.connection().lock().await;
        conn.execute("DELETE FROM apps WHERE id = ?1", turso::params![id])
            .await?;
        Ok(changes(&conn).await? > 0)
    }
}
