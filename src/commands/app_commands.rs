use super::{AppCore, Browsing};
use crate::db::{AppProvider, NewStorageApp, StorageApp};
use crate::error::{EngineError, EngineResult};
use crate::providers::{LocalBackend, S3Backend, S3Config, StorageBackend};
use std::sync::Arc;

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Required connection fields per provider.
fn validate(
    provider: AppProvider,
    account_id: Option<&str>,
    region: Option<&str>,
    endpoint_host: Option<&str>,
) -> EngineResult<()> {
    match provider {
        AppProvider::R2 if non_empty(account_id).is_none() => {
            Err(EngineError::invalid("R2 account id is required"))
        }
        AppProvider::Aws if non_empty(region).is_none() => {
            Err(EngineError::invalid("AWS region is required"))
        }
        AppProvider::Minio if non_empty(endpoint_host).is_none() => {
            Err(EngineError::invalid("MinIO endpoint host is required"))
        }
        AppProvider::Local if non_empty(endpoint_host).is_none() => {
            Err(EngineError::invalid("local storage root is required"))
        }
        _ => Ok(()),
    }
}

/// Build the adapter for a saved app.
pub(crate) fn backend_for(app: &StorageApp) -> EngineResult<Arc<dyn StorageBackend>> {
    validate(
        app.provider,
        app.account_id.as_deref(),
        app.region.as_deref(),
        app.endpoint_host.as_deref(),
    )?;

    let backend: Arc<dyn StorageBackend> = match app.provider {
        AppProvider::Local => {
            let root = non_empty(app.endpoint_host.as_deref()).unwrap_or_default();
            Arc::new(LocalBackend::new(root))
        }
        AppProvider::R2 => {
            let account_id = non_empty(app.account_id.as_deref()).unwrap_or_default();
            let mut config = S3Config::r2(account_id, &app.access_key_id, &app.secret_access_key);
            config.domains = app.domains.clone();
            Arc::new(S3Backend::new(config))
        }
        AppProvider::Aws => Arc::new(S3Backend::new(S3Config {
            access_key_id: app.access_key_id.clone(),
            secret_access_key: app.secret_access_key.clone(),
            region: non_empty(app.region.as_deref()).unwrap_or_default().to_string(),
            endpoint_scheme: app.endpoint_scheme.clone(),
            endpoint_host: app.endpoint_host.clone(),
            force_path_style: app.force_path_style,
            domains: app.domains.clone(),
        })),
        AppProvider::Minio => Arc::new(S3Backend::new(S3Config {
            access_key_id: app.access_key_id.clone(),
            secret_access_key: app.secret_access_key.clone(),
            region: non_empty(app.region.as_deref())
                .unwrap_or("us-east-1")
                .to_string(),
            endpoint_scheme: Some(
                app.endpoint_scheme
                    .clone()
                    .unwrap_or_else(|| "https".to_string()),
            ),
            endpoint_host: app.endpoint_host.clone(),
            force_path_style: app.force_path_style,
            domains: app.domains.clone(),
        })),
    };
    Ok(backend)
}

impl AppCore {
    /// Save a new storage connection after checking its required fields.
    pub async fn add_app(&self, input: NewStorageApp) -> EngineResult<StorageApp> {
        let provider: AppProvider = input.provider.parse().map_err(EngineError::invalid)?;
        validate(
            provider,
            input.account_id.as_deref(),
            input.region.as_deref(),
            input.endpoint_host.as_deref(),
        )?;
        let app = self.db.create_app(&input).await?;
        log::info!("apps: added {} app {}", app.provider, app.id);
        Ok(app)
    }

    pub async fn list_apps(&self) -> EngineResult<Vec<StorageApp>> {
        Ok(self.db.list_apps().await?)
    }

    pub async fn current_app(&self) -> Option<String> {
        self.settings.read().await.current_app.clone()
    }

    /// Make `id` the active connection. Running tasks finish on the adapter
    /// they started with; the directory view is reset.
    pub async fn change_app(&self, id: &str) -> EngineResult<StorageApp> {
        let app = self
            .db
            .get_app(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("storage app {}", id)))?;
        let backend = backend_for(&app)?;

        if self.backend.is_active() {
            self.backend.swap(backend);
        } else {
            self.backend.init(backend)?;
        }
        self.reset_browsing().await;

        let mut settings = self.settings.write().await;
        if settings.current_app.as_deref() != Some(id) {
            settings.current_app = Some(id.to_string());
            settings.save(&self.db).await?;
        }
        log::info!("apps: switched to {} ({})", app.id, app.provider);
        Ok(app)
    }

    /// Delete a saved app. Removing the active one disconnects storage.
    pub async fn remove_app(&self, id: &str) -> EngineResult<bool> {
        let removed = self.db.delete_app(id).await?;
        if !removed {
            return Ok(false);
        }

        let mut settings = self.settings.write().await;
        if settings.current_app.as_deref() == Some(id) {
            settings.current_app = None;
            settings.save(&self.db).await?;
            drop(settings);
            self.backend.clear();
            self.reset_browsing().await;
            log::info!("apps: removed active app {}, storage disconnected", id);
        }
        Ok(true)
    }

    async fn reset_browsing(&self) {
        *self.browsing.write().await = Browsing::default();
    }
}
