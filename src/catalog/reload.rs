//! Validated, atomic configuration reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use super::{Catalog, Snapshot};
use crate::config::{Config, ConfigError};

/// What a successful reload published.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReloadSummary {
    pub version: u64,
    pub models_count: usize,
    pub providers_count: usize,
}

/// Re-reads the config file and swaps the live snapshot on success.
///
/// Reloads are serialized so two concurrent reloads cannot publish
/// out of order. On any failure the active snapshot stays in place.
pub struct ReloadController {
    path: PathBuf,
    catalog: Arc<Catalog>,
    lock: Mutex<()>,
}

impl ReloadController {
    pub fn new(path: impl Into<PathBuf>, catalog: Arc<Catalog>) -> Self {
        Self {
            path: path.into(),
            catalog,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn reload(&self) -> Result<ReloadSummary, ConfigError> {
        let _guard = self.lock.lock().await;

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ConfigError::Io {
                path: self.path.display().to_string(),
                source: e,
            })?;

        let result = Config::parse_with_env(&content).and_then(|(config, _)| {
            Snapshot::from_config(&config, self.catalog.version() + 1)
        });

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    version = self.catalog.version(),
                    "Reload rejected, keeping current configuration"
                );
                return Err(e);
            }
        };

        let summary = ReloadSummary {
            version: snapshot.version,
            models_count: snapshot.registry.models_count(),
            providers_count: snapshot.registry.providers_count(),
        };
        self.catalog.publish(snapshot);

        tracing::info!(
            version = summary.version,
            models = summary.models_count,
            providers = summary.providers_count,
            "Configuration reloaded"
        );
        Ok(summary)
    }
}

impl std::fmt::Debug for ReloadController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadController")
            .field("path", &self.path)
            .field("catalog", &self.catalog)
            .finish()
    }
}
