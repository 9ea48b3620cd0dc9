//! Engine builder
//!
//! Wires the catalog, query side, job store and orchestrator into one
//! [`AnalyticsEngine`]. Every piece can be supplied explicitly; anything left
//! unset is derived from the [`Config`].

use super::query::QueryEngine;
use super::AnalyticsEngine;
use crate::catalog::{Catalog, CatalogHandle};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics;
use crate::tasks::{JobRunner, JobStore, TaskOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Builder for [`AnalyticsEngine`]
#[derive(Default)]
pub struct AnalyticsEngineBuilder {
    config: Option<Config>,
    catalog: Option<Arc<CatalogHandle>>,
    data_dir: Option<PathBuf>,
    artifact_dir: Option<PathBuf>,
}

impl AnalyticsEngineBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an already opened catalog
    pub fn with_catalog(mut self, catalog: Arc<CatalogHandle>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Use an in-memory catalog
    pub fn with_catalog_snapshot(self, catalog: Catalog) -> Self {
        let capacity = self
            .config
            .as_ref()
            .map_or_else(|| Config::default().dataset.segment_cache_capacity, |c| {
                c.dataset.segment_cache_capacity
            });
        self.with_catalog(Arc::new(CatalogHandle::from_catalog(catalog, capacity)))
    }

    /// Override `dataset.data_dir`
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Override `tasks.artifact_dir`
    pub fn with_artifact_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_dir = Some(dir.into());
        self
    }

    /// Validate the configuration, open the catalog and job store
    pub fn build(self) -> Result<AnalyticsEngine> {
        let mut config = self.config.unwrap_or_default();
        if let Some(dir) = self.data_dir {
            config.dataset.data_dir = dir;
        }
        if let Some(dir) = self.artifact_dir {
            config.tasks.artifact_dir = dir;
        }
        config.validate().map_err(Error::Configuration)?;

        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(CatalogHandle::open(
                config.dataset.data_dir.clone(),
                config.dataset.segment_cache_capacity,
            )?),
        };
        let snapshot = catalog.snapshot();
        metrics::update_catalog_sources(snapshot.len());

        let store = Arc::new(JobStore::open(config.tasks.artifact_dir.clone())?);
        let config = Arc::new(config);
        let query = Arc::new(QueryEngine::new(config.clone(), catalog));
        let runner: Arc<dyn JobRunner> = query.clone();
        let orchestrator = Arc::new(TaskOrchestrator::new(config.tasks.clone(), store, runner));

        info!(
            sources = snapshot.len(),
            skipped = snapshot.skipped().len(),
            years = ?snapshot.covered_years(),
            artifact_dir = %config.tasks.artifact_dir.display(),
            "Analytics engine ready"
        );
        Ok(AnalyticsEngine {
            query,
            orchestrator,
        })
    }
}
