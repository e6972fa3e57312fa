//! Engine connections
//!
//! A [`Harbor`] owns the settings and hands out one engine client per URL,
//! so every container on a ship shares the same connection.

use crate::docker::{DockerApi, DockerClient};
use crate::entities::Ship;
use crate::error::{DominatorError, Result};
use crate::settings::Settings;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Opens a client for an engine URL
pub type Connector = Box<dyn Fn(&str) -> Result<Arc<dyn DockerApi>> + Send + Sync>;

/// Settings plus cached engine clients
pub struct Harbor {
    settings: Settings,
    connector: Connector,
    engines: Mutex<HashMap<String, Arc<dyn DockerApi>>>,
}

impl Harbor {
    /// Harbor talking to real engines over HTTP
    pub fn new(settings: Settings) -> Self {
        Self::with_connector(
            settings,
            Box::new(|url| Ok(Arc::new(DockerClient::new(url)?) as Arc<dyn DockerApi>)),
        )
    }

    pub fn with_connector(settings: Settings, connector: Connector) -> Self {
        Self {
            settings,
            connector,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Client for the engine at `url`, created on first use
    pub fn engine(&self, url: &str) -> Result<Arc<dyn DockerApi>> {
        let mut engines = self
            .engines
            .lock()
            .map_err(|_| DominatorError::Network("engine cache poisoned".to_string()))?;
        if let Some(engine) = engines.get(url) {
            return Ok(engine.clone());
        }
        let engine = (self.connector)(url)?;
        engines.insert(url.to_string(), engine.clone());
        Ok(engine)
    }

    /// Engine used for image bookkeeping
    pub fn local(&self) -> Result<Arc<dyn DockerApi>> {
        self.engine(&self.settings.docker_url)
    }

    /// Engine of `ship`
    pub fn ship(&self, ship: &Ship) -> Result<Arc<dyn DockerApi>> {
        self.engine(&ship.docker_url(&self.settings))
    }
}
