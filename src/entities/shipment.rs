//! Shipments: the declarative description of a service

use super::{Container, Ship, LOCAL_SHIP_NAME};
use crate::error::{DominatorError, Result};
use crate::harbor::Harbor;
use crate::logging;
use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Ships and the containers placed on them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shipment {
    pub name: String,
    #[serde(default)]
    pub ships: BTreeMap<String, Ship>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

impl Shipment {
    /// Load from a YAML file, or from stdin when `source` is `-`
    pub async fn load(source: &str, settings: &Settings) -> Result<Self> {
        if source == "-" {
            tracing::debug!("reading shipment from stdin");
            return Self::read(tokio::io::stdin(), settings).await;
        }
        let path = Path::new(source);
        tracing::debug!(path = %path.display(), "reading shipment");
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            DominatorError::Shipment(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text, settings)
    }

    /// Read a whole shipment document from `reader`
    pub async fn read<R: AsyncRead + Unpin>(mut reader: R, settings: &Settings) -> Result<Self> {
        let mut text = String::new();
        reader.read_to_string(&mut text).await?;
        Self::from_yaml(&text, settings)
    }

    /// Parse and validate a shipment
    ///
    /// Ship names default to their key, `localship` is implied when
    /// referenced and every image is normalized against the settings.
    pub fn from_yaml(text: &str, settings: &Settings) -> Result<Self> {
        let mut shipment: Shipment = serde_yaml::from_str(text)
            .map_err(|e| DominatorError::Shipment(format!("invalid shipment: {}", e)))?;

        for (key, ship) in shipment.ships.iter_mut() {
            if ship.name.is_empty() {
                ship.name = key.clone();
            } else if ship.name != *key {
                return Err(DominatorError::Shipment(format!(
                    "ship {} is listed under the name {}",
                    ship.name, key
                )));
            }
        }

        for container in shipment.containers.iter_mut() {
            if !shipment.ships.contains_key(&container.ship) {
                if container.ship != LOCAL_SHIP_NAME {
                    return Err(DominatorError::Shipment(format!(
                        "container {} refers to unknown ship {}",
                        container.name, container.ship
                    )));
                }
                shipment
                    .ships
                    .insert(LOCAL_SHIP_NAME.to_string(), Ship::local(settings));
            }
            container.image.normalize(settings);
        }

        tracing::debug!(
            shipment = %shipment.name,
            ships = shipment.ships.len(),
            containers = shipment.containers.len(),
            "shipment loaded"
        );
        Ok(shipment)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// The ship a container is placed on
    pub fn ship(&self, container: &Container) -> Result<&Ship> {
        self.ships.get(&container.ship).ok_or_else(|| {
            DominatorError::Shipment(format!("unknown ship {} of {}", container.ship, container.name))
        })
    }

    /// Containers placed on ships that are this machine
    pub fn local_containers(&self) -> Vec<&Container> {
        self.containers
            .iter()
            .filter(|c| self.ships.get(&c.ship).is_some_and(Ship::is_local))
            .collect()
    }

    /// Containers matching the optional ship and container names, sorted
    /// by ship then name
    pub fn filter(&self, ship: Option<&str>, container: Option<&str>) -> Vec<Container> {
        let mut selected: Vec<Container> = self
            .containers
            .iter()
            .filter(|c| ship.map_or(true, |s| c.ship == s))
            .filter(|c| container.map_or(true, |n| c.name == n))
            .cloned()
            .collect();
        selected.sort_by(|a, b| (&a.ship, &a.name).cmp(&(&b.ship, &b.name)));
        if selected.is_empty() {
            tracing::error!(
                target: logging::CONTAINER,
                ship = ship.unwrap_or("*"),
                container = container.unwrap_or("*"),
                "no containers matched"
            );
        }
        selected
    }

    /// Containers grouped by the ship they run on
    pub fn group(containers: Vec<Container>) -> BTreeMap<String, Vec<Container>> {
        let mut groups: BTreeMap<String, Vec<Container>> = BTreeMap::new();
        for container in containers {
            groups.entry(container.ship.clone()).or_default().push(container);
        }
        groups
    }

    /// Shipment holding only `containers` and the ships they use
    pub fn subset(&self, containers: Vec<Container>) -> Self {
        let ships = self
            .ships
            .iter()
            .filter(|(name, _)| containers.iter().any(|c| &c.ship == *name))
            .map(|(name, ship)| (name.clone(), ship.clone()))
            .collect();
        Self {
            name: self.name.clone(),
            ships,
            containers,
        }
    }

    /// Resolve every image so the shipment names exact images
    ///
    /// Source images whose tag is missing are built and pushed.
    pub async fn pin_images(&mut self, harbor: &Harbor) -> Result<()> {
        let docker = harbor.local()?;
        for container in self.containers.iter_mut() {
            container.image.resolve_id(docker.as_ref()).await?;
        }
        Ok(())
    }
}
