//! Ships: hosts running a Docker engine

use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Name of the implicit ship representing this machine
pub const LOCAL_SHIP_NAME: &str = "localship";

/// A host running a Docker engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ship {
    /// Filled from the key of the `ships` mapping when omitted
    #[serde(default)]
    pub name: String,
    pub fqdn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    /// The ship is this machine, reached through `docker-url`
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local: bool,
}

impl Ship {
    pub fn new(name: &str, fqdn: &str) -> Self {
        Self {
            name: name.to_string(),
            fqdn: fqdn.to_string(),
            datacenter: None,
            local: false,
        }
    }

    /// The ship for this machine
    pub fn local(settings: &Settings) -> Self {
        Self {
            name: LOCAL_SHIP_NAME.to_string(),
            fqdn: settings.localship_fqdn.clone(),
            datacenter: Some("localdc".to_string()),
            local: true,
        }
    }

    /// True for the local ship or a ship named after this host
    pub fn is_local(&self) -> bool {
        self.local || gethostname::gethostname().to_string_lossy() == self.name
    }

    /// URL of the ship's Docker engine
    pub fn docker_url(&self, settings: &Settings) -> String {
        if self.local {
            settings.docker_url.clone()
        } else {
            format!("http://{}:{}/", self.fqdn, settings.ship_docker_port)
        }
    }
}

impl std::fmt::Display for Ship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialOrd for Ship {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ship {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fqdn
            .cmp(&other.fqdn)
            .then_with(|| self.name.cmp(&other.name))
    }
}
