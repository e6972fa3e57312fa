//! Shipment object model: ships, images, volumes, files and containers

pub mod container;
pub mod file;
pub mod image;
pub mod ship;
pub mod shipment;
pub mod volume;

pub use container::{Container, ContainerState};
pub use file::File;
pub use image::{BuildRecipe, Image};
pub use ship::{Ship, LOCAL_SHIP_NAME};
pub use shipment::Shipment;
pub use volume::Volume;

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// Mapping of names to scalars, kept as strings
///
/// Shipments write `PORT: 80` and `DEBUG: true` as often as quoted strings.
pub(crate) fn deserialize_string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_yaml::Value>>::deserialize(deserializer)?;
    raw.unwrap_or_default()
        .into_iter()
        .map(|(name, value)| match file::scalar_to_string(&value) {
            Some(value) => Ok((name, value)),
            None => Err(serde::de::Error::custom(format!(
                "value of {} must be a scalar",
                name
            ))),
        })
        .collect()
}
