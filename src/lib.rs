//! Dominator - deploys declarative shipments of Docker containers
//!
//! A shipment describes which containers run on which ships (hosts with a
//! Docker engine). Dominator provides:
//!
//! - An object model for ships, images, volumes, config files and containers
//! - Building and pushing images from recipes, pinned by content hash
//! - Reconciliation of running containers with the shipment
//! - Remote execution through an ambassador container on every ship

pub mod actions;
pub mod compare;
pub mod docker;
pub mod entities;
pub mod error;
pub mod harbor;
pub mod logging;
pub mod settings;

pub use error::{DominatorError, Result};
