//! Docker engine transport
//!
//! [`DockerApi`] is the seam between the orchestration logic and a Docker
//! engine. [`DockerClient`] speaks the Engine HTTP API; tests substitute an
//! in-memory engine.

pub mod client;
pub mod stream;

#[cfg(test)]
pub mod fake;

pub use client::DockerClient;
pub use stream::{follow_progress, LineReader, Operation};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw body chunks of a streaming engine response
pub type Chunks = tokio::sync::mpsc::Receiver<Result<Vec<u8>>>;

/// Operations Dominator needs from a Docker engine
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// Base URL of the engine
    fn url(&self) -> &str;

    async fn containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    /// Create a container and return its ID
    async fn create_container(&self, name: &str, spec: &CreateContainer) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str, timeout_secs: u64) -> Result<()>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect>;

    /// Block until the container exits and return its exit code
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Multiplexed stdout/stderr of the container
    async fn logs(&self, id: &str, follow: bool) -> Result<Chunks>;

    /// Attach to stdout/stderr, including output produced so far
    async fn attach(&self, id: &str) -> Result<Chunks>;

    /// Write `data` to the container's stdin and close it
    async fn send_stdin(&self, id: &str, data: &[u8]) -> Result<()>;

    /// Images of a repository
    async fn images(&self, repository: &str) -> Result<Vec<ImageSummary>>;

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect>;

    async fn pull(&self, repository: &str, tag: &str) -> Result<Chunks>;

    async fn push(&self, repository: &str, tag: &str) -> Result<Chunks>;

    /// Build from a tar context and tag the result `tag`
    async fn build(&self, tag: &str, context: Vec<u8>) -> Result<Chunks>;
}

/// Entry of the engine's container list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub status: String,
}

impl ContainerSummary {
    /// Primary name without the leading slash
    pub fn name(&self) -> Option<&str> {
        self.names.first().map(|n| n.trim_start_matches('/'))
    }
}

/// Host side of a published port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: String,
}

/// Host configuration sent on container creation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub memory: i64,
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    pub binds: Vec<String>,
}

/// Body of a container creation request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateContainer {
    pub image: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub exposed_ports: BTreeMap<String, serde_json::Value>,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectHostConfig {
    #[serde(default)]
    pub memory: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub ports: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountPoint {
    #[serde(default)]
    pub source: String,
    pub destination: String,
    #[serde(rename = "RW", default)]
    pub rw: bool,
}

/// Result of inspecting a container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    /// ID of the image the container runs
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub config: InspectConfig,
    #[serde(default)]
    pub host_config: InspectHostConfig,
    #[serde(default)]
    pub network_settings: NetworkSettings,
    #[serde(default)]
    pub mounts: Vec<MountPoint>,
}

impl ContainerInspect {
    /// Published ports that are actually bound to the host
    pub fn bound_ports(&self) -> BTreeMap<String, Vec<PortBinding>> {
        self.network_settings
            .ports
            .iter()
            .flatten()
            .filter_map(|(port, bindings)| match bindings {
                Some(bindings) if !bindings.is_empty() => Some((port.clone(), bindings.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Entry of the engine's image list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
}

/// Result of inspecting an image
///
/// Engines have reported the configuration under both `Config` and
/// `config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "config")]
    pub config: ImageConfig,
}

/// Split a command line into words, honouring single and double quotes
pub fn split_command(command: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_word = true;
                }
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("sleep 10"), vec!["sleep", "10"]);
        assert_eq!(
            split_command(r#"sh -c 'echo "hi there"'"#),
            vec!["sh", "-c", r#"echo "hi there""#]
        );
        assert_eq!(split_command(r#"echo "" x"#), vec!["echo", "", "x"]);
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn test_inspect_accepts_lowercase_config() {
        let json = r#"{"Id": "sha256:abc", "config": {"Cmd": ["sh"], "Env": ["A=1"]}}"#;
        let inspect: ImageInspect = serde_json::from_str(json).unwrap();
        assert_eq!(inspect.config.cmd, Some(vec!["sh".to_string()]));
    }

    #[test]
    fn test_inspect_without_config_fails() {
        let json = r#"{"Id": "sha256:abc"}"#;
        assert!(serde_json::from_str::<ImageInspect>(json).is_err());
    }

    #[test]
    fn test_bound_ports_skips_unbound() {
        let json = r#"{
            "Id": "c1", "Name": "/web",
            "NetworkSettings": {"Ports": {
                "80/tcp": [{"HostIp": "::", "HostPort": "8080"}],
                "443/tcp": null
            }}
        }"#;
        let inspect: ContainerInspect = serde_json::from_str(json).unwrap();
        let ports = inspect.bound_ports();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports["80/tcp"][0].host_port, "8080");
    }

    #[test]
    fn test_create_body_field_names() {
        let spec = CreateContainer {
            image: "busybox:latest".to_string(),
            open_stdin: true,
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["Image"], "busybox:latest");
        assert_eq!(json["OpenStdin"], true);
        assert!(json.get("Cmd").is_none());
        assert!(json["HostConfig"].get("PortBindings").is_some());
    }
}
