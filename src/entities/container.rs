//! Containers and their lifecycle on a ship

use super::{deserialize_string_map, Image, Ship, Volume};
use crate::compare::{compare_container, Difference};
use crate::docker::{
    split_command, ContainerInspect, ContainerSummary, CreateContainer, DockerApi, HostConfig,
    LineReader, PortBinding,
};
use crate::error::{DominatorError, Result};
use crate::harbor::Harbor;
use crate::logging;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::Instrument;

/// Seconds the engine waits before killing a stopping container
pub const STOP_TIMEOUT_SECS: u64 = 2;

/// Status of a container the engine does not know
pub const NOT_FOUND: &str = "not found";

/// Engine bug: start fails right after create
const BUG_CANNOT_FIND_CHILD: &str = "Cannot find child for";
/// Engine bug: stale port allocation survives the previous container
const BUG_PORT_ALLOCATED: &str = "port has already been allocated";
/// Engine bug: devicemapper occasionally fails to remove a root filesystem
const BUG_DEVICEMAPPER: &str = "Driver devicemapper failed to remove root filesystem";

/// Runtime state as last observed on the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    pub status: String,
}

impl Default for ContainerState {
    fn default() -> Self {
        Self {
            id: String::new(),
            status: NOT_FOUND.to_string(),
        }
    }
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Desired configuration of a container placed on a ship
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    /// Name of the ship the container runs on
    pub ship: String,
    pub image: Image,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Container ports by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, u16>,
    /// Memory limit in bytes, 0 for none
    #[serde(default, skip_serializing_if = "is_zero")]
    pub memory: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Volume>,
    #[serde(
        default,
        deserialize_with = "deserialize_string_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub env: BTreeMap<String, String>,
    /// Host ports by port name, when they differ from the container port
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extports: BTreeMap<String, u16>,
    /// Protocol by port name, `tcp` when absent
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub portproto: BTreeMap<String, String>,
    /// Keep stdin open for a single attach and close it with the stream
    #[serde(skip)]
    pub stdin_once: bool,
    #[serde(skip)]
    pub state: ContainerState,
}

impl std::fmt::Display for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ship, self.name)
    }
}

impl Container {
    pub fn new(name: &str, ship: &str, image: Image) -> Self {
        Self {
            name: name.to_string(),
            ship: ship.to_string(),
            image,
            command: None,
            hostname: None,
            ports: BTreeMap::new(),
            memory: 0,
            volumes: BTreeMap::new(),
            env: BTreeMap::new(),
            extports: BTreeMap::new(),
            portproto: BTreeMap::new(),
            stdin_once: false,
            state: ContainerState::default(),
        }
    }

    /// Hostname inside the container, `<name>-<ship>` unless set
    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.name, self.ship))
    }

    pub fn running(&self) -> bool {
        self.state.status.contains("Up")
    }

    /// Host port for the named port
    pub fn port(&self, name: &str) -> Option<u16> {
        self.extports
            .get(name)
            .or_else(|| self.ports.get(name))
            .copied()
    }

    pub fn protocol(&self, name: &str) -> &str {
        self.portproto.get(name).map(String::as_str).unwrap_or("tcp")
    }

    /// Variables templates can refer to as `this.*`
    pub fn template_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("this.name".to_string(), self.name.clone());
        vars.insert("this.hostname".to_string(), self.hostname());
        vars.insert("this.ship.name".to_string(), self.ship.clone());
        vars.insert("this.memory".to_string(), self.memory.to_string());
        vars.insert("this.image.repository".to_string(), self.image.full_repository());
        vars.insert("this.image.tag".to_string(), self.image.tag.clone());
        for (name, value) in &self.env {
            vars.insert(format!("this.env.{}", name), value.clone());
        }
        for (name, port) in &self.ports {
            vars.insert(format!("this.ports.{}", name), port.to_string());
        }
        for name in self.ports.keys() {
            if let Some(port) = self.port(name) {
                vars.insert(format!("this.extports.{}", name), port.to_string());
            }
        }
        vars
    }

    fn span(&self) -> tracing::Span {
        tracing::info_span!(target: logging::CONTAINER, "container", ship = %self.ship, container = %self.name)
    }

    /// Refresh id and status from `info`, or from the engine when `None`
    pub async fn check(&mut self, docker: &dyn DockerApi) -> Result<()> {
        tracing::debug!(target: logging::CONTAINER, container = %self, "checking container status");
        let containers = docker.containers(true).await?;
        let matched = containers.iter().find(|c| c.name() == Some(self.name.as_str()));
        self.apply(matched);
        Ok(())
    }

    /// Take id and status from an engine list entry; `None` means absent
    pub fn apply(&mut self, info: Option<&ContainerSummary>) {
        match info {
            Some(info) => {
                if !info.id.is_empty() {
                    self.state.id = info.id.clone();
                }
                if !info.status.is_empty() {
                    self.state.status = info.status.clone();
                }
            }
            None => self.state = ContainerState::default(),
        }
    }

    /// Creation request for this container
    pub fn create_spec(&self, harbor: &Harbor) -> CreateContainer {
        let settings = harbor.settings();
        let mut exposed_ports = BTreeMap::new();
        let mut port_bindings = BTreeMap::new();
        for (name, port) in &self.ports {
            let key = format!("{}/{}", port, self.protocol(name));
            exposed_ports.insert(key.clone(), serde_json::json!({}));
            port_bindings.insert(
                key,
                vec![PortBinding {
                    host_ip: "::".to_string(),
                    host_port: self.port(name).unwrap_or(*port).to_string(),
                }],
            );
        }

        CreateContainer {
            image: self.image.to_string(),
            hostname: self.hostname(),
            cmd: self.command.as_deref().map(split_command),
            env: self
                .env
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect(),
            exposed_ports,
            open_stdin: true,
            stdin_once: self.stdin_once,
            attach_stdin: self.stdin_once,
            attach_stdout: true,
            attach_stderr: true,
            host_config: HostConfig {
                memory: self.memory,
                port_bindings,
                binds: self
                    .volumes
                    .values()
                    .map(|v| v.bind_spec(&self.name, settings))
                    .collect(),
            },
        }
    }

    /// Render volumes and create the container, pulling the image onto the
    /// ship when it is missing there
    pub async fn create(&mut self, harbor: &Harbor, ship: &Ship) -> Result<()> {
        let span = self.span();
        async {
            tracing::debug!(target: logging::CONTAINER, "preparing to create container");
            for volume in self.volumes.values() {
                volume.render(self, harbor.settings())?;
            }

            let local = harbor.local()?;
            self.image.resolve_id(local.as_ref()).await?;

            let docker = harbor.ship(ship)?;
            let spec = self.create_spec(harbor);
            tracing::debug!(target: logging::CONTAINER, image = %self.image, "creating container");
            let id = match docker.create_container(&self.name, &spec).await {
                Err(e) if e.status() == Some(404) => {
                    tracing::info!(target: logging::CONTAINER, "could not find requested image, pulling repo");
                    let mut image = self.image.clone();
                    image.pull(docker.as_ref()).await?;
                    docker.create_container(&self.name, &spec).await?
                }
                other => other?,
            };

            self.state = ContainerState {
                id,
                status: "Created".to_string(),
            };
            tracing::debug!(target: logging::CONTAINER, id = %self.state.id, "container created");
            Ok(())
        }
        .instrument(span)
        .await
    }

    pub async fn start(&mut self, docker: &dyn DockerApi) -> Result<()> {
        let span = self.span();
        async {
            tracing::debug!(target: logging::CONTAINER, "starting container");
            match docker.start(&self.state.id).await {
                Ok(()) => {}
                Err(e) if e.explains(BUG_CANNOT_FIND_CHILD) => {
                    tracing::debug!(target: logging::CONTAINER, error = %e, "start failed");
                    tracing::warn!(target: logging::CONTAINER, "engine bug 'Cannot find child' detected, waiting 2 seconds and trying to start container again");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    docker.start(&self.state.id).await?;
                }
                Err(e) if e.explains(BUG_PORT_ALLOCATED) => {
                    tracing::debug!(target: logging::CONTAINER, error = %e, "start failed");
                    tracing::error!(target: logging::CONTAINER, "engine bug 'port has already been allocated' detected, try to restart the engine manually");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
            self.state.status = "Up".to_string();
            tracing::debug!(target: logging::CONTAINER, "container started");
            Ok(())
        }
        .instrument(span)
        .await
    }

    pub async fn stop(&mut self, docker: &dyn DockerApi) -> Result<()> {
        tracing::debug!(target: logging::CONTAINER, container = %self, "stopping container");
        docker.stop(&self.state.id, STOP_TIMEOUT_SECS).await?;
        self.state.status = "stopped".to_string();
        Ok(())
    }

    pub async fn remove(&mut self, docker: &dyn DockerApi, force: bool) -> Result<()> {
        tracing::debug!(target: logging::CONTAINER, container = %self, "removing container");
        match docker.remove_container(&self.state.id, force).await {
            Ok(()) => {}
            Err(e) if e.explains(BUG_DEVICEMAPPER) => {
                tracing::debug!(target: logging::CONTAINER, error = %e, "remove failed");
                tracing::warn!(target: logging::CONTAINER, container = %self, "engine bug 'Driver devicemapper failed to remove root filesystem' detected, just trying again");
                self.check(docker).await?;
                if !self.state.id.is_empty() {
                    docker.remove_container(&self.state.id, force).await?;
                }
            }
            Err(e) => return Err(e),
        }
        self.state = ContainerState::default();
        Ok(())
    }

    pub async fn inspect(&self, docker: &dyn DockerApi) -> Result<ContainerInspect> {
        docker.inspect_container(&self.state.id).await
    }

    pub async fn wait(&self, docker: &dyn DockerApi) -> Result<i64> {
        docker.wait(&self.state.id).await
    }

    /// Differences between the running container and this configuration
    pub async fn diff(&mut self, harbor: &Harbor, ship: &Ship) -> Result<Vec<Difference>> {
        let docker = harbor.ship(ship)?;
        let info = self.inspect(docker.as_ref()).await?;
        let local = harbor.local()?;
        compare_container(self, local.as_ref(), &info, harbor.settings()).await
    }

    /// Bring the ship in line with this configuration
    ///
    /// A running container with identical configuration is kept. Otherwise
    /// any container with the same name is stopped and removed, and a fresh
    /// one created and started.
    pub async fn run(&mut self, harbor: &Harbor, ship: &Ship) -> Result<()> {
        let docker = harbor.ship(ship)?;
        self.check(docker.as_ref()).await?;

        if self.running() {
            tracing::info!(target: logging::CONTAINER, container = %self, "found running container with the same name, comparing config with requested");
            let diff = self.diff(harbor, ship).await?;
            if diff.is_empty() {
                tracing::info!(target: logging::CONTAINER, container = %self, "running container config identical to requested, keeping");
                return Ok(());
            }
            tracing::info!(
                target: logging::CONTAINER,
                container = %self,
                diff = %crate::compare::summary(&diff),
                "running container config differs from requested, stopping"
            );
            self.stop(docker.as_ref()).await?;
        }

        if !self.state.id.is_empty() {
            tracing::info!(target: logging::CONTAINER, container = %self, "found stopped container with the same name, removing");
            self.remove(docker.as_ref(), false).await?;
        }

        self.create(harbor, ship).await?;
        self.start(docker.as_ref()).await
    }

    /// Create, attach and start the container, returning its output
    ///
    /// A leftover container with the same name is force-removed first.
    pub async fn launch(&mut self, harbor: &Harbor, ship: &Ship) -> Result<LineReader> {
        let docker = harbor.ship(ship)?;
        tracing::debug!(target: logging::CONTAINER, container = %self, "executing");
        match self.create(harbor, ship).await {
            Ok(()) => {}
            Err(e) if e.status() == Some(409) => {
                self.check(docker.as_ref()).await?;
                self.remove(docker.as_ref(), true).await?;
                self.create(harbor, ship).await?;
            }
            Err(e) => return Err(e),
        }

        tracing::debug!(target: logging::CONTAINER, container = %self, "attaching to stdout/stderr");
        let output = docker.attach(&self.state.id).await?;
        self.start(docker.as_ref()).await?;
        Ok(LineReader::multiplexed(output))
    }

    /// Stop a launched container, ignoring failures
    pub async fn halt(&mut self, docker: &dyn DockerApi) {
        if let Err(e) = self.stop(docker).await {
            tracing::debug!(target: logging::CONTAINER, container = %self, error = %e, "could not stop container, ignoring");
        }
    }

    /// Run the container until it stops, feeding each output line to `sink`
    pub async fn execute<F>(&mut self, harbor: &Harbor, ship: &Ship, mut sink: F) -> Result<()>
    where
        F: FnMut(&str) + Send,
    {
        let docker = harbor.ship(ship)?;
        let result: Result<()> = async {
            let mut output = self.launch(harbor, ship).await?;
            while let Some(line) = output.next_line().await {
                sink(&line?);
            }
            Ok(())
        }
        .await;
        self.halt(docker.as_ref()).await;
        result
    }

    /// Feed the container's log lines to `sink`, optionally following
    pub async fn logs<F>(&self, docker: &dyn DockerApi, follow: bool, mut sink: F) -> Result<()>
    where
        F: FnMut(&str) + Send,
    {
        if self.state.id.is_empty() {
            return Err(DominatorError::Container(format!("{} not found", self)));
        }
        tracing::debug!(target: logging::CONTAINER, container = %self, follow, "getting logs from container");
        let mut lines = LineReader::multiplexed(docker.logs(&self.state.id, follow).await?);
        while let Some(line) = lines.next_line().await {
            sink(&line?);
        }
        Ok(())
    }
}
