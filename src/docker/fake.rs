//! In-memory engine for tests

use super::stream::chunks_from;
use super::{
    Chunks, ContainerInspect, ContainerSummary, CreateContainer, DockerApi, ImageConfig,
    ImageInspect, ImageSummary, InspectConfig, InspectHostConfig, MountPoint, NetworkSettings,
};
use crate::error::{DominatorError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub running: bool,
    pub spec: CreateContainer,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub containers: Vec<FakeContainer>,
    /// Local images: id, repo:tag list, config
    pub images: Vec<(String, Vec<String>, ImageConfig)>,
    /// What a pull can fetch: `repo:tag` to id
    pub registry: BTreeMap<String, String>,
    pub calls: Vec<String>,
    pub start_errors: VecDeque<DominatorError>,
    pub remove_errors: VecDeque<DominatorError>,
    pub stdin_errors: VecDeque<DominatorError>,
    pub output: Vec<u8>,
    pub stdin: Vec<u8>,
    pub exit_code: i64,
    next_id: u32,
}

/// Engine keeping containers and images in memory
pub struct FakeDocker {
    url: String,
    pub state: Mutex<FakeState>,
}

fn api_error(status: u16, message: &str) -> DominatorError {
    DominatorError::Api {
        status,
        message: message.to_string(),
    }
}

impl FakeDocker {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: Mutex::new(FakeState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake state poisoned")
    }

    /// Make `repo_tag` available locally
    pub fn add_image(&self, repo_tag: &str, id: &str, config: ImageConfig) {
        let mut state = self.state();
        for (_, tags, _) in state.images.iter_mut() {
            tags.retain(|t| t != repo_tag);
        }
        state
            .images
            .push((id.to_string(), vec![repo_tag.to_string()], config));
    }

    /// Make `repo_tag` available for pulling
    pub fn publish(&self, repo_tag: &str, id: &str) {
        self.state()
            .registry
            .insert(repo_tag.to_string(), id.to_string());
    }

    /// Pretend a container already exists
    pub fn add_container(&self, name: &str, spec: CreateContainer, running: bool) -> String {
        let image_id = self.image_id(&spec.image).unwrap_or_default();
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            image_id,
            running,
            spec,
        });
        id
    }

    pub fn set_output(&self, output: Vec<u8>) {
        self.state().output = output;
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Recorded calls whose name starts with `prefix`
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split(' ').next() == Some(prefix))
            .collect()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state()
            .containers
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    fn image_id(&self, reference: &str) -> Option<String> {
        self.state()
            .images
            .iter()
            .find(|(id, tags, _)| id == reference || tags.iter().any(|t| t == reference))
            .map(|(id, _, _)| id.clone())
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }

    fn find(&self, id: &str) -> Result<FakeContainer> {
        self.state()
            .containers
            .iter()
            .find(|c| c.id == id || c.name == id)
            .cloned()
            .ok_or_else(|| api_error(404, &format!("No such container: {}", id)))
    }

    fn set_running(&self, id: &str, running: bool) {
        for c in self.state().containers.iter_mut() {
            if c.id == id {
                c.running = running;
            }
        }
    }
}

#[async_trait]
impl DockerApi for FakeDocker {
    fn url(&self) -> &str {
        &self.url
    }

    async fn containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .state()
            .containers
            .iter()
            .filter(|c| all || c.running)
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.name)],
                status: if c.running {
                    "Up 2 seconds".to_string()
                } else {
                    "Exited (0) 1 second ago".to_string()
                },
            })
            .collect())
    }

    async fn create_container(&self, name: &str, spec: &CreateContainer) -> Result<String> {
        self.record(format!("create {}", name));
        if self.container(name).is_some() {
            return Err(api_error(409, "Conflict. The container name is already in use"));
        }
        if self.image_id(&spec.image).is_none() {
            return Err(api_error(404, &format!("No such image: {}", spec.image)));
        }
        Ok(self.add_container(name, spec.clone(), false))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(format!("start {}", id));
        self.find(id)?;
        if let Some(err) = self.state().start_errors.pop_front() {
            return Err(err);
        }
        self.set_running(id, true);
        Ok(())
    }

    async fn stop(&self, id: &str, timeout_secs: u64) -> Result<()> {
        self.record(format!("stop {} {}", id, timeout_secs));
        self.find(id)?;
        self.set_running(id, false);
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        self.record(format!("remove {} {}", id, force));
        let container = self.find(id)?;
        if let Some(err) = self.state().remove_errors.pop_front() {
            return Err(err);
        }
        if container.running && !force {
            return Err(api_error(409, "You cannot remove a running container"));
        }
        self.state().containers.retain(|c| c.id != container.id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        let container = self.find(id)?;
        let image_config = self
            .state()
            .images
            .iter()
            .find(|(image_id, _, _)| *image_id == container.image_id)
            .map(|(_, _, config)| config.clone())
            .unwrap_or_default();

        let mut env: BTreeMap<String, String> = BTreeMap::new();
        for var in image_config.env.iter().flatten().chain(container.spec.env.iter()) {
            if let Some((k, v)) = var.split_once('=') {
                env.insert(k.to_string(), v.to_string());
            }
        }
        let ports = container
            .spec
            .host_config
            .port_bindings
            .iter()
            .map(|(port, bindings)| (port.clone(), Some(bindings.clone())))
            .collect();
        let mounts = container
            .spec
            .host_config
            .binds
            .iter()
            .filter_map(|bind| {
                let mut parts = bind.split(':');
                let source = parts.next()?.to_string();
                let destination = parts.next()?.to_string();
                let rw = parts.next() != Some("ro");
                Some(MountPoint {
                    source,
                    destination,
                    rw,
                })
            })
            .collect();

        Ok(ContainerInspect {
            id: container.id.clone(),
            name: format!("/{}", container.name),
            image: container.image_id.clone(),
            config: InspectConfig {
                image: container.spec.image.clone(),
                cmd: container.spec.cmd.clone().or(image_config.cmd),
                env: Some(env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            },
            host_config: InspectHostConfig {
                memory: container.spec.host_config.memory,
            },
            network_settings: NetworkSettings { ports: Some(ports) },
            mounts,
        })
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        self.record(format!("wait {}", id));
        self.set_running(id, false);
        Ok(self.state().exit_code)
    }

    async fn logs(&self, id: &str, follow: bool) -> Result<Chunks> {
        self.record(format!("logs {} {}", id, follow));
        self.find(id)?;
        Ok(chunks_from(vec![self.state().output.clone()]))
    }

    async fn attach(&self, id: &str) -> Result<Chunks> {
        self.record(format!("attach {}", id));
        self.find(id)?;
        Ok(chunks_from(vec![self.state().output.clone()]))
    }

    async fn send_stdin(&self, id: &str, data: &[u8]) -> Result<()> {
        self.record(format!("stdin {}", id));
        if let Some(err) = self.state().stdin_errors.pop_front() {
            return Err(err);
        }
        self.state().stdin.extend_from_slice(data);
        Ok(())
    }

    async fn images(&self, repository: &str) -> Result<Vec<ImageSummary>> {
        let prefix = format!("{}:", repository);
        Ok(self
            .state()
            .images
            .iter()
            .filter(|(_, tags, _)| tags.iter().any(|t| t.starts_with(&prefix)))
            .map(|(id, tags, _)| ImageSummary {
                id: id.clone(),
                repo_tags: Some(tags.clone()),
            })
            .collect())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect> {
        self.state()
            .images
            .iter()
            .find(|(id, tags, _)| id == reference || tags.iter().any(|t| t == reference))
            .map(|(id, _, config)| ImageInspect {
                id: id.clone(),
                config: config.clone(),
            })
            .ok_or_else(|| api_error(404, &format!("No such image: {}", reference)))
    }

    async fn pull(&self, repository: &str, tag: &str) -> Result<Chunks> {
        let repo_tag = format!("{}:{}", repository, tag);
        self.record(format!("pull {}", repo_tag));
        let published = self.state().registry.get(&repo_tag).cloned();
        let body = match published {
            Some(id) => {
                let config = self
                    .state()
                    .images
                    .iter()
                    .find(|(image_id, _, _)| *image_id == id)
                    .map(|(_, _, config)| config.clone())
                    .unwrap_or_default();
                self.add_image(&repo_tag, &id, config);
                format!("{{\"status\": \"Downloaded newer image for {}\"}}\n", repo_tag)
            }
            None => format!("{{\"error\": \"manifest for {} not found\"}}\n", repo_tag),
        };
        Ok(chunks_from(vec![body.into_bytes()]))
    }

    async fn push(&self, repository: &str, tag: &str) -> Result<Chunks> {
        let repo_tag = format!("{}:{}", repository, tag);
        self.record(format!("push {}", repo_tag));
        let body = match self.image_id(&repo_tag) {
            Some(id) => {
                self.publish(&repo_tag, &id);
                format!("{{\"status\": \"Pushed {}\"}}\n", repo_tag)
            }
            None => format!("{{\"error\": \"An image does not exist locally with the tag: {}\"}}\n", repo_tag),
        };
        Ok(chunks_from(vec![body.into_bytes()]))
    }

    async fn build(&self, tag: &str, context: Vec<u8>) -> Result<Chunks> {
        self.record(format!("build {} {}", tag, context.len()));
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            format!("sha256:built{}", state.next_id)
        };
        self.add_image(tag, &id, ImageConfig::default());
        Ok(chunks_from(vec![
            format!("{{\"stream\": \"Successfully built {}\\n\"}}\n", id).into_bytes(),
        ]))
    }
}
