//! Images and buildable source images

use crate::docker::{follow_progress, DockerApi, ImageConfig, Operation};
use crate::error::{DominatorError, Result};
use crate::logging;
use crate::settings::Settings;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use tracing::Instrument;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

fn default_tag() -> String {
    "latest".to_string()
}

fn registry_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(.*)/(.*/.*)$").expect("static regex"))
}

/// A repository image, optionally built from a recipe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub repository: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    /// Engine ID, resolved lazily
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    /// Recipe for images Dominator builds itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Box<BuildRecipe>>,
    #[serde(skip)]
    tags: Option<BTreeMap<String, String>>,
}

/// How to build a source image on top of its parent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecipe {
    pub parent: Image,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(
        default,
        deserialize_with = "super::deserialize_string_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ports: BTreeMap<String, u16>,
    /// Files added to the image, path to content
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
}

impl BuildRecipe {
    pub fn new(parent: Image) -> Self {
        Self {
            parent,
            scripts: Vec::new(),
            command: None,
            workdir: None,
            env: BTreeMap::new(),
            volumes: BTreeMap::new(),
            ports: BTreeMap::new(),
            files: BTreeMap::new(),
        }
    }

    /// Dockerfile for this recipe; the parent must be resolved
    pub fn dockerfile(&self) -> String {
        let mut lines = vec![format!(
            "FROM {}:{}",
            self.parent.full_repository(),
            self.parent.tag
        )];
        for (name, value) in &self.env {
            lines.push(format!("ENV {} {}", name, value));
        }
        if let Some(ref workdir) = self.workdir {
            lines.push(format!("WORKDIR {}", workdir));
        }
        for script in &self.scripts {
            lines.push(format!("RUN {}", script));
        }
        for volume in self.volumes.values() {
            lines.push(format!("VOLUME {}", volume));
        }
        for port in self.ports.values() {
            lines.push(format!("EXPOSE {}", port));
        }
        if let Some(ref command) = self.command {
            lines.push(format!("CMD {}", command));
        }
        for path in self.files.keys() {
            lines.push(format!("ADD {} {}", path.trim_start_matches('/'), path));
        }
        let mut dockerfile = lines.join("\n");
        dockerfile.push('\n');
        dockerfile
    }

    /// Tar archive holding the Dockerfile and every file of the recipe
    pub fn build_context(&self) -> Result<Vec<u8>> {
        let mut archive = tar::Builder::new(Vec::new());
        for (path, content) in &self.files {
            append_file(&mut archive, path.trim_start_matches('/'), content.as_bytes())?;
        }
        append_file(&mut archive, "Dockerfile", self.dockerfile().as_bytes())?;
        Ok(archive.into_inner()?)
    }

    /// Content hash identifying this recipe for `repository`
    ///
    /// Any change to the recipe, its files or the parent image yields a new
    /// tag, and a tag missing from the registry means a rebuild.
    pub fn digest(&self, repository: &str) -> String {
        let files: BTreeMap<&String, String> = self
            .files
            .iter()
            .map(|(path, content)| (path, format!("{:x}", Sha256::digest(content.as_bytes()))))
            .collect();
        let document = serde_json::json!({
            "repository": repository,
            "parent": self.parent.hash_ref(),
            "scripts": self.scripts,
            "command": self.command,
            "workdir": self.workdir,
            "env": self.env,
            "volumes": self.volumes,
            "ports": self.ports,
            "files": files,
        });
        format!("{:x}", Sha256::digest(document.to_string().as_bytes()))
    }
}

fn append_file(archive: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, path, data)?;
    Ok(())
}

impl std::fmt::Display for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.full_repository(), self.tag)
    }
}

impl Image {
    /// Image of `repository`, resolved against the configured namespace and
    /// registry
    pub fn new(repository: &str, settings: &Settings) -> Self {
        let mut image = Self::bare(repository);
        image.normalize(settings);
        image
    }

    /// Image taken literally, without applying settings
    pub fn bare(repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
            tag: default_tag(),
            id: String::new(),
            registry: None,
            build: None,
            tags: None,
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    /// Image built from `recipe`
    pub fn source(repository: &str, recipe: BuildRecipe, settings: &Settings) -> Self {
        let mut image = Self::bare(repository);
        image.build = Some(Box::new(recipe));
        image.normalize(settings);
        image
    }

    /// Apply the namespace and registry rules to the repository name
    ///
    /// A bare name gets the configured namespace. `host/ns/name` splits into
    /// registry `host` and repository `ns/name`; otherwise the configured
    /// registry applies.
    pub fn normalize(&mut self, settings: &Settings) {
        if let Some(ref mut recipe) = self.build {
            recipe.parent.normalize(settings);
        }
        if self.registry.is_some() {
            return;
        }
        let mut repository = self.repository.clone();
        if !repository.contains('/') {
            if let Some(ref namespace) = settings.docker_namespace {
                repository = format!("{}/{}", namespace, repository);
            }
        }
        match registry_pattern().captures(&repository) {
            Some(caps) => {
                self.registry = Some(caps[1].to_string());
                self.repository = caps[2].to_string();
            }
            None => {
                self.registry = settings.docker_registry.clone();
                self.repository = repository;
            }
        }
    }

    /// Repository including the registry, if any
    pub fn full_repository(&self) -> String {
        match self.registry {
            Some(ref registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }

    /// `repo:tag[id]`, identifying the exact image
    pub fn hash_ref(&self) -> String {
        format!("{}:{}[{}]", self.full_repository(), self.tag, self.id)
    }

    pub fn is_source(&self) -> bool {
        self.build.is_some()
    }

    /// Tag to image ID map of the repository, cached until the next
    /// pull, push or build
    pub async fn tags(&mut self, docker: &dyn DockerApi) -> Result<BTreeMap<String, String>> {
        if let Some(ref tags) = self.tags {
            return Ok(tags.clone());
        }
        tracing::debug!(target: logging::IMAGE, image = %self, "retrieving tags");
        let repository = self.full_repository();
        let mut tags = BTreeMap::new();
        for image in docker.images(&repository).await? {
            for repo_tag in image.repo_tags.iter().flatten() {
                if let Some((repo, tag)) = repo_tag.rsplit_once(':') {
                    if repo == repository {
                        tags.insert(tag.to_string(), image.id.clone());
                    }
                }
            }
        }
        self.tags = Some(tags.clone());
        Ok(tags)
    }

    /// Resolve the image ID, pulling (or for source images building) when
    /// the tag is not available
    pub fn resolve_id<'a>(&'a mut self, docker: &'a dyn DockerApi) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            if !self.id.is_empty() {
                return Ok(self.id.clone());
            }
            if self.build.is_none() {
                return self.fetch_id(docker).await;
            }

            self.update_source_tag(docker).await?;
            match self.fetch_id(docker).await {
                Ok(id) => Ok(id),
                Err(e) => {
                    tracing::info!(target: logging::IMAGE, image = %self, error = %e, "pull failed, rebuilding");
                    self.build(docker, true).await?;
                    self.fetch_id(docker).await
                }
            }
        })
    }

    /// Recompute the tag of a source image from its recipe
    async fn update_source_tag(&mut self, docker: &dyn DockerApi) -> Result<()> {
        let repository = self.repository.clone();
        if let Some(ref mut recipe) = self.build {
            recipe.parent.resolve_id(docker).await?;
            self.tag = recipe.digest(&repository);
        }
        Ok(())
    }

    async fn fetch_id(&mut self, docker: &dyn DockerApi) -> Result<String> {
        tracing::debug!(target: logging::IMAGE, image = %self, "retrieving id");
        if !self.tags(docker).await?.contains_key(&self.tag) {
            self.pull(docker).await?;
        }
        let id = self
            .tags(docker)
            .await?
            .get(&self.tag)
            .cloned()
            .ok_or_else(|| {
                DominatorError::Image(format!("tag {} of {} not found", self.tag, self.full_repository()))
            })?;
        self.id = id.clone();
        Ok(id)
    }

    pub async fn pull(&mut self, docker: &dyn DockerApi) -> Result<()> {
        let span = tracing::info_span!(target: logging::IMAGE, "pull", image = %self);
        async {
            tracing::info!(target: logging::IMAGE, "pulling repo");
            let chunks = docker.pull(&self.full_repository(), &self.tag).await?;
            follow_progress(Operation::Pull, &self.to_string(), chunks).await
        }
        .instrument(span)
        .await?;
        self.tags = None;
        Ok(())
    }

    pub async fn push(&mut self, docker: &dyn DockerApi) -> Result<()> {
        let span = tracing::info_span!(target: logging::IMAGE, "push", image = %self);
        async {
            tracing::info!(target: logging::IMAGE, "pushing repo");
            let chunks = docker.push(&self.full_repository(), &self.tag).await?;
            follow_progress(Operation::Push, &self.to_string(), chunks).await
        }
        .instrument(span)
        .await?;
        self.tags = None;
        Ok(())
    }

    /// Build a source image from its recipe, then push it if asked
    pub async fn build(&mut self, docker: &dyn DockerApi, push: bool) -> Result<()> {
        self.update_source_tag(docker).await?;
        let context = match self.build {
            Some(ref recipe) => recipe.build_context()?,
            None => {
                return Err(DominatorError::Image(format!(
                    "{} has no build recipe",
                    self.full_repository()
                )))
            }
        };

        let span = tracing::info_span!(target: logging::IMAGE, "build", image = %self);
        async {
            tracing::info!(target: logging::IMAGE, "building image");
            let chunks = docker.build(&self.to_string(), context).await?;
            follow_progress(Operation::Build, &self.to_string(), chunks).await
        }
        .instrument(span)
        .await?;
        self.tags = None;
        self.id.clear();

        if push {
            self.push(docker).await?;
        }
        Ok(())
    }

    /// Configuration baked into the image
    pub async fn inspect(&mut self, docker: &dyn DockerApi) -> Result<ImageConfig> {
        let id = self.resolve_id(docker).await?;
        Ok(docker.inspect_image(&id).await?.config)
    }

    /// Ports the image exposes
    pub async fn exposed_ports(&mut self, docker: &dyn DockerApi) -> Result<Vec<u16>> {
        if let Some(ref recipe) = self.build {
            return Ok(recipe.ports.values().copied().collect());
        }
        let config = self.inspect(docker).await?;
        Ok(config
            .exposed_ports
            .unwrap_or_default()
            .keys()
            .filter_map(|port| port.split('/').next()?.parse().ok())
            .collect())
    }

    /// Default command of the image
    pub async fn command(&mut self, docker: &dyn DockerApi) -> Result<Vec<String>> {
        Ok(self.inspect(docker).await?.cmd.unwrap_or_default())
    }

    /// Default environment of the image
    pub async fn env(&mut self, docker: &dyn DockerApi) -> Result<BTreeMap<String, String>> {
        Ok(parse_env(&self.inspect(docker).await?.env.unwrap_or_default()))
    }
}

/// Split `NAME=value` entries on the first `=`
pub fn parse_env(vars: &[String]) -> BTreeMap<String, String> {
    vars.iter()
        .map(|var| match var.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (var.clone(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::FakeDocker;
    use std::io::Read;

    fn namespaced() -> Settings {
        Settings {
            docker_namespace: Some("yandex".to_string()),
            ..Settings::default()
        }
    }

    #[test]
    fn test_normalize_namespace() {
        let image = Image::new("busybox", &namespaced());
        assert_eq!(image.repository, "yandex/busybox");
        assert_eq!(image.registry, None);
        assert_eq!(image.full_repository(), "yandex/busybox");

        let image = Image::new("library/busybox", &namespaced());
        assert_eq!(image.repository, "library/busybox");
    }

    #[test]
    fn test_normalize_registry() {
        let image = Image::new("registry.example.com:5000/team/app", &namespaced());
        assert_eq!(image.registry.as_deref(), Some("registry.example.com:5000"));
        assert_eq!(image.repository, "team/app");
        assert_eq!(image.full_repository(), "registry.example.com:5000/team/app");

        let settings = Settings {
            docker_registry: Some("hub.local".to_string()),
            ..Settings::default()
        };
        let image = Image::new("team/app", &settings);
        assert_eq!(image.full_repository(), "hub.local/team/app");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let settings = namespaced();
        let mut image = Image::new("busybox", &settings);
        image.normalize(&settings);
        assert_eq!(image.full_repository(), "yandex/busybox");
    }

    #[test]
    fn test_hash_ref() {
        let mut image = Image::bare("busybox").with_tag("1.36");
        image.id = "sha256:abc".to_string();
        assert_eq!(image.hash_ref(), "busybox:1.36[sha256:abc]");
        assert_eq!(image.to_string(), "busybox:1.36");
    }

    fn recipe() -> BuildRecipe {
        let mut parent = Image::bare("ubuntu").with_tag("22.04");
        parent.id = "sha256:parent".to_string();
        let mut recipe = BuildRecipe::new(parent);
        recipe.scripts.push("apt-get update".to_string());
        recipe.env.insert("LANG".to_string(), "C.UTF-8".to_string());
        recipe.workdir = Some("/app".to_string());
        recipe.ports.insert("http".to_string(), 8080);
        recipe.command = Some("./serve".to_string());
        recipe.files.insert("/etc/app.conf".to_string(), "port = 8080\n".to_string());
        recipe
    }

    #[test]
    fn test_dockerfile() {
        let dockerfile = recipe().dockerfile();
        assert_eq!(
            dockerfile,
            "FROM ubuntu:22.04\n\
             ENV LANG C.UTF-8\n\
             WORKDIR /app\n\
             RUN apt-get update\n\
             EXPOSE 8080\n\
             CMD ./serve\n\
             ADD etc/app.conf /etc/app.conf\n"
        );
    }

    #[test]
    fn test_build_context_contents() {
        let context = recipe().build_context().unwrap();
        let mut archive = tar::Archive::new(context.as_slice());
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            if name == "etc/app.conf" {
                assert_eq!(content, "port = 8080\n");
            }
            names.push(name);
        }
        assert_eq!(names, vec!["etc/app.conf", "Dockerfile"]);
    }

    #[test]
    fn test_digest_tracks_recipe_and_parent() {
        let base = recipe();
        let digest = base.digest("yandex/app");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, recipe().digest("yandex/app"));

        let mut changed = recipe();
        changed.files.insert("/etc/app.conf".to_string(), "port = 9090\n".to_string());
        assert_ne!(changed.digest("yandex/app"), digest);

        let mut reparented = recipe();
        reparented.parent.id = "sha256:other".to_string();
        assert_ne!(reparented.digest("yandex/app"), digest);

        assert_ne!(base.digest("yandex/other"), digest);
    }

    #[tokio::test]
    async fn test_resolve_id_pulls_missing_tag() {
        let docker = FakeDocker::new("http://local");
        docker.publish("busybox:latest", "sha256:busy");

        let mut image = Image::bare("busybox");
        let id = image.resolve_id(&docker).await.unwrap();
        assert_eq!(id, "sha256:busy");
        assert_eq!(docker.calls_matching("pull"), vec!["pull busybox:latest"]);

        // Cached from now on
        image.resolve_id(&docker).await.unwrap();
        assert_eq!(docker.calls_matching("pull").len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_id_fails_when_unavailable() {
        let docker = FakeDocker::new("http://local");
        let mut image = Image::bare("nonexistent");
        assert!(image.resolve_id(&docker).await.is_err());
    }

    #[tokio::test]
    async fn test_source_image_is_built_and_pushed_when_missing() {
        let docker = FakeDocker::new("http://local");
        docker.add_image("ubuntu:22.04", "sha256:ubuntu", ImageConfig::default());

        let mut recipe = BuildRecipe::new(Image::bare("ubuntu").with_tag("22.04"));
        recipe.scripts.push("true".to_string());
        let mut image = Image::source("yandex/app", recipe, &Settings::default());

        let id = image.resolve_id(&docker).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(image.tag.len(), 64);
        assert_eq!(docker.calls_matching("build").len(), 1);
        assert_eq!(
            docker.calls_matching("push"),
            vec![format!("push yandex/app:{}", image.tag)]
        );
    }

    #[tokio::test]
    async fn test_source_image_is_not_rebuilt_when_present() {
        let docker = FakeDocker::new("http://local");
        docker.add_image("ubuntu:22.04", "sha256:ubuntu", ImageConfig::default());

        let recipe = BuildRecipe::new(Image::bare("ubuntu").with_tag("22.04"));
        let mut first = Image::source("yandex/app", recipe.clone(), &Settings::default());
        first.resolve_id(&docker).await.unwrap();

        let mut second = Image::source("yandex/app", recipe, &Settings::default());
        second.resolve_id(&docker).await.unwrap();

        assert_eq!(first.tag, second.tag);
        assert_eq!(docker.calls_matching("build").len(), 1);
    }

    #[tokio::test]
    async fn test_exposed_ports_and_env() {
        let docker = FakeDocker::new("http://local");
        let mut exposed = BTreeMap::new();
        exposed.insert("80/tcp".to_string(), serde_json::json!({}));
        docker.add_image(
            "nginx:latest",
            "sha256:nginx",
            ImageConfig {
                cmd: Some(vec!["nginx".to_string(), "-g".to_string()]),
                env: Some(vec!["PATH=/usr/bin".to_string(), "A=b=c".to_string()]),
                exposed_ports: Some(exposed),
            },
        );

        let mut image = Image::bare("nginx");
        assert_eq!(image.exposed_ports(&docker).await.unwrap(), vec![80]);
        assert_eq!(image.command(&docker).await.unwrap(), vec!["nginx", "-g"]);
        let env = image.env(&docker).await.unwrap();
        assert_eq!(env["A"], "b=c");
    }
}
