//! Volumes mounted into containers

use super::{Container, File};
use crate::error::{DominatorError, Result};
use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A host directory bound into a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Volume {
    /// Persistent data directory
    Data {
        dest: String,
        /// Host path; defaults to a per-container directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default)]
        ro: bool,
    },
    /// Read-only directory regenerated from `files` on every create
    Config {
        dest: String,
        #[serde(default)]
        files: BTreeMap<String, File>,
    },
}

impl Volume {
    pub fn data(dest: &str) -> Self {
        Volume::Data {
            dest: dest.to_string(),
            path: None,
            ro: false,
        }
    }

    pub fn bind(path: &str, dest: &str) -> Self {
        Volume::Data {
            dest: dest.to_string(),
            path: Some(path.to_string()),
            ro: false,
        }
    }

    pub fn config(dest: &str, files: BTreeMap<String, File>) -> Self {
        Volume::Config {
            dest: dest.to_string(),
            files,
        }
    }

    /// Mount point inside the container
    pub fn dest(&self) -> &str {
        match self {
            Volume::Data { dest, .. } | Volume::Config { dest, .. } => dest,
        }
    }

    pub fn ro(&self) -> bool {
        match self {
            Volume::Data { ro, .. } => *ro,
            Volume::Config { .. } => true,
        }
    }

    /// Directory on the ship backing this volume for `container_name`
    pub fn host_path(&self, container_name: &str, settings: &Settings) -> PathBuf {
        let relative = self.dest().trim_start_matches('/');
        match self {
            Volume::Data { path: Some(path), .. } => PathBuf::from(path),
            Volume::Data { path: None, .. } => {
                settings.data_volume_root().join(container_name).join(relative)
            }
            Volume::Config { .. } => settings
                .config_volume_root()
                .join(container_name)
                .join(relative),
        }
    }

    /// `host:dest:mode` bind specification
    pub fn bind_spec(&self, container_name: &str, settings: &Settings) -> String {
        format!(
            "{}:{}:{}",
            self.host_path(container_name, settings).display(),
            self.dest(),
            if self.ro() { "ro" } else { "rw" }
        )
    }

    /// Prepare the host directory before the container is created
    ///
    /// Config volumes are emptied and every file written afresh.
    pub fn render(&self, container: &Container, settings: &Settings) -> Result<()> {
        let files = match self {
            Volume::Data { .. } => return Ok(()),
            Volume::Config { files, .. } => files,
        };

        let dir = self.host_path(&container.name, settings);
        tracing::debug!(volume = self.dest(), path = %dir.display(), "rendering");
        std::fs::create_dir_all(&dir).map_err(|e| {
            DominatorError::Volume(format!("failed to create {}: {}", dir.display(), e))
        })?;

        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        for (name, file) in files {
            file.dump(container, &dir, name)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Volume::Data { dest, .. } => write!(f, "DataVolume(dest={})", dest),
            Volume::Config { dest, .. } => write!(f, "ConfigVolume(dest={})", dest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Image;
    use tempfile::tempdir;

    fn settings(root: &std::path::Path) -> Settings {
        Settings {
            config_volume_dir: root.join("config").display().to_string(),
            data_volume_dir: root.join("data").display().to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_host_paths() {
        let settings = Settings::default();
        assert_eq!(
            Volume::data("/var/lib/app").host_path("web", &settings),
            PathBuf::from("/var/lib/dominator/data/web/var/lib/app")
        );
        assert_eq!(
            Volume::bind("/srv/logs", "/logs").host_path("web", &settings),
            PathBuf::from("/srv/logs")
        );
        assert_eq!(
            Volume::config("/etc/app", BTreeMap::new()).host_path("web", &settings),
            PathBuf::from("/var/lib/dominator/config/web/etc/app")
        );
    }

    #[test]
    fn test_bind_spec() {
        let settings = Settings::default();
        assert_eq!(
            Volume::bind("/run/docker.sock", "/run/docker.sock").bind_spec("x", &settings),
            "/run/docker.sock:/run/docker.sock:rw"
        );
        assert!(Volume::config("/etc/app", BTreeMap::new())
            .bind_spec("x", &settings)
            .ends_with(":/etc/app:ro"));
    }

    #[test]
    fn test_render_config_volume_replaces_contents() {
        let temp = tempdir().unwrap();
        let settings = settings(temp.path());
        let container = Container::new("web", "ship1", Image::bare("nginx"));

        let mut files = BTreeMap::new();
        files.insert("app.conf".to_string(), File::text("listen 80\n"));
        let volume = Volume::config("/etc/app", files);

        let dir = volume.host_path("web", &settings);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("stale.conf"), "old").unwrap();

        volume.render(&container, &settings).unwrap();

        assert!(!dir.join("stale.conf").exists());
        assert_eq!(std::fs::read_to_string(dir.join("app.conf")).unwrap(), "listen 80\n");
    }

    #[test]
    fn test_render_data_volume_is_noop() {
        let temp = tempdir().unwrap();
        let settings = settings(temp.path());
        let container = Container::new("web", "ship1", Image::bare("nginx"));

        Volume::data("/data").render(&container, &settings).unwrap();
        assert!(!temp.path().join("data").exists());
    }

    #[test]
    fn test_volume_yaml() {
        let yaml = r#"
type: config
dest: /etc/app
files:
  app.conf:
    type: text
    content: hi
"#;
        let volume: Volume = serde_yaml::from_str(yaml).unwrap();
        assert!(volume.ro());
        assert_eq!(volume.dest(), "/etc/app");
    }
}
