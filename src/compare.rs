//! Differences between a desired container and the one running on a ship

use crate::docker::{split_command, ContainerInspect, DockerApi, MountPoint, PortBinding};
use crate::entities::image::parse_env;
use crate::entities::{Container, File, Volume};
use crate::error::Result;
use crate::settings::Settings;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

/// Mount sources managed by the engine itself
const ENGINE_VOLUME_DIRS: &[&str] = &["/var/lib/docker/vfs/dir", "/var/lib/docker/volumes"];

/// How a single setting differs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Value { expected: String, actual: String },
    /// Changed lines of a file, prefixed `- ` (running) or `+ ` (desired)
    Lines(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference {
    /// Path of the setting, e.g. `["env", "PATH"]`
    pub key: Vec<String>,
    pub change: Change,
}

impl Difference {
    pub fn value(key: &[&str], expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            key: key.iter().map(|k| k.to_string()).collect(),
            change: Change::Value {
                expected: expected.into(),
                actual: actual.into(),
            },
        }
    }

    pub fn key(&self) -> String {
        self.key.join(" ")
    }
}

fn show(value: &str) -> &str {
    if value.is_empty() {
        "\"\""
    } else {
        value
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.change {
            Change::Value { expected, actual } => {
                write!(f, "({}) {} != {}", self.key(), show(expected), show(actual))
            }
            Change::Lines(lines) => {
                write!(f, "({})", self.key())?;
                for line in lines {
                    write!(f, "\n  {}", line)?;
                }
                Ok(())
            }
        }
    }
}

/// One-line rendering of a diff for log events
pub fn summary(diff: &[Difference]) -> String {
    diff.iter()
        .map(|d| match &d.change {
            Change::Value { .. } => d.to_string(),
            Change::Lines(lines) => format!("({}) {} lines changed", d.key(), lines.len()),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn push_value(diff: &mut Vec<Difference>, key: &[&str], expected: &str, actual: &str) {
    if expected != actual {
        diff.push(Difference::value(key, expected, actual));
    }
}

/// Repository part of an image reference
fn strip_tag(reference: &str) -> &str {
    match reference.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => repository,
        _ => reference,
    }
}

/// Compare `container` with the engine's inspect output
///
/// Command and environment are only compared when the running image is
/// the desired one; a different image already explains them.
pub async fn compare_container(
    container: &mut Container,
    docker: &dyn DockerApi,
    info: &ContainerInspect,
    settings: &Settings,
) -> Result<Vec<Difference>> {
    let mut diff = Vec::new();

    push_value(&mut diff, &["name"], &container.name, info.name.trim_start_matches('/'));
    push_value(
        &mut diff,
        &["image", "repo"],
        &container.image.full_repository(),
        strip_tag(&info.config.image),
    );
    let image_id = container.image.resolve_id(docker).await?;
    push_value(&mut diff, &["image", "id"], &image_id, &info.image);
    push_value(
        &mut diff,
        &["memory"],
        &container.memory.to_string(),
        &info.host_config.memory.to_string(),
    );

    if image_id == info.image {
        let command = match container.command {
            Some(ref command) => split_command(command),
            None => container.image.command(docker).await?,
        };
        let actual = info.config.cmd.clone().unwrap_or_default();
        if command != actual {
            diff.push(Difference::value(&["command"], command.join(" "), actual.join(" ")));
        }

        let mut env = container.image.env(docker).await?;
        env.extend(container.env.clone());
        let actual = parse_env(info.config.env.as_deref().unwrap_or_default());
        diff.extend(compare_env(&env, &actual));
    }

    diff.extend(compare_ports(container, &info.bound_ports()));
    diff.extend(compare_volumes(container, &info.mounts, settings)?);
    Ok(diff)
}

/// Missing, changed and unexpected variables
pub fn compare_env(
    expected: &BTreeMap<String, String>,
    actual: &BTreeMap<String, String>,
) -> Vec<Difference> {
    let names: BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let want = expected.get(name).map(String::as_str).unwrap_or_default();
            let have = actual.get(name).map(String::as_str).unwrap_or_default();
            let differs = expected.get(name) != actual.get(name);
            differs.then(|| Difference::value(&["env", name.as_str()], want, have))
        })
        .collect()
}

/// Desired ports against the engine's `port/proto` bindings
pub fn compare_ports(
    container: &Container,
    bindings: &BTreeMap<String, Vec<PortBinding>>,
) -> Vec<Difference> {
    let mut diff = Vec::new();
    let mut desired = BTreeSet::new();

    for (name, port) in &container.ports {
        let key = format!("{}/{}", port, container.protocol(name));
        match bindings.get(&key).and_then(|b| b.first()) {
            None => diff.push(Difference::value(&["ports"], name.as_str(), "")),
            Some(binding) => {
                let external = container.port(name).unwrap_or(*port).to_string();
                push_value(&mut diff, &["ports", name.as_str(), "ext"], &external, &binding.host_port);
            }
        }
        desired.insert(key);
    }

    for key in bindings.keys().filter(|key| !desired.contains(*key)) {
        let port = key.split('/').next().unwrap_or(key);
        diff.push(Difference::value(&["ports"], "", port));
    }
    diff
}

/// Mounts, their modes and config file contents
pub fn compare_volumes(
    container: &Container,
    mounts: &[MountPoint],
    settings: &Settings,
) -> Result<Vec<Difference>> {
    let mut diff = Vec::new();

    for mount in mounts {
        let desired = container.volumes.values().any(|v| v.dest() == mount.destination);
        let managed = ENGINE_VOLUME_DIRS.iter().any(|dir| mount.source.starts_with(dir));
        if !desired && !managed {
            diff.push(Difference::value(&["volumes"], "", mount.destination.as_str()));
        }
    }

    for volume in container.volumes.values() {
        let dest = volume.dest();
        let mount = match mounts.iter().find(|m| m.destination == dest) {
            Some(mount) => mount,
            None => {
                diff.push(Difference::value(&["volumes"], dest, ""));
                continue;
            }
        };

        let path = volume.host_path(&container.name, settings);
        let expected_path = path.display().to_string();
        if mount.source != expected_path {
            diff.push(Difference::value(&["volumes", dest, "path"], expected_path, mount.source.as_str()));
        } else if let Volume::Config { files, .. } = volume {
            diff.extend(compare_files(container, dest, files, &path)?);
        }

        if mount.rw == volume.ro() {
            diff.push(Difference::value(
                &["volumes", dest, "ro"],
                volume.ro().to_string(),
                (!mount.rw).to_string(),
            ));
        }
    }
    Ok(diff)
}

/// Rendered config files against what is on the ship
pub fn compare_files(
    container: &Container,
    dest: &str,
    files: &BTreeMap<String, File>,
    dir: &Path,
) -> Result<Vec<Difference>> {
    let mut diff = Vec::new();
    for (name, file) in files {
        let expected = file.data(container)?;
        let actual = File::load(dir, name).unwrap_or_default();
        if expected != actual {
            diff.push(Difference {
                key: vec![
                    "volumes".to_string(),
                    dest.to_string(),
                    "files".to_string(),
                    name.clone(),
                ],
                change: Change::Lines(line_diff(&actual, &expected)),
            });
        }
    }
    Ok(diff)
}

/// Largest middle section, in table cells, diffed line by line
const MAX_LCS_CELLS: usize = 4 * 1024 * 1024;

/// Changed lines turning `old` into `new`, from a longest common subsequence
///
/// Only the part between the common head and tail is compared. When even
/// that is too large, the whole middle is reported as replaced.
pub fn line_diff(old: &str, new: &str) -> Vec<String> {
    let old: Vec<&str> = old.lines().collect();
    let new: Vec<&str> = new.lines().collect();

    let head = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let tail = old[head..]
        .iter()
        .rev()
        .zip(new[head..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old = &old[head..old.len() - tail];
    let new = &new[head..new.len() - tail];

    let cells = (old.len() + 1).saturating_mul(new.len() + 1);
    if cells > MAX_LCS_CELLS {
        let removed = old.iter().map(|line| format!("- {}", line));
        let added = new.iter().map(|line| format!("+ {}", line));
        return removed.chain(added).collect();
    }

    let mut lcs = vec![vec![0usize; new.len() + 1]; old.len() + 1];
    for i in (0..old.len()).rev() {
        for j in (0..new.len()).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    let mut lines = Vec::new();
    while i < old.len() || j < new.len() {
        if i < old.len() && j < new.len() && old[i] == new[j] {
            i += 1;
            j += 1;
        } else if i < old.len() && (j == new.len() || lcs[i + 1][j] >= lcs[i][j + 1]) {
            lines.push(format!("- {}", old[i]));
            i += 1;
        } else {
            lines.push(format!("+ {}", new[j]));
            j += 1;
        }
    }
    lines
}
