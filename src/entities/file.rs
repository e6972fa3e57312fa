//! Files rendered into config volumes

use super::Container;
use crate::error::{DominatorError, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)(?::-([^}]*))?\}").expect("static regex")
    })
}

/// A file placed into a config volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum File {
    /// Literal text
    Text { content: String },
    /// Another file with `${name}` placeholders substituted
    Template {
        file: Box<File>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        context: BTreeMap<String, serde_yaml::Value>,
    },
    /// Data serialized as YAML
    Yaml { data: serde_yaml::Value },
    /// Data serialized as pretty JSON with sorted keys
    Json { data: serde_json::Value },
}

impl File {
    pub fn text(content: &str) -> Self {
        File::Text {
            content: content.to_string(),
        }
    }

    /// Rendered contents of the file for `container`
    pub fn data(&self, container: &Container) -> Result<String> {
        match self {
            File::Text { content } => Ok(content.clone()),
            File::Template { file, context } => {
                let source = file.data(container)?;
                let mut vars = container.template_vars();
                for (key, value) in context {
                    flatten_value(key, value, &mut vars);
                }
                tracing::debug!(vars = vars.len(), "rendering template file");
                Ok(render_template(&source, &vars))
            }
            File::Yaml { data } => serde_yaml::to_string(data)
                .map_err(|e| DominatorError::Template(format!("failed to dump YAML: {}", e))),
            File::Json { data } => Ok(serde_json::to_string_pretty(data)?),
        }
    }

    /// Write the rendered file into `dir` as `name`
    pub fn dump(&self, container: &Container, dir: &Path, name: &str) -> Result<()> {
        let path = dir.join(name);
        tracing::debug!(path = %path.display(), "writing file");
        std::fs::write(&path, self.data(container)?)?;
        Ok(())
    }

    /// Current contents of `name` in `dir`
    pub fn load(dir: &Path, name: &str) -> Result<String> {
        let path = dir.join(name);
        tracing::debug!(path = %path.display(), "loading file contents");
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Flatten nested mappings into dotted keys
fn flatten_value(prefix: &str, value: &serde_yaml::Value, vars: &mut BTreeMap<String, String>) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for (key, value) in map {
                if let Some(key) = scalar_to_string(key) {
                    flatten_value(&format!("{}.{}", prefix, key), value, vars);
                }
            }
        }
        other => {
            if let Some(text) = scalar_to_string(other) {
                vars.insert(prefix.to_string(), text);
            } else if let Ok(text) = serde_yaml::to_string(other) {
                vars.insert(prefix.to_string(), text.trim_end().to_string());
            }
        }
    }
}

/// String form of a YAML scalar
pub(crate) fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}

/// Substitute `${name}` and `${name:-default}` placeholders
///
/// Unknown placeholders without a default are left as they are.
pub fn render_template(source: &str, vars: &BTreeMap<String, String>) -> String {
    placeholder_pattern()
        .replace_all(source, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => caps[0].to_string(),
            },
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Image;

    fn container() -> Container {
        let mut container = Container::new("web", "ship1", Image::bare("nginx"));
        container.ports.insert("http".to_string(), 80);
        container.env.insert("MODE".to_string(), "prod".to_string());
        container
    }

    #[test]
    fn test_render_template() {
        let mut vars = BTreeMap::new();
        vars.insert("name".to_string(), "web".to_string());

        assert_eq!(render_template("hi ${name}!", &vars), "hi web!");
        assert_eq!(render_template("${missing:-fallback}", &vars), "fallback");
        assert_eq!(render_template("${missing}", &vars), "${missing}");
        assert_eq!(render_template("$name", &vars), "$name");
    }

    #[test]
    fn test_template_file_uses_container_and_context() {
        let mut context = BTreeMap::new();
        context.insert(
            "db".to_string(),
            serde_yaml::from_str("{host: db1, port: 5432}").unwrap(),
        );
        let file = File::Template {
            file: Box::new(File::text(
                "server ${this.hostname}:${this.ports.http} ${this.env.MODE}\ndb ${db.host}:${db.port}\n",
            )),
            context,
        };

        let data = file.data(&container()).unwrap();
        assert_eq!(data, "server web-ship1:80 prod\ndb db1:5432\n");
    }

    #[test]
    fn test_json_file_is_sorted_and_indented() {
        let file = File::Json {
            data: serde_json::json!({"b": 1, "a": {"c": true}}),
        };
        let data = file.data(&container()).unwrap();
        assert_eq!(data, "{\n  \"a\": {\n    \"c\": true\n  },\n  \"b\": 1\n}");
    }

    #[test]
    fn test_yaml_file() {
        let file = File::Yaml {
            data: serde_yaml::from_str("key: value").unwrap(),
        };
        assert_eq!(file.data(&container()).unwrap(), "key: value\n");
    }

    #[test]
    fn test_file_yaml_representation() {
        let yaml = r#"
type: template
file:
  type: text
  content: "hello ${who}"
context:
  who: world
"#;
        let file: File = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.data(&container()).unwrap(), "hello world");
    }

    #[test]
    fn test_dump_and_load() {
        let temp = tempfile::tempdir().unwrap();
        File::text("abc").dump(&container(), temp.path(), "f.txt").unwrap();
        assert_eq!(File::load(temp.path(), "f.txt").unwrap(), "abc");
        assert!(File::load(temp.path(), "missing").is_err());
    }
}
