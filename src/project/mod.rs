//! YAML project configuration.
//!
//! A crew project keeps its personas in `config/agents.yaml` and its tasks
//! in `config/tasks.yaml`, both keyed by name:
//!
//! ```yaml
//! market_analyst:
//!   role: Market Dynamics Analyst for {industry}
//!   goal: ...
//!   backstory: ...
//!   tools: [search]
//! ```
//!
//! Declaration order in the file is the declaration order of the crew.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::agent::Agent;
use crate::task::Task;

/// Errors raised while loading project configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// YAML parsing or shape error.
    #[error("YAML error in {section}: {source}")]
    Yaml {
        section: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// File I/O error.
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not a name-keyed mapping.
    #[error("{0} must be a mapping keyed by name")]
    NotAMapping(String),
}

/// Parsed agents and tasks of one crew project.
#[derive(Debug, Clone, Default)]
pub struct CrewBase {
    /// Roles in declaration order.
    pub agents: Vec<Agent>,
    /// Tasks in declaration order.
    pub tasks: Vec<Task>,
}

impl CrewBase {
    /// Parse both documents from strings.
    pub fn from_yaml(agents_yaml: &str, tasks_yaml: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            agents: parse_named("agents", agents_yaml)?,
            tasks: parse_named("tasks", tasks_yaml)?,
        })
    }

    /// Load `config/agents.yaml` and `config/tasks.yaml` under `root`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let agents = read(&root.join("config").join("agents.yaml"))?;
        let tasks = read(&root.join("config").join("tasks.yaml"))?;
        Self::from_yaml(&agents, &tasks)
    }

    pub fn agent(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse a name-keyed mapping into entries, injecting each key as `name`.
fn parse_named<T: DeserializeOwned>(section: &str, yaml: &str) -> Result<Vec<T>, ConfigError> {
    let yaml_error = |source| ConfigError::Yaml {
        section: section.to_string(),
        source,
    };

    let document: Value = serde_yaml::from_str(yaml).map_err(yaml_error)?;
    let mapping = match document {
        Value::Mapping(mapping) => mapping,
        Value::Null => Mapping::new(),
        _ => return Err(ConfigError::NotAMapping(section.to_string())),
    };

    let mut entries = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let Value::String(name) = key else {
            return Err(ConfigError::NotAMapping(section.to_string()));
        };
        let mut body = match value {
            Value::Mapping(body) => body,
            _ => return Err(ConfigError::NotAMapping(format!("{}.{}", section, name))),
        };
        body.entry(Value::String("name".into()))
            .or_insert_with(|| Value::String(name.clone()));

        let entry = serde_yaml::from_value(Value::Mapping(body)).map_err(|source| ConfigError::Yaml {
            section: format!("{}.{}", section, name),
            source,
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENTS: &str = r#"
analyst:
  role: Analyst for {industry}
  goal: Understand the market
  backstory: Seasoned.
  tools: [search]
writer:
  role: Writer
  goal: Write
  backstory: Writes.
  memory: false
"#;

    const TASKS: &str = r#"
research:
  description: Research {industry}.
  expected_output: A report.
  agent: analyst
  output_schema: Report
summary:
  description: Summarise.
  expected_output: A summary.
  agent: writer
  output_schema: Summary
  context: [research]
  optional: true
"#;

    #[test]
    fn test_names_come_from_keys_in_order() {
        let base = CrewBase::from_yaml(AGENTS, TASKS).unwrap();
        let names: Vec<&str> = base.agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["analyst", "writer"]);
        assert_eq!(base.agent("analyst").unwrap().tools, vec!["search".to_string()]);
        assert!(!base.agent("writer").unwrap().memory);

        let summary = base.task("summary").unwrap();
        assert_eq!(summary.context, vec!["research".to_string()]);
        assert!(summary.optional);
        assert_eq!(base.tasks[0].name, "research");
    }

    #[test]
    fn test_malformed_documents_are_rejected() {
        assert!(matches!(
            CrewBase::from_yaml("- a\n- b\n", TASKS),
            Err(ConfigError::NotAMapping(_))
        ));
        let err = CrewBase::from_yaml(AGENTS, "research:\n  agent: analyst\n").unwrap_err();
        assert!(err.to_string().contains("tasks.research"));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("config")).unwrap();
        std::fs::write(dir.path().join("config/agents.yaml"), AGENTS).unwrap();
        std::fs::write(dir.path().join("config/tasks.yaml"), TASKS).unwrap();
        assert_eq!(CrewBase::load(dir.path()).unwrap().tasks.len(), 2);

        assert!(matches!(
            CrewBase::load(&dir.path().join("missing")),
            Err(ConfigError::Io { .. })
        ));
    }
}
