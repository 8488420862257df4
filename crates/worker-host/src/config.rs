//! Host configuration.
//!
//! Loaded from a `worker-host.toml` and then overridden from the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use worker_bridge::{BridgeConfig, EventRecord, Value};
use worker_bridge_quickjs::QuickJsConfig;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid event '{0}': expected name=<json array>")]
    InvalidEmit(String),

    #[error("Invalid arguments for event '{name}': {source}")]
    EmitArgs {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("No worker scripts configured")]
    NoWorkers,
}

/// Complete host configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub bridge: BridgeConfig,
    pub engine: QuickJsConfig,
    pub host: HostSettings,
    #[serde(rename = "worker")]
    pub workers: Vec<WorkerEntry>,
}

/// The `[host]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// How often the main loop drains worker output
    pub drain_interval_ms: u64,
    /// Stop after this long; run until Ctrl+C or until every worker exits otherwise
    pub run_for_ms: Option<u64>,
    /// Event names printed to stdout as JSON lines
    pub listen: Vec<String>,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            drain_interval_ms: 10,
            run_for_ms: None,
            listen: Vec::new(),
        }
    }
}

impl HostSettings {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }

    pub fn run_for(&self) -> Option<Duration> {
        self.run_for_ms.map(Duration::from_millis)
    }
}

/// One `[[worker]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub script: PathBuf,
    /// Sent to the worker once its `load` event is seen
    #[serde(default)]
    pub emit: Vec<EventRecord>,
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub scripts: Vec<PathBuf>,
    pub emit: Vec<String>,
    pub listen: Vec<String>,
    pub run_for_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub wake_on_push: bool,
}

impl HostConfig {
    /// Load a config file. Relative worker scripts resolve against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut config = Self::from_toml(&content)?;
        if let Some(dir) = path.parent() {
            for worker in &mut config.workers {
                if worker.script.is_relative() {
                    worker.script = dir.join(&worker.script);
                }
            }
        }

        tracing::debug!(
            "Loaded config from {} ({} workers)",
            path.display(),
            config.workers.len()
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply command-line overrides. Scripts given on the command line
    /// receive every `--emit` event.
    pub fn apply(&mut self, overrides: Overrides) -> Result<(), ConfigError> {
        let events = overrides
            .emit
            .iter()
            .map(|text| parse_emit(text))
            .collect::<Result<Vec<_>, _>>()?;

        self.workers
            .extend(overrides.scripts.into_iter().map(|script| WorkerEntry {
                script,
                emit: events.clone(),
            }));
        self.host.listen.extend(overrides.listen);

        if let Some(ms) = overrides.run_for_ms {
            self.host.run_for_ms = Some(ms);
        }
        if let Some(ms) = overrides.poll_interval_ms {
            self.bridge.poll_interval_ms = ms;
        }
        if overrides.wake_on_push {
            self.bridge.wake_on_push = true;
        }

        if self.workers.is_empty() {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }
}

/// Parse `name=<json array>`. A bare `name` sends no arguments.
pub fn parse_emit(text: &str) -> Result<EventRecord, ConfigError> {
    let (name, args) = match text.split_once('=') {
        Some((name, args)) => (name.trim(), Some(args)),
        None => (text.trim(), None),
    };
    if name.is_empty() {
        return Err(ConfigError::InvalidEmit(text.to_string()));
    }

    let args = match args {
        Some(raw) => {
            let value: Value = serde_json::from_str(raw).map_err(|e| ConfigError::EmitArgs {
                name: name.to_string(),
                source: e,
            })?;
            match value {
                Value::Array(items) => items,
                _ => return Err(ConfigError::InvalidEmit(text.to_string())),
            }
        }
        None => Vec::new(),
    };

    Ok(EventRecord::new(name, args))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HostConfig::from_toml("").unwrap();
        assert_eq!(config.host.drain_interval_ms, 10);
        assert_eq!(config.bridge.poll_interval_ms, 3);
        assert!(!config.bridge.wake_on_push);
        assert_eq!(config.engine, QuickJsConfig::default());
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_full_file() {
        let config = HostConfig::from_toml(
            r#"
            [bridge]
            poll_interval_ms = 5
            wake_on_push = true

            [engine]
            memory_limit = 16777216

            [host]
            run_for_ms = 500
            listen = ["greeted"]

            [[worker]]
            script = "greet.js"
            emit = [{ name = "greet", args = ["bob", 3] }]

            [[worker]]
            script = "idle.js"
            "#,
        )
        .unwrap();

        assert_eq!(config.bridge.poll_interval_ms, 5);
        assert!(config.bridge.wake_on_push);
        assert_eq!(config.engine.memory_limit, Some(16_777_216));
        assert_eq!(config.host.run_for(), Some(Duration::from_millis(500)));
        assert_eq!(config.host.listen, vec!["greeted"]);
        assert_eq!(config.workers.len(), 2);
        assert_eq!(
            config.workers[0].emit,
            vec![EventRecord::new("greet", vec![json!("bob"), json!(3)])]
        );
        assert!(config.workers[1].emit.is_empty());
    }

    #[test]
    fn test_load_resolves_scripts_next_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker-host.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[[worker]]\nscript = \"main.js\"").unwrap();

        let config = HostConfig::load(&path).unwrap();
        assert_eq!(config.workers[0].script, dir.path().join("main.js"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = HostConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_invalid_toml() {
        let err = HostConfig::from_toml("[host\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_parse_emit() {
        let event = parse_emit(r#"greet=["bob", {"n": 1}]"#).unwrap();
        assert_eq!(event.name, "greet");
        assert_eq!(event.args, vec![json!("bob"), json!({ "n": 1 })]);

        assert_eq!(parse_emit("tick").unwrap(), EventRecord::bare("tick"));
        assert!(matches!(parse_emit("=[1]"), Err(ConfigError::InvalidEmit(_))));
        assert!(matches!(parse_emit("x=5"), Err(ConfigError::InvalidEmit(_))));
        assert!(matches!(parse_emit("x=[1"), Err(ConfigError::EmitArgs { .. })));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = HostConfig::from_toml("[host]\nrun_for_ms = 100\nlisten = [\"a\"]").unwrap();
        config
            .apply(Overrides {
                scripts: vec![PathBuf::from("w.js")],
                emit: vec!["go=[1]".to_string()],
                listen: vec!["b".to_string()],
                run_for_ms: Some(250),
                poll_interval_ms: Some(7),
                wake_on_push: true,
            })
            .unwrap();

        assert_eq!(config.host.run_for_ms, Some(250));
        assert_eq!(config.host.listen, vec!["a", "b"]);
        assert_eq!(config.bridge.poll_interval_ms, 7);
        assert!(config.bridge.wake_on_push);
        assert_eq!(config.workers[0].script, PathBuf::from("w.js"));
        assert_eq!(config.workers[0].emit, vec![EventRecord::new("go", vec![json!(1)])]);
    }

    #[test]
    fn test_no_workers_is_an_error() {
        let mut config = HostConfig::default();
        let err = config.apply(Overrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::NoWorkers));
    }
}
