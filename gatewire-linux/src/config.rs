//! Load the deployment description from a TOML file and the environment.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

/// Top-level deployment: `[global]`, `[nodes.<name>]`, `[[paths]]`.
/// Env overrides applied after the file: `GATEWIRE_STATS`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeConfig>,
    #[serde(default)]
    pub paths: Vec<PathConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Instance name used in logs and stats.
    #[serde(default = "default_name")]
    pub name: String,
    /// CPU affinity bitmask; zero leaves the scheduler alone.
    #[serde(default)]
    pub affinity: u64,
    /// SCHED_FIFO priority; zero keeps the default policy.
    #[serde(default)]
    pub priority: i32,
    /// Stats interval in seconds; zero disables the periodic line.
    #[serde(default)]
    pub stats: f64,
    /// Drop privileges to this user after startup.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            affinity: 0,
            priority: 0,
            stats: 0.0,
            user: None,
            group: None,
        }
    }
}

fn default_name() -> String {
    "gatewire".to_string()
}

/// One `[nodes.<name>]` table. Everything except the common keys is handed
/// verbatim to the node-type plug-in.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub r#type: String,
    #[serde(default = "default_vectorize")]
    pub vectorize: usize,
    #[serde(default)]
    pub signals: Option<SignalsConfig>,
    #[serde(flatten)]
    pub params: toml::Table,
}

fn default_vectorize() -> usize {
    1
}

/// Default signal list description for nodes whose type does not provide one.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalsConfig {
    #[serde(default = "default_signal_count")]
    pub count: usize,
    #[serde(default = "default_signal_type", rename = "type")]
    pub ty: gatewire_core::SignalType,
}

fn default_signal_count() -> usize {
    gatewire_core::path::DEFAULT_SAMPLELEN
}

fn default_signal_type() -> gatewire_core::SignalType {
    gatewire_core::SignalType::Float
}

/// One `[[paths]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathConfig {
    pub r#in: String,
    pub out: OneOrMany,
    #[serde(default)]
    pub hooks: Vec<toml::Value>,
    #[serde(default)]
    pub rate: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default = "default_queuelen")]
    pub queuelen: usize,
    #[serde(default = "default_samplelen")]
    pub samplelen: usize,
    #[serde(default)]
    pub poolsize: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_queuelen() -> usize {
    gatewire_core::path::DEFAULT_QUEUELEN
}

fn default_samplelen() -> usize {
    gatewire_core::path::DEFAULT_SAMPLELEN
}

/// A destination list may be written as one name or an array of names.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn names(&self) -> Vec<String> {
        match self {
            OneOrMany::One(name) => vec![name.clone()],
            OneOrMany::Many(names) => names.clone(),
        }
    }
}

/// A path after expansion: disabled entries removed, reverse pairs split
/// into two independent pipelines.
#[derive(Debug, Clone)]
pub struct ExpandedPath {
    pub source: String,
    pub destinations: Vec<String>,
    pub hooks: Vec<toml::Value>,
    pub rate: f64,
    pub queuelen: usize,
    pub samplelen: usize,
    pub poolsize: Option<usize>,
}

/// Read and parse a configuration file, then apply environment overrides.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut config: Config = toml::from_str(&text)?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(s) = std::env::var("GATEWIRE_STATS") {
        if let Ok(stats) = s.parse::<f64>() {
            config.global.stats = stats;
        }
    }
}

/// Reject references to unknown nodes and shapes the engine cannot run.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    for path in &config.paths {
        let label = path_label(path);
        if !config.nodes.contains_key(&path.r#in) {
            return Err(ConfigError::UnknownNode {
                path: label,
                node: path.r#in.clone(),
            });
        }
        let outs = path.out.names();
        if outs.is_empty() {
            return Err(ConfigError::NoDestinations(label));
        }
        for out in &outs {
            if !config.nodes.contains_key(out) {
                return Err(ConfigError::UnknownNode {
                    path: label.clone(),
                    node: out.clone(),
                });
            }
        }
        if path.reverse && outs.len() != 1 {
            return Err(ConfigError::ReverseFanOut(label));
        }
        if !path.rate.is_finite() || path.rate < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "path '{label}' has invalid rate {}",
                path.rate
            )));
        }
        if path.queuelen == 0 || path.samplelen == 0 {
            return Err(ConfigError::Invalid(format!(
                "path '{label}' needs non-zero queuelen and samplelen"
            )));
        }
    }
    Ok(())
}

/// Expand the configured path list: drop disabled entries and split
/// `reverse = true` pairs into two pipelines with independent state.
pub fn expand_paths(config: &Config) -> Vec<ExpandedPath> {
    let mut out = Vec::new();
    for path in &config.paths {
        if !path.enabled {
            tracing::warn!(path = path_label(path), "path is not enabled");
            continue;
        }
        let destinations = path.out.names();
        out.push(ExpandedPath {
            source: path.r#in.clone(),
            destinations: destinations.clone(),
            hooks: path.hooks.clone(),
            rate: path.rate,
            queuelen: path.queuelen,
            samplelen: path.samplelen,
            poolsize: path.poolsize,
        });
        if path.reverse {
            out.push(ExpandedPath {
                source: destinations[0].clone(),
                destinations: vec![path.r#in.clone()],
                hooks: path.hooks.clone(),
                rate: path.rate,
                queuelen: path.queuelen,
                samplelen: path.samplelen,
                poolsize: path.poolsize,
            });
        }
    }
    out
}

fn path_label(path: &PathConfig) -> String {
    format!("{} => {}", path.r#in, path.out.names().join(" "))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("path '{path}' references unknown node '{node}'")]
    UnknownNode { path: String, node: String },
    #[error("path '{0}' has no destinations")]
    NoDestinations(String),
    #[error("reverse path '{0}' needs exactly one destination")]
    ReverseFanOut(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [global]
        name = "demo"
        stats = 2.5

        [nodes.src]
        type = "loopback"
        queuelen = 32

        [nodes.dst]
        type = "loopback"

        [nodes.log]
        type = "file"
        out = { path = "/tmp/gatewire.log" }

        [[paths]]
        in = "src"
        out = ["dst", "log"]
        rate = 10.0
        queuelen = 64
        samplelen = 8
    "#;

    fn parse(text: &str) -> Config {
        toml::from_str(text).expect("test config must parse")
    }

    #[test]
    fn full_deployment_parses() {
        let config = parse(SAMPLE);
        validate(&config).unwrap();
        assert_eq!(config.global.name, "demo");
        assert_eq!(config.global.stats, 2.5);
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes["src"].r#type, "loopback");
        assert!(config.nodes["src"].params.contains_key("queuelen"));

        let path = &config.paths[0];
        assert_eq!(path.out.names(), vec!["dst", "log"]);
        assert_eq!(path.rate, 10.0);
        assert_eq!(path.queuelen, 64);
        assert!(path.enabled);
    }

    #[test]
    fn single_destination_as_plain_string() {
        let config = parse(
            r#"
            [nodes.a]
            type = "loopback"
            [nodes.b]
            type = "loopback"
            [[paths]]
            in = "a"
            out = "b"
        "#,
        );
        validate(&config).unwrap();
        assert_eq!(config.paths[0].out.names(), vec!["b"]);
    }

    #[test]
    fn unknown_node_is_rejected() {
        let config = parse(
            r#"
            [nodes.a]
            type = "loopback"
            [[paths]]
            in = "a"
            out = "ghost"
        "#,
        );
        assert!(matches!(
            validate(&config),
            Err(ConfigError::UnknownNode { .. })
        ));
    }

    #[test]
    fn reverse_pair_expands_to_two_paths() {
        let config = parse(
            r#"
            [nodes.a]
            type = "loopback"
            [nodes.b]
            type = "loopback"
            [[paths]]
            in = "a"
            out = "b"
            reverse = true
        "#,
        );
        validate(&config).unwrap();
        let expanded = expand_paths(&config);
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[0].source, "a");
        assert_eq!(expanded[0].destinations, vec!["b"]);
        assert_eq!(expanded[1].source, "b");
        assert_eq!(expanded[1].destinations, vec!["a"]);
    }

    #[test]
    fn reverse_fan_out_is_rejected() {
        let config = parse(
            r#"
            [nodes.a]
            type = "loopback"
            [nodes.b]
            type = "loopback"
            [nodes.c]
            type = "loopback"
            [[paths]]
            in = "a"
            out = ["b", "c"]
            reverse = true
        "#,
        );
        assert!(matches!(
            validate(&config),
            Err(ConfigError::ReverseFanOut(_))
        ));
    }

    #[test]
    fn disabled_paths_are_dropped() {
        let config = parse(
            r#"
            [nodes.a]
            type = "loopback"
            [nodes.b]
            type = "loopback"
            [[paths]]
            in = "a"
            out = "b"
            enabled = false
        "#,
        );
        assert!(expand_paths(&config).is_empty());
    }

    #[test]
    fn bad_rate_is_rejected() {
        let config = parse(
            r#"
            [nodes.a]
            type = "loopback"
            [nodes.b]
            type = "loopback"
            [[paths]]
            in = "a"
            out = "b"
            rate = -2.0
        "#,
        );
        assert!(matches!(validate(&config), Err(ConfigError::Invalid(_))));
    }
}
