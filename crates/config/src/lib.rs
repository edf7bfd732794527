//! Configuration schema and loader for shardstate deployments.

use serde::{Deserialize, Serialize};
use shardstate_common::{is_reserved_field, parse_node_list, NodeAddress};

/// Top-level state adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Comma-separated `host:port` list of store nodes.
    pub nodes: String,

    /// Routing mode.
    #[serde(default)]
    pub mode: RoutingMode,

    /// Key namespace prepended to every mapped key. Empty means none.
    #[serde(default)]
    pub key_prefix: String,

    /// Expiry applied to every written key, in milliseconds. Zero disables expiry.
    #[serde(default)]
    pub ttl_ms: u64,

    /// Record schema the adapter reads and writes.
    pub schema: SchemaConfig,

    /// How repeated values for one key are folded.
    #[serde(default)]
    pub combiner: CombinerKind,

    /// Router settings.
    #[serde(default)]
    pub router: RouterSettings,

    /// Updater settings.
    #[serde(default)]
    pub updater: UpdaterSettings,

    /// Which store client to use.
    #[serde(default)]
    pub backend: Backend,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Consistent hashing over the node set, with redirect handling.
    #[default]
    Cluster,
    /// Every key goes to the single configured node.
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinerKind {
    #[default]
    Overwrite,
    Sum,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process simulated cluster.
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Record field whose value becomes the key.
    pub key_field: String,

    /// Record fields stored as hash fields under the key.
    pub value_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Virtual nodes per physical node on the hash ring.
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,

    /// Attempts per operation before a node is declared unavailable.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds; doubles on every retry.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Per-operation timeout in milliseconds.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Periodic topology refresh interval in seconds. Zero disables it.
    #[serde(default)]
    pub refresh_interval_secs: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            virtual_nodes: default_virtual_nodes(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            op_timeout_ms: default_op_timeout_ms(),
            refresh_interval_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterSettings {
    /// Keys written concurrently per batch.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Recently committed batch ids remembered in-process.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            history_capacity: default_history_capacity(),
        }
    }
}

// --- Defaults ---

fn default_virtual_nodes() -> usize {
    160
}
fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff_ms() -> u64 {
    50
}
fn default_max_backoff_ms() -> u64 {
    2000
}
fn default_op_timeout_ms() -> u64 {
    2000
}
fn default_concurrency() -> usize {
    16
}
fn default_history_capacity() -> usize {
    1024
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for shardstate_common::StateError {
    fn from(e: ConfigError) -> Self {
        shardstate_common::StateError::Configuration(e.to_string())
    }
}

impl StateConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nodes = self.node_addresses()?;
        if self.mode == RoutingMode::Single && nodes.len() != 1 {
            return Err(ConfigError::Invalid(format!(
                "mode single requires exactly one node, got {}",
                nodes.len()
            )));
        }
        if self.schema.key_field.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "schema.key_field must not be empty".into(),
            ));
        }
        if self.schema.value_fields.is_empty() {
            return Err(ConfigError::Invalid(
                "schema.value_fields must name at least one field".into(),
            ));
        }
        for field in &self.schema.value_fields {
            if field.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "schema.value_fields contains an empty name".into(),
                ));
            }
            if is_reserved_field(field) {
                return Err(ConfigError::Invalid(format!(
                    "schema.value_fields: '{}' uses the reserved '__' prefix",
                    field
                )));
            }
        }
        if self.router.virtual_nodes == 0 {
            return Err(ConfigError::Invalid(
                "router.virtual_nodes must be > 0".into(),
            ));
        }
        if self.router.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "router.max_attempts must be > 0".into(),
            ));
        }
        if self.router.op_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "router.op_timeout_ms must be > 0".into(),
            ));
        }
        if self.router.max_backoff_ms < self.router.base_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "router.max_backoff_ms ({}) must be >= router.base_backoff_ms ({})",
                self.router.max_backoff_ms, self.router.base_backoff_ms
            )));
        }
        if self.updater.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "updater.concurrency must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Parse the configured node list.
    pub fn node_addresses(&self) -> Result<Vec<NodeAddress>, ConfigError> {
        parse_node_list(&self.nodes).map_err(|e| ConfigError::Invalid(format!("nodes: {}", e)))
    }
}

/// Load a `StateConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<StateConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `StateConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<StateConfig, ConfigError> {
    let config: StateConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
nodes: "127.0.0.1:6379,127.0.0.1:6380"
schema:
  key_field: word
  value_fields: [count]
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config = load_from_str(MINIMAL).unwrap();
        assert_eq!(config.node_addresses().unwrap().len(), 2);
        assert_eq!(config.mode, RoutingMode::Cluster);
        assert_eq!(config.key_prefix, "");
        assert_eq!(config.ttl_ms, 0);
        assert_eq!(config.combiner, CombinerKind::Overwrite);
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.router.virtual_nodes, 160);
        assert_eq!(config.router.max_attempts, 3);
        assert_eq!(config.updater.concurrency, 16);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
nodes: "10.0.0.1:7000"
mode: single
key_prefix: "test_"
ttl_ms: 86400000
schema:
  key_field: word
  value_fields: [count, source]
combiner: sum
router:
  virtual_nodes: 64
  max_attempts: 5
  base_backoff_ms: 10
  max_backoff_ms: 500
  op_timeout_ms: 250
  refresh_interval_secs: 30
updater:
  concurrency: 4
  history_capacity: 16
backend: redis
metrics_port: 9100
"#;
        let config = load_from_str(yaml).unwrap();
        assert_eq!(config.mode, RoutingMode::Single);
        assert_eq!(config.key_prefix, "test_");
        assert_eq!(config.ttl_ms, 86_400_000);
        assert_eq!(config.schema.value_fields, vec!["count", "source"]);
        assert_eq!(config.combiner, CombinerKind::Sum);
        assert_eq!(config.router.max_attempts, 5);
        assert_eq!(config.router.refresh_interval_secs, 30);
        assert_eq!(config.updater.history_capacity, 16);
        assert_eq!(config.backend, Backend::Redis);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn test_roundtrip_yaml() {
        let config = load_from_str(MINIMAL).unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let config2 = load_from_str(&serialized).unwrap();
        assert_eq!(config.nodes, config2.nodes);
        assert_eq!(config.schema.key_field, config2.schema.key_field);
    }

    #[test]
    fn test_rejects_malformed_nodes() {
        let yaml = r#"
nodes: "127.0.0.1:6379,nope"
schema:
  key_field: word
  value_fields: [count]
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("nodes"), "error should mention nodes: {}", err);
    }

    #[test]
    fn test_rejects_empty_nodes() {
        let yaml = r#"
nodes: ""
schema:
  key_field: word
  value_fields: [count]
"#;
        assert!(load_from_str(yaml).is_err());
    }

    #[test]
    fn test_rejects_negative_ttl() {
        let yaml = r#"
nodes: "127.0.0.1:6379"
ttl_ms: -5
schema:
  key_field: word
  value_fields: [count]
"#;
        assert!(matches!(load_from_str(yaml), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_rejects_single_mode_with_many_nodes() {
        let yaml = r#"
nodes: "127.0.0.1:6379,127.0.0.1:6380"
mode: single
schema:
  key_field: word
  value_fields: [count]
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("single"), "{}", err);
    }

    #[test]
    fn test_rejects_missing_key_field() {
        let yaml = r#"
nodes: "127.0.0.1:6379"
schema:
  key_field: ""
  value_fields: [count]
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("key_field"), "{}", err);
    }

    #[test]
    fn test_rejects_reserved_value_field() {
        let yaml = r#"
nodes: "127.0.0.1:6379"
schema:
  key_field: word
  value_fields: ["__batch"]
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("reserved"), "{}", err);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let yaml = r#"
nodes: "127.0.0.1:6379"
schema:
  key_field: word
  value_fields: [count]
router:
  max_attempts: 0
"#;
        let err = load_from_str(yaml).unwrap_err().to_string();
        assert!(err.contains("router.max_attempts"), "{}", err);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = load_from_file(file.path()).unwrap();
        assert_eq!(config.schema.key_field, "word");
    }

    #[test]
    fn test_config_error_into_state_error() {
        let err: shardstate_common::StateError =
            ConfigError::Invalid("router.max_attempts must be > 0".into()).into();
        assert!(matches!(
            err,
            shardstate_common::StateError::Configuration(_)
        ));
    }
}
