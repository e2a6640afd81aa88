//! Registration configuration.
//!
//! A [`RegistrationConfig`] is assembled in layers: defaults, then the JSON
//! config file (`~/.registrar/config.json` unless a path is given), then
//! `REGISTRAR_*` environment variables (a `.env` file is honoured), and
//! finally CLI flags applied by the binary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::utils::duration::{parse_duration, serde_duration};

/// Default etcd client endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Default key prefix under which services are registered.
pub const DEFAULT_REGISTRY_PREFIX: &str = "/registry";

/// Default lease TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Largest lease TTL etcd accepts.
pub const MAX_TTL: Duration = Duration::from_secs(9_000_000_000);

/// Bound on each grant / put / keep-alive / delete round-trip.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(3);

/// Bound on the initial store connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix shared by every environment override.
const ENV_PREFIX: &str = "REGISTRAR_";

/// Returns the registrar config directory (`~/.registrar`).
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".registrar")
}

/// Returns the default config file path.
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Metadata advertised for one service instance.
///
/// Serialized as `{"Addr": "...", "Metadata": {...}}`, the shape grpclb-style
/// resolvers decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeData {
    /// Dialable address of the instance (`host:port`).
    #[serde(rename = "Addr")]
    pub address: String,

    /// Free-form labels (zone, version, weight, ...).
    #[serde(rename = "Metadata", default)]
    pub metadata: BTreeMap<String, String>,
}

impl NodeData {
    /// Create node data with no metadata.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add a metadata label.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// What the heartbeat loop does when the store reports the lease as gone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseLossPolicy {
    /// Keep renewing the lost lease id; the key stays absent until deregistration.
    #[default]
    Keep,
    /// Forget the lost lease so the next tick grants a new one and re-writes the key.
    Regrant,
}

impl std::str::FromStr for LeaseLossPolicy {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "keep" => Ok(LeaseLossPolicy::Keep),
            "regrant" => Ok(LeaseLossPolicy::Regrant),
            other => Err(RegistryError::InvalidConfig(format!(
                "Unknown lease loss policy '{}' (expected keep or regrant)",
                other
            ))),
        }
    }
}

/// Connection parameters for the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store endpoints (`http://host:2379` for etcd, `memory://name` in-process).
    pub endpoints: Vec<String>,

    /// How long to wait for the initial connection.
    #[serde(with = "serde_duration")]
    pub connect_timeout: Duration,

    /// Bound on each individual store call made by the heartbeat loop.
    #[serde(with = "serde_duration")]
    pub operation_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl StoreConfig {
    /// Store config pointing at the given endpoints with default timeouts.
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Whether every endpoint addresses the in-process memory store.
    pub fn is_memory(&self) -> bool {
        !self.endpoints.is_empty() && self.endpoints.iter().all(|e| e.starts_with("memory://"))
    }
}

/// Everything needed to register one service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Coordination store connection.
    pub store: StoreConfig,

    /// Leading path segment, e.g. `/registry`.
    pub registry_prefix: String,

    /// Logical service name.
    pub service_name: String,

    /// Unique id of this instance within the service.
    pub node_id: String,

    /// Value advertised under the registration key.
    pub node_data: NodeData,

    /// Lease TTL; renewals happen every `ttl / 3`.
    #[serde(with = "serde_duration")]
    pub ttl: Duration,

    /// Reaction to a renewal that reports the lease as not found.
    pub lease_loss: LeaseLossPolicy,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            registry_prefix: DEFAULT_REGISTRY_PREFIX.to_string(),
            service_name: String::new(),
            node_id: Uuid::new_v4().to_string(),
            node_data: NodeData::default(),
            ttl: DEFAULT_TTL,
            lease_loss: LeaseLossPolicy::default(),
        }
    }
}

impl RegistrationConfig {
    /// Minimal config for `service_name/node_id` advertising `node_data`.
    pub fn new(
        service_name: impl Into<String>,
        node_id: impl Into<String>,
        node_data: NodeData,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            node_id: node_id.into(),
            node_data,
            ..Self::default()
        }
    }

    /// The registration key: `{registry_prefix}/{service_name}/{node_id}`.
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.registry_prefix, self.service_name, self.node_id
        )
    }

    /// Interval between heartbeat ticks.
    pub fn heartbeat_interval(&self) -> Duration {
        self.ttl / 3
    }

    /// TTL handed to the store, in whole seconds (rounded up, at least 1).
    pub fn lease_ttl_secs(&self) -> i64 {
        let secs = self.ttl.as_secs() + u64::from(self.ttl.subsec_nanos() > 0);
        i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
    }

    /// Check the invariants a registration relies on.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(RegistryError::InvalidConfig(
                "service_name must not be empty".into(),
            ));
        }
        if self.node_id.trim().is_empty() {
            return Err(RegistryError::InvalidConfig(
                "node_id must not be empty".into(),
            ));
        }
        for (field, value) in [
            ("service_name", &self.service_name),
            ("node_id", &self.node_id),
        ] {
            if value.contains('/') {
                return Err(RegistryError::InvalidConfig(format!(
                    "{} '{}' must not contain '/'",
                    field, value
                )));
            }
        }
        if self.ttl < Duration::from_secs(1) {
            return Err(RegistryError::InvalidConfig(format!(
                "ttl must be at least 1s, got {:?}",
                self.ttl
            )));
        }
        if self.ttl > MAX_TTL {
            return Err(RegistryError::InvalidConfig(format!(
                "ttl must be at most {}s, got {}s",
                MAX_TTL.as_secs(),
                self.ttl.as_secs()
            )));
        }
        if self.store.operation_timeout.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "store.operation_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Load config from `path` (or the default location), then apply
    /// environment overrides. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env is the common case.
        let _ = dotenvy::dotenv();

        let path = path.map_or_else(default_config_path, Path::to_path_buf);
        let mut config = Self::from_file(&path)?.unwrap_or_default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Read a JSON config file. Returns `Ok(None)` if it does not exist.
    pub fn from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(Some(config))
    }

    /// Apply `REGISTRAR_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, suffix)).filter(|v| !v.trim().is_empty())
        };

        if let Some(endpoints) = var("ENDPOINTS") {
            self.store.endpoints = endpoints
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect();
        }
        if let Some(prefix) = var("PREFIX") {
            self.registry_prefix = prefix;
        }
        if let Some(service) = var("SERVICE") {
            self.service_name = service;
        }
        if let Some(node_id) = var("NODE_ID") {
            self.node_id = node_id;
        }
        if let Some(address) = var("ADDRESS") {
            self.node_data.address = address;
        }
        if let Some(ttl) = var("TTL") {
            self.ttl = parse_duration(&ttl)?;
        }
        if let Some(timeout) = var("OPERATION_TIMEOUT") {
            self.store.operation_timeout = parse_duration(&timeout)?;
        }
        if let Some(timeout) = var("CONNECT_TIMEOUT") {
            self.store.connect_timeout = parse_duration(&timeout)?;
        }
        if let Some(policy) = var("LEASE_LOSS") {
            self.lease_loss = policy.parse()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample() -> RegistrationConfig {
        RegistrationConfig::new(
            "echo",
            "node-1",
            NodeData::new("10.0.0.5:50051").with_metadata("zone", "eu-west-1a"),
        )
    }

    #[test]
    fn test_key_composition() {
        let mut config = sample();
        assert_eq!(config.key(), "/registry/echo/node-1");

        config.registry_prefix = "grpclb".into();
        assert_eq!(config.key(), "grpclb/echo/node-1");
    }

    #[test]
    fn test_heartbeat_interval_is_third_of_ttl() {
        let mut config = sample();
        config.ttl = Duration::from_secs(9);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(3));
        assert_eq!(config.lease_ttl_secs(), 9);
    }

    #[test]
    fn test_lease_ttl_rounds_up() {
        let mut config = sample();
        config.ttl = Duration::from_millis(4500);
        assert_eq!(config.lease_ttl_secs(), 5);
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());

        let mut config = sample();
        config.service_name = " ".into();
        assert!(matches!(
            config.validate(),
            Err(RegistryError::InvalidConfig(_))
        ));

        let mut config = sample();
        config.node_id = "a/b".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must not contain '/'"));

        let mut config = sample();
        config.ttl = Duration::from_millis(500);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_huge_ttl() {
        let mut config: RegistrationConfig = serde_json::from_str(
            r#"{ "service_name": "echo", "node_id": "n1", "ttl": 18446744073709551615 }"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RegistryError::InvalidConfig(_)));
        assert!(err.to_string().contains("at most"));

        config.ttl = MAX_TTL;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_node_id_is_generated() {
        let a = RegistrationConfig::default();
        let b = RegistrationConfig::default();
        assert!(!a.node_id.is_empty());
        assert_ne!(a.node_id, b.node_id);
    }

    #[test]
    fn test_node_data_wire_format() {
        let data = NodeData::new("127.0.0.1:8080").with_metadata("version", "v2");
        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(json, r#"{"Addr":"127.0.0.1:8080","Metadata":{"version":"v2"}}"#);

        let parsed: NodeData = serde_json::from_str(r#"{"Addr":"h:1"}"#).unwrap();
        assert_eq!(parsed, NodeData::new("h:1"));
    }

    #[test]
    fn test_parse_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "store": { "endpoints": ["http://etcd-0:2379", "http://etcd-1:2379"], "operation_timeout": "2s" },
                "registry_prefix": "/grpclb",
                "service_name": "payments",
                "node_id": "p-7",
                "node_data": { "Addr": "10.1.2.3:9000", "Metadata": { "weight": "10" } },
                "ttl": 15,
                "lease_loss": "regrant"
            }"#,
        )
        .unwrap();

        let config = RegistrationConfig::from_file(&path).unwrap().unwrap();
        assert_eq!(config.store.endpoints.len(), 2);
        assert_eq!(config.store.operation_timeout, Duration::from_secs(2));
        assert_eq!(config.store.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.key(), "/grpclb/payments/p-7");
        assert_eq!(config.ttl, Duration::from_secs(15));
        assert_eq!(config.lease_loss, LeaseLossPolicy::Regrant);
        assert_eq!(config.node_data.metadata.get("weight").unwrap(), "10");
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = RegistrationConfig::from_file(&dir.path().join("absent.json")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_malformed_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            RegistrationConfig::from_file(&path),
            Err(RegistryError::Serialization(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("REGISTRAR_ENDPOINTS", "memory://a, memory://b"),
            ("REGISTRAR_SERVICE", "search"),
            ("REGISTRAR_NODE_ID", "s-1"),
            ("REGISTRAR_ADDRESS", "0.0.0.0:7000"),
            ("REGISTRAR_TTL", "30s"),
            ("REGISTRAR_LEASE_LOSS", "regrant"),
            ("REGISTRAR_PREFIX", ""),
        ]
        .into_iter()
        .collect();

        let mut config = RegistrationConfig::default();
        config
            .apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.store.endpoints, vec!["memory://a", "memory://b"]);
        assert!(config.store.is_memory());
        assert_eq!(config.key(), "/registry/search/s-1");
        assert_eq!(config.node_data.address, "0.0.0.0:7000");
        assert_eq!(config.ttl, Duration::from_secs(30));
        assert_eq!(config.lease_loss, LeaseLossPolicy::Regrant);
    }

    #[test]
    fn test_env_override_rejects_bad_ttl() {
        let mut config = RegistrationConfig::default();
        let result = config.apply_overrides_from(|k| {
            (k == "REGISTRAR_TTL").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(RegistryError::InvalidConfig(_))));
    }
}
