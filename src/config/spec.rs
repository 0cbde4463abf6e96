//! Desired-state document types.
//!
//! This module defines the structs that map to `converge.yaml`. The document
//! is purely declarative: resource declarations (optionally grouped in
//! modules), engine settings and where state lives.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The root desired-state document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DesiredDocument {
    /// Engine settings.
    #[serde(default)]
    pub settings: EngineSettings,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Root-module resource declarations.
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    /// Child modules.
    #[serde(default)]
    pub modules: Vec<ModuleDeclaration>,
}

/// Engine-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    /// Maximum number of steps running at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Stop starting new steps after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
    /// Lock holder identity; generated from host and process when absent.
    #[serde(default)]
    pub lock_holder: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            fail_fast: false,
            lock_holder: None,
        }
    }
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// A named group of declarations, addressed as `module.<name>.`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleDeclaration {
    /// Module name.
    pub name: String,
    /// Resource declarations in this module.
    #[serde(default)]
    pub resources: Vec<ResourceDeclaration>,
    /// Nested modules.
    #[serde(default)]
    pub modules: Vec<ModuleDeclaration>,
}

/// One resource declaration, expanded into one or more instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDeclaration {
    /// Resource type, e.g. `null_instance`. The prefix selects the provider.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Declared name, unique per type within a module.
    pub name: String,
    /// Managed resource or trigger.
    #[serde(default)]
    pub kind: ResourceKind,
    /// Count-style repetition.
    #[serde(default)]
    pub count: Option<u64>,
    /// Keyed repetition.
    #[serde(default)]
    pub for_each: Option<ForEach>,
    /// Desired attributes; string values may contain `${...}` references.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Explicit dependencies as addresses.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Lifecycle policy.
    #[serde(default)]
    pub lifecycle: LifecyclePolicy,
    /// Post-creation provisioners, run in order.
    #[serde(default)]
    pub provisioners: Vec<ProvisionerConfig>,
}

/// Kind of resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Backed by a provider.
    #[default]
    Managed,
    /// No provider; replaced whenever the hash of its attributes changes.
    Trigger,
}

/// Keys for `for_each` expansion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ForEach {
    /// A list of keys; `each.value` equals `each.key`.
    List(Vec<String>),
    /// A map of key to value.
    Map(BTreeMap<String, Value>),
}

impl ForEach {
    /// Returns `(key, value)` pairs in key order.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Value)> {
        match self {
            Self::List(keys) => {
                let mut keys: Vec<&String> = keys.iter().collect();
                keys.sort();
                keys.dedup();
                keys.into_iter()
                    .map(|k| (k.clone(), Value::String(k.clone())))
                    .collect()
            }
            Self::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

/// Lifecycle policy of a declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Attributes whose change forces replacement.
    #[serde(default)]
    pub force_new: Vec<String>,
    /// Refuse any plan that would destroy or replace the instance.
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Attributes whose change never triggers update or replace.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
    /// Create the replacement before destroying the old object.
    #[serde(default)]
    pub create_before_destroy: bool,
}

/// A provisioner block: where to connect and what to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionerConfig {
    /// Connection parameters.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Commands, run in order.
    pub commands: Vec<String>,
    /// What a failure does to the instance.
    #[serde(default)]
    pub on_failure: OnFailure,
}

/// Connection parameters; string fields may use `${self.<attr>}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Connection method.
    #[serde(rename = "type", default)]
    pub method: ConnectionMethod,
    /// Target host.
    #[serde(default)]
    pub host: Option<String>,
    /// Target port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Login user.
    #[serde(default)]
    pub user: Option<String>,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
    /// Private key path or content.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Per-command timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            method: ConnectionMethod::default(),
            host: None,
            port: None,
            user: None,
            password: None,
            private_key: None,
            timeout_secs: default_command_timeout(),
        }
    }
}

/// Connection methods.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMethod {
    /// Run on the machine executing the engine.
    #[default]
    Local,
    /// Run over SSH.
    Ssh,
}

impl std::fmt::Display for ConnectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Ssh => write!(f, "ssh"),
        }
    }
}

/// Provisioner failure handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    /// Taint the instance and fail the step.
    #[default]
    Taint,
    /// Log the failure and carry on.
    Continue,
}

// Default value functions

const fn default_parallelism() -> usize {
    10
}

const fn default_command_timeout() -> u64 {
    300
}

impl DesiredDocument {
    /// Returns the total number of declarations, including nested modules.
    #[must_use]
    pub fn declaration_count(&self) -> usize {
        fn count(modules: &[ModuleDeclaration]) -> usize {
            modules
                .iter()
                .map(|m| m.resources.len() + count(&m.modules))
                .sum()
        }
        self.resources.len() + count(&self.modules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document_defaults() {
        let doc: DesiredDocument = serde_yaml::from_str(
            r"
resources:
  - type: null_instance
    name: web
",
        )
        .expect("valid yaml");

        assert_eq!(doc.settings.parallelism, 10);
        assert_eq!(doc.state.backend, StateBackend::Local);
        let web = &doc.resources[0];
        assert_eq!(web.kind, ResourceKind::Managed);
        assert!(web.count.is_none());
        assert!(!web.lifecycle.prevent_destroy);
    }

    #[test]
    fn test_for_each_list_and_map() {
        let list: ForEach = serde_yaml::from_str("[qa, dev, qa]").expect("list");
        let keys: Vec<String> = list.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["dev", "qa"]);

        let map: ForEach = serde_yaml::from_str("{prod: 3, dev: 1}").expect("map");
        let entries = map.entries();
        assert_eq!(entries[0], ("dev".to_string(), Value::from(1)));
        assert_eq!(entries[1], ("prod".to_string(), Value::from(3)));
    }

    #[test]
    fn test_provisioner_defaults() {
        let prov: ProvisionerConfig =
            serde_yaml::from_str("commands: [\"echo hi\"]").expect("provisioner");
        assert_eq!(prov.connection.method, ConnectionMethod::Local);
        assert_eq!(prov.connection.timeout_secs, 300);
        assert_eq!(prov.on_failure, OnFailure::Taint);
    }

    #[test]
    fn test_declaration_count_includes_modules() {
        let doc: DesiredDocument = serde_yaml::from_str(
            r"
resources:
  - {type: null_a, name: one}
modules:
  - name: net
    resources:
      - {type: null_b, name: two}
    modules:
      - name: edge
        resources:
          - {type: null_c, name: three}
",
        )
        .expect("valid yaml");
        assert_eq!(doc.declaration_count(), 3);
    }
}
