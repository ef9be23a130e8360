//! Sandbox configuration types.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// DNS settings rendered into the sandbox's `resolv.conf`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Nameserver addresses.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Search domains.
    #[serde(default)]
    pub searches: Vec<String>,
    /// Resolver options (e.g. `ndots:5`).
    #[serde(default)]
    pub options: Vec<String>,
}

impl DnsConfig {
    /// True when no line would be rendered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.searches.is_empty() && self.options.is_empty()
    }

    /// Render in `resolv.conf` syntax.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.searches.is_empty() {
            out.push_str(&format!("search {}\n", self.searches.join(" ")));
        }
        for server in &self.servers {
            out.push_str(&format!("nameserver {}\n", server));
        }
        if !self.options.is_empty() {
            out.push_str(&format!("options {}\n", self.options.join(" ")));
        }
        out
    }
}

/// Snapshot of the request a sandbox was created from.
///
/// Held behind an `Arc` by the sandbox and handed out to readers as-is;
/// label and annotation updates replace the snapshot rather than mutate it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    #[serde(default)]
    pub namespace: String,
    /// Pod UID assigned by the orchestrator.
    #[serde(default)]
    pub uid: String,
    /// Creation attempt counter.
    #[serde(default)]
    pub attempt: u32,
    /// Hostname for the sandbox; the sandbox name is used when empty.
    #[serde(default)]
    pub hostname: String,
    /// Directory for container logs.
    #[serde(default)]
    pub log_directory: String,
    /// DNS settings.
    #[serde(default)]
    pub dns: Option<DnsConfig>,
    /// Orchestrator labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Orchestrator annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Parent cgroup for the sandbox.
    #[serde(default)]
    pub cgroup_parent: String,
}

impl SandboxConfig {
    /// Create a new config builder.
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::InvalidConfig("name is required".into()));
        }
        if self.labels.keys().any(|k| k.is_empty()) {
            return Err(CoreError::InvalidConfig("label keys must be non-empty".into()));
        }
        if self.annotations.keys().any(|k| k.is_empty()) {
            return Err(CoreError::InvalidConfig(
                "annotation keys must be non-empty".into(),
            ));
        }
        Ok(())
    }

    /// Hostname to write into the sandbox, falling back to `fallback`.
    pub fn hostname_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.hostname.is_empty() {
            fallback
        } else {
            &self.hostname
        }
    }
}

/// Builder for SandboxConfig.
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    /// Set the pod name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the pod namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the pod UID.
    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.config.uid = uid.into();
        self
    }

    /// Set the creation attempt.
    pub fn attempt(mut self, attempt: u32) -> Self {
        self.config.attempt = attempt;
        self
    }

    /// Set the hostname.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.config.hostname = hostname.into();
        self
    }

    /// Set the log directory.
    pub fn log_directory(mut self, dir: impl Into<String>) -> Self {
        self.config.log_directory = dir.into();
        self
    }

    /// Set DNS settings.
    pub fn dns(mut self, dns: DnsConfig) -> Self {
        self.config.dns = Some(dns);
        self
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.labels.insert(key.into(), value.into());
        self
    }

    /// Add an annotation.
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.annotations.insert(key.into(), value.into());
        self
    }

    /// Set the parent cgroup.
    pub fn cgroup_parent(mut self, parent: impl Into<String>) -> Self {
        self.config.cgroup_parent = parent.into();
        self
    }

    /// Build the configuration, validating all required fields.
    pub fn build(self) -> Result<SandboxConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
