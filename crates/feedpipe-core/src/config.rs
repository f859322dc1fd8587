//! pipeline.toml configuration parser.
//!
//! Every section and field is optional; omitted values fall back to the
//! defaults documented on each field.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::Params;

/// Errors raised while loading or validating a pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pool: PoolSection,
    pub bridge: BridgeSection,
    pub policy: PolicySection,
    /// Parameters passed to every transform.
    pub params: Params,
    /// Parameter name → request header whose value populates it.
    pub params_from_headers: BTreeMap<String, String>,
    pub headers: HeadersSection,
    pub definition: DefinitionSection,
}

/// What a borrower does when every engine is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionMode {
    /// Wait up to `borrow_timeout_ms` for an engine to be returned.
    #[default]
    Wait,
    /// Fail immediately.
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    /// Engines instantiated at startup (default: 2).
    pub min_idle: u32,
    /// Maximum engines, and therefore concurrent transforms (default: 8).
    pub max_size: u32,
    pub on_exhausted: ExhaustionMode,
    /// Upper bound on a borrow wait in `wait` mode (default: 5000).
    pub borrow_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            min_idle: 2,
            max_size: 8,
            on_exhausted: ExhaustionMode::Wait,
            borrow_timeout_ms: 5_000,
        }
    }
}

impl PoolSection {
    pub fn borrow_timeout(&self) -> Duration {
        Duration::from_millis(self.borrow_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    /// Chunks buffered between producer and consumer (default: 16).
    pub channel_capacity: usize,
    /// Largest chunk a single producer write is split into (default: 8192).
    pub chunk_size: usize,
    /// Deadline for the producer to commit its response head.
    pub first_byte_timeout_ms: Option<u64>,
    /// Deadline for the producer task to finish once the consumer is done.
    pub completion_timeout_ms: Option<u64>,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            channel_capacity: 16,
            chunk_size: 8 * 1024,
            first_byte_timeout_ms: Some(30_000),
            completion_timeout_ms: Some(30_000),
        }
    }
}

impl BridgeSection {
    pub fn first_byte_timeout(&self) -> Option<Duration> {
        self.first_byte_timeout_ms.map(Duration::from_millis)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    /// Lowest status eligible for transformation (default: 200).
    pub status_min: u16,
    /// Highest status eligible for transformation, inclusive (default: 299).
    pub status_max: u16,
    /// Content types recognized as transformable (substring match).
    pub content_types: Vec<String>,
    /// Skip the transform unless the declared content type is recognized.
    /// When false the sniffed marker byte alone decides.
    pub require_content_type: bool,
    /// Byte a transformable body starts with, after leading whitespace.
    pub marker: char,
    /// Bytes inspected when looking for the marker (default: 64).
    pub sniff_window: usize,
    /// Consumed input retained for the raw-copy fallback (default: 64 KiB).
    pub replay_limit: usize,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            status_min: 200,
            status_max: 299,
            content_types: vec![
                "application/xml".to_string(),
                "application/atom+xml".to_string(),
            ],
            require_content_type: false,
            marker: '<',
            sniff_window: 64,
            replay_limit: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadersSection {
    /// Base URL substituted into `Location` and `Link` headers.
    pub rewrite_links_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    #[default]
    Identity,
    Rewrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionSection {
    pub name: String,
    pub kind: DefinitionKind,
    pub rules: Vec<RuleSection>,
}

impl Default for DefinitionSection {
    fn default() -> Self {
        Self {
            name: "identity".to_string(),
            kind: DefinitionKind::Identity,
            rules: Vec::new(),
        }
    }
}

/// One substitution rule of a `rewrite` definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSection {
    pub pattern: String,
    pub replacement: String,
}

const EXAMPLE: &str = r#"# feedpipe pipeline configuration

[pool]
min_idle = 2
max_size = 8
on_exhausted = "wait"     # or "fail"
borrow_timeout_ms = 5000

[bridge]
channel_capacity = 16
chunk_size = 8192
first_byte_timeout_ms = 30000
completion_timeout_ms = 30000

[policy]
status_min = 200
status_max = 299
content_types = ["application/xml", "application/atom+xml"]
require_content_type = false
marker = "<"
sniff_window = 64
replay_limit = 65536

[params]
correct_url = "https://feeds.example.com"

[params_from_headers]
tenant_id = "x-tenant-id"

[headers]
rewrite_links_to = "https://feeds.example.com"

[definition]
name = "external-href"
kind = "rewrite"

[[definition.rules]]
pattern = 'href="https?://[^/"]+/'
replacement = 'href="{{correct_url}}/'
"#;

impl PipelineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "loaded pipeline config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// An annotated sample configuration.
    pub fn example() -> &'static str {
        EXAMPLE
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.pool.max_size == 0 {
            return invalid("pool.max_size must be at least 1".into());
        }
        if self.pool.min_idle > self.pool.max_size {
            return invalid(format!(
                "pool.min_idle ({}) exceeds pool.max_size ({})",
                self.pool.min_idle, self.pool.max_size
            ));
        }
        if self.bridge.channel_capacity == 0 {
            return invalid("bridge.channel_capacity must be at least 1".into());
        }
        if self.bridge.chunk_size == 0 {
            return invalid("bridge.chunk_size must be at least 1".into());
        }
        if self.policy.status_min > self.policy.status_max {
            return invalid(format!(
                "policy.status_min ({}) exceeds policy.status_max ({})",
                self.policy.status_min, self.policy.status_max
            ));
        }
        if !self.policy.marker.is_ascii() {
            return invalid(format!(
                "policy.marker must be a single ASCII character, got {:?}",
                self.policy.marker
            ));
        }
        if self.policy.sniff_window == 0 {
            return invalid("policy.sniff_window must be at least 1".into());
        }
        if self.definition.kind == DefinitionKind::Rewrite && self.definition.rules.is_empty() {
            return invalid(format!(
                "definition '{}' is a rewrite with no rules",
                self.definition.name
            ));
        }
        Ok(())
    }
}
