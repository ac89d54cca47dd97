//! Snapshot configuration

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};

/// How threads (coroutines) are captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadPolicy {
    /// Threads keep their identity and idle stack, but in-flight frames are
    /// dropped and open upvalues are closed over their current value.
    #[default]
    Exclude,
    /// Stacks, frames and open upvalues are captured as-is. Experimental:
    /// the snapshot only restores against the same bytecode revision.
    Deep,
}

/// What to do when capture meets a value that cannot be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnserializablePolicy {
    /// Fail the whole capture.
    #[default]
    Abort,
    /// Write nil in its place and report the substitution.
    SubstituteNil,
}

/// Snapshot configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub threads: ThreadPolicy,

    pub unserializable: UnserializablePolicy,

    /// Table nesting limit for native auto-registration
    pub auto_register_depth: usize,
}

/// Upper bound on `auto_register_depth`.
pub const MAX_AUTO_REGISTER_DEPTH: usize = 64;

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            threads: ThreadPolicy::Exclude,
            unserializable: UnserializablePolicy::Abort,
            auto_register_depth: 7,
        }
    }
}

impl SnapshotConfig {
    /// Create a new config builder
    pub fn builder() -> SnapshotConfigBuilder {
        SnapshotConfigBuilder::default()
    }

    /// Parse from TOML. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SnapshotConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auto_register_depth > MAX_AUTO_REGISTER_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "auto_register_depth {} exceeds {}",
                self.auto_register_depth, MAX_AUTO_REGISTER_DEPTH
            )));
        }
        Ok(())
    }
}

/// Config builder for fluent API
#[derive(Debug, Default)]
pub struct SnapshotConfigBuilder {
    threads: Option<ThreadPolicy>,
    unserializable: Option<UnserializablePolicy>,
    auto_register_depth: Option<usize>,
}

impl SnapshotConfigBuilder {
    pub fn threads(mut self, policy: ThreadPolicy) -> Self {
        self.threads = Some(policy);
        self
    }

    pub fn unserializable(mut self, policy: UnserializablePolicy) -> Self {
        self.unserializable = Some(policy);
        self
    }

    pub fn auto_register_depth(mut self, depth: usize) -> Self {
        self.auto_register_depth = Some(depth);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<SnapshotConfig, ConfigError> {
        let defaults = SnapshotConfig::default();
        let config = SnapshotConfig {
            threads: self.threads.unwrap_or(defaults.threads),
            unserializable: self.unserializable.unwrap_or(defaults.unserializable),
            auto_register_depth: self
                .auto_register_depth
                .unwrap_or(defaults.auto_register_depth),
        };
        config.validate()?;
        Ok(config)
    }
}
