// Copyright 2024-2026 GG-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Allocator configuration.
//!
//! Sources, lowest to highest priority: built-in defaults, a TOML file,
//! `GG_DEVMEM_*` environment variables.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_SMALL_THRESHOLD: &str = "GG_DEVMEM_SMALL_THRESHOLD";
pub const ENV_SMALL_GRANULARITY: &str = "GG_DEVMEM_SMALL_GRANULARITY";
pub const ENV_BIG_REUSE_SLACK: &str = "GG_DEVMEM_BIG_REUSE_SLACK";
pub const ENV_TRIM_THRESHOLD: &str = "GG_DEVMEM_TRIM_THRESHOLD";
pub const ENV_OOM_POLICY: &str = "GG_DEVMEM_OOM_POLICY";

const MIB: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// What the caching allocator does when the device cannot supply a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OomPolicy {
    /// Fault immediately.
    Fatal,
    /// Free idle blocks, retry once, then return `AllocError::OutOfMemory`.
    Report,
}

impl std::str::FromStr for OomPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(OomPolicy::Fatal),
            "report" => Ok(OomPolicy::Report),
            _ => Err(()),
        }
    }
}

/// Configuration for the GPU caching allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Requests below this size use the small pool.
    pub small_threshold: usize,
    /// Small blocks are rounded up to a multiple of this (power of two).
    pub small_granularity: usize,
    /// A big block may serve a request only if it wastes less than this.
    pub big_reuse_slack: usize,
    /// Idle buffers per device above which a trim pass runs.
    pub trim_threshold: usize,
    /// Behavior on device out-of-memory.
    pub oom_policy: OomPolicy,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            small_threshold: MIB,
            small_granularity: 512,
            big_reuse_slack: MIB,
            trim_threshold: 32,
            oom_policy: OomPolicy::Fatal,
        }
    }
}

impl AllocatorConfig {
    /// Every released block goes straight back to the device.
    pub fn no_caching() -> Self {
        Self { trim_threshold: 0, ..Default::default() }
    }

    /// Report exhaustion instead of faulting, for callers that can shrink work.
    pub fn graceful_oom() -> Self {
        Self { oom_policy: OomPolicy::Report, ..Default::default() }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Defaults, then the optional file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        tracing::debug!(?config, "allocator config loaded");
        Ok(config)
    }

    /// Overlay values from `lookup` (usually the environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let size = |var: &'static str, slot: &mut usize| -> Result<(), ConfigError> {
            if let Some(value) = lookup(var) {
                *slot = value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnv { var, value })?;
            }
            Ok(())
        };
        size(ENV_SMALL_THRESHOLD, &mut self.small_threshold)?;
        size(ENV_SMALL_GRANULARITY, &mut self.small_granularity)?;
        size(ENV_BIG_REUSE_SLACK, &mut self.big_reuse_slack)?;
        size(ENV_TRIM_THRESHOLD, &mut self.trim_threshold)?;

        if let Some(value) = lookup(ENV_OOM_POLICY) {
            self.oom_policy = value
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { var: ENV_OOM_POLICY, value })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.small_threshold == 0 {
            return Err(ConfigError::Invalid("small_threshold must be > 0".into()));
        }
        if self.small_granularity == 0 || !self.small_granularity.is_power_of_two() {
            return Err(ConfigError::Invalid("small_granularity must be a power of two".into()));
        }
        if self.small_granularity > self.small_threshold {
            return Err(ConfigError::Invalid(
                "small_granularity must not exceed small_threshold".into(),
            ));
        }
        Ok(())
    }

    /// Round a small request up to the pool granularity.
    pub fn round_small(&self, byte_size: usize) -> usize {
        let g = self.small_granularity;
        byte_size.div_ceil(g) * g
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
