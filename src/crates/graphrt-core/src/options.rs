//! Ordered key/value options at global, session and graph scope
//!
//! Options resolve in three layers. Global options are overlaid by session
//! options at Initialize, and session options are overlaid by graph options
//! when a graph compiles or runs. Later layers win on conflicting keys.

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Well-known option keys
pub mod keys {
    /// Device ordinal the session binds to
    pub const DEVICE_ID: &str = "device_id";
    /// Target platform identifier; queried from the device when absent
    pub const SOC_VERSION: &str = "soc_version";
    /// Numeric precision policy
    pub const PRECISION_MODE: &str = "precision_mode";
    /// Newer spelling of the precision policy; exclusive with `precision_mode`
    pub const PRECISION_MODE_V2: &str = "precision_mode_v2";
    /// Whether intermediate buffers may share memory
    pub const MEMORY_REUSE: &str = "memory_reuse";
    /// Log level cached by the session at Initialize
    pub const LOG_LEVEL: &str = "log_level";
    /// `single` compiles one binary per concrete shape, `multi` a range binary
    pub const SHAPE_MODE: &str = "shape_mode";
    /// Per-input dynamic shape bounds, e.g. `[1~8,4];[-1]`
    pub const INPUT_SHAPE_RANGE: &str = "input_shape_range";
    /// Removed legacy auto-tune switch
    pub const AUTO_TUNE_MODE: &str = "auto_tune_mode";
    /// Removed legacy operator tuning switch
    pub const OP_TUNING_MODE: &str = "op_tuning_mode";
    /// Correlation tag stamped on every graph and subgraph
    pub const SESSION_GRAPH_ID: &str = "session_graph_id";
}

const PRECISION_MODES: &[&str] = &[
    "force_fp32",
    "force_fp16",
    "allow_fp32_to_fp16",
    "must_keep_origin_dtype",
    "allow_mix_precision",
];

const PRECISION_MODES_V2: &[&str] = &["fp16", "origin", "cube_fp16in_fp32out", "mixed_float16"];

const LEGACY_TUNING_KEYS: &[&str] = &[keys::AUTO_TUNE_MODE, keys::OP_TUNING_MODE];

/// Ordered string key/value configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(BTreeMap<String, String>);

impl Options {
    /// Create an empty option set
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    /// Look up a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Whether a key is present
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Remove a key
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Return a copy of `self` with every key of `top` applied over it.
    ///
    /// Keys present in both take the value from `top`.
    pub fn overlay(&self, top: &Options) -> Options {
        let mut merged = self.clone();
        for (k, v) in &top.0 {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Add keys from `extra` that are not already present.
    ///
    /// Returns the number of keys added.
    pub fn merge_missing(&mut self, extra: &Options) -> usize {
        let mut added = 0;
        for (k, v) in &extra.0 {
            if !self.0.contains_key(k) {
                self.0.insert(k.clone(), v.clone());
                added += 1;
            }
        }
        added
    }

    /// Parse a boolean option (`true`/`false`/`1`/`0`)
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some("true") | Some("1") => Ok(Some(true)),
            Some("false") | Some("0") => Ok(Some(false)),
            Some(other) => Err(SessionError::Configuration(format!(
                "option '{}' expects a boolean, got '{}'",
                key, other
            ))),
        }
    }

    /// Parse an unsigned option
    pub fn get_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<u32>().map(Some).map_err(|_| {
                SessionError::Configuration(format!(
                    "option '{}' expects an unsigned integer, got '{}'",
                    key, raw
                ))
            }),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Options {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Reject the removed legacy auto-tune key (AddGraph)
pub fn reject_auto_tune(options: &Options) -> Result<()> {
    if options.contains(keys::AUTO_TUNE_MODE) {
        return Err(SessionError::Configuration(format!(
            "option '{}' has been removed; use the offline tuning tool instead",
            keys::AUTO_TUNE_MODE
        )));
    }
    Ok(())
}

/// Validate a resolved session option set (Initialize)
pub fn validate_session_options(options: &Options) -> Result<()> {
    for key in LEGACY_TUNING_KEYS {
        if options.contains(key) {
            return Err(SessionError::Configuration(format!(
                "tuning option '{}' is no longer supported",
                key
            )));
        }
    }

    if options.contains(keys::PRECISION_MODE) && options.contains(keys::PRECISION_MODE_V2) {
        return Err(SessionError::Configuration(format!(
            "'{}' and '{}' are mutually exclusive",
            keys::PRECISION_MODE,
            keys::PRECISION_MODE_V2
        )));
    }

    if let Some(mode) = options.get(keys::PRECISION_MODE) {
        if !PRECISION_MODES.contains(&mode) {
            return Err(SessionError::Configuration(format!(
                "unknown precision mode '{}'",
                mode
            )));
        }
    }

    if let Some(mode) = options.get(keys::PRECISION_MODE_V2) {
        if !PRECISION_MODES_V2.contains(&mode) {
            return Err(SessionError::Configuration(format!(
                "unknown precision mode '{}'",
                mode
            )));
        }
    }

    if let Some(mode) = options.get(keys::SHAPE_MODE) {
        if mode != "single" && mode != "multi" {
            return Err(SessionError::Configuration(format!(
                "option '{}' must be 'single' or 'multi', got '{}'",
                keys::SHAPE_MODE,
                mode
            )));
        }
    }

    options.get_bool(keys::MEMORY_REUSE)?;
    options.get_u32(keys::DEVICE_ID)?;
    Ok(())
}
