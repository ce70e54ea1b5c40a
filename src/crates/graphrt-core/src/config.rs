//! TOML session configuration
//!
//! ```toml
//! [session]
//! id = 7
//!
//! [global_options]
//! soc_version = "loopback-v1"
//!
//! [options]
//! device_id = "0"
//! precision_mode = "force_fp16"
//!
//! [logging]
//! level = "debug"
//!
//! [graph]
//! id = 1
//! name = "matmul"
//! inputs = [{ dims = [2, 4], dtype = "f32" }]
//! outputs = [{ dims = [2, 8], dtype = "f32" }]
//! ```

use crate::error::{Result, SessionError};
use crate::options::{validate_session_options, Options};
use crate::tensor::TensorDesc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Root of a session configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub session: SessionSection,
    /// Options applied to the process-wide context
    pub global_options: Options,
    /// Session-scope options
    pub options: Options,
    pub logging: LoggingConfig,
    /// Demo graph driven by the CLI
    pub graph: Option<GraphConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Fixed session id; engine-assigned when absent
    pub id: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `graphrt_core=debug`
    pub level: Option<String>,
}

/// Signature of a graph to build from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphConfig {
    pub id: u32,
    #[serde(default = "default_graph_name")]
    pub name: String,
    pub inputs: Vec<TensorDesc>,
    pub outputs: Vec<TensorDesc>,
    /// Graph-scope options
    #[serde(default)]
    pub options: Options,
}

fn default_graph_name() -> String {
    "graph".to_string()
}

impl SessionConfig {
    /// Parse a configuration document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| SessionError::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Global options overlaid with session options, validated as Initialize
    /// would validate them
    pub fn resolved_options(&self) -> Result<Options> {
        let resolved = self.global_options.overlay(&self.options);
        validate_session_options(&resolved)?;
        Ok(resolved)
    }
}

/// Reads [`SessionConfig`] files
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load and parse a configuration file
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<SessionConfig> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading session config");

        let content = fs::read_to_string(path).await.map_err(|e| {
            SessionError::Configuration(format!(
                "Failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = SessionConfig::from_toml(&content)?;

        info!(
            path = %path.display(),
            session_options = config.options.len(),
            has_graph = config.graph.is_some(),
            "Session config loaded"
        );
        Ok(config)
    }

    /// Load a file and validate its options
    pub async fn load_validated(&self, path: impl AsRef<Path>) -> Result<SessionConfig> {
        let config = self.load(path).await?;
        config.resolved_options()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DType;
    use std::io::Write;

    const SAMPLE: &str = r#"
[session]
id = 7

[global_options]
soc_version = "loopback-v1"
precision_mode = "force_fp32"

[options]
device_id = "2"
precision_mode = "force_fp16"

[logging]
level = "debug"

[graph]
id = 1
name = "matmul"
inputs = [{ dims = [2, 4], dtype = "f32" }]
outputs = [{ dims = [2, 8], dtype = "f32" }]
"#;

    #[test]
    fn test_parse_sample() {
        let config = SessionConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.session.id, Some(7));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));

        let graph = config.graph.as_ref().unwrap();
        assert_eq!(graph.inputs[0], TensorDesc::new(vec![2, 4], DType::F32));
        assert!(graph.options.is_empty());

        let resolved = config.resolved_options().unwrap();
        assert_eq!(resolved.get("precision_mode"), Some("force_fp16"));
        assert_eq!(resolved.get("soc_version"), Some("loopback-v1"));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SessionConfig::from_toml("").unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_invalid_options_rejected() {
        let config = SessionConfig::from_toml(
            r#"
[options]
auto_tune_mode = "RA"
"#,
        )
        .unwrap();
        assert!(matches!(
            config.resolved_options(),
            Err(SessionError::Configuration(_))
        ));

        assert!(matches!(
            SessionConfig::from_toml("[session]\nid = \"seven\""),
            Err(SessionError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_loader_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ConfigLoader::new().load_validated(file.path()).await.unwrap();
        assert_eq!(config.graph.unwrap().name, "matmul");
    }

    #[tokio::test]
    async fn test_loader_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new()
            .load(dir.path().join("absent.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
    }
}
