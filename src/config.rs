//! Configuration.
//!
//! A [`Config`] struct deserialized via the `config` crate, layering an
//! optional TOML file under `TLOG__`-prefixed environment variables,
//! with `serde` derives and `humantime_serde` for durations.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::QueueConfig;

/// Loads configuration from an optional TOML file, overridden by
/// `TLOG__`-prefixed environment variables (e.g. `TLOG__SERVER__ADDRESS`).
///
/// # Errors
/// Returns an error if the file can't be read or the merged settings
/// don't deserialize into [`Config`].
pub fn load_config(config_file_path: Option<&Path>) -> anyhow::Result<Config> {
    let mut settings = config::Config::builder();

    if let Some(path) = config_file_path {
        settings = settings.add_source(config::File::from(path).required(true));
    }

    let settings = settings
        .add_source(
            config::Environment::with_prefix("TLOG")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize::<Config>()?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub tree: TreeConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Identifies the log and binds it to the signing key used for
/// checkpoints. The signing key material itself is out of scope —
/// only its identifier lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// UTF-8 identifier present in every checkpoint note.
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: SocketAddr,

    #[serde(with = "humantime_serde")]
    #[serde(default = "default::serve_timeout")]
    pub serve_timeout: Duration,
}

/// Selects which [`crate::storage::Storage`] implementation to construct.
/// Concrete backends (object store, SQL, filesystem) are external
/// collaborators; `memory` is the only variant this crate itself can
/// satisfy without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum StorageConfig {
    #[default]
    Memory,
}

mod default {
    use std::time::Duration;

    pub const fn serve_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn tempfile_with_contents(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn deserializes_minimal_toml() {
        let toml = r#"
            [tree]
            origin = "example.com/log"

            [server]
            address = "127.0.0.1:8080"
        "#;
        let file = tempfile_with_contents(toml);
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.tree.origin, "example.com/log");
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.storage, StorageConfig::Memory);
    }

    #[test]
    fn env_var_overrides_file() {
        let toml = r#"
            [tree]
            origin = "file-origin"

            [server]
            address = "127.0.0.1:8080"
        "#;
        let file = tempfile_with_contents(toml);
        std::env::set_var("TLOG__TREE__ORIGIN", "env-origin");
        let config = load_config(Some(file.path())).unwrap();
        std::env::remove_var("TLOG__TREE__ORIGIN");
        assert_eq!(config.tree.origin, "env-origin");
    }
}
