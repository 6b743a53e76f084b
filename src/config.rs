//! Archive configuration with layered resolution using figment.
//!
//! An archive id resolves to `<id>.toml` searched along the colon-separated
//! `MUNINN_CONFIG_PATH` (entries may be directories or direct file paths).
//! Environment variables prefixed `MUNINN_` override file values, with `__`
//! as the section separator (e.g. `MUNINN_ARCHIVE__DATABASE`).

use std::ops::Deref;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use crate::catalogue::sqlite::SqliteConfig;
use crate::storage::fs::FsConfig;

/// Boxed wrapper for figment::Error to reduce Result size on the stack.
#[derive(Debug)]
pub struct ConfigError(Box<figment::Error>);

impl Deref for ConfigError {
    type Target = figment::Error;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self(Box::new(err))
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    pub sqlite: Option<SqliteConfig>,
    pub fs: Option<FsConfig>,
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// The `[archive]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Catalogue backend selector.
    #[serde(default = "default_database")]
    pub database: String,
    /// Storage backend selector, or `none` for a catalogue-only archive.
    #[serde(default = "default_storage")]
    pub storage: String,
    /// Minimum age in minutes before a product becomes a cascade candidate.
    #[serde(default)]
    pub cascade_grace_period: i64,
    #[serde(default = "default_max_cascade_cycles")]
    pub max_cascade_cycles: u32,
    #[serde(default)]
    pub namespace_extensions: Vec<String>,
    #[serde(default)]
    pub product_type_extensions: Vec<String>,
    #[serde(default)]
    pub remote_backend_extensions: Vec<String>,
    #[serde(default)]
    pub hook_extensions: Vec<String>,
    /// JSON credentials for remote downloads.
    pub auth_file: Option<String>,
    /// Staging root for storage backends that cannot stage in place.
    pub tempdir: Option<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            database: default_database(),
            storage: default_storage(),
            cascade_grace_period: 0,
            max_cascade_cycles: default_max_cascade_cycles(),
            namespace_extensions: Vec::new(),
            product_type_extensions: Vec::new(),
            remote_backend_extensions: Vec::new(),
            hook_extensions: Vec::new(),
            auth_file: None,
            tempdir: None,
        }
    }
}

fn default_database() -> String {
    "sqlite".to_string()
}

fn default_storage() -> String {
    "fs".to_string()
}

fn default_max_cascade_cycles() -> u32 {
    25
}

/// The `[remote]` section: settings applied to the built-in download
/// backends.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Retry budget; only read timeouts are retried.
    #[serde(default)]
    pub retries: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            timeout: default_timeout(),
            retries: 0,
        }
    }
}

fn default_timeout() -> u64 {
    60
}

impl Config {
    /// Load a configuration file, with `MUNINN_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MUNINN_").map(|key| key.as_str().replace("__", ".").into()))
            .extract()
            .map_err(ConfigError::from)
    }
}

/// Value of the `MUNINN_CONFIG_PATH` environment variable.
pub fn config_path() -> String {
    std::env::var("MUNINN_CONFIG_PATH").unwrap_or_default()
}

/// Locate the configuration file for an archive id along the search path.
/// An id that already ends in `.toml` is used as a direct path.
pub fn locate_config_file(archive_id: &str) -> crate::error::Result<PathBuf> {
    if archive_id.ends_with(".toml") {
        return Ok(PathBuf::from(archive_id));
    }

    let file_name = format!("{}.toml", archive_id);
    if Path::new(&file_name).file_name().map(|name| name.to_string_lossy().into_owned())
        != Some(file_name.clone())
    {
        return Err(crate::error::Error::User(format!(
            "invalid archive identifier: \"{}\"",
            archive_id
        )));
    }

    for entry in config_path().split(':').filter(|entry| !entry.is_empty()) {
        let entry = Path::new(entry);
        if entry.is_file() {
            if entry.file_name().map(|name| name.to_string_lossy().into_owned())
                == Some(file_name.clone())
            {
                return Ok(entry.to_path_buf());
            }
        } else {
            let candidate = entry.join(&file_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(crate::error::Error::User(format!(
        "configuration file: \"{}\" not found on search path: \"{}\"",
        file_name,
        config_path()
    )))
}

/// Names of all archives found along the search path.
pub fn list_archives() -> Vec<String> {
    let mut result = Vec::new();
    for entry in config_path().split(':').filter(|entry| !entry.is_empty()) {
        let entry = Path::new(entry);
        if entry.is_file() {
            if let Some(name) = entry.file_name().and_then(|name| name.to_str()) {
                if let Some(stem) = name.strip_suffix(".toml") {
                    result.push(stem.to_string());
                }
            }
        } else if let Ok(listing) = std::fs::read_dir(entry) {
            for item in listing.flatten() {
                if let Some(name) = item.file_name().to_str() {
                    if let Some(stem) = name.strip_suffix(".toml") {
                        result.push(stem.to_string());
                    }
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_defaults() {
        let config = ArchiveConfig::default();
        assert_eq!(config.database, "sqlite");
        assert_eq!(config.storage, "fs");
        assert_eq!(config.cascade_grace_period, 0);
        assert_eq!(config.max_cascade_cycles, 25);
    }

    #[test]
    fn load_parses_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("myarchive.toml");
        std::fs::write(
            &path,
            r#"
            [archive]
            cascade_grace_period = 10
            product_type_extensions = ["mytypes"]

            [sqlite]
            connection_string = "/data/catalogue.db"
            table_prefix = "my_"

            [fs]
            root = "/data/archive"
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.archive.cascade_grace_period, 10);
        assert_eq!(config.archive.product_type_extensions, vec!["mytypes"]);
        assert_eq!(
            config.sqlite.as_ref().unwrap().connection_string,
            "/data/catalogue.db"
        );
        assert_eq!(config.sqlite.as_ref().unwrap().table_prefix, "my_");
        assert_eq!(config.fs.as_ref().unwrap().root, "/data/archive");
        assert_eq!(config.remote.timeout, 60);
    }

    #[test]
    fn invalid_archive_id_is_rejected() {
        assert!(locate_config_file("../sneaky").is_err());
    }
}
