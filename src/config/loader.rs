use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult, ConfigError};

use super::types::ConfigFile;

/// Config filenames checked in the working directory when `--config` is absent.
pub(crate) const DEFAULT_CONFIG_FILES: [&str; 2] = ["netprobe.toml", "netprobe.json"];

/// Loads the agent configuration from `path`, or from the first default file
/// present in the working directory. `Ok(None)` means no file was found.
///
/// # Errors
///
/// Returns an error when the config file cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> AppResult<Option<ConfigFile>> {
    resolve_config_path(path)
        .map(|resolved| load_config_file(&resolved))
        .transpose()
}

fn resolve_config_path(path: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(PathBuf::from(path));
    }
    DEFAULT_CONFIG_FILES
        .into_iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
}

pub(crate) fn load_config_file(path: &Path) -> AppResult<ConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|err| ConfigError::ReadConfig {
        path: path.to_path_buf(),
        source: err,
    })?;
    let parsed = match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => toml::from_str(&content).map_err(|err| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source: err,
        }),
        Some("json") => serde_json::from_str(&content).map_err(|err| ConfigError::ParseJson {
            path: path.to_path_buf(),
            source: err,
        }),
        Some(ext) => Err(ConfigError::UnsupportedExtension {
            ext: ext.to_owned(),
        }),
        None => Err(ConfigError::MissingExtension),
    };
    parsed.map_err(AppError::config)
}
