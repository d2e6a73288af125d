use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::PalisadeConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "palisade.toml",
    "palisade.yaml",
    "palisade.yml",
    "palisade.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<PalisadeConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| Error::read(path, e))?;
    parse_config(&substitute_env(&raw), path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./palisade.{toml,yaml,yml,json}`
/// 2. `~/.config/palisade/palisade.{toml,yaml,yml,json}`
///
/// Falls back to `PalisadeConfig::default()` when nothing is found or the
/// file fails to parse.
pub fn discover_and_load() -> PalisadeConfig {
    let found = find_config_file(Path::new(".")).or_else(|| config_dir().and_then(|d| find_config_file(&d)));
    load_or_default(found)
}

/// Like [`discover_and_load`], but only looks inside `dir`.
pub fn load_from_dir(dir: &Path) -> PalisadeConfig {
    load_or_default(find_config_file(dir))
}

fn load_or_default(path: Option<PathBuf>) -> PalisadeConfig {
    let Some(path) = path else {
        debug!("no config file found, using defaults");
        return PalisadeConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            PalisadeConfig::default()
        },
    }
}

/// First standard config file present in `dir`, if any.
pub fn find_config_file(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/palisade/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "palisade").map(|d| d.config_dir().to_path_buf())
}

/// Serialize `config` as TOML into `dir/palisade.toml`, creating `dir`.
pub fn save_config(config: &PalisadeConfig, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(CONFIG_FILENAMES[0]);
    std::fs::write(&path, toml::to_string_pretty(config)?)?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

fn parse_config(raw: &str, path: &Path) -> Result<PalisadeConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}
