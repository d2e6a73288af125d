//! Configuration loading and env substitution.
//!
//! Config files: `palisade.toml`, `palisade.yaml` or `palisade.json`,
//! searched in `./` then `~/.config/palisade/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::{Error, Result},
    loader::{
        config_dir, discover_and_load, find_config_file, load_config, load_from_dir, save_config,
    },
    schema::{ApprovalConfig, ExtensionsConfig, HandlersConfig, PalisadeConfig, SandboxConfig},
};
