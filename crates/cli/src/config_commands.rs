use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    palisade_config::PalisadeConfig,
};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write a default palisade.toml into the config directory.
    Init {
        /// Replace an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration as JSON.
    Show,
}

pub fn handle_config(action: &ConfigAction, config_dir: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            let dir = target_dir(config_dir)?;
            let path = init(&dir, *force)?;
            eprintln!("Wrote {}", path.display());
            Ok(())
        },
        ConfigAction::Show => {
            let config = match config_dir {
                Some(dir) => palisade_config::load_from_dir(dir),
                None => palisade_config::discover_and_load(),
            };
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        },
    }
}

fn target_dir(config_dir: Option<&Path>) -> Result<PathBuf> {
    match config_dir {
        Some(dir) => Ok(dir.to_path_buf()),
        None => palisade_config::config_dir()
            .context("no user config directory; pass --config-dir"),
    }
}

/// Save a default config into `dir`. Refuses when any config file is
/// already present unless `force` is set.
fn init(dir: &Path, force: bool) -> Result<PathBuf> {
    if let Some(existing) = palisade_config::find_config_file(dir)
        && !force
    {
        anyhow::bail!(
            "{} already exists; pass --force to replace it",
            existing.display()
        );
    }
    Ok(palisade_config::save_config(&PalisadeConfig::default(), dir)?)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_writes_loadable_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("palisade");
        let path = init(&target, false).unwrap();
        assert_eq!(path, target.join("palisade.toml"));

        let loaded = palisade_config::load_config(&path).unwrap();
        assert_eq!(loaded.extensions.fetch_timeout_secs, 30);
        assert!(loaded.handlers.builtin);
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("palisade.yaml"), "handlers:\n  builtin: false\n").unwrap();

        let err = init(dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("--force"));

        init(dir.path(), true).unwrap();
        assert!(dir.path().join("palisade.toml").is_file());
    }
}
