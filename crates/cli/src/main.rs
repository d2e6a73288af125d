mod config_commands;
mod manifest_commands;
mod run_command;

use {
    clap::{Parser, Subcommand},
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "palisade", about = "Sandboxed extension host", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom config directory (overrides discovery of palisade.toml).
    #[arg(long, global = true, env = "PALISADE_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a manifest and run every validation without loading it.
    Check {
        /// Manifest URL.
        url: String,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print the canonical integrity digest of a local manifest file.
    Hash {
        /// Path to a JSON manifest.
        file: std::path::PathBuf,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: config_commands::ConfigAction,
    },
    /// Load every configured extension and serve until Ctrl-C.
    Run {
        /// Request sent to each extension right after it loads.
        #[arg(long)]
        probe: Option<String>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> palisade_config::PalisadeConfig {
    match &cli.config_dir {
        Some(dir) => palisade_config::load_from_dir(dir),
        None => palisade_config::discover_and_load(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    debug!(version = env!("CARGO_PKG_VERSION"), "palisade starting");

    match &cli.command {
        Commands::Config { action } => {
            config_commands::handle_config(action, cli.config_dir.as_deref())
        },
        Commands::Check { url, json } => {
            let config = load_config(&cli);
            manifest_commands::check(url, config.extensions.fetch_timeout_secs, *json).await
        },
        Commands::Hash { file } => manifest_commands::hash(file),
        Commands::Run { probe } => {
            let config = load_config(&cli);
            info!(
                manifests = config.extensions.manifests.len(),
                builtin_handlers = config.handlers.builtin,
                "starting extension host"
            );
            run_command::run(config, probe.clone()).await
        },
    }
}
