use anyhow::{Context, Result};
use clap::Parser;
use livedoc_core::config::Config;
use livedoc_core::core_collection::LiveDb;
use livedoc_core::core_doc::Selector;
use livedoc_core::core_observe::DriverKind;
use livedoc_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use livedoc_core::metrics::init_metrics;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

mod script;

#[derive(Parser, Debug)]
#[command(name = "livedoc")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Observe a query while running a mutation script against it
    Run {
        /// JSON-lines mutation script
        #[arg(long)]
        script: PathBuf,

        /// Collection to observe and mutate
        #[arg(long, default_value = "items")]
        collection: String,

        /// Selector to observe, as JSON
        #[arg(long, default_value = "{}")]
        selector: String,

        /// Force a driver (poll, log, pubsub)
        #[arg(long)]
        driver: Option<DriverKind>,

        /// TOML configuration file; environment overrides apply otherwise
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stop after this many milliseconds without events
        #[arg(long, default_value_t = 250)]
        settle_ms: u64,
    },
    /// Validate a configuration file
    CheckConfig {
        path: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::from_file(path).with_context(|| format!("loading {}", path.display()))?;
            config.apply_env()?;
            config.validate()?;
            Ok(config)
        }
        None => Ok(Config::from_env()?),
    }
}

fn init_logging(args: &Args, config: &Config) -> Result<()> {
    let mut log_config = LogConfig::try_from(&config.logging)?;
    if let Some(level) = &args.log_level {
        log_config.level = level.parse::<LogLevel>().unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', using 'info'", level);
            LogLevel::Info
        });
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match &args.command {
        Command::Run {
            script,
            collection,
            selector,
            driver,
            config,
            settle_ms,
        } => {
            let config = load_config(config.as_ref())?;
            init_logging(&args, &config)?;
            if config.metrics.enabled {
                init_metrics();
            }

            let source = std::fs::read_to_string(script).with_context(|| format!("reading {}", script.display()))?;
            let ops = script::parse_script(&source)?;
            let selector: serde_json::Value = serde_json::from_str(selector).context("parsing --selector")?;
            let session = script::Session {
                collection: collection.clone(),
                selector: Selector::new(selector),
                driver: *driver,
                settle: Duration::from_millis(*settle_ms),
            };

            info!(ops = ops.len(), collection = %session.collection, "running script");
            let db = LiveDb::new(config);
            let mut stdout = std::io::stdout().lock();
            let events = script::run(&db, &session, ops, &mut stdout).await?;
            info!(events, "script finished");
        }
        Command::CheckConfig { path } => {
            let config = Config::from_file(path).with_context(|| format!("loading {}", path.display()))?;
            println!(
                "{} is valid (poll every {:?}, pubsub {})",
                path.display(),
                config.observe.poll_interval,
                if config.pubsub.enabled { "on" } else { "off" }
            );
        }
    }

    Ok(())
}
