mod event;
mod operation;
mod resource;
mod service;
mod template;

use crate::{
    conf,
    engine::{epoch_milli, resources::User, EngineState},
};
use anyhow::{Context, Result};
use chrono_humanize::HumanTime;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::{sync::Arc, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT_LOGGING: Once = Once::new();

#[derive(Debug, Parser, Clone)]
#[clap(name = "steward")]
#[clap(about = "Steward drives multi-step deployment pipelines for workspace resources.")]
#[clap(
    long_about = "Steward drives multi-step deployment pipelines for workspace resources.\n\n Resources are created \
    from versioned templates. Asking for an action on a resource produces an operation whose steps are handed to an \
    external runner one at a time; the runner reports back and steward moves the pipeline along."
)]
#[clap(version)]
pub struct Args {
    /// Set configuration path; if empty default paths are used
    #[clap(long, value_name = "PATH")]
    pub config: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    /// Manages service related commands pertaining to administration.
    Service(service::ServiceSubcommands),

    /// Register and inspect resource templates.
    Template(template::TemplateSubcommands),

    /// Create resources and request actions against them.
    Resource(resource::ResourceSubcommands),

    /// Inspect operations and feed them status updates.
    Operation(operation::OperationSubcommands),

    /// List steward events.
    Event(event::EventSubcommands),
}

#[derive(Debug, Clone)]
pub struct Cli {
    args: Args,
    config: conf::Config,
}

impl Cli {
    pub fn new() -> Result<Self> {
        let args = Args::parse();

        let config = conf::Config::load(args.config.as_deref())
            .context("Could not load steward configuration")?;

        Ok(Self { args, config })
    }

    pub async fn run(&self) -> Result<()> {
        match self.args.command.clone() {
            Commands::Service(service) => self.handle_service_subcommands(service).await,
            Commands::Template(template) => self.handle_template_subcommands(template).await,
            Commands::Resource(resource) => self.handle_resource_subcommands(resource).await,
            Commands::Operation(operation) => self.handle_operation_subcommands(operation).await,
            Commands::Event(event) => self.handle_event_subcommands(event).await,
        }
    }

    /// Opens the engine against the configured database and queue.
    async fn engine(&self) -> Result<Arc<EngineState>> {
        let state = EngineState::new(self.config.clone())
            .await
            .context("Could not initialize steward engine")?;

        Ok(Arc::new(state))
    }

    /// Who actions taken from the command line are attributed to.
    fn user(&self) -> User {
        let name = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());

        User {
            id: format!("cli:{name}"),
            name,
            email: String::new(),
        }
    }

    /// Transforms the given time into a humanized duration string from the current time.
    /// (i.e. 'about an hour ago')
    fn format_time(&self, epoch_milli_time: u64) -> Option<String> {
        if epoch_milli_time == 0 {
            return None;
        }

        let diff = epoch_milli().saturating_sub(epoch_milli_time);
        let duration = chrono::Duration::milliseconds(-(diff as i64));
        Some(HumanTime::from(duration).to_string())
    }
}

/// Reads and parses a JSON document from disk.
fn read_json_file<T: DeserializeOwned>(path: &str) -> Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Could not read file '{path}'"))?;

    serde_json::from_str(&contents).with_context(|| format!("Could not parse file '{path}'"))
}

/// Sets up the global tracing subscriber from the general config section. The log level from configuration is
/// used unless RUST_LOG is set. Calling this more than once has no effect.
pub fn init_logging(config: &conf::General) {
    INIT_LOGGING.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

        match config.log_format {
            conf::LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            conf::LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}
