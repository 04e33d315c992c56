use crate::{
    cli::{init_logging, Cli},
    engine,
};
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Debug, Args, Clone)]
pub struct ServiceSubcommands {
    #[clap(subcommand)]
    pub command: ServiceCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ServiceCommands {
    /// Start the deployment status consumer.
    ///
    /// Reads status reports from the deployment status queue and drives each operation's pipeline forward. With
    /// the default sqlite queue engine, requests sent by other steward commands against the same database are
    /// seen here. Blocks and only stops gracefully on SIGINT.
    Start,
}

impl Cli {
    pub async fn handle_service_subcommands(&self, command: ServiceSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            ServiceCommands::Start => self.service_start().await,
        }
    }

    pub async fn service_start(&self) -> Result<()> {
        init_logging(&self.config.general);

        let state = self.engine().await?;
        engine::start_consumer(state).await
    }
}
