use crate::{cli::Cli, engine::event_utils};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use polyfmt::println;

#[derive(Debug, Args, Clone)]
pub struct EventSubcommands {
    #[clap(subcommand)]
    pub command: EventCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum EventCommands {
    /// List events; default from oldest event to newest.
    List {
        /// Sort events from newest to oldest.
        #[clap(short, long)]
        reverse: bool,

        #[arg(short, long, default_value = "0")]
        offset: i64,

        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
}

impl Cli {
    pub async fn handle_event_subcommands(&self, command: EventSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            EventCommands::List {
                reverse,
                offset,
                limit,
            } => self.event_list(reverse, offset, limit).await,
        }
    }

    pub async fn event_list(&self, reverse: bool, offset: i64, limit: i64) -> Result<()> {
        let state = self.engine().await?;
        let events = event_utils::list_events(&state.storage, offset, limit, reverse)
            .await
            .context("Could not retrieve events")?;

        for event in events {
            let details = serde_json::to_string(&event.kind).unwrap_or_default();

            println!(
                "{} {} {}",
                self.format_time(event.emitted)
                    .unwrap_or_else(|| "Unknown".to_string())
                    .dimmed(),
                event.kind.to_string().cyan(),
                details
            );
        }

        Ok(())
    }
}
