use crate::{
    cli::{read_json_file, Cli},
    engine::{
        deployment_status::{self, DeploymentStatusUpdateMessage},
        operations::{self, Operation},
        resources::Status,
    },
};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};
use polyfmt::{print, println, success};

#[derive(Debug, Args, Clone)]
pub struct OperationSubcommands {
    #[clap(subcommand)]
    pub command: OperationCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum OperationCommands {
    /// Fetch an operation and the state of each of its steps.
    Get {
        /// Operation Identifier.
        id: String,
    },

    /// List operations for a resource, newest first.
    List {
        /// Resource Identifier.
        resource_id: String,

        #[arg(short, long, default_value = "0")]
        offset: i64,

        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Apply a deployment status update from a JSON file.
    ///
    /// The update is handled exactly as if it had arrived from the runner. Useful for moving a stalled pipeline
    /// along by hand.
    Report {
        /// Path to a deployment status update file.
        path: String,
    },
}

impl Cli {
    pub async fn handle_operation_subcommands(&self, command: OperationSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            OperationCommands::Get { id } => self.operation_get(&id).await,
            OperationCommands::List {
                resource_id,
                offset,
                limit,
            } => self.operation_list(&resource_id, offset, limit).await,
            OperationCommands::Report { path } => self.operation_report(&path).await,
        }
    }
}

fn colorize_status(status: Status) -> Cell {
    let cell = Cell::new(status.to_string());

    if status.is_success() || status == Status::PipelineSucceeded {
        cell.fg(Color::Green)
    } else if status.is_failure() {
        cell.fg(Color::Red)
    } else {
        cell.fg(Color::Yellow)
    }
}

impl Cli {
    fn print_operation(&self, operation: &Operation) -> Result<()> {
        const TEMPLATE: &str = r#"[{{id}}] {{action}} {{resource_path}} :: {{status}}
{{message}}
"#;

        let mut tera = tera::Tera::default();
        tera.add_raw_template("main", TEMPLATE)
            .context("Failed to render context")?;

        let mut context = tera::Context::new();
        context.insert("id", &operation.id);
        context.insert("action", &operation.action.to_string());
        context.insert("resource_path", &operation.resource_path);
        context.insert("status", &operation.status.to_string());
        context.insert("message", &operation.message);

        let content = tera.render("main", &context)?;
        print!("{}", content);

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("step")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("resource")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("action")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("status")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("message")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("updated")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for step in &operation.steps {
            table.add_row(vec![
                Cell::new(&step.template_step_id).fg(Color::Green),
                Cell::new(format!("{} ({})", step.resource_id, step.resource_type)),
                Cell::new(step.resource_action.to_string()),
                colorize_status(step.status),
                Cell::new(&step.message),
                Cell::new(
                    self.format_time(step.updated_when)
                        .unwrap_or_else(|| "Unknown".to_string()),
                ),
            ]);
        }

        println!("{}", &table.to_string());
        println!(
            "Started {} by {}",
            self.format_time(operation.created_when)
                .unwrap_or_else(|| "Unknown".to_string()),
            operation.user.name
        );
        Ok(())
    }

    pub async fn operation_get(&self, id: &str) -> Result<()> {
        let state = self.engine().await?;
        let operation = operations::get_operation(&state, id)
            .await
            .context("Could not retrieve operation")?;

        self.print_operation(&operation)
    }

    pub async fn operation_list(&self, resource_id: &str, offset: i64, limit: i64) -> Result<()> {
        let state = self.engine().await?;
        let operations = operations::list_operations(&state, resource_id, offset, limit)
            .await
            .context("Could not retrieve operations")?;

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("id")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("action")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("status")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("steps")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("started")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("user")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for operation in operations {
            let finished = operation
                .steps
                .iter()
                .filter(|step| step.is_success())
                .count();

            table.add_row(vec![
                Cell::new(&operation.id).fg(Color::Green),
                Cell::new(operation.action.to_string()),
                colorize_status(operation.status),
                Cell::new(format!("{finished}/{}", operation.steps.len())),
                Cell::new(
                    self.format_time(operation.created_when)
                        .unwrap_or_else(|| "Unknown".to_string()),
                ),
                Cell::new(&operation.user.name),
            ]);
        }

        println!("{}", &table.to_string());
        Ok(())
    }

    pub async fn operation_report(&self, path: &str) -> Result<()> {
        let message: DeploymentStatusUpdateMessage = read_json_file(path)?;

        let state = self.engine().await?;
        deployment_status::handle_message(&state, &message)
            .await
            .context("Could not apply deployment status update")?;

        let operation = operations::get_operation(&state, &message.operation_id)
            .await
            .context("Could not retrieve operation")?;

        success!("Applied '{}' to operation '{}'", message.status, operation.id);
        self.print_operation(&operation)
    }
}
