use crate::{
    cli::{read_json_file, Cli},
    engine::{
        resource_requests,
        resources::{self, NewResource, RequestAction},
    },
};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};
use polyfmt::{print, println, success};

#[derive(Debug, Args, Clone)]
pub struct ResourceSubcommands {
    #[clap(subcommand)]
    pub command: ResourceCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ResourceCommands {
    /// Create a resource from a JSON file.
    ///
    /// The file names the resource type, template and properties along with any parent references. The
    /// resource is created from the current version of its template but nothing is deployed yet.
    Create {
        /// Path to a resource file.
        path: String,
    },

    /// Fetch information about an individual resource.
    Get {
        /// Resource Identifier.
        id: String,
    },

    /// Ask for an action to be carried out against a resource.
    ///
    /// install, upgrade and uninstall are always available; anything else must be a custom action declared by
    /// the resource's template.
    Request {
        /// Resource Identifier.
        id: String,

        /// The action to perform.
        action: String,

        /// Include every resource below this one, deepest first.
        #[arg(short, long)]
        cascade: bool,
    },
}

impl Cli {
    pub async fn handle_resource_subcommands(&self, command: ResourceSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            ResourceCommands::Create { path } => self.resource_create(&path).await,
            ResourceCommands::Get { id } => self.resource_get(&id).await,
            ResourceCommands::Request {
                id,
                action,
                cascade,
            } => self.resource_request(&id, &action, cascade).await,
        }
    }
}

impl Cli {
    pub async fn resource_create(&self, path: &str) -> Result<()> {
        let new_resource: NewResource = read_json_file(path)?;

        let state = self.engine().await?;
        let resource = resources::create_resource(&state, new_resource, &self.user())
            .await
            .context("Could not create resource")?;

        success!(
            "Created {} '{}' at {}",
            resource.resource_type,
            resource.id,
            resource.resource_path
        );
        Ok(())
    }

    pub async fn resource_get(&self, id: &str) -> Result<()> {
        let state = self.engine().await?;
        let resource = resources::get_resource(&state, id)
            .await
            .context("Could not retrieve resource")?;

        const TEMPLATE: &str = r#"[{{id}}] {{template_name}} {{template_version}} :: {{deployment_status}}
{{resource_path}}
{% if not is_active %}
This resource has been deleted.
{% endif -%}
{% if not is_enabled %}
This resource is disabled.
{% endif %}"#;

        let mut tera = tera::Tera::default();
        tera.add_raw_template("main", TEMPLATE)
            .context("Failed to render context")?;

        let mut context = tera::Context::new();
        context.insert("id", &resource.id);
        context.insert("template_name", &resource.template_name);
        context.insert("template_version", &resource.template_version);
        context.insert("deployment_status", &resource.deployment_status.to_string());
        context.insert("resource_path", &resource.resource_path);
        context.insert("is_active", &resource.is_active);
        context.insert("is_enabled", &resource.is_enabled);

        let content = tera.render("main", &context)?;
        print!("{}", content);

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("property")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("value")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for (name, value) in &resource.properties {
            table.add_row(vec![Cell::new(name).fg(Color::Green), Cell::new(value)]);
        }

        println!("{}", &table.to_string());
        println!(
            "Version {} | Updated {} by {}",
            resource.resource_version,
            self.format_time(resource.updated_when)
                .unwrap_or_else(|| "Unknown".to_string()),
            resource.user.name
        );
        Ok(())
    }

    pub async fn resource_request(&self, id: &str, action: &str, cascade: bool) -> Result<()> {
        let state = self.engine().await?;
        let resource = resources::get_resource(&state, id)
            .await
            .context("Could not retrieve resource")?;

        let action = RequestAction::from(action.to_string());

        let operation = resource_requests::send_resource_request(
            &state,
            &resource,
            action.clone(),
            &self.user(),
            cascade,
        )
        .await
        .with_context(|| format!("Could not request '{action}' for resource '{id}'"))?;

        success!(
            "Started operation '{}' with {} step(s) for {} '{}'",
            operation.id,
            operation.steps.len(),
            action,
            id
        );
        Ok(())
    }
}
