use crate::{
    cli::{read_json_file, Cli},
    engine::{
        resource_templates::{self, ResourceTemplate},
        resources::ResourceType,
    },
};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};
use polyfmt::{print, println, success};

#[derive(Debug, Args, Clone)]
pub struct TemplateSubcommands {
    #[clap(subcommand)]
    pub command: TemplateCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum TemplateCommands {
    /// Register a new template version from a JSON file.
    ///
    /// If the template is marked current it replaces whichever version was current before.
    Register {
        /// Path to a template file.
        path: String,
    },

    /// Fetch the current version of a template.
    Get {
        /// Template name.
        name: String,

        /// One of workspace, workspace-service, user-resource or shared-service.
        resource_type: ResourceType,

        /// Name of the workspace service template; required for user resource templates.
        #[arg(short, long)]
        parent_service: Option<String>,
    },

    /// List every registered version of a template.
    Versions {
        /// Template name.
        name: String,

        /// One of workspace, workspace-service, user-resource or shared-service.
        resource_type: ResourceType,
    },
}

impl Cli {
    pub async fn handle_template_subcommands(&self, command: TemplateSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            TemplateCommands::Register { path } => self.template_register(&path).await,
            TemplateCommands::Get {
                name,
                resource_type,
                parent_service,
            } => {
                self.template_get(&name, resource_type, parent_service.as_deref())
                    .await
            }
            TemplateCommands::Versions {
                name,
                resource_type,
            } => self.template_versions(&name, resource_type).await,
        }
    }
}

impl Cli {
    pub async fn template_register(&self, path: &str) -> Result<()> {
        let template: ResourceTemplate = read_json_file(path)?;

        let state = self.engine().await?;
        let template = resource_templates::register_template(&state, template)
            .await
            .context("Could not register template")?;

        success!(
            "Registered {} template '{}' version '{}'",
            template.resource_type,
            template.name,
            template.version
        );
        Ok(())
    }

    pub async fn template_get(
        &self,
        name: &str,
        resource_type: ResourceType,
        parent_service: Option<&str>,
    ) -> Result<()> {
        let state = self.engine().await?;
        let template =
            resource_templates::get_current_template(&state, name, resource_type, parent_service)
                .await
                .context("Could not retrieve template")?;

        const TEMPLATE: &str = r#"[{{name}} {{version}}] {{title}} :: {{resource_type}}
{{description}}
{% if properties %}
Properties:
{%- for property in properties %}
  • {{property}}
{%- endfor %}
{% endif -%}
{% if pipelines %}
Pipelines:
{%- for pipeline in pipelines %}
  • {{pipeline}}
{%- endfor %}
{% endif -%}
{% if custom_actions %}
Custom actions: {{custom_actions | join(sep=", ")}}
{% endif %}"#;

        let properties: Vec<String> = template
            .properties
            .iter()
            .map(|(name, property)| {
                let required = if template.required.contains(name) {
                    " (required)"
                } else {
                    ""
                };
                let updateable = if property.updateable {
                    " [updateable]"
                } else {
                    ""
                };

                format!(
                    "{name}: {}{required}{updateable}",
                    property.property_type.as_deref().unwrap_or("any")
                )
            })
            .collect();

        let pipelines: Vec<String> = template
            .pipeline
            .iter()
            .map(|(action, steps)| {
                let steps: Vec<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
                format!("{action}: {}", steps.join(" -> "))
            })
            .collect();

        let custom_actions: Vec<&str> = template
            .custom_actions
            .iter()
            .map(|a| a.name.as_str())
            .collect();

        let mut tera = tera::Tera::default();
        tera.add_raw_template("main", TEMPLATE)
            .context("Failed to render context")?;

        let mut context = tera::Context::new();
        context.insert("name", &template.name);
        context.insert("version", &template.version);
        context.insert("title", &template.title);
        context.insert("resource_type", &template.resource_type.to_string());
        context.insert("description", &template.description);
        context.insert("properties", &properties);
        context.insert("pipelines", &pipelines);
        context.insert("custom_actions", &custom_actions);

        let content = tera.render("main", &context)?;
        print!("{}", content);
        Ok(())
    }

    pub async fn template_versions(&self, name: &str, resource_type: ResourceType) -> Result<()> {
        let state = self.engine().await?;
        let templates = resource_templates::list_template_versions(&state, name, resource_type)
            .await
            .context("Could not retrieve template versions")?;

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("version")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("current")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("parent service")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("title")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for template in templates {
            let current = if template.current {
                Cell::new("yes").fg(Color::Green)
            } else {
                Cell::new("no")
            };

            table.add_row(vec![
                Cell::new(template.version).fg(Color::Green),
                current,
                Cell::new(template.parent_service_name.unwrap_or_default()),
                Cell::new(template.title),
            ]);
        }

        println!("{}", &table.to_string());
        Ok(())
    }
}
