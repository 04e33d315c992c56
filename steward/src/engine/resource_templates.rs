use crate::{
    engine::{
        resources::{RequestAction, ResourceType},
        EngineState, PipelineError,
    },
    storage,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, HashSet},
    str::FromStr,
};
use tracing::info;
use uuid::Uuid;

/// The step id reserved for the resource a pipeline is declared on.
pub const MAIN_STEP_ID: &str = "main";

/// How a substituted value is merged into an existing array property on the target resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArraySubstitutionAction {
    /// Replace the whole array with a single element array holding the new value.
    Overwrite,
    Append,
    /// Replace the element matching on `arrayMatchField`, or append if none matches.
    Replace,
    /// Delete the element matching on `arrayMatchField`, if any.
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStepProperty {
    pub name: String,

    #[serde(rename = "type")]
    pub property_type: String,

    /// Either a literal or a structure whose strings may contain substitution tokens.
    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_substitution_action: Option<ArraySubstitutionAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_match_field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub step_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_template_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_action: Option<RequestAction>,

    #[serde(default)]
    pub properties: Vec<PipelineStepProperty>,
}

/// Schema of a single template property.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Whether the property may be changed once the resource is installed.
    #[serde(default)]
    pub updateable: bool,

    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomAction {
    pub name: String,

    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub version: String,
    pub resource_type: ResourceType,

    /// Only set for user resource templates; names the workspace service template they belong to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_service_name: Option<String>,

    #[serde(default)]
    pub current: bool,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub required: Vec<String>,

    #[serde(default)]
    pub properties: BTreeMap<String, Property>,

    #[serde(default)]
    pub additional_properties: bool,

    /// Maps an action name to the ordered steps that carry it out.
    #[serde(default)]
    pub pipeline: BTreeMap<String, Vec<PipelineStep>>,

    #[serde(default)]
    pub custom_actions: Vec<CustomAction>,
}

impl TryFrom<storage::resource_templates::ResourceTemplate> for ResourceTemplate {
    type Error = anyhow::Error;

    fn try_from(value: storage::resource_templates::ResourceTemplate) -> Result<Self> {
        let resource_type = ResourceType::from_str(&value.resource_type).with_context(|| {
            format!(
                "Could not parse field 'resource_type' from storage value '{}'",
                value.resource_type
            )
        })?;

        let required: Vec<String> = serde_json::from_str(&value.required).with_context(|| {
            format!(
                "Could not parse field 'required' from storage value '{}'",
                value.required
            )
        })?;

        let properties: BTreeMap<String, Property> = serde_json::from_str(&value.properties)
            .with_context(|| {
                format!(
                    "Could not parse field 'properties' from storage value '{}'",
                    value.properties
                )
            })?;

        let pipeline: BTreeMap<String, Vec<PipelineStep>> = serde_json::from_str(&value.pipeline)
            .with_context(|| {
                format!(
                    "Could not parse field 'pipeline' from storage value '{}'",
                    value.pipeline
                )
            })?;

        let custom_actions: Vec<CustomAction> = serde_json::from_str(&value.custom_actions)
            .with_context(|| {
                format!(
                    "Could not parse field 'custom_actions' from storage value '{}'",
                    value.custom_actions
                )
            })?;

        let parent_service_name = if value.parent_service_name.is_empty() {
            None
        } else {
            Some(value.parent_service_name)
        };

        Ok(ResourceTemplate {
            id: value.id,
            name: value.name,
            version: value.version,
            resource_type,
            parent_service_name,
            current: value.current,
            title: value.title,
            description: value.description,
            required,
            properties,
            additional_properties: value.additional_properties,
            pipeline,
            custom_actions,
        })
    }
}

impl TryFrom<ResourceTemplate> for storage::resource_templates::ResourceTemplate {
    type Error = anyhow::Error;

    fn try_from(value: ResourceTemplate) -> Result<Self> {
        let required = serde_json::to_string(&value.required).with_context(|| {
            format!(
                "Could not parse field 'required' to storage value '{:#?}'",
                value.required
            )
        })?;

        let properties = serde_json::to_string(&value.properties).with_context(|| {
            format!(
                "Could not parse field 'properties' to storage value '{:#?}'",
                value.properties
            )
        })?;

        let pipeline = serde_json::to_string(&value.pipeline).with_context(|| {
            format!(
                "Could not parse field 'pipeline' to storage value '{:#?}'",
                value.pipeline
            )
        })?;

        let custom_actions = serde_json::to_string(&value.custom_actions).with_context(|| {
            format!(
                "Could not parse field 'custom_actions' to storage value '{:#?}'",
                value.custom_actions
            )
        })?;

        Ok(Self {
            id: value.id,
            name: value.name,
            version: value.version,
            resource_type: value.resource_type.to_string(),
            parent_service_name: value.parent_service_name.unwrap_or_default(),
            current: value.current,
            title: value.title,
            description: value.description,
            required,
            properties,
            additional_properties: value.additional_properties,
            pipeline,
            custom_actions,
        })
    }
}

fn json_type_matches(declared: &str, value: &Value) -> bool {
    match declared {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Types we do not know how to check are let through.
        _ => true,
    }
}

impl ResourceTemplate {
    /// Returns the steps declared for an action, if any.
    pub fn pipeline_for(&self, action: &RequestAction) -> Option<&[PipelineStep]> {
        self.pipeline
            .get(&action.to_string())
            .map(|steps| steps.as_slice())
            .filter(|steps| !steps.is_empty())
    }

    /// Property values a new resource starts out with.
    pub fn default_properties(&self) -> Map<String, Value> {
        self.properties
            .iter()
            .filter_map(|(name, property)| {
                property
                    .default
                    .as_ref()
                    .map(|default| (name.clone(), default.clone()))
            })
            .collect()
    }

    /// Checks a set of property values against the template schema. Outside of install only properties marked
    /// updateable may be set.
    pub fn validate_properties(
        &self,
        properties: &Map<String, Value>,
        action: &RequestAction,
    ) -> Result<(), PipelineError> {
        for (name, value) in properties {
            let Some(property) = self.properties.get(name) else {
                if self.additional_properties {
                    continue;
                }

                return Err(PipelineError::Validation(format!(
                    "property '{name}' is not declared by template '{}' version '{}'",
                    self.name, self.version
                )));
            };

            if *action != RequestAction::Install && !property.updateable {
                return Err(PipelineError::Validation(format!(
                    "property '{name}' of template '{}' is not updateable",
                    self.name
                )));
            }

            if let Some(declared) = &property.property_type {
                if !json_type_matches(declared, value) {
                    return Err(PipelineError::Validation(format!(
                        "property '{name}' must be of type '{declared}'"
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn check_required(&self, properties: &Map<String, Value>) -> Result<(), PipelineError> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|name| !properties.contains_key(name.as_str()))
            .map(|name| name.as_str())
            .collect();

        if !missing.is_empty() {
            return Err(PipelineError::Validation(format!(
                "missing required properties: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }

    /// Rejects pipelines that could never be turned into an operation.
    pub fn validate_pipeline(&self) -> Result<(), PipelineError> {
        for (action, steps) in &self.pipeline {
            let mut seen = HashSet::new();

            for step in steps {
                if !seen.insert(step.step_id.as_str()) {
                    return Err(PipelineError::Configuration(format!(
                        "duplicate step id '{}' in pipeline for action '{action}'",
                        step.step_id
                    )));
                }

                if step.step_id == MAIN_STEP_ID {
                    continue;
                }

                let (Some(resource_type), Some(_), Some(_)) = (
                    step.resource_type,
                    &step.resource_template_name,
                    &step.resource_action,
                ) else {
                    return Err(PipelineError::Configuration(format!(
                        "step '{}' in pipeline for action '{action}' must declare resourceType, \
                        resourceTemplateName and resourceAction",
                        step.step_id
                    )));
                };

                if resource_type == ResourceType::UserResource {
                    return Err(PipelineError::Configuration(format!(
                        "step '{}' in pipeline for action '{action}' targets a user resource, which is not supported",
                        step.step_id
                    )));
                }

                for property in &step.properties {
                    let needs_match_field = matches!(
                        property.array_substitution_action,
                        Some(ArraySubstitutionAction::Replace | ArraySubstitutionAction::Remove)
                    );

                    if needs_match_field && property.array_match_field.is_none() {
                        return Err(PipelineError::Configuration(format!(
                            "property '{}' of step '{}' needs an arrayMatchField",
                            property.name, step.step_id
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn internal(e: anyhow::Error) -> PipelineError {
    PipelineError::Internal(format!("{e:#}"))
}

/// Validates and stores a new template version. If it is marked current it replaces the previously current
/// version.
pub async fn register_template(
    state: &EngineState,
    mut template: ResourceTemplate,
) -> Result<ResourceTemplate, PipelineError> {
    match (template.resource_type, &template.parent_service_name) {
        (ResourceType::UserResource, None) => {
            return Err(PipelineError::Validation(
                "user resource templates must declare a parentServiceName".into(),
            ))
        }
        (ResourceType::UserResource, Some(_)) | (_, None) => {}
        (_, Some(_)) => {
            return Err(PipelineError::Validation(
                "only user resource templates may declare a parentServiceName".into(),
            ))
        }
    }

    template.validate_pipeline()?;

    template.id = Uuid::now_v7().to_string();

    let storage_template =
        storage::resource_templates::ResourceTemplate::try_from(template.clone()).map_err(internal)?;

    let mut conn = state.storage.write_conn().await?;

    storage::resource_templates::insert(&mut conn, &storage_template)
        .await
        .map_err(|e| match e {
            storage::StorageError::Exists => PipelineError::Validation(format!(
                "template '{}' version '{}' already exists",
                template.name, template.version
            )),
            _ => e.into(),
        })?;

    info!(
        name = template.name,
        version = template.version,
        resource_type = %template.resource_type,
        current = template.current,
        "registered resource template"
    );

    Ok(template)
}

fn not_found_as_configuration<'a>(
    name: &'a str,
    version: Option<&str>,
    resource_type: ResourceType,
) -> impl FnOnce(storage::StorageError) -> PipelineError + 'a {
    let version = version.map(String::from);

    move |e| match e {
        storage::StorageError::NotFound => PipelineError::Configuration(match version {
            Some(version) => {
                format!("no {resource_type} template named '{name}' with version '{version}'")
            }
            None => format!("no current {resource_type} template named '{name}'"),
        }),
        _ => e.into(),
    }
}

pub async fn get_current_template(
    state: &EngineState,
    name: &str,
    resource_type: ResourceType,
    parent_service_name: Option<&str>,
) -> Result<ResourceTemplate, PipelineError> {
    let mut conn = state.storage.read_conn().await?;

    let storage_template = storage::resource_templates::get_current(
        &mut conn,
        name,
        &resource_type.to_string(),
        parent_service_name.unwrap_or_default(),
    )
    .await
    .map_err(not_found_as_configuration(name, None, resource_type))?;

    ResourceTemplate::try_from(storage_template).map_err(internal)
}

pub async fn get_template_by_name_and_version(
    state: &EngineState,
    name: &str,
    version: &str,
    resource_type: ResourceType,
    parent_service_name: Option<&str>,
) -> Result<ResourceTemplate, PipelineError> {
    let mut conn = state.storage.read_conn().await?;

    let storage_template = storage::resource_templates::get_by_name_and_version(
        &mut conn,
        name,
        version,
        &resource_type.to_string(),
        parent_service_name.unwrap_or_default(),
    )
    .await
    .map_err(not_found_as_configuration(name, Some(version), resource_type))?;

    ResourceTemplate::try_from(storage_template).map_err(internal)
}

/// Every registered version of a template, newest registration first.
pub async fn list_template_versions(
    state: &EngineState,
    name: &str,
    resource_type: ResourceType,
) -> Result<Vec<ResourceTemplate>, PipelineError> {
    let mut conn = state.storage.read_conn().await?;

    let templates =
        storage::resource_templates::list_versions(&mut conn, name, &resource_type.to_string())
            .await?;

    templates
        .into_iter()
        .map(|t| ResourceTemplate::try_from(t).map_err(internal))
        .collect()
}
