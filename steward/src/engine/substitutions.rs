//! Resolves the property bag of a pipeline step.
//!
//! Step property values may contain tokens of the form `{{ resource.properties.name }}`. Each `.parent` directly
//! after `resource` moves one level up the hierarchy of the primary resource (the resource whose template
//! declared the step), so `{{ resource.parent.parent.properties.name }}` reads from the workspace of a user
//! resource.

use crate::engine::{
    resource_templates::{ArraySubstitutionAction, PipelineStep, PipelineStepProperty},
    resources::{Ancestry, Resource},
    PipelineError,
};
use lazy_regex::regex;
use serde_json::{Map, Value};

const ROOT_SEGMENT: &str = "resource";
const PARENT_SEGMENT: &str = "parent";

/// The resources a token may be resolved against, already rendered as the JSON documents tokens navigate.
#[derive(Debug)]
struct Context<'a> {
    primary: &'a Resource,
    levels: [Option<Value>; 3],
}

impl<'a> Context<'a> {
    fn new(primary: &'a Resource, ancestry: &Ancestry) -> Result<Self, PipelineError> {
        let render = |resource: &Resource| {
            serde_json::to_value(resource).map_err(|e| {
                PipelineError::Internal(format!(
                    "could not render resource '{}' for substitution; {e}",
                    resource.id
                ))
            })
        };

        Ok(Self {
            primary,
            levels: [
                Some(render(primary)?),
                ancestry.parent.as_ref().map(render).transpose()?,
                ancestry.grandparent.as_ref().map(render).transpose()?,
            ],
        })
    }

    /// Resolves a single token (without braces) to the value it points at. Missing keys resolve to an empty
    /// string.
    fn resolve(&self, token: &str) -> Result<Value, PipelineError> {
        let mut segments = token.split('.');

        if segments.next() != Some(ROOT_SEGMENT) {
            return Err(PipelineError::Configuration(format!(
                "substitution token '{token}' must start with '{ROOT_SEGMENT}'"
            )));
        }

        let segments: Vec<&str> = segments.collect();
        let hops = segments
            .iter()
            .take_while(|segment| **segment == PARENT_SEGMENT)
            .count();

        let max_hops = self.primary.resource_type.max_parent_hops();
        if hops > max_hops {
            return Err(PipelineError::Configuration(format!(
                "substitution token '{token}' makes {hops} parent hop(s) but a {} allows at most {max_hops}",
                self.primary.resource_type
            )));
        }

        let Some(Some(document)) = self.levels.get(hops) else {
            return Err(PipelineError::Configuration(format!(
                "substitution token '{token}' refers to an ancestor of '{}' that could not be found",
                self.primary.id
            )));
        };

        let mut current = document;
        for segment in &segments[hops..] {
            match current.get(segment) {
                Some(next) => current = next,
                None => return Ok(Value::String(String::new())),
            }
        }

        Ok(current.clone())
    }

    /// Substitutes every token in a string. A token that resolves to an object or array replaces the whole
    /// value; scalars are interpolated in place.
    fn substitute_str(&self, value: &str) -> Result<Value, PipelineError> {
        if !value.contains("{{") {
            return Ok(Value::String(value.to_string()));
        }

        let token_regex = regex!(r"\{\{\s*([^{}]*?)\s*\}\}");

        let tokens: Vec<&str> = token_regex
            .captures_iter(value)
            .filter_map(|captures| captures.get(1).map(|m| m.as_str()))
            .collect();

        let mut resolved = Vec::with_capacity(tokens.len());
        for token in &tokens {
            resolved.push(self.resolve(token)?);
        }

        if let Some(structure) = resolved
            .iter()
            .find(|value| value.is_object() || value.is_array())
        {
            return Ok(structure.clone());
        }

        let mut result = String::with_capacity(value.len());
        let mut last = 0;

        for (token_match, replacement) in token_regex.find_iter(value).zip(resolved) {
            result.push_str(&value[last..token_match.start()]);

            match replacement {
                Value::String(s) => result.push_str(&s),
                Value::Null => {}
                other => result.push_str(&other.to_string()),
            }

            last = token_match.end();
        }

        result.push_str(&value[last..]);

        Ok(Value::String(result))
    }

    /// Walks nested objects and arrays substituting every string found.
    fn substitute(&self, value: &Value) -> Result<Value, PipelineError> {
        match value {
            Value::String(s) => self.substitute_str(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.substitute(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => fields
                .iter()
                .map(|(key, item)| Ok((key.clone(), self.substitute(item)?)))
                .collect::<Result<Map<_, _>, PipelineError>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }
}

fn find_match(existing: &[Value], match_field: &str, value: &Value) -> Option<usize> {
    let wanted = value.get(match_field)?;
    existing
        .iter()
        .position(|item| item.get(match_field) == Some(wanted))
}

/// Merges a substituted value into the current array value of a property according to the property's policy.
fn merge_array(
    property: &PipelineStepProperty,
    action: ArraySubstitutionAction,
    current: Option<&Value>,
    value: Value,
) -> Result<Value, PipelineError> {
    let mut existing = match current {
        Some(Value::Array(items)) => items.clone(),
        _ => vec![],
    };

    let match_field = || {
        property.array_match_field.as_deref().ok_or_else(|| {
            PipelineError::Configuration(format!(
                "property '{}' uses '{action:?}' but declares no arrayMatchField",
                property.name
            ))
        })
    };

    match action {
        ArraySubstitutionAction::Overwrite => existing = vec![value],
        ArraySubstitutionAction::Append => existing.push(value),
        ArraySubstitutionAction::Replace => match find_match(&existing, match_field()?, &value) {
            Some(index) => existing[index] = value,
            None => existing.push(value),
        },
        ArraySubstitutionAction::Remove => {
            if let Some(index) = find_match(&existing, match_field()?, &value) {
                existing.remove(index);
            }
        }
    }

    Ok(Value::Array(existing))
}

/// Computes the properties to patch onto `resource_to_update` for a pipeline step.
///
/// Tokens are resolved against `primary` and its ancestry. The hop limit is that of the primary resource's type,
/// regardless of what kind of resource is being updated.
pub fn substitute_properties(
    step: &PipelineStep,
    primary: &Resource,
    ancestry: &Ancestry,
    resource_to_update: &Resource,
) -> Result<Map<String, Value>, PipelineError> {
    let context = Context::new(primary, ancestry)?;
    let mut properties = Map::new();

    for property in &step.properties {
        let value = context.substitute(&property.value)?;

        let value = match (
            property.property_type.as_str(),
            property.array_substitution_action,
        ) {
            ("array", Some(action)) => merge_array(
                property,
                action,
                resource_to_update.properties.get(&property.name),
                value,
            )?,
            _ => value,
        };

        properties.insert(property.name.clone(), value);
    }

    Ok(properties)
}
