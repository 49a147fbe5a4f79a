/// Tool surface: the static registry of tool definitions with compiled
/// JSON-schema validators, and the dispatcher that runs the guardrail chain
/// in front of the core services.
pub mod dispatcher;

pub use dispatcher::{Dispatcher, ToolOutcome};

use crate::error::{Error, Result};
use jsonschema::JSONSchema;
use serde_json::{json, Value};
use std::collections::HashMap;

/// One registered tool: its argument schema, compiled once at startup
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    schema: Value,
    compiled: JSONSchema,
}

impl ToolDefinition {
    fn new(name: &'static str, description: &'static str, schema: Value) -> Result<Self> {
        let compiled = JSONSchema::compile(&schema)
            .map_err(|e| Error::config(format!("Invalid schema for tool {}: {}", name, e)))?;
        Ok(Self {
            name,
            description,
            schema,
            compiled,
        })
    }

    /// The raw JSON schema, served to clients listing the tool surface
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Validate an argument object. Returns `(field, reason)` on the first
    /// violation.
    pub fn validate(&self, arguments: &Value) -> std::result::Result<(), (String, String)> {
        let result = self.compiled.validate(arguments);
        if let Err(mut errors) = result {
            if let Some(error) = errors.next() {
                let field = error.instance_path.to_string();
                let field = if field.is_empty() {
                    "arguments".to_string()
                } else {
                    field
                };
                return Err((field, error.to_string()));
            }
        }
        Ok(())
    }

    /// Clients sometimes over-wrap enum string fields as one-element arrays;
    /// unwrap those before validation
    pub fn auto_unwrap(&self, arguments: &mut Value) {
        let properties = match self.schema.get("properties").and_then(|p| p.as_object()) {
            Some(properties) => properties,
            None => return,
        };
        let object = match arguments.as_object_mut() {
            Some(object) => object,
            None => return,
        };
        for (name, property) in properties {
            let is_enum_string = property.get("type").and_then(|t| t.as_str()) == Some("string")
                && property.get("enum").is_some();
            if !is_enum_string {
                continue;
            }
            if let Some(value) = object.get_mut(name) {
                let unwrapped = match value.as_array() {
                    Some(items) if items.len() == 1 && items[0].is_string() => {
                        Some(items[0].clone())
                    }
                    _ => None,
                };
                if let Some(inner) = unwrapped {
                    *value = inner;
                }
            }
        }
    }
}

/// Static map from tool name to definition, built once at startup
pub struct ToolRegistry {
    tools: HashMap<&'static str, ToolDefinition>,
}

impl ToolRegistry {
    /// Build the full tool surface
    pub fn new() -> Result<Self> {
        let mut tools = HashMap::new();
        for definition in Self::definitions()? {
            tools.insert(definition.name, definition);
        }
        Ok(Self { tools })
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Tool listing in stable order, for the transport handshake
    pub fn list(&self) -> Vec<Value> {
        let mut names: Vec<&&'static str> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.tools.get(*name))
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.schema(),
                })
            })
            .collect()
    }

    fn definitions() -> Result<Vec<ToolDefinition>> {
        let resource_types_property = json!({
            "type": "array",
            "items": {"type": "string", "minLength": 3, "maxLength": 100},
            "minItems": 1,
            "maxItems": 50,
            "uniqueItems": true
        });
        let regions_property = json!({
            "type": "array",
            "items": {"type": "string", "minLength": 2, "maxLength": 30},
            "minItems": 1,
            "maxItems": 50,
            "uniqueItems": true
        });
        let severity_property = json!({
            "type": "string",
            "enum": ["errors_only", "warnings_only", "all"]
        });
        let filters_property = json!({
            "type": "object",
            "maxProperties": 20,
            "additionalProperties": {"type": "string", "maxLength": 256}
        });

        Ok(vec![
            ToolDefinition::new(
                "check_tag_compliance",
                "Scan resources across all enabled regions and validate their tags against the tagging policy",
                json!({
                    "type": "object",
                    "properties": {
                        "resource_types": resource_types_property.clone(),
                        "filters": filters_property,
                        "severity": severity_property.clone(),
                        "store_snapshot": {"type": "boolean"},
                        "force_refresh": {"type": "boolean"}
                    },
                    "required": ["resource_types"],
                    "additionalProperties": false
                }),
            )?,
            ToolDefinition::new(
                "find_untagged_resources",
                "Find resources with no tags or missing required tags, optionally above a monthly cost threshold",
                json!({
                    "type": "object",
                    "properties": {
                        "resource_types": resource_types_property.clone(),
                        "regions": regions_property,
                        "min_cost_threshold": {"type": "number", "minimum": 0}
                    },
                    "required": ["resource_types"],
                    "additionalProperties": false
                }),
            )?,
            ToolDefinition::new(
                "validate_resource_tags",
                "Validate the tags of specific resources by ARN",
                json!({
                    "type": "object",
                    "properties": {
                        "resource_arns": {
                            "type": "array",
                            "items": {"type": "string", "minLength": 20, "maxLength": 1000},
                            "minItems": 1,
                            "maxItems": 100,
                            "uniqueItems": true
                        }
                    },
                    "required": ["resource_arns"],
                    "additionalProperties": false
                }),
            )?,
            ToolDefinition::new(
                "get_cost_attribution_gap",
                "Compute how much spend cannot be attributed to properly tagged resources",
                json!({
                    "type": "object",
                    "properties": {
                        "time_period": {
                            "type": "string",
                            "enum": ["last_7_days", "last_30_days", "last_90_days"]
                        },
                        "grouping": {
                            "type": "string",
                            "enum": ["by_resource_type", "by_region", "by_account"]
                        }
                    },
                    "required": ["time_period"],
                    "additionalProperties": false
                }),
            )?,
            ToolDefinition::new(
                "suggest_tags",
                "Suggest values for a resource's missing tags from its neighbourhood and name",
                json!({
                    "type": "object",
                    "properties": {
                        "resource_arn": {"type": "string", "minLength": 20, "maxLength": 1000}
                    },
                    "required": ["resource_arn"],
                    "additionalProperties": false
                }),
            )?,
            ToolDefinition::new(
                "get_tagging_policy",
                "Return the active tagging policy",
                json!({
                    "type": "object",
                    "properties": {},
                    "additionalProperties": false
                }),
            )?,
            ToolDefinition::new(
                "generate_compliance_report",
                "Run a compliance scan and render it as a report",
                json!({
                    "type": "object",
                    "properties": {
                        "format": {"type": "string", "enum": ["json", "csv", "markdown"]},
                        "include_recommendations": {"type": "boolean"}
                    },
                    "required": ["format"],
                    "additionalProperties": false
                }),
            )?,
            ToolDefinition::new(
                "get_violation_history",
                "Aggregate stored compliance snapshots over a window",
                json!({
                    "type": "object",
                    "properties": {
                        "days_back": {"type": "integer", "minimum": 1, "maximum": 365},
                        "group_by": {"type": "string", "enum": ["day", "week", "month"]}
                    },
                    "required": ["days_back"],
                    "additionalProperties": false
                }),
            )?,
            ToolDefinition::new(
                "export_violations_csv",
                "Run a compliance scan and export the violations as CSV",
                json!({
                    "type": "object",
                    "properties": {
                        "resource_types": resource_types_property,
                        "severity": severity_property
                    },
                    "required": ["resource_types"],
                    "additionalProperties": false
                }),
            )?,
            ToolDefinition::new(
                "get_resource_types",
                "List the resource types the scanner supports, with their cost categories",
                json!({
                    "type": "object",
                    "properties": {},
                    "additionalProperties": false
                }),
            )?,
        ])
    }
}
