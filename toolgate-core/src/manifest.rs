//! App and function manifest schemas.
//!
//! A function manifest describes one invocable operation: a JSON-Schema for
//! its parameters (top-level properties drawn from the closed set
//! {path, query, header, cookie, body}) plus `protocol_data` describing the
//! HTTP call. The `visible` annotation selects which fields are exposed to
//! the LLM; non-visible required fields must carry a `default`.

use crate::types::{Function, FunctionDefinitionFormat, Protocol, SecuritySchemes, Visibility};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;

/// Top-level parameter locations a function schema may declare.
pub const PARAMETER_LOCATIONS: [&str; 5] = ["path", "query", "header", "cookie", "body"];

/// REST protocol data attached to a function manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestMetadata {
    pub server_url: String,
    pub path: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl RestMetadata {
    /// Parse REST metadata out of a function's `protocol_data`.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Declarative manifest for an app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppManifest {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub provider: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    #[serde(default)]
    pub security_schemes: SecuritySchemes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_security_credentials_by_scheme: Option<Value>,
}

fn default_visibility() -> Visibility {
    Visibility::Public
}

/// Declarative manifest for a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionManifest {
    /// Unique name of the form `<APP>__<ACTION>`.
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub protocol: Protocol,
    pub protocol_data: Value,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// A manifest validation failure, with the JSON-pointer-ish path at fault.
#[derive(Debug, thiserror::Error)]
#[error("Invalid manifest at {path}: {message}")]
pub struct ManifestError {
    pub path: String,
    pub message: String,
}

impl FunctionManifest {
    /// Validate this manifest against the parameter-schema conventions.
    pub fn validate(&self, app_name: &str) -> Result<(), ManifestError> {
        match self.name.split_once("__") {
            Some((prefix, action)) if !action.is_empty() => {
                if prefix != app_name {
                    return Err(ManifestError {
                        path: "name".into(),
                        message: format!(
                            "function prefix '{prefix}' does not match app '{app_name}'"
                        ),
                    });
                }
            }
            _ => {
                return Err(ManifestError {
                    path: "name".into(),
                    message: "expected '<APP>__<ACTION>' form".into(),
                });
            }
        }
        validate_parameters(&self.parameters)?;
        if self.protocol == Protocol::Rest {
            RestMetadata::from_value(&self.protocol_data).map_err(|e| ManifestError {
                path: "protocol_data".into(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Validate a function parameter schema: top-level properties restricted to
/// the closed location set, `additionalProperties: false` at every object
/// level, and non-visible required fields carrying a `default`.
pub fn validate_parameters(parameters: &Value) -> Result<(), ManifestError> {
    let obj = parameters.as_object().ok_or_else(|| ManifestError {
        path: "parameters".into(),
        message: "must be a JSON-Schema object".into(),
    })?;

    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        for key in props.keys() {
            if !PARAMETER_LOCATIONS.contains(&key.as_str()) {
                return Err(ManifestError {
                    path: format!("parameters.properties.{key}"),
                    message: format!(
                        "unknown parameter location '{key}', expected one of {PARAMETER_LOCATIONS:?}"
                    ),
                });
            }
        }
    }
    validate_object_schema(parameters, "parameters")
}

fn validate_object_schema(schema: &Value, path: &str) -> Result<(), ManifestError> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };
    if obj.get("type").and_then(Value::as_str) != Some("object") {
        return Ok(());
    }

    if obj.get("additionalProperties").and_then(Value::as_bool) != Some(false) {
        return Err(ManifestError {
            path: path.into(),
            message: "object schemas must set additionalProperties: false".into(),
        });
    }

    let visible: Option<Vec<&str>> = obj
        .get("visible")
        .and_then(Value::as_array)
        .map(|v| v.iter().filter_map(Value::as_str).collect());
    let required: Vec<&str> = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|v| v.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        for (key, sub) in props {
            let hidden = visible
                .as_ref()
                .is_some_and(|v| !v.contains(&key.as_str()));
            if hidden && required.contains(&key.as_str()) {
                let has_default = sub.get("default").is_some();
                if !has_default {
                    return Err(ManifestError {
                        path: format!("{path}.properties.{key}"),
                        message: "non-visible required field must carry a default".into(),
                    });
                }
            }
            validate_object_schema(sub, &format!("{path}.properties.{key}"))?;
        }
    }
    Ok(())
}

/// Filter a parameter schema down to the fields exposed to the LLM.
///
/// At every object level, drops properties not listed in the `visible`
/// annotation, intersects `required` accordingly, and strips the annotation
/// itself from the output.
pub fn filter_visible_properties(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => {
            let visible: Option<Vec<String>> = obj
                .get("visible")
                .and_then(Value::as_array)
                .map(|v| v.iter().filter_map(|x| x.as_str().map(String::from)).collect());

            let mut out = Map::new();
            for (key, value) in obj {
                match key.as_str() {
                    "visible" => {}
                    "properties" => {
                        if let Some(props) = value.as_object() {
                            let mut filtered = Map::new();
                            for (name, sub) in props {
                                let keep = visible.as_ref().is_none_or(|v| v.contains(name));
                                if keep {
                                    filtered.insert(name.clone(), filter_visible_properties(sub));
                                }
                            }
                            out.insert("properties".into(), Value::Object(filtered));
                        } else {
                            out.insert(key.clone(), value.clone());
                        }
                    }
                    "required" => {
                        let filtered: Vec<Value> = value
                            .as_array()
                            .map(|reqs| {
                                reqs.iter()
                                    .filter(|r| {
                                        r.as_str().is_some_and(|name| {
                                            visible
                                                .as_ref()
                                                .is_none_or(|v| v.iter().any(|x| x == name))
                                        })
                                    })
                                    .cloned()
                                    .collect()
                            })
                            .unwrap_or_default();
                        out.insert("required".into(), Value::Array(filtered));
                    }
                    _ => {
                        out.insert(key.clone(), filter_visible_properties(value));
                    }
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

/// Render a function definition for an LLM in the requested format. The
/// parameter schema is always filtered to its visible properties first.
pub fn function_definition(function: &Function, format: FunctionDefinitionFormat) -> Value {
    let parameters = filter_visible_properties(&function.parameters);
    match format {
        FunctionDefinitionFormat::Basic => json!({
            "name": function.name,
            "description": function.description,
        }),
        FunctionDefinitionFormat::Openai => json!({
            "type": "function",
            "function": {
                "name": function.name,
                "description": function.description,
                "parameters": parameters,
            }
        }),
        FunctionDefinitionFormat::OpenaiResponses => json!({
            "type": "function",
            "name": function.name,
            "description": function.description,
            "parameters": parameters,
        }),
        FunctionDefinitionFormat::Anthropic => json!({
            "name": function.name,
            "description": function.description,
            "input_schema": parameters,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn send_email_parameters() -> Value {
        json!({
            "type": "object",
            "properties": {
                "body": {
                    "type": "object",
                    "properties": {
                        "to": {"type": "string"},
                        "subject": {"type": "string"},
                        "text": {"type": "string"},
                        "trace_id": {"type": "string", "default": "gw"}
                    },
                    "required": ["to", "subject", "text", "trace_id"],
                    "visible": ["to", "subject", "text"],
                    "additionalProperties": false
                }
            },
            "required": ["body"],
            "additionalProperties": false
        })
    }

    #[test]
    fn test_validate_accepts_well_formed_schema() {
        assert!(validate_parameters(&send_email_parameters()).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_location() {
        let params = json!({
            "type": "object",
            "properties": {"payload": {"type": "object", "additionalProperties": false}},
            "additionalProperties": false
        });
        let err = validate_parameters(&params).unwrap_err();
        assert!(err.to_string().contains("unknown parameter location"));
    }

    #[test]
    fn test_validate_rejects_open_object() {
        let params = json!({
            "type": "object",
            "properties": {
                "body": {"type": "object", "properties": {}}
            },
            "additionalProperties": false
        });
        let err = validate_parameters(&params).unwrap_err();
        assert!(err.to_string().contains("additionalProperties"));
    }

    #[test]
    fn test_validate_rejects_hidden_required_without_default() {
        let params = json!({
            "type": "object",
            "properties": {
                "body": {
                    "type": "object",
                    "properties": {"token": {"type": "string"}},
                    "required": ["token"],
                    "visible": [],
                    "additionalProperties": false
                }
            },
            "additionalProperties": false
        });
        let err = validate_parameters(&params).unwrap_err();
        assert!(err.to_string().contains("default"));
    }

    #[test]
    fn test_filter_visible_properties() {
        let filtered = filter_visible_properties(&send_email_parameters());
        let body = &filtered["properties"]["body"];
        let props = body["properties"].as_object().unwrap();
        assert!(props.contains_key("to"));
        assert!(!props.contains_key("trace_id"));
        assert!(body.get("visible").is_none());
        let required: Vec<&str> = body["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(required, ["to", "subject", "text"]);
    }

    #[test]
    fn test_function_manifest_validates_prefix() {
        let manifest = FunctionManifest {
            name: "GMAIL__SEND_EMAIL".into(),
            description: "Send an email".into(),
            parameters: send_email_parameters(),
            protocol: Protocol::Rest,
            protocol_data: json!({
                "server_url": "https://gmail.googleapis.com",
                "path": "/gmail/v1/users/me/messages/send",
                "method": "POST",
                "headers": {"Content-Type": "application/json"}
            }),
            visibility: Visibility::Public,
            active: true,
        };
        assert!(manifest.validate("GMAIL").is_ok());
        assert!(manifest.validate("SLACK").is_err());
    }

    #[test]
    fn test_function_definition_formats() {
        let function = Function {
            id: uuid::Uuid::new_v4(),
            app_id: uuid::Uuid::new_v4(),
            name: "GMAIL__SEND_EMAIL".into(),
            description: "Send an email".into(),
            parameters: send_email_parameters(),
            protocol: Protocol::Rest,
            protocol_data: json!({}),
            visibility: Visibility::Public,
            active: true,
            embedding: vec![],
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let basic = function_definition(&function, FunctionDefinitionFormat::Basic);
        assert_eq!(basic["name"], "GMAIL__SEND_EMAIL");
        assert!(basic.get("parameters").is_none());

        let openai = function_definition(&function, FunctionDefinitionFormat::Openai);
        assert_eq!(openai["type"], "function");
        assert!(
            openai["function"]["parameters"]["properties"]["body"]["properties"]
                .get("trace_id")
                .is_none()
        );

        let anthropic = function_definition(&function, FunctionDefinitionFormat::Anthropic);
        assert!(anthropic.get("input_schema").is_some());
    }

    #[test]
    fn test_rest_metadata_parse() {
        let value = json!({
            "server_url": "https://api.example.com",
            "path": "/v1/items/{id}",
            "method": "GET"
        });
        let meta = RestMetadata::from_value(&value).unwrap();
        assert_eq!(meta.path, "/v1/items/{id}");
        assert!(meta.headers.is_none());
    }
}
