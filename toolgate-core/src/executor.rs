//! REST function executor.
//!
//! Composes an outbound HTTP request from a function manifest plus the
//! agent-supplied input, injects credentials, routes the body encoding by
//! content type, dispatches, and classifies the outcome. Upstream failures
//! are results, not errors: the call succeeded, its result is an error.

use crate::credentials::{ApiKeyCredentials, OAuth1Credentials, OAuth2Credentials};
use crate::error::ExecutionError;
use crate::manifest::RestMetadata;
use crate::types::{ApiKeySchemeConfig, Function, HttpLocation, OAuth2SchemeConfig, Protocol};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Body keys that mark a multipart file upload.
const FILE_KEYS: [&str; 3] = ["attachment", "file", "upload"];
/// Strings longer than this are treated as candidate base64 file payloads.
const FILE_CANDIDATE_MIN_LEN: usize = 100;

/// Outcome of a function execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Credentials plus the scheme settings needed to place them in the request.
#[derive(Debug, Clone)]
pub enum ExecutionAuth {
    OAuth2 {
        scheme: OAuth2SchemeConfig,
        credentials: OAuth2Credentials,
    },
    /// Trello-style key + token query parameters.
    OAuth1 { credentials: OAuth1Credentials },
    ApiKey {
        scheme: ApiKeySchemeConfig,
        credentials: ApiKeyCredentials,
    },
    NoAuth,
}

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq)]
pub enum ComposedPart {
    Text { name: String, value: String },
    File {
        name: String,
        filename: String,
        bytes: Vec<u8>,
    },
}

/// The request body after content-type routing.
#[derive(Debug, Clone, PartialEq)]
pub enum ComposedBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    Multipart(Vec<ComposedPart>),
}

/// A fully composed request, ready for dispatch. Kept separate from the
/// HTTP client so composition is testable in isolation.
#[derive(Debug, Clone)]
pub struct ComposedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub body: ComposedBody,
}

/// Executor for functions with `protocol = rest`.
pub struct RestExecutor {
    client: reqwest::Client,
}

impl Default for RestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RestExecutor {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Compose and dispatch. Transport and upstream-status failures land in
    /// the result; only malformed manifests are errors.
    pub async fn execute(
        &self,
        function: &Function,
        function_input: &Value,
        auth: &ExecutionAuth,
    ) -> Result<ExecutionResult, ExecutionError> {
        let request = compose_request(function, function_input, auth)?;
        debug!(
            function_name = %function.name,
            method = %request.method,
            url = %request.url,
            "dispatching function execution request"
        );
        Ok(self.dispatch(request).await)
    }

    async fn dispatch(&self, request: ComposedRequest) -> ExecutionResult {
        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => return ExecutionResult::err(format!("invalid method {}", request.method)),
        };

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if !request.cookies.is_empty() {
            let cookie_header = request
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header("Cookie", cookie_header);
        }
        builder = match request.body {
            ComposedBody::Empty => builder,
            ComposedBody::Json(json) => builder.json(&json),
            ComposedBody::Form(fields) => builder.form(&fields),
            ComposedBody::Multipart(parts) => {
                let mut form = reqwest::multipart::Form::new();
                for part in parts {
                    form = match part {
                        ComposedPart::Text { name, value } => form.text(name, value),
                        ComposedPart::File {
                            name,
                            filename,
                            bytes,
                        } => form.part(
                            name,
                            reqwest::multipart::Part::bytes(bytes).file_name(filename),
                        ),
                    };
                }
                builder.multipart(form)
            }
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "function execution transport error");
                return ExecutionResult::err(e.to_string());
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            // Prefer the remote JSON body; it usually carries the detail.
            let error = match serde_json::from_str::<Value>(&text) {
                Ok(json) => json.to_string(),
                Err(_) if !text.is_empty() => text,
                Err(_) => format!("HTTP status {status}"),
            };
            return ExecutionResult::err(error);
        }

        let data = if text.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        ExecutionResult::ok(data)
    }
}

/// Compose the outgoing request: split the input by location, template the
/// path, merge headers, inject credentials, and route the body encoding.
pub fn compose_request(
    function: &Function,
    function_input: &Value,
    auth: &ExecutionAuth,
) -> Result<ComposedRequest, ExecutionError> {
    if function.protocol != Protocol::Rest {
        return Err(ExecutionError::UnsupportedProtocol {
            protocol: function.protocol.as_str().into(),
        });
    }
    let protocol_data = RestMetadata::from_value(&function.protocol_data).map_err(|e| {
        ExecutionError::InvalidProtocolData {
            function: function.name.clone(),
            message: e.to_string(),
        }
    })?;

    let path = input_section(function_input, "path");
    let mut query = input_section(function_input, "query");
    let input_headers = input_section(function_input, "header");
    let mut cookies = input_section(function_input, "cookie");
    let mut body = input_section(function_input, "body");

    // URL with path parameters substituted.
    let mut url = format!("{}{}", protocol_data.server_url, protocol_data.path);
    for (name, value) in &path {
        url = url.replace(&format!("{{{name}}}"), &value_to_string(value));
    }

    // Manifest defaults first, input headers win.
    let mut headers: Vec<(String, String)> = Vec::new();
    if let Some(defaults) = &protocol_data.headers {
        for (name, value) in defaults {
            if !input_headers.contains_key(name) {
                headers.push((name.clone(), value.clone()));
            }
        }
    }
    for (name, value) in &input_headers {
        headers.push((name.clone(), value_to_string(value)));
    }

    inject_credentials(auth, &mut headers, &mut query, &mut body, &mut cookies);

    let content_type = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("Content-Type"))
        .map(|(_, value)| value.to_lowercase())
        .unwrap_or_default();
    let mut is_multipart = content_type.contains("multipart/form-data");
    let is_form = content_type.contains("application/x-www-form-urlencoded");

    // Auto-detect uploads by body shape when nothing is declared.
    if !is_multipart && !is_form && FILE_KEYS.iter().any(|key| body.contains_key(*key)) {
        is_multipart = true;
    }

    let composed_body = if body.is_empty() {
        ComposedBody::Empty
    } else if is_multipart {
        // The HTTP client must set the boundary itself.
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("Content-Type"));
        ComposedBody::Multipart(multipart_parts(&body))
    } else if is_form {
        ComposedBody::Form(
            body.iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect(),
        )
    } else {
        ComposedBody::Json(Value::Object(body))
    };

    Ok(ComposedRequest {
        method: protocol_data.method.to_uppercase(),
        url,
        headers,
        query: query
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect(),
        cookies: cookies
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect(),
        body: composed_body,
    })
}

fn input_section(input: &Value, key: &str) -> Map<String, Value> {
    input
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn inject_credentials(
    auth: &ExecutionAuth,
    headers: &mut Vec<(String, String)>,
    query: &mut Map<String, Value>,
    body: &mut Map<String, Value>,
    cookies: &mut Map<String, Value>,
) {
    match auth {
        ExecutionAuth::OAuth2 {
            scheme,
            credentials,
        } => {
            let token = match &scheme.prefix {
                Some(prefix) => format!("{prefix} {}", credentials.access_token),
                None => credentials.access_token.clone(),
            };
            place(scheme.location, &scheme.name, token, headers, query, body, cookies);

            // Additional headers carry `{{key}}` templates resolved from
            // credential metadata.
            if let Some(additional) = &scheme.additional_headers {
                for (name, template) in additional {
                    let mut value = template.clone();
                    for (key, replacement) in &credentials.metadata {
                        value = value.replace(&format!("{{{{{key}}}}}"), replacement);
                    }
                    headers.push((name.clone(), value));
                }
            }
        }
        ExecutionAuth::OAuth1 { credentials } => {
            query.insert("key".into(), Value::String(credentials.consumer_key.clone()));
            query.insert("token".into(), Value::String(credentials.oauth_token.clone()));
        }
        ExecutionAuth::ApiKey {
            scheme,
            credentials,
        } => {
            let key = match &scheme.prefix {
                Some(prefix) => format!("{prefix} {}", credentials.secret_key),
                None => credentials.secret_key.clone(),
            };
            place(scheme.location, &scheme.name, key, headers, query, body, cookies);
        }
        ExecutionAuth::NoAuth => {}
    }
}

#[allow(clippy::too_many_arguments)]
fn place(
    location: HttpLocation,
    name: &str,
    value: String,
    headers: &mut Vec<(String, String)>,
    query: &mut Map<String, Value>,
    body: &mut Map<String, Value>,
    cookies: &mut Map<String, Value>,
) {
    match location {
        HttpLocation::Header => headers.push((name.to_string(), value)),
        HttpLocation::Query => {
            query.insert(name.to_string(), Value::String(value));
        }
        HttpLocation::Body => {
            body.insert(name.to_string(), Value::String(value));
        }
        HttpLocation::Cookie => {
            cookies.insert(name.to_string(), Value::String(value));
        }
    }
}

/// Build multipart parts from a body map. Base64-decodes likely file
/// payloads; `filename` names the file parts and is not itself a part.
fn multipart_parts(body: &Map<String, Value>) -> Vec<ComposedPart> {
    let filename = body
        .get("filename")
        .and_then(Value::as_str)
        .unwrap_or("file")
        .to_string();

    let mut parts = Vec::new();
    for (key, value) in body {
        if key == "filename" {
            continue;
        }
        let is_file_key = FILE_KEYS.contains(&key.as_str());
        let long_string = value
            .as_str()
            .is_some_and(|s| s.len() > FILE_CANDIDATE_MIN_LEN);
        if is_file_key || long_string {
            if let Some(text) = value.as_str() {
                match STANDARD.decode(text) {
                    Ok(bytes) => {
                        parts.push(ComposedPart::File {
                            name: key.clone(),
                            filename: filename.clone(),
                            bytes,
                        });
                        continue;
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "body field is not base64, sending as text");
                    }
                }
            }
        }
        parts.push(ComposedPart::Text {
            name: key.clone(),
            value: value_to_string(value),
        });
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Visibility;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn function(headers: Value) -> Function {
        Function {
            id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            name: "GMAIL__SEND_EMAIL".into(),
            description: "Send an email".into(),
            parameters: json!({}),
            protocol: Protocol::Rest,
            protocol_data: json!({
                "server_url": "https://gmail.googleapis.com",
                "path": "/gmail/v1/users/{user_id}/messages/send",
                "method": "POST",
                "headers": headers
            }),
            visibility: Visibility::Public,
            active: true,
            embedding: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn oauth2_auth() -> ExecutionAuth {
        ExecutionAuth::OAuth2 {
            scheme: OAuth2SchemeConfig {
                client_id: "cid".into(),
                client_secret: "cs".into(),
                scope: "mail".into(),
                authorize_url: "https://a".into(),
                access_token_url: "https://t".into(),
                refresh_token_url: "https://t".into(),
                token_endpoint_auth_method: None,
                location: HttpLocation::Header,
                name: "Authorization".into(),
                prefix: Some("Bearer".into()),
                additional_headers: None,
                redirect_url: None,
            },
            credentials: OAuth2Credentials {
                client_id: "cid".into(),
                client_secret: "cs".into(),
                scope: "mail".into(),
                access_token: "tok123".into(),
                token_type: Some("Bearer".into()),
                expires_at: None,
                refresh_token: None,
                metadata: Default::default(),
                raw_token_response: None,
            },
        }
    }

    #[test]
    fn test_compose_path_template_and_bearer_header() {
        let input = json!({
            "path": {"user_id": "me"},
            "body": {"to": "a@b", "subject": "s", "text": "t"}
        });
        let request =
            compose_request(&function(json!({"Content-Type": "application/json"})), &input, &oauth2_auth())
                .unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(
            request.url,
            "https://gmail.googleapis.com/gmail/v1/users/me/messages/send"
        );
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer tok123"));
        assert_eq!(
            request.body,
            ComposedBody::Json(json!({"to": "a@b", "subject": "s", "text": "t"}))
        );
    }

    #[test]
    fn test_input_headers_win_over_manifest_defaults() {
        let input = json!({
            "header": {"Content-Type": "application/x-www-form-urlencoded"},
            "body": {"grant_type": "authorization_code"}
        });
        let request = compose_request(
            &function(json!({"Content-Type": "application/json"})),
            &input,
            &ExecutionAuth::NoAuth,
        )
        .unwrap();

        let content_types: Vec<&str> = request
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("Content-Type"))
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(content_types, ["application/x-www-form-urlencoded"]);
        assert_eq!(
            request.body,
            ComposedBody::Form(vec![("grant_type".into(), "authorization_code".into())])
        );
    }

    #[test]
    fn test_multipart_strips_content_type_and_splits_parts() {
        let payload = STANDARD.encode(b"file-bytes");
        let input = json!({
            "header": {"Content-Type": "multipart/form-data"},
            "body": {
                "attachment": payload,
                "filename": "notes.txt",
                "comment": "hello"
            }
        });
        let request =
            compose_request(&function(json!(null)), &input, &ExecutionAuth::NoAuth).unwrap();

        // The executor must not set Content-Type; the client adds the boundary.
        assert!(!request
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("Content-Type")));

        let ComposedBody::Multipart(parts) = request.body else {
            panic!("expected multipart body");
        };
        assert_eq!(parts.len(), 2);
        assert!(parts.contains(&ComposedPart::File {
            name: "attachment".into(),
            filename: "notes.txt".into(),
            bytes: b"file-bytes".to_vec(),
        }));
        assert!(parts.contains(&ComposedPart::Text {
            name: "comment".into(),
            value: "hello".into(),
        }));
    }

    #[test]
    fn test_multipart_auto_detected_from_file_keys() {
        let input = json!({
            "body": {"file": STANDARD.encode(b"x"), "filename": "x.bin"}
        });
        let request =
            compose_request(&function(json!(null)), &input, &ExecutionAuth::NoAuth).unwrap();
        assert!(matches!(request.body, ComposedBody::Multipart(_)));
    }

    #[test]
    fn test_oauth1_key_token_query_params() {
        let auth = ExecutionAuth::OAuth1 {
            credentials: OAuth1Credentials {
                consumer_key: "ck".into(),
                consumer_secret: "cs".into(),
                oauth_token: "ot".into(),
                oauth_token_secret: "ots".into(),
            },
        };
        let request = compose_request(&function(json!(null)), &json!({}), &auth).unwrap();
        assert!(request.query.contains(&("key".into(), "ck".into())));
        assert!(request.query.contains(&("token".into(), "ot".into())));
    }

    #[test]
    fn test_api_key_query_location() {
        let auth = ExecutionAuth::ApiKey {
            scheme: ApiKeySchemeConfig {
                location: HttpLocation::Query,
                name: "api_key".into(),
                prefix: None,
            },
            credentials: ApiKeyCredentials {
                secret_key: "sk-1".into(),
            },
        };
        let request = compose_request(&function(json!(null)), &json!({}), &auth).unwrap();
        assert!(request.query.contains(&("api_key".into(), "sk-1".into())));
    }

    #[test]
    fn test_additional_headers_template_resolution() {
        let ExecutionAuth::OAuth2 {
            mut scheme,
            mut credentials,
        } = oauth2_auth()
        else {
            unreachable!()
        };
        scheme.additional_headers = Some(
            [("X-Org-Id".to_string(), "{{orgId}}".to_string())]
                .into_iter()
                .collect(),
        );
        credentials
            .metadata
            .insert("orgId".into(), "2389290".into());
        let auth = ExecutionAuth::OAuth2 {
            scheme,
            credentials,
        };
        let request = compose_request(&function(json!(null)), &json!({}), &auth).unwrap();
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "X-Org-Id" && v == "2389290"));
    }

    #[test]
    fn test_cookie_section_passthrough() {
        let input = json!({"cookie": {"session": "abc"}});
        let request =
            compose_request(&function(json!(null)), &input, &ExecutionAuth::NoAuth).unwrap();
        assert_eq!(request.cookies, vec![("session".into(), "abc".into())]);
    }

    #[test]
    fn test_invalid_protocol_data_is_an_error() {
        let mut broken = function(json!(null));
        broken.protocol_data = json!({"path": "/x"});
        let err = compose_request(&broken, &json!({}), &ExecutionAuth::NoAuth).unwrap_err();
        assert!(matches!(err, ExecutionError::InvalidProtocolData { .. }));
    }
}
