//! Request and response transformation rules.
//!
//! Rules are indexed by path prefix. Each rule is an ordered sequence of
//! typed operations over headers, query parameters, or dotted body paths
//! (`user.address.city`); intermediate objects are created as needed when
//! adding. The response side also attaches the gateway metadata envelope and
//! patches error bodies with a support envelope.

use crate::models::context::GatewayResponse;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Operation kind applied by one transformation step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformAction {
    /// Add a value, creating intermediate body objects as needed.
    Add,
    /// Remove a value.
    Remove,
    /// Rename a field or header, keeping its value.
    Rename,
    /// Apply a named function to the current value.
    Transform,
}

/// What the operation targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformTarget {
    Header,
    Query,
    Body,
}

/// Named value functions available to `Transform` operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransformFunction {
    Lowercase,
    Uppercase,
    Trim,
    ToNumber,
    ToString,
    ToArray,
}

impl TransformFunction {
    /// Applies the function to a JSON value. Functions that do not apply to
    /// the value's type leave it unchanged.
    pub fn apply(&self, value: Value) -> Value {
        match self {
            TransformFunction::Lowercase => match value {
                Value::String(s) => Value::String(s.to_lowercase()),
                other => other,
            },
            TransformFunction::Uppercase => match value {
                Value::String(s) => Value::String(s.to_uppercase()),
                other => other,
            },
            TransformFunction::Trim => match value {
                Value::String(s) => Value::String(s.trim().to_string()),
                other => other,
            },
            TransformFunction::ToNumber => match &value {
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(value),
                _ => value,
            },
            TransformFunction::ToString => match value {
                Value::String(s) => Value::String(s),
                other => Value::String(other.to_string()),
            },
            TransformFunction::ToArray => match value {
                Value::Array(items) => Value::Array(items),
                other => Value::Array(vec![other]),
            },
        }
    }
}

/// One transformation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformOp {
    pub action: TransformAction,
    pub target: TransformTarget,
    /// Header name, query parameter name, or dotted body path.
    pub name: String,
    /// Value for `Add`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// New name for `Rename`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Function for `Transform`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<TransformFunction>,
}

impl TransformOp {
    fn validate(&self) -> Result<(), String> {
        match self.action {
            TransformAction::Add if self.value.is_none() => {
                Err(format!("add operation on {} requires a value", self.name))
            }
            TransformAction::Rename if self.to.is_none() => {
                Err(format!("rename operation on {} requires a target name", self.name))
            }
            TransformAction::Transform if self.function.is_none() => {
                Err(format!("transform operation on {} requires a function", self.name))
            }
            _ => Ok(()),
        }
    }
}

/// Rule set scoped to one path prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformRuleSet {
    pub path_prefix: String,
    #[serde(default)]
    pub request: Vec<TransformOp>,
    #[serde(default)]
    pub response: Vec<TransformOp>,
}

/// Transformation configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationSettings {
    #[serde(default)]
    pub rules: Vec<TransformRuleSet>,
    /// Attach the `_gateway` metadata envelope to JSON responses.
    #[serde(default = "default_true")]
    pub attach_gateway_envelope: bool,
    /// Patch a support envelope onto error bodies (status >= 400).
    #[serde(default = "default_true")]
    pub error_envelope: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_contact: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for TransformationSettings {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            attach_gateway_envelope: true,
            error_envelope: true,
            support_contact: None,
        }
    }
}

impl TransformationSettings {
    pub fn validate(&self) -> Result<(), String> {
        for rule in &self.rules {
            if !rule.path_prefix.starts_with('/') {
                return Err(format!(
                    "Transformation prefix must start with '/': {}",
                    rule.path_prefix
                ));
            }
            for op in &rule.request {
                op.validate()?;
            }
            for op in &rule.response {
                op.validate()?;
                // A response has no query string to rewrite.
                if op.target == TransformTarget::Query {
                    return Err(format!(
                        "Response rules cannot target query parameters: {}",
                        op.name
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Applies configured transformations to requests and responses.
pub struct Transformer {
    settings: TransformationSettings,
}

impl Transformer {
    pub fn new(settings: TransformationSettings) -> Self {
        Self { settings }
    }

    fn rules_for<'a>(&'a self, path: &str) -> impl Iterator<Item = &'a TransformRuleSet> + 'a {
        let path = path.to_string();
        self.settings
            .rules
            .iter()
            .filter(move |rule| path.starts_with(&rule.path_prefix))
    }

    /// Applies request-side rules in configuration order, then sanitizes the
    /// query string.
    pub fn apply_request(
        &self,
        path: &str,
        headers: &mut HashMap<String, String>,
        query: &mut HashMap<String, String>,
        body: &mut Option<Value>,
    ) {
        for rule in self.rules_for(path) {
            for op in &rule.request {
                apply_op(op, headers, query, body);
            }
        }
        sanitize_query(query);
    }

    /// Applies response-side rules for the path: header operations against
    /// the response headers and body operations against the JSON body. The
    /// body is parsed at most once and written back only when a rule
    /// touched it.
    pub fn apply_response(&self, path: &str, response: &mut GatewayResponse) {
        let mut body: Option<Value> = None;
        let mut body_dirty = false;

        for rule in self.rules_for(path) {
            for op in &rule.response {
                match op.target {
                    TransformTarget::Header => apply_response_header_op(op, response),
                    TransformTarget::Body => {
                        if body.is_none() {
                            body = parse_json_body(response);
                        }
                        if let Some(json) = body.as_mut() {
                            apply_body_op(op, json);
                            body_dirty = true;
                        }
                    }
                    // Rejected at config load; nothing to apply here.
                    TransformTarget::Query => {}
                }
            }
        }

        if body_dirty {
            if let Some(json) = &body {
                replace_json_body(response, json);
            }
        }
    }

    /// Wraps a JSON response body with the `_gateway` metadata envelope.
    pub fn attach_gateway_envelope(
        &self,
        response: &mut GatewayResponse,
        request_id: &str,
        service: Option<&str>,
        instance: Option<&str>,
    ) {
        if !self.settings.attach_gateway_envelope {
            return;
        }
        let Some(mut body) = parse_json_body(response) else {
            return;
        };
        if let Value::Object(map) = &mut body {
            map.insert(
                "_gateway".to_string(),
                serde_json::json!({
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "requestId": request_id,
                    "service": service,
                    "instance": instance,
                }),
            );
            replace_json_body(response, &body);
        }
    }

    /// Patches a support envelope onto error bodies.
    pub fn attach_error_envelope(&self, response: &mut GatewayResponse, request_id: &str) {
        if !self.settings.error_envelope || response.status.as_u16() < 400 {
            return;
        }
        let Some(mut body) = parse_json_body(response) else {
            return;
        };
        if let Value::Object(map) = &mut body {
            if map.contains_key("support") {
                return;
            }
            let mut support = serde_json::json!({
                "requestId": request_id,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            if let Some(contact) = &self.settings.support_contact {
                support["contact"] = Value::String(contact.clone());
            }
            map.insert("support".to_string(), support);
            replace_json_body(response, &body);
        }
    }
}

fn apply_op(
    op: &TransformOp,
    headers: &mut HashMap<String, String>,
    query: &mut HashMap<String, String>,
    body: &mut Option<Value>,
) {
    match op.target {
        TransformTarget::Header => apply_map_op(op, headers, true),
        TransformTarget::Query => apply_map_op(op, query, false),
        TransformTarget::Body => {
            if let Some(json) = body {
                apply_body_op(op, json);
            }
        }
    }
}

fn apply_map_op(op: &TransformOp, map: &mut HashMap<String, String>, lowercase_keys: bool) {
    let key = if lowercase_keys {
        op.name.to_ascii_lowercase()
    } else {
        op.name.clone()
    };
    match op.action {
        TransformAction::Add => {
            if let Some(value) = op.value.as_ref().and_then(value_as_string) {
                map.entry(key).or_insert(value);
            }
        }
        TransformAction::Remove => {
            map.remove(&key);
        }
        TransformAction::Rename => {
            if let Some(to) = &op.to {
                if let Some(value) = map.remove(&key) {
                    let to = if lowercase_keys {
                        to.to_ascii_lowercase()
                    } else {
                        to.clone()
                    };
                    map.insert(to, value);
                }
            }
        }
        TransformAction::Transform => {
            if let (Some(function), Some(value)) = (op.function, map.get(&key).cloned()) {
                let transformed = function.apply(Value::String(value));
                if let Some(s) = value_as_string(&transformed) {
                    map.insert(key, s);
                }
            }
        }
    }
}

fn apply_response_header_op(op: &TransformOp, response: &mut GatewayResponse) {
    match op.action {
        TransformAction::Add => {
            if let Some(value) = op.value.as_ref().and_then(value_as_string) {
                if response.header(&op.name).is_none() {
                    response.set_header(&op.name, value);
                }
            }
        }
        TransformAction::Remove => response.remove_header(&op.name),
        TransformAction::Rename => {
            if let (Some(to), Some(value)) =
                (op.to.as_deref(), response.header(&op.name).map(String::from))
            {
                response.remove_header(&op.name);
                response.set_header(to, value);
            }
        }
        TransformAction::Transform => {
            if let (Some(function), Some(value)) =
                (op.function, response.header(&op.name).map(String::from))
            {
                let transformed = function.apply(Value::String(value));
                if let Some(s) = value_as_string(&transformed) {
                    response.set_header(&op.name, s);
                }
            }
        }
    }
}

fn apply_body_op(op: &TransformOp, body: &mut Value) {
    match op.action {
        TransformAction::Add => {
            if let Some(value) = &op.value {
                set_path(body, &op.name, value.clone());
            }
        }
        TransformAction::Remove => {
            remove_path(body, &op.name);
        }
        TransformAction::Rename => {
            if let Some(to) = &op.to {
                if let Some(value) = get_path(body, &op.name).cloned() {
                    remove_path(body, &op.name);
                    set_path(body, to, value);
                }
            }
        }
        TransformAction::Transform => {
            if let Some(function) = op.function {
                if let Some(value) = get_path(body, &op.name).cloned() {
                    set_path(body, &op.name, function.apply(value));
                }
            }
        }
    }
}

/// Resolves a dotted path to a reference inside a JSON value.
pub fn get_path<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = body;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Sets a dotted path, creating intermediate objects as needed. Segments
/// that collide with non-object values are overwritten.
pub fn set_path(body: &mut Value, path: &str, value: Value) {
    let mut current = body;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().unwrap();
        if i == segments.len() - 1 {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Removes a dotted path if present.
pub fn remove_path(body: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = body;
    for segment in &segments[..segments.len() - 1] {
        match current.as_object_mut().and_then(|m| m.get_mut(*segment)) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(segments[segments.len() - 1]);
    }
}

/// Strips a small fixed set of HTML/JS fragments from query values.
pub fn sanitize_query(query: &mut HashMap<String, String>) {
    static STRIP: Lazy<Vec<Regex>> = Lazy::new(|| {
        [r"(?i)<script[^>]*>", r"(?i)</script>", r"(?i)javascript:", r"(?i)\bon\w+\s*="]
            .iter()
            .map(|p| Regex::new(p).expect("invalid sanitize pattern"))
            .collect()
    });
    for value in query.values_mut() {
        if STRIP.iter().any(|p| p.is_match(value)) {
            let mut cleaned = value.clone();
            for pattern in STRIP.iter() {
                cleaned = pattern.replace_all(&cleaned, "").into_owned();
            }
            debug!("Sanitized query value");
            *value = cleaned;
        }
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_json_body(response: &GatewayResponse) -> Option<Value> {
    let is_json = response
        .header("content-type")
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);
    if !is_json || response.body.is_empty() {
        return None;
    }
    serde_json::from_slice(&response.body).ok()
}

fn replace_json_body(response: &mut GatewayResponse, body: &Value) {
    let raw = body.to_string();
    response.set_header("content-length", raw.len().to_string());
    response.body = raw.into_bytes().into();
}
