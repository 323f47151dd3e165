//! FHIR search filter syntax.
//!
//! Parses and validates `key=value&key=value` search strings, turns keyword-style
//! parameters (`birthdate__gt`, `name__contains`, `address_state`) into FHIR
//! parameter names, and renders URL query strings.

use serde_json::{Map, Value};
use thiserror::Error;

/// Comparison prefixes allowed in front of ordered values (dates, numbers, quantities).
pub const COMPARISON_PREFIXES: [&str; 9] = ["eq", "ne", "gt", "lt", "ge", "le", "sa", "eb", "ap"];

/// Modifiers accepted as the last `__` segment of a keyword-style key.
const KEYWORD_MODIFIERS: [&str; 13] = [
    "contains", "exact", "not", "missing", "text", "above", "below", "in", "not_in", "of_type",
    "identifier", "iterate", "code_text",
];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QuerySyntaxError {
    #[error("query is empty")]
    Empty,

    #[error("'{0}' is not a key=value pair")]
    MissingEquals(String),

    #[error("invalid parameter name '{0}'")]
    InvalidKey(String),

    #[error("parameter '{0}' has an empty value")]
    EmptyValue(String),

    #[error("parameter '{key}' has an unsupported value: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// One `key=value` search parameter. `key` includes any `:modifier` suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParam {
    pub key: String,
    pub value: String,
}

impl SearchParam {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parameter name without modifier.
    pub fn name(&self) -> &str {
        self.key.split(':').next().unwrap_or(&self.key)
    }

    pub fn modifier(&self) -> Option<&str> {
        self.key.split_once(':').map(|(_, m)| m)
    }

    /// Values joined with commas are alternatives.
    pub fn alternatives(&self) -> impl Iterator<Item = &str> {
        self.value.split(',')
    }
}

/// A validated search string, optionally prefixed with a resource type (`Encounter?...`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FhirQuery {
    pub resource_type: Option<String>,
    pub params: Vec<SearchParam>,
}

impl FhirQuery {
    pub fn parse(input: &str) -> Result<Self, QuerySyntaxError> {
        let input = input.trim();
        let (resource_type, query) = match input.split_once('?') {
            Some((path, rest)) if !path.is_empty() => {
                let resource_type = path.trim_start_matches('/');
                if !is_resource_type(resource_type) {
                    return Err(QuerySyntaxError::InvalidKey(path.to_string()));
                }
                (Some(resource_type.to_string()), rest)
            }
            Some((_, rest)) => (None, rest),
            None => (None, input),
        };

        let mut params = Vec::new();
        for pair in query.split('&').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| QuerySyntaxError::MissingEquals(pair.to_string()))?;
            let key = key.trim();
            let value = value.trim();

            validate_key(key)?;
            validate_value(key, value)?;
            params.push(SearchParam::new(key, value));
        }

        if params.is_empty() {
            return Err(QuerySyntaxError::Empty);
        }

        Ok(Self {
            resource_type,
            params,
        })
    }
}

/// Split a comparison prefix off an ordered value, e.g. `ge2024-01-01` -> (`ge`, `2024-01-01`).
pub fn comparison_prefix(value: &str) -> Option<(&str, &str)> {
    if value.len() < 3 || !value.is_char_boundary(2) {
        return None;
    }
    let (prefix, rest) = value.split_at(2);
    let starts_ordered = rest
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '.');
    (COMPARISON_PREFIXES.contains(&prefix) && starts_ordered).then_some((prefix, rest))
}

pub fn render_query_string(params: &[SearchParam]) -> String {
    params
        .iter()
        .map(|p| format!("{}={}", p.key, urlencoding::encode(&p.value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Turn tool-supplied search parameters into FHIR search parameters.
///
/// Keys already in FHIR form (`name:contains`, `birthdate`) pass through. Keyword-style
/// keys are rewritten: `birthdate__gt=1944` becomes `birthdate=gt1944`, `name__contains`
/// becomes `name:contains`, `address_state` becomes `address-state` and
/// `general_practitioner__Organization__name` becomes `general-practitioner:Organization.name`.
/// List values repeat the key; booleans and numbers are rendered as text.
pub fn normalize_params(search_params: &Map<String, Value>) -> Result<Vec<SearchParam>, QuerySyntaxError> {
    let mut params = Vec::new();

    for (raw_key, value) in search_params {
        let (key, prefix) = normalize_key(raw_key.trim())?;
        validate_key(&key)?;

        let values = match value {
            Value::Array(items) => items
                .iter()
                .map(|item| scalar_to_string(&key, item))
                .collect::<Result<Vec<_>, _>>()?,
            other => vec![scalar_to_string(&key, other)?],
        };

        for value in values {
            let value = match prefix {
                Some(prefix) if comparison_prefix(&value).is_none() => format!("{}{}", prefix, value),
                _ => value,
            };
            validate_value(&key, &value)?;
            params.push(SearchParam::new(key.clone(), value));
        }
    }

    Ok(params)
}

fn normalize_key(raw: &str) -> Result<(String, Option<&'static str>), QuerySyntaxError> {
    if raw.is_empty() {
        return Err(QuerySyntaxError::InvalidKey(raw.to_string()));
    }
    if raw.contains(':') {
        return Ok((raw.to_string(), None));
    }
    if !raw.contains("__") {
        return Ok((dash_case(raw), None));
    }

    let mut parts = raw.split("__");
    let mut key = dash_case(parts.next().unwrap_or_default());
    let rest: Vec<&str> = parts.collect();
    let mut prefix = None;
    let mut index = 0;

    while index < rest.len() {
        let part = rest[index];
        let is_last = index + 1 == rest.len();
        let comparison = COMPARISON_PREFIXES.iter().copied().find(|p| *p == part);

        if is_last && comparison.is_some() {
            prefix = comparison;
        } else if is_last && KEYWORD_MODIFIERS.contains(&part) {
            key.push(':');
            key.push_str(&part.replace('_', "-"));
        } else if part.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
            key.push(':');
            key.push_str(part);
            if let Some(next) = rest.get(index + 1) {
                key.push('.');
                key.push_str(&dash_case(next));
                index += 1;
            }
        } else if part.is_empty() {
            return Err(QuerySyntaxError::InvalidKey(raw.to_string()));
        } else {
            key.push('.');
            key.push_str(&dash_case(part));
        }
        index += 1;
    }

    Ok((key, prefix))
}

/// `address_state` -> `address-state`, keeping a leading underscore (`_lastUpdated`).
fn dash_case(part: &str) -> String {
    match part.strip_prefix('_') {
        Some(rest) => format!("_{}", rest.replace('_', "-")),
        None => part.replace('_', "-"),
    }
}

fn scalar_to_string(key: &str, value: &Value) -> Result<String, QuerySyntaxError> {
    match value {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Err(QuerySyntaxError::EmptyValue(key.to_string())),
        Value::Array(_) | Value::Object(_) => Err(QuerySyntaxError::InvalidValue {
            key: key.to_string(),
            reason: "nested lists and objects are not search values".to_string(),
        }),
    }
}

fn is_resource_type(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_uppercase()) && chars.all(|c| c.is_ascii_alphanumeric())
}

/// Name segments are `[A-Za-z_][A-Za-z0-9_.-]*`; modifier segments after `:` may not be empty.
fn validate_key(key: &str) -> Result<(), QuerySyntaxError> {
    let invalid = || QuerySyntaxError::InvalidKey(key.to_string());
    let mut segments = key.split(':');

    let name = segments.next().ok_or_else(invalid)?;
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(invalid());
    }

    for segment in segments {
        let ok = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !ok {
            return Err(invalid());
        }
    }

    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), QuerySyntaxError> {
    if value.is_empty() || value.split(',').any(|alt| alt.trim().is_empty()) {
        return Err(QuerySyntaxError::EmptyValue(key.to_string()));
    }
    if value.contains('&') {
        return Err(QuerySyntaxError::InvalidValue {
            key: key.to_string(),
            reason: "values may not contain '&'".to_string(),
        });
    }
    Ok(())
}
