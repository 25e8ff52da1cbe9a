use serde_json::Value;

use crate::error::TokenError;
use crate::models::{TokenComponentInput, TokenValue};

/// Check one submitted entry against the token schema.
///
/// Any object inside `value` with a string `type` next to a `value` or
/// `category` key is treated as a token leaf and must parse as a [`TokenValue`].
pub fn validate_component(id: &str, input: &TokenComponentInput) -> Result<(), TokenError> {
    if id.trim().is_empty() {
        return Err(TokenError::validation(id, "id must not be empty"));
    }
    if input.kind.trim().is_empty() {
        return Err(TokenError::validation(id, "component type must not be empty"));
    }
    validate_tree(id, &input.value, &mut String::from("$"))
}

fn validate_tree(id: &str, node: &Value, path: &mut String) -> Result<(), TokenError> {
    match node {
        Value::Object(map) if is_token_leaf(map) => {
            serde_json::from_value::<TokenValue>(node.clone())
                .map(|_| ())
                .map_err(|e| TokenError::validation(id, format!("{path}: {e}")))
        }
        Value::Object(map) => {
            for (key, child) in map {
                let len = path.len();
                path.push('.');
                path.push_str(key);
                validate_tree(id, child, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                validate_tree(id, child, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn is_token_leaf(map: &serde_json::Map<String, Value>) -> bool {
    map.get("type").is_some_and(Value::is_string)
        && (map.contains_key("value") || map.contains_key("category"))
}
