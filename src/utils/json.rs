use serde_json::Value;

/// How a field appeared in a PATCH body.
#[derive(Debug, PartialEq, Eq)]
pub enum NullableValue {
    Omitted,
    Null,
    String(String),
}

pub fn classify_nullable(optional_value: Option<&Value>) -> Result<NullableValue, String> {
    match optional_value {
        None => Ok(NullableValue::Omitted),
        Some(Value::Null) => Ok(NullableValue::Null),
        Some(Value::String(s)) => Ok(NullableValue::String(s.to_owned())),
        Some(other) => Err(format!("expected string or null, got {other}")),
    }
}

/// A field that may be omitted but not nulled.
pub fn optional_string(body: &Value, field: &str) -> Result<Option<String>, String> {
    match classify_nullable(body.get(field)).map_err(|err| format!("{field}: {err}"))? {
        NullableValue::Omitted => Ok(None),
        NullableValue::Null => Err(format!("{field} cannot be null")),
        NullableValue::String(value) => Ok(Some(value)),
    }
}

/// Fails on the first field of `read_only` present in the body, whatever its value.
pub fn reject_fields(body: &Value, read_only: &[&str]) -> Result<(), String> {
    let Some(object) = body.as_object() else {
        return Err("request body must be a JSON object".to_string());
    };
    match read_only.iter().find(|field| object.contains_key(**field)) {
        Some(field) => Err(format!("{field} is read-only and cannot be set")),
        None => Ok(()),
    }
}
