//! Pluggable payload schema checks

use std::collections::HashMap;

use serde_json::value::RawValue;
use serde_json::{Map, Value};

/// Schema check applied to every admitted payload
///
/// The adapter has already verified that the payload is well-formed JSON and
/// within the size limit; validators add topic-specific rules on top. Return
/// `Err(reason)` to reject with `InvalidPayload`.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, topic: &str, payload: &RawValue) -> Result<(), String>;
}

impl<F> PayloadValidator for F
where
    F: Fn(&str, &RawValue) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, topic: &str, payload: &RawValue) -> Result<(), String> {
        self(topic, payload)
    }
}

/// Accepts any well-formed JSON payload
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl PayloadValidator for AcceptAll {
    fn validate(&self, _topic: &str, _payload: &RawValue) -> Result<(), String> {
        Ok(())
    }
}

/// Requires payloads on selected topics to be JSON objects with given keys
///
/// Topics without a rule are accepted as-is.
#[derive(Debug, Clone, Default)]
pub struct RequiredFields {
    rules: HashMap<String, Vec<String>>,
}

impl RequiredFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `fields` on every payload published to `topic`
    pub fn require<I, S>(mut self, topic: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules
            .entry(topic.into())
            .or_default()
            .extend(fields.into_iter().map(Into::into));
        self
    }
}

impl PayloadValidator for RequiredFields {
    fn validate(&self, topic: &str, payload: &RawValue) -> Result<(), String> {
        let Some(fields) = self.rules.get(topic) else {
            return Ok(());
        };

        let object: Map<String, Value> = serde_json::from_str(payload.get())
            .map_err(|_| format!("payload for '{}' must be a JSON object", topic))?;

        match fields.iter().find(|field| !object.contains_key(field.as_str())) {
            Some(missing) => Err(format!("missing required field '{}'", missing)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).unwrap()
    }

    #[test]
    fn test_accept_all() {
        assert!(AcceptAll.validate("depth", &raw("null")).is_ok());
    }

    #[test]
    fn test_required_fields() {
        let validator = RequiredFields::new().require("depth", ["sensor1", "sensor2"]);

        assert!(validator
            .validate("depth", &raw(r#"{"sensor1":1,"sensor2":2}"#))
            .is_ok());

        let err = validator
            .validate("depth", &raw(r#"{"sensor1":1}"#))
            .unwrap_err();
        assert!(err.contains("sensor2"));

        // Not an object
        assert!(validator.validate("depth", &raw("[1,2]")).is_err());

        // Topic without a rule
        assert!(validator.validate("winch", &raw("42")).is_ok());
    }

    #[test]
    fn test_closure_validator() {
        let validator = |topic: &str, _payload: &RawValue| {
            if topic.starts_with("private/") {
                Err("private topics are read-only".to_string())
            } else {
                Ok(())
            }
        };

        assert!(validator.validate("depth", &raw("1")).is_ok());
        assert!(validator.validate("private/x", &raw("1")).is_err());
    }
}
