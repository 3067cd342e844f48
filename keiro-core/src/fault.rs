//! # Faults
//!
//! A [`Fault`] is the structured, catchable error value shared by the expression
//! engine and tenant handlers. It carries a machine-readable `code`
//! (`namespace.kind.detail`), an optional human-readable `reason`, and an HTTP-ish
//! `status_code` used when the fault reaches a transport.
//!
//! Faults cross the boundary between Rust and expressions in both directions:
//! `$try` binds a raised fault as a value and `$throw` turns a value back into a
//! fault, so [`Fault::to_value`] and [`Fault::from_value`] are inverse operations.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::eval::value::Value;

pub const UNSPECIFIED: &str = "keiro.error.unspecified";
pub const INVALID_EXPRESSION: &str = "keiro.invalidArgument.expression";
pub const UNSUPPORTED_OPERATOR: &str = "keiro.unsupportedOperation.operator";
pub const UNKNOWN_VARIABLE: &str = "keiro.invalidArgument.unknownVariable";
pub const MAX_EXPRESSION_DEPTH: &str = "keiro.invalidArgument.maxExpressionDepth";
pub const MAX_CALL_DEPTH: &str = "keiro.invalidState.maxCallDepth";
pub const STORE_UNAVAILABLE: &str = "keiro.unsupportedOperation.store";
pub const STORE_ERROR: &str = "keiro.error.store";
pub const HANDLER_PANICKED: &str = "keiro.error.handlerPanicked";
pub const NOT_FOUND: &str = "keiro.notFound.operation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fault {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_status_code() -> u16 {
    500
}

impl Fault {
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        let status_code = status_for(&code);
        Self {
            code,
            reason: None,
            status_code,
            path: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Expression-facing representation, the shape `$$err` has inside `$try`.
    pub fn to_value(&self) -> Value {
        let mut object = IndexMap::new();
        object.insert("object".to_string(), Value::from("fault"));
        object.insert("code".to_string(), Value::from(self.code.as_str()));
        object.insert("errCode".to_string(), Value::from(self.code.as_str()));
        if let Some(reason) = &self.reason {
            object.insert("reason".to_string(), Value::from(reason.as_str()));
        }
        object.insert(
            "statusCode".to_string(),
            Value::Integer(i64::from(self.status_code)),
        );
        if let Some(path) = &self.path {
            object.insert("path".to_string(), Value::from(path.as_str()));
        }
        Value::Object(object)
    }

    /// Builds a fault from an error-code string or a structured descriptor.
    /// Returns `None` for values that describe neither.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(code) if !code.is_empty() => Some(Fault::new(code.as_str())),
            Value::Object(object) => {
                let code = ["code", "errCode"]
                    .iter()
                    .find_map(|key| match object.get(*key) {
                        Some(Value::String(code)) if !code.is_empty() => Some(code.clone()),
                        _ => None,
                    })?;
                let mut fault = Fault::new(code);
                if let Some(Value::String(reason)) = object.get("reason") {
                    fault.reason = Some(reason.clone());
                }
                if let Some(status) = object.get("statusCode").and_then(Value::as_f64) {
                    if (100.0..600.0).contains(&status) {
                        fault.status_code = status as u16;
                    }
                }
                if let Some(Value::String(path)) = object.get("path") {
                    fault.path = Some(path.clone());
                }
                Some(fault)
            }
            _ => None,
        }
    }
}

fn status_for(code: &str) -> u16 {
    match code.split('.').nth(1) {
        Some("invalidArgument") => 400,
        Some("accessDenied") => 403,
        Some("notFound") => 404,
        Some("conflict") => 409,
        Some("unsupportedOperation") => 501,
        _ => 500,
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} ({})", self.code, reason),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for Fault {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_from_code_namespace() {
        assert_eq!(Fault::new("axon.accessDenied.newOnly").status_code, 403);
        assert_eq!(Fault::new("keiro.invalidArgument.expression").status_code, 400);
        assert_eq!(Fault::new("E").status_code, 500);
    }

    #[test]
    fn test_value_descriptor_keeps_reason_and_status() {
        let fault = Fault::new("c_app.conflict.duplicate")
            .with_reason("already exists")
            .with_path("c_name");
        let restored = Fault::from_value(&fault.to_value()).unwrap();
        assert_eq!(restored, fault);
    }

    #[test]
    fn test_from_value_rejects_non_descriptors() {
        assert!(Fault::from_value(&Value::Integer(3)).is_none());
        assert!(Fault::from_value(&Value::from("")).is_none());
        assert!(Fault::from_value(&Value::Object(IndexMap::new())).is_none());
    }
}
