//! Object store collaborator.
//!
//! The engine never owns persistent data. It talks to the store through
//! [`ObjectStore`] for two things: live queries backing the `$cursor` stage and
//! durable status records of asynchronous operations. [`InMemoryObjectStore`]
//! is the reference implementation used by tests and the CLI.

mod memory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::dispatch::operation::OperationStatus;
use crate::eval::value::Value;

pub use memory::InMemoryObjectStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("unknown object: {0}")]
    UnknownObject(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("query is closed")]
    Closed,
    #[error("store failure: {0}")]
    Backend(String),
}

/// Options of a live query, as written in a `$cursor` stage.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryOptions {
    pub object: String,
    /// Field equality filter. `Null` matches everything.
    pub filter: Value,
    pub limit: Option<usize>,
    pub skip: usize,
    pub batch_size: Option<usize>,
}

impl QueryOptions {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            ..Default::default()
        }
    }

    pub fn from_value(value: &Value) -> StoreResult<Self> {
        let Value::Object(options) = value else {
            return Err(StoreError::InvalidQuery(format!(
                "expected an object, got {}",
                value.type_name()
            )));
        };
        let object = match options.get("object") {
            Some(Value::String(object)) if !object.is_empty() => object.clone(),
            _ => return Err(StoreError::InvalidQuery("object is required".to_string())),
        };
        let count = |key: &str| -> StoreResult<Option<usize>> {
            match options.get(key) {
                None | Some(Value::Null) | Some(Value::Missing) => Ok(None),
                Some(v) => v
                    .as_i64()
                    .filter(|n| *n >= 0)
                    .map(|n| Some(n as usize))
                    .ok_or_else(|| StoreError::InvalidQuery(format!("{key} must be a count"))),
            }
        };
        let filter = match options.get("where") {
            None | Some(Value::Null) | Some(Value::Missing) => Value::Null,
            Some(filter @ Value::Object(_)) => filter.clone(),
            Some(other) => {
                return Err(StoreError::InvalidQuery(format!(
                    "where must be an object, got {}",
                    other.type_name()
                )));
            }
        };
        Ok(Self {
            object,
            filter,
            limit: count("limit")?,
            skip: count("skip")?.unwrap_or(0),
            batch_size: count("batchSize")?,
        })
    }

    /// Whether `document` satisfies the equality filter.
    pub fn matches(&self, document: &Value) -> bool {
        match &self.filter {
            Value::Object(conditions) => conditions
                .iter()
                .all(|(path, expected)| document.get_path(path).deep_equals(expected)),
            _ => true,
        }
    }
}

/// An open server-side query, pulled in batches.
#[async_trait]
pub trait LiveQuery: Send + Sync {
    /// Up to `batch_size` further documents; an empty batch means exhausted.
    async fn fetch(&mut self, batch_size: usize) -> StoreResult<Vec<Value>>;
    async fn close(&mut self) -> StoreResult<()>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn open(&self, options: QueryOptions) -> StoreResult<Box<dyn LiveQuery>>;
    async fn save_operation(&self, status: &OperationStatus) -> StoreResult<()>;
    async fn load_operation(&self, uuid: Uuid) -> StoreResult<Option<OperationStatus>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_from_stage_value() {
        let options = QueryOptions::from_value(&Value::from(json!({
            "object": "c_order",
            "where": { "status": "open" },
            "limit": 5,
            "batchSize": 2
        })))
        .unwrap();
        assert_eq!(options.object, "c_order");
        assert_eq!(options.limit, Some(5));
        assert_eq!(options.batch_size, Some(2));
        assert!(options.matches(&Value::from(json!({ "status": "open", "n": 1 }))));
        assert!(!options.matches(&Value::from(json!({ "status": "closed" }))));
    }

    #[test]
    fn test_options_require_object() {
        let err = QueryOptions::from_value(&Value::from(json!({ "limit": 1 }))).unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
        let err = QueryOptions::from_value(&Value::from(json!({ "object": "a", "limit": -1 })))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidQuery(_)));
    }
}
