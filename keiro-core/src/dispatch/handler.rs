use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::invocation::Invocation;
use crate::eval::value::Value;
use crate::fault::Fault;

/// What a handler hands back. Routes may redirect instead of returning a body.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    Value(Value),
    Redirect {
        status_code: u16,
        location: String,
        body: Value,
    },
}

impl HandlerOutput {
    pub fn redirect(location: impl Into<String>) -> Self {
        HandlerOutput::Redirect {
            status_code: 302,
            location: location.into(),
            body: Value::Null,
        }
    }

    /// `null` and missing outputs do not halt a policy chain.
    pub fn is_null(&self) -> bool {
        matches!(self, HandlerOutput::Value(v) if v.is_nullish())
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            HandlerOutput::Value(v) => Some(v),
            HandlerOutput::Redirect { .. } => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            HandlerOutput::Value(v) => v,
            HandlerOutput::Redirect {
                status_code,
                location,
                body,
            } => Value::object([
                ("statusCode", Value::Integer(status_code as i64)),
                ("location", Value::String(location)),
                ("body", body),
            ]),
        }
    }
}

impl From<Value> for HandlerOutput {
    fn from(value: Value) -> Self {
        HandlerOutput::Value(value)
    }
}

impl Default for HandlerOutput {
    fn default() -> Self {
        HandlerOutput::Value(Value::Null)
    }
}

/// A callable tenant handler. The script host supplies these when a module
/// registers its handlers.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutput, Fault>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut, R> Handler for FnHandler<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Fault>> + Send + 'static,
    R: Into<HandlerOutput> + Send + 'static,
{
    async fn invoke(&self, invocation: Invocation) -> Result<HandlerOutput, Fault> {
        (self.0)(invocation).await.map(Into::into)
    }
}

/// Wraps an async closure as a [`Handler`].
pub fn handler_fn<F, Fut, R>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Fault>> + Send + 'static,
    R: Into<HandlerOutput> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// How a module refers to the function behind a registration.
#[derive(Clone)]
pub enum HandlerRef {
    Direct(Arc<dyn Handler>),
    /// Looked up among the module's own definitions, then through the
    /// [`ScriptHost`].
    Named(String),
}

impl std::fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerRef::Direct(_) => f.write_str("Direct(..)"),
            HandlerRef::Named(name) => f.debug_tuple("Named").field(name).finish(),
        }
    }
}

/// Script host collaborator: resolves function names exported by a module.
#[cfg_attr(test, mockall::automock)]
pub trait ScriptHost: Send + Sync {
    fn resolve(&self, resource: &str, name: &str) -> Option<Arc<dyn Handler>>;
}
