use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::error::{EvalError, EvalResult};
use super::node::VariableRef;
use super::value::Value;
use crate::principal::Principal;
use crate::store::ObjectStore;

pub const DEFAULT_MAX_DEPTH: usize = 100;
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Names resolved by the engine itself. User variables may not shadow them.
pub const SYSTEM_BINDINGS: [&str; 7] = [
    "ROOT", "CURRENT", "NOW", "RANDOM", "CONTEXT", "REMOVE", "VAR",
];

/// User variables introduced by `$let`, `$map`, `$filter`, `$reduce` and `$try`.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    variables: HashMap<String, Value>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent(parent: Arc<Scope>) -> Self {
        Self {
            variables: HashMap::new(),
            parent: Some(parent),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        match self.variables.get(name) {
            Some(value) => Some(value.clone()),
            None => self.parent.as_ref().and_then(|p| p.lookup(name)),
        }
    }
}

#[derive(Debug, Clone)]
struct Environment {
    now: DateTime<Utc>,
    principal: Principal,
    bindings: HashMap<String, Value>,
}

/// Everything an expression can observe: the current document, variables,
/// the acting principal, the object store for `$cursor`, the cancellation
/// token of the surrounding operation and the expression-depth guard.
///
/// Contexts are cheap to clone; every `with_*` call returns a derived context
/// and leaves the original untouched.
#[derive(Clone)]
pub struct EvaluationContext {
    root: Arc<Value>,
    scope: Arc<Scope>,
    environment: Arc<Environment>,
    store: Option<Arc<dyn ObjectStore>>,
    cancellation: Option<CancellationToken>,
    /// Values stored by `$var` stages, shared by every stage of one pipeline run.
    pipeline_vars: Option<Arc<DashMap<String, Value>>>,
    depth: usize,
    max_depth: usize,
    batch_size: usize,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EvaluationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("root", &self.root)
            .field("depth", &self.depth)
            .field("max_depth", &self.max_depth)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self {
            root: Arc::new(Value::Null),
            scope: Arc::new(Scope::new()),
            environment: Arc::new(Environment {
                now: Utc::now(),
                principal: Principal::anonymous(),
                bindings: HashMap::new(),
            }),
            store: None,
            cancellation: None,
            pipeline_vars: None,
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_root(&self, root: Value) -> Self {
        Self {
            root: Arc::new(root),
            ..self.clone()
        }
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Pushes a scope holding one user variable.
    pub fn with_variable(&self, name: impl Into<String>, value: Value) -> Self {
        let mut scope = Scope::with_parent(self.scope.clone());
        scope.insert(name, value);
        Self {
            scope: Arc::new(scope),
            ..self.clone()
        }
    }

    pub fn with_variables<I>(&self, variables: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut scope = Scope::with_parent(self.scope.clone());
        for (name, value) in variables {
            scope.insert(name, value);
        }
        Self {
            scope: Arc::new(scope),
            ..self.clone()
        }
    }

    /// Named binding supplied by the host, such as `OLD` or `PRINCIPAL`.
    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        Arc::make_mut(&mut self.environment)
            .bindings
            .insert(name.into(), value);
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        Arc::make_mut(&mut self.environment).principal = principal;
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        Arc::make_mut(&mut self.environment).now = now;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Gives a pipeline run its `$$VAR` store unless an enclosing run already
    /// provides one.
    pub fn with_pipeline_vars(&self) -> Self {
        match self.pipeline_vars {
            Some(_) => self.clone(),
            None => Self {
                pipeline_vars: Some(Arc::new(DashMap::new())),
                ..self.clone()
            },
        }
    }

    pub fn set_pipeline_var(&self, name: &str, value: Value) -> EvalResult<()> {
        let vars = self
            .pipeline_vars
            .as_ref()
            .ok_or_else(|| EvalError::shape("$var", "only valid inside a pipeline"))?;
        vars.insert(name.to_string(), value);
        Ok(())
    }

    fn pipeline_vars_value(&self) -> Value {
        let mut entries: Vec<(String, Value)> = self
            .pipeline_vars
            .iter()
            .flat_map(|vars| vars.iter().map(|e| (e.key().clone(), e.value().clone())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Value::Object(entries.into_iter().collect())
    }

    pub fn principal(&self) -> &Principal {
        &self.environment.principal
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.environment.now
    }

    pub fn store(&self) -> Option<&Arc<dyn ObjectStore>> {
        self.store.as_ref()
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(|t| t.is_cancelled())
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// One level deeper into the expression tree.
    pub fn enter(&self) -> EvalResult<Self> {
        if self.depth >= self.max_depth {
            return Err(EvalError::DepthExceeded {
                max: self.max_depth,
            });
        }
        Ok(Self {
            depth: self.depth + 1,
            ..self.clone()
        })
    }

    pub fn resolve(&self, variable: &VariableRef) -> EvalResult<Value> {
        match variable {
            VariableRef::Field(path) => Ok(self.root.get_path(path)),
            VariableRef::Binding { name, path } => {
                let value = self.lookup(name)?;
                Ok(match path {
                    Some(path) => value.get_path(path),
                    None => value,
                })
            }
        }
    }

    fn lookup(&self, name: &str) -> EvalResult<Value> {
        if let Some(value) = self.scope.lookup(name) {
            return Ok(value);
        }
        let value = match name {
            "ROOT" | "CURRENT" => self.root.as_ref().clone(),
            "NOW" => Value::Date(self.environment.now),
            "RANDOM" => Value::Float(rand::random::<f64>()),
            "REMOVE" => Value::Missing,
            "VAR" => self.pipeline_vars_value(),
            "CONTEXT" => Value::object([
                ("principal", self.environment.principal.to_value()),
                ("now", Value::Date(self.environment.now)),
            ]),
            other => self
                .environment
                .bindings
                .get(other)
                .cloned()
                .ok_or_else(|| EvalError::UnknownVariable {
                    name: other.to_string(),
                })?,
        };
        Ok(value)
    }
}

/// Validates a user variable name introduced by an operator.
pub fn check_variable_name(operator: &str, name: &str) -> EvalResult<()> {
    if name.is_empty()
        || name.starts_with('$')
        || name.contains('.')
        || SYSTEM_BINDINGS.contains(&name)
    {
        return Err(EvalError::shape(
            operator,
            format!("invalid variable name {:?}", name),
        ));
    }
    Ok(())
}
