use std::sync::Arc;

use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::dispatcher::{Dispatcher, FireOutcome};
use super::error::DispatchError;
use super::operation::Operation;
use crate::eval::{
    BoxCursor, EvalResult, EvaluationContext, ExpressionNode, IterCursor, Stage, Value,
};
use crate::principal::Principal;
use crate::registry::{Discriminant, Method, Params, Registration};

/// The entity a lifecycle event is about, with its pre/post state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    pub object: String,
    pub id: Option<String>,
    pub old: Option<Value>,
    pub new: Option<Value>,
    /// Dotted paths changed by the write.
    pub modified: Vec<String>,
}

impl Target {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_old(mut self, old: Value) -> Self {
        self.old = Some(old);
        self
    }

    pub fn with_new(mut self, new: Value) -> Self {
        self.new = Some(new);
        self
    }

    pub fn with_modified<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modified = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Whether any modified path overlaps `path` (one is a prefix of the other).
    pub fn touches(&self, path: &str) -> bool {
        self.modified.iter().any(|m| overlaps(m, path))
    }
}

fn overlaps(a: &str, b: &str) -> bool {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    long == short || (long.starts_with(short) && long[short.len()..].starts_with('.'))
}

/// Transport-facing request metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMeta {
    pub method: Method,
    pub path: String,
    pub headers: IndexMap<String, String>,
    pub body: Value,
}

impl RequestMeta {
    pub fn to_value(&self) -> Value {
        Value::object([
            ("method", Value::from(self.method.to_string())),
            ("path", Value::from(self.path.as_str())),
            (
                "headers",
                Value::Object(
                    self.headers
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                        .collect(),
                ),
            ),
            ("body", self.body.clone()),
        ])
    }
}

/// What the firing side supplies along with a discriminant.
#[derive(Debug, Clone, Default)]
pub struct Payload {
    pub principal: Option<Principal>,
    pub target: Option<Target>,
    pub arguments: Value,
    pub request: Option<RequestMeta>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_arguments(mut self, arguments: impl Into<Value>) -> Self {
        self.arguments = arguments.into();
        self
    }

    pub fn with_request(mut self, request: RequestMeta) -> Self {
        self.request = Some(request);
        self
    }
}

/// Per-firing state. Each nested firing derives a context one level deeper
/// with a child cancellation token.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub depth: usize,
    pub principal: Principal,
    pub original_principal: Principal,
    pub discriminant: Discriminant,
    pub target: Option<Target>,
    pub arguments: Value,
    pub request: Option<RequestMeta>,
    pub cancellation: CancellationToken,
    pub operation: Option<Uuid>,
}

impl InvocationContext {
    /// Context of a firing from outside any handler. The caller sits at depth
    /// 0, so the firing runs at depth 1.
    pub fn root(discriminant: Discriminant, payload: Payload) -> Self {
        let principal = payload.principal.unwrap_or_else(Principal::anonymous);
        Self {
            depth: 1,
            original_principal: principal.clone(),
            principal,
            discriminant,
            target: payload.target,
            arguments: payload.arguments,
            request: payload.request,
            cancellation: CancellationToken::new(),
            operation: None,
        }
    }

    /// Context of a firing made from inside a handler running in `self`.
    pub fn descend(&self, discriminant: Discriminant, payload: Payload) -> Self {
        Self {
            depth: self.depth + 1,
            principal: payload.principal.unwrap_or_else(|| self.principal.clone()),
            original_principal: self.original_principal.clone(),
            discriminant,
            target: payload.target,
            arguments: payload.arguments,
            request: payload.request.or_else(|| self.request.clone()),
            cancellation: self.cancellation.child_token(),
            operation: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Same firing, with `params` merged into the arguments under `params`.
    pub(crate) fn with_params(mut self, params: &Params) -> Self {
        if params.is_empty() {
            return self;
        }
        let params = Value::Object(
            params
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                .collect(),
        );
        match &mut self.arguments {
            Value::Object(arguments) => {
                arguments.insert("params".to_string(), params);
            }
            _ => self.arguments = Value::object([("params", params)]),
        }
        self
    }

    /// Evaluation context for guards and handler expressions.
    ///
    /// The current document is the post-state, falling back to the pre-state,
    /// the request body and finally the arguments.
    pub fn guard_context(&self, base: &EvaluationContext) -> EvaluationContext {
        let old = self.target.as_ref().and_then(|t| t.old.clone());
        let new = self.target.as_ref().and_then(|t| t.new.clone());
        let root = new
            .clone()
            .or_else(|| old.clone())
            .or_else(|| self.request.as_ref().map(|r| r.body.clone()))
            .unwrap_or_else(|| self.arguments.clone());
        let script = Value::object([
            ("depth", Value::Integer(self.depth as i64)),
            ("kind", Value::from(self.discriminant.kind().to_string())),
            ("event", Value::from(self.discriminant.to_string())),
            ("originalPrincipal", self.original_principal.to_value()),
            (
                "operation",
                self.operation.map(Value::ObjectId).unwrap_or(Value::Null),
            ),
        ]);
        base.with_root(root)
            .with_principal(self.principal.clone())
            .with_cancellation(self.cancellation.clone())
            .with_binding("OLD", old.unwrap_or(Value::Null))
            .with_binding("NEW", new.unwrap_or(Value::Null))
            .with_binding("PRINCIPAL", self.principal.to_value())
            .with_binding(
                "REQUEST",
                self.request
                    .as_ref()
                    .map(RequestMeta::to_value)
                    .unwrap_or(Value::Null),
            )
            .with_binding("ARGS", self.arguments.clone())
            .with_binding("SCRIPT", script)
    }
}

/// Handed to a [`Handler`](super::Handler) when it runs.
#[derive(Clone)]
pub struct Invocation {
    pub context: InvocationContext,
    pub registration: Arc<Registration>,
    dispatcher: Dispatcher,
    operation: Option<Arc<Operation>>,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("context", &self.context)
            .field("handler", &self.registration.describe())
            .finish_non_exhaustive()
    }
}

impl Invocation {
    pub(crate) fn new(
        dispatcher: Dispatcher,
        registration: Arc<Registration>,
        context: InvocationContext,
        operation: Option<Arc<Operation>>,
    ) -> Self {
        Self {
            context,
            registration,
            dispatcher,
            operation,
        }
    }

    pub fn depth(&self) -> usize {
        self.context.depth
    }

    pub fn principal(&self) -> &Principal {
        &self.context.principal
    }

    pub fn arguments(&self) -> &Value {
        &self.context.arguments
    }

    pub fn target(&self) -> Option<&Target> {
        self.context.target.as_ref()
    }

    pub fn request(&self) -> Option<&RequestMeta> {
        self.context.request.as_ref()
    }

    /// Captured route parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.context
            .arguments
            .as_object()
            .and_then(|a| a.get("params"))
            .and_then(|p| p.as_object())
            .and_then(|p| p.get(name))
            .and_then(Value::as_str)
    }

    pub fn operation_id(&self) -> Option<Uuid> {
        self.context.operation
    }

    pub fn is_cancelled(&self) -> bool {
        self.context.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.context.cancellation
    }

    pub fn set_progress(&self, progress: u64) {
        if let Some(operation) = &self.operation {
            operation.set_progress(progress);
        }
    }

    /// Fires a nested event one level deeper than this invocation.
    pub async fn fire(
        &self,
        discriminant: Discriminant,
        payload: Payload,
    ) -> Result<FireOutcome, DispatchError> {
        let context = self.context.descend(discriminant, payload);
        self.dispatcher.dispatch(context).await
    }

    /// Runs subsequent work of this invocation as `principal`.
    pub fn elevate(&self, principal: Principal) -> Self {
        let mut elevated = self.clone();
        elevated.context.principal = principal;
        elevated
    }

    pub fn evaluation_context(&self) -> EvaluationContext {
        self.context.guard_context(&self.dispatcher.base_context())
    }

    /// Evaluates a JSON expression with script-facing normalization.
    pub async fn evaluate(&self, expression: &serde_json::Value) -> EvalResult<Value> {
        let node = ExpressionNode::parse(expression)?;
        self.dispatcher
            .evaluator()
            .evaluate_for_script(&node, &self.evaluation_context())
            .await
    }

    /// Runs `stages` over `input`, stopping when this invocation is cancelled.
    pub fn run(&self, stages: &[Stage], input: Vec<Value>) -> BoxCursor {
        self.dispatcher.evaluator().run(
            stages,
            IterCursor::boxed(input),
            &self.evaluation_context(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Action, When};
    use serde_json::json;

    #[test]
    fn test_descend_increments_depth_and_links_cancellation() {
        let root = InvocationContext::root(
            Discriminant::event("a"),
            Payload::new().with_principal(Principal::account("u1")),
        );
        assert_eq!(root.depth, 1);
        let child = root.descend(Discriminant::event("b"), Payload::new());
        assert_eq!(child.depth, 2);
        assert_eq!(child.principal.id, "u1");
        root.cancellation.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_guard_context_prefers_post_state() {
        let target = Target::new("c_order")
            .with_old(Value::from(json!({ "status": "open" })))
            .with_new(Value::from(json!({ "status": "closed" })));
        let ctx = InvocationContext::root(
            Discriminant::trigger("c_order", When::After, Action::Update),
            Payload::new().with_target(target),
        )
        .guard_context(&EvaluationContext::new());
        assert_eq!(ctx.root().get_path("status"), Value::from("closed"));
    }

    #[test]
    fn test_params_merge_into_arguments() {
        let mut params = Params::new();
        params.insert("id".into(), "42".into());
        let ctx = InvocationContext::root(
            Discriminant::route(Method::Get, "/orders/42"),
            Payload::new().with_arguments(json!({ "q": 1 })),
        )
        .with_params(&params);
        assert_eq!(ctx.arguments.get_path("params.id"), Value::from("42"));
        assert_eq!(ctx.arguments.get_path("q"), Value::Integer(1));
    }

    #[test]
    fn test_modified_path_overlap() {
        let target = Target::new("c_order").with_modified(["address.city", "total"]);
        assert!(target.touches("address"));
        assert!(target.touches("address.city.zip"));
        assert!(target.touches("total"));
        assert!(!target.touches("totals"));
        assert!(!target.touches("name"));
    }
}
