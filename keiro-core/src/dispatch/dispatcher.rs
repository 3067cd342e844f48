use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use indexmap::IndexMap;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::error::DispatchError;
use super::handler::HandlerOutput;
use super::invocation::{Invocation, InvocationContext, Payload, RequestMeta};
use super::operation::{Operation, OperationRegistry, OperationState, OperationStatus};
use crate::config::RuntimeConfig;
use crate::event::{Event, EventBus, EventType};
use crate::eval::{EvaluationContext, ExpressionEvaluator, Value};
use crate::fault::{self, Fault};
use crate::principal::{Principal, PrincipalResolver};
use crate::registry::{
    Candidate, Discriminant, Method, Registration, Registry, Resolver, Selector, SlotKey,
};
use crate::schedule::lock::JobLease;
use crate::store::ObjectStore;

/// What one firing did.
#[derive(Debug, Default)]
pub struct FireOutcome {
    /// Slots of every handler that ran or was queued, in execution order.
    pub handlers: Vec<SlotKey>,
    /// Outputs of inline handlers, in execution order.
    pub results: Vec<HandlerOutput>,
    /// Operations queued for async handlers.
    pub operations: Vec<Uuid>,
    /// Set when a policy returned a non-null output and stopped the chain.
    pub halted: bool,
}

impl FireOutcome {
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn output(&self) -> Option<&HandlerOutput> {
        self.results.last()
    }
}

/// An HTTP request as handed over by the transport.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub method: Method,
    pub path: String,
    pub headers: IndexMap<String, String>,
    pub body: Value,
    pub principal: Option<Principal>,
}

impl RouteRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: IndexMap::new(),
            body: Value::Null,
            principal: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    fn payload(&self) -> Payload {
        let payload = Payload::new().with_request(RequestMeta {
            method: self.method,
            path: self.path.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
        });
        match &self.principal {
            Some(principal) => payload.with_principal(principal.clone()),
            None => payload,
        }
    }
}

struct DispatcherInner {
    registry: Arc<Registry>,
    resolver: Resolver,
    evaluator: ExpressionEvaluator,
    operations: Arc<OperationRegistry>,
    event_bus: Arc<EventBus>,
    principals: Option<Arc<dyn PrincipalResolver>>,
    store: Option<Arc<dyn ObjectStore>>,
    workers: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
    config: RuntimeConfig,
}

/// Runs resolved handlers: inline ones in the caller's task, async ones on
/// the worker pool as tracked operations.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("in_flight", &self.inner.in_flight.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        config: RuntimeConfig,
        registry: Arc<Registry>,
        event_bus: Arc<EventBus>,
        store: Option<Arc<dyn ObjectStore>>,
        principals: Option<Arc<dyn PrincipalResolver>>,
    ) -> Self {
        let evaluator = ExpressionEvaluator::new();
        let operations = Arc::new(OperationRegistry::new(event_bus.clone(), store.clone()));
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                resolver: Resolver::new(evaluator),
                evaluator,
                operations,
                event_bus,
                principals,
                store,
                workers: Arc::new(Semaphore::new(config.dispatch.worker_pool_size)),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                config,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn operations(&self) -> &Arc<OperationRegistry> {
        &self.inner.operations
    }

    pub fn evaluator(&self) -> ExpressionEvaluator {
        self.inner.evaluator
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.event_bus
    }

    /// Evaluation context every guard and handler expression starts from.
    pub fn base_context(&self) -> EvaluationContext {
        let ctx = EvaluationContext::new()
            .with_max_depth(self.inner.config.evaluation.max_depth)
            .with_batch_size(self.inner.config.evaluation.cursor_batch_size);
        match &self.inner.store {
            Some(store) => ctx.with_store(store.clone()),
            None => ctx,
        }
    }

    /// Fires `discriminant` from outside any handler.
    #[instrument(level = "debug", skip(self, payload), fields(discriminant = %discriminant))]
    pub async fn fire(
        &self,
        discriminant: Discriminant,
        payload: Payload,
    ) -> Result<FireOutcome, DispatchError> {
        self.dispatch(InvocationContext::root(discriminant, payload))
            .await
    }

    /// Invokes the registration occupying `slot` directly, bypassing
    /// discriminant matching. Its guard still applies.
    pub async fn invoke_slot(
        &self,
        slot: &SlotKey,
        payload: Payload,
    ) -> Result<FireOutcome, DispatchError> {
        let table = self.inner.registry.snapshot();
        let Some(registration) = table.find(slot) else {
            return Ok(FireOutcome::default());
        };
        let context = InvocationContext::root(registration.discriminant.clone(), payload);
        let candidates = self
            .inner
            .resolver
            .resolve(
                &table,
                slot.kind,
                Selector::Signature(slot),
                &context,
                &self.base_context(),
            )
            .await?;
        self.execute_candidates(candidates, context, false).await
    }

    pub(crate) async fn dispatch(
        &self,
        context: InvocationContext,
    ) -> Result<FireOutcome, DispatchError> {
        self.dispatch_with(context, false).await
    }

    async fn dispatch_with(
        &self,
        context: InvocationContext,
        halt_on_output: bool,
    ) -> Result<FireOutcome, DispatchError> {
        self.check_depth(&context)?;
        let candidates = self.resolve(&context).await?;
        self.execute_candidates(candidates, context, halt_on_output)
            .await
    }

    fn check_depth(&self, context: &InvocationContext) -> Result<(), DispatchError> {
        if let Some(max) = self.inner.config.dispatch.max_depth {
            if context.depth > max {
                warn!(depth = context.depth, max, discriminant = %context.discriminant, "dispatch depth ceiling reached");
                return Err(DispatchError::DepthExceeded {
                    depth: context.depth,
                    max,
                });
            }
        }
        Ok(())
    }

    pub(crate) async fn resolve(
        &self,
        context: &InvocationContext,
    ) -> Result<Vec<Candidate>, DispatchError> {
        let table = self.inner.registry.snapshot();
        self.inner
            .resolver
            .resolve(
                &table,
                context.discriminant.kind(),
                Selector::Discriminant(&context.discriminant),
                context,
                &self.base_context(),
            )
            .await
    }

    async fn execute_candidates(
        &self,
        candidates: Vec<Candidate>,
        context: InvocationContext,
        halt_on_output: bool,
    ) -> Result<FireOutcome, DispatchError> {
        let mut outcome = FireOutcome::default();
        for candidate in candidates {
            let registration = candidate.registration;
            let ctx = self
                .run_as(&registration, context.clone().with_params(&candidate.params))
                .await;
            outcome.handlers.push(registration.slot_key());
            if registration.inline {
                let output = self.invoke_inline(registration, ctx).await?;
                let halt = halt_on_output && !output.is_null();
                outcome.results.push(output);
                if halt {
                    outcome.halted = true;
                    break;
                }
            } else {
                let uuid = self.submit(registration, ctx, None).await;
                outcome.operations.push(uuid);
            }
        }
        Ok(outcome)
    }

    /// Applies the registration's declared run-as principal.
    async fn run_as(
        &self,
        registration: &Registration,
        mut context: InvocationContext,
    ) -> InvocationContext {
        let Some(id) = &registration.principal else {
            return context;
        };
        let resolved = match &self.inner.principals {
            Some(resolver) => resolver.resolve(id).await,
            None => Some(Principal::account(id.as_str())),
        };
        match resolved {
            Some(principal) => context.principal = principal,
            None => warn!(
                handler = %registration.describe(),
                principal = %id,
                "run-as principal not found, keeping caller"
            ),
        }
        context
    }

    async fn invoke_inline(
        &self,
        registration: Arc<Registration>,
        context: InvocationContext,
    ) -> Result<HandlerOutput, DispatchError> {
        debug!(handler = %registration.describe(), depth = context.depth, "invoking inline");
        let invocation = Invocation::new(self.clone(), registration.clone(), context, None);
        guarded(registration.handler.invoke(invocation))
            .await
            .map_err(|fault| DispatchError::Handler {
                handler: registration.describe(),
                fault,
            })
    }

    /// Queues a job run that holds `lease` until it finishes.
    pub(crate) async fn submit_job(
        &self,
        registration: Arc<Registration>,
        context: InvocationContext,
        lease: JobLease,
    ) -> Uuid {
        let context = self.run_as(&registration, context).await;
        self.submit(registration, context, Some(lease)).await
    }

    /// Queues `registration` as an operation. `lease` is held until the
    /// operation and its completion handler have finished.
    pub(crate) async fn submit(
        &self,
        registration: Arc<Registration>,
        mut context: InvocationContext,
        lease: Option<JobLease>,
    ) -> Uuid {
        // siblings from one firing must not share a token
        context.cancellation = context.cancellation.child_token();
        let operation = self
            .inner
            .operations
            .create(&registration, context.depth, context.cancellation.clone())
            .await;
        let uuid = operation.uuid();
        context.operation = Some(uuid);
        debug!(handler = %registration.describe(), %uuid, "queued operation");

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher
                .execute(registration, context, operation, lease)
                .await;
            if dispatcher.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                dispatcher.inner.idle.notify_waiters();
            }
        });
        uuid
    }

    async fn execute(
        &self,
        registration: Arc<Registration>,
        context: InvocationContext,
        operation: Arc<Operation>,
        lease: Option<JobLease>,
    ) {
        let _permit = self.inner.workers.clone().acquire_owned().await.ok();
        let (state, fault) = if operation.is_cancelled() {
            (OperationState::Cancelled, None)
        } else {
            self.inner.operations.start(&operation).await;
            let invocation = Invocation::new(
                self.clone(),
                registration.clone(),
                context.clone(),
                Some(operation.clone()),
            );
            let result = guarded(registration.handler.invoke(invocation)).await;
            match (result, operation.is_cancelled()) {
                (Ok(_), false) => (OperationState::Completed, None),
                (Ok(_), true) => (OperationState::Cancelled, None),
                (Err(fault), true) => (OperationState::Cancelled, Some(fault)),
                (Err(fault), false) => {
                    error!(
                        handler = %registration.describe(),
                        uuid = %operation.uuid(),
                        code = %fault.code,
                        "async handler failed: {}",
                        fault
                    );
                    let event = Event::new(EventType::HandlerFailed {
                        handler: registration.describe(),
                    })
                    .with_parameter("fault", fault.to_value());
                    if let Err(e) = self.inner.event_bus.publish(event) {
                        debug!(error = %e, "handler failure event dropped");
                    }
                    (OperationState::Failed, Some(fault))
                }
            }
        };
        let status = self
            .inner
            .operations
            .finish(&operation, state, fault)
            .await;
        self.complete(&registration, context, &operation, &status)
            .await;
        drop(lease);
    }

    /// Runs the completion handler, at most once per operation.
    async fn complete(
        &self,
        registration: &Arc<Registration>,
        mut context: InvocationContext,
        operation: &Arc<Operation>,
        status: &OperationStatus,
    ) {
        let Some(on_complete) = registration.on_complete.clone() else {
            return;
        };
        if !operation.claim_completion() {
            return;
        }
        context.arguments = Value::object([
            ("operation", Value::ObjectId(status.uuid)),
            ("cancelled", Value::Boolean(status.cancelled)),
            ("state", Value::from(status.state.to_string())),
            (
                "error",
                status
                    .fault
                    .as_ref()
                    .map(Fault::to_value)
                    .unwrap_or(Value::Null),
            ),
        ]);
        let invocation = Invocation::new(
            self.clone(),
            registration.clone(),
            context,
            Some(operation.clone()),
        );
        if let Err(fault) = guarded(on_complete.invoke(invocation)).await {
            error!(
                handler = %registration.describe(),
                uuid = %status.uuid,
                "completion handler failed: {}",
                fault
            );
        }
    }

    /// Serves one HTTP request: matching policies first, in ascending
    /// weight, then the route. A policy with a non-null output answers the
    /// request itself. `None` means no route matched.
    #[instrument(level = "debug", skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn handle_request(
        &self,
        request: RouteRequest,
    ) -> Result<Option<HandlerOutput>, DispatchError> {
        let payload = request.payload();
        let policies = self
            .dispatch_with(
                InvocationContext::root(
                    Discriminant::policy(request.method, request.path.as_str()),
                    payload.clone(),
                ),
                true,
            )
            .await?;
        if policies.halted {
            return Ok(policies.results.into_iter().last());
        }
        let route = self
            .fire(Discriminant::route(request.method, request.path.as_str()), payload)
            .await?;
        Ok(route.results.into_iter().next())
    }

    pub async fn find_operation(&self, uuid: Uuid) -> Option<OperationStatus> {
        self.inner.operations.find(uuid).await
    }

    pub async fn cancel(&self, uuid: Uuid) -> Result<OperationStatus, DispatchError> {
        self.inner.operations.cancel(uuid).await
    }

    /// Number of operations spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until every spawned operation, completion handlers included,
    /// has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Cancels every unfinished operation.
    pub async fn cancel_all(&self) {
        for status in self.inner.operations.active().await {
            if let Err(e) = self.cancel(status.uuid).await {
                debug!(uuid = %status.uuid, error = %e, "cancel during shutdown failed");
            }
        }
    }
}

/// Awaits a handler future, turning a panic into a fault.
async fn guarded<F>(future: F) -> Result<HandlerOutput, Fault>
where
    F: std::future::Future<Output = Result<HandlerOutput, Fault>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(Fault::new(fault::HANDLER_PANICKED).with_reason(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{HandlerRef, handler_fn};
    use crate::principal::MockPrincipalResolver;
    use crate::registry::HandlerKind;
    use crate::system::Runtime;
    use serde_json::json;

    async fn fire_as(resolver: MockPrincipalResolver) -> Value {
        let runtime = Runtime::with_collaborators(
            RuntimeConfig::default(),
            None,
            Some(Arc::new(resolver)),
            None,
        );
        runtime
            .load(|loader| {
                loader.module("a").register_handler(
                    HandlerKind::Event,
                    "whoami",
                    json!({ "event": "whoami", "inline": true, "principal": "svc" }),
                    HandlerRef::Direct(handler_fn(|inv: Invocation| async move {
                        Ok(Value::from(inv.principal().id.clone()))
                    })),
                )?;
                Ok(())
            })
            .await
            .unwrap();
        let outcome = runtime
            .fire(
                Discriminant::event("whoami"),
                Payload::new().with_principal(Principal::account("alice")),
            )
            .await
            .unwrap();
        outcome.output().unwrap().clone().into_value()
    }

    #[tokio::test]
    async fn test_run_as_uses_resolver() {
        let mut resolver = MockPrincipalResolver::new();
        resolver
            .expect_resolve()
            .withf(|id| id == "svc")
            .times(1)
            .returning(|id| Some(Principal::system().with_roles([id])));
        assert_eq!(fire_as(resolver).await, Value::from("system"));
    }

    #[tokio::test]
    async fn test_unknown_run_as_keeps_caller() {
        let mut resolver = MockPrincipalResolver::new();
        resolver.expect_resolve().times(1).returning(|_| None);
        assert_eq!(fire_as(resolver).await, Value::from("alice"));
    }
}
