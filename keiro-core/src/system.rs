use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::dispatch::{
    DispatchError, Dispatcher, FireOutcome, HandlerOutput, OperationStatus, Payload, RouteRequest,
    ScriptHost,
};
use crate::error::InternalResult;
use crate::eval::{BoxCursor, ExpressionNode, IterCursor, Stage, Value};
use crate::event::{Event, EventBus, EventType};
use crate::principal::PrincipalResolver;
use crate::registry::{ConfigurationError, Discriminant, ModuleLoader, Registry, RegistryTable};
use crate::schedule::{JobFiring, JobLocks, JobRunner, Scheduler};
use crate::store::ObjectStore;

/// Everything a host needs to run handlers: the registry, the dispatcher,
/// the event bus and the job scheduler, wired from one [`RuntimeConfig`].
pub struct Runtime {
    config: RuntimeConfig,
    registry: Arc<Registry>,
    event_bus: Arc<EventBus>,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    host: Option<Arc<dyn ScriptHost>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_collaborators(config, None, None, None)
    }

    pub fn with_collaborators(
        config: RuntimeConfig,
        store: Option<Arc<dyn ObjectStore>>,
        principals: Option<Arc<dyn PrincipalResolver>>,
        host: Option<Arc<dyn ScriptHost>>,
    ) -> Self {
        let registry = Arc::new(Registry::new(config.environment.clone()));
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let dispatcher = Dispatcher::new(
            config.clone(),
            registry.clone(),
            event_bus.clone(),
            store,
            principals,
        );
        let runner = JobRunner::new(
            dispatcher.clone(),
            JobLocks::new(config.scheduler.lock_ttl),
            config.scheduler.lock_refresh_interval,
        );
        Self {
            config,
            registry,
            event_bus,
            dispatcher,
            scheduler: Scheduler::new(runner),
            host,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Builds a fresh registry table with `build` and installs it atomically.
    /// On error the current table stays in place.
    pub async fn load<F>(&self, build: F) -> InternalResult<Arc<RegistryTable>>
    where
        F: FnOnce(&mut ModuleLoader) -> Result<(), ConfigurationError>,
    {
        let mut loader = ModuleLoader::new(self.config.environment.clone());
        if let Some(host) = &self.host {
            loader = loader.with_host(host.clone());
        }
        build(&mut loader)?;
        let table = self.registry.install(loader.finish());
        let event = Event::new(EventType::RegistryReloaded {
            version: table.version(),
        })
        .with_parameter("handlers", Value::from(table.len() as i64));
        if let Err(e) = self.event_bus.publish(event) {
            debug!(error = %e, "reload event dropped");
        }
        self.scheduler.refresh().await;
        Ok(table)
    }

    pub async fn fire(
        &self,
        discriminant: Discriminant,
        payload: Payload,
    ) -> Result<FireOutcome, DispatchError> {
        self.dispatcher.fire(discriminant, payload).await
    }

    pub async fn handle_request(
        &self,
        request: RouteRequest,
    ) -> Result<Option<HandlerOutput>, DispatchError> {
        self.dispatcher.handle_request(request).await
    }

    /// Runs the job `name` now, outside its cron schedule.
    pub async fn run_job(&self, name: &str) -> Result<JobFiring, DispatchError> {
        self.scheduler.runner().fire(name).await
    }

    /// Evaluates a JSON expression against `root` the way scripts see it.
    pub async fn evaluate(
        &self,
        expression: &serde_json::Value,
        root: serde_json::Value,
    ) -> InternalResult<Value> {
        let node = ExpressionNode::parse(expression)?;
        let ctx = self.dispatcher.base_context().with_root(Value::from(root));
        Ok(self
            .dispatcher
            .evaluator()
            .evaluate_for_script(&node, &ctx)
            .await?)
    }

    /// Runs a JSON pipeline over `input`. Nothing is pulled until the
    /// returned cursor is.
    pub fn run(
        &self,
        pipeline: &serde_json::Value,
        input: Vec<serde_json::Value>,
    ) -> InternalResult<BoxCursor> {
        let stages = Stage::parse_all(pipeline)?;
        let input = IterCursor::boxed(input.into_iter().map(Value::from));
        Ok(self
            .dispatcher
            .evaluator()
            .run(&stages, input, &self.dispatcher.base_context()))
    }

    pub async fn find_operation(&self, uuid: Uuid) -> Option<OperationStatus> {
        self.dispatcher.find_operation(uuid).await
    }

    pub async fn cancel(&self, uuid: Uuid) -> Result<OperationStatus, DispatchError> {
        self.dispatcher.cancel(uuid).await
    }

    /// Starts the job scheduler if the configuration enables it.
    pub async fn start(&self) {
        if self.config.scheduler.enabled {
            self.scheduler.start().await;
            info!(environment = %self.config.environment, "runtime started");
        } else {
            info!(environment = %self.config.environment, "runtime started without scheduler");
        }
    }

    /// Stops scheduling, cancels every unfinished operation and waits for
    /// them and their completion handlers to end.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.dispatcher.cancel_all().await;
        self.dispatcher.wait_idle().await;
        info!("runtime stopped");
    }
}
