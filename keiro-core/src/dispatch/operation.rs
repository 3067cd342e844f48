use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::DispatchError;
use crate::event::{Event, EventBus, EventType};
use crate::eval::value::Value;
use crate::fault::Fault;
use crate::registry::{HandlerKind, Registration};
use crate::store::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Cancelled
        )
    }
}

/// Durable record of one asynchronous dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub uuid: Uuid,
    pub name: String,
    pub kind: HandlerKind,
    pub handler: String,
    pub state: OperationState,
    pub cancelled: bool,
    pub progress: u64,
    pub depth: usize,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub fault: Option<Fault>,
}

impl OperationStatus {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .map(Value::from)
            .unwrap_or(Value::Null)
    }
}

/// A live asynchronous dispatch.
#[derive(Debug)]
pub struct Operation {
    uuid: Uuid,
    token: CancellationToken,
    status: RwLock<OperationStatus>,
    progress: AtomicU64,
    completion_claimed: AtomicBool,
}

impl Operation {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn status(&self) -> OperationStatus {
        let mut status = self.status.read().await.clone();
        status.progress = self.progress.load(Ordering::SeqCst);
        status
    }

    pub fn set_progress(&self, progress: u64) {
        self.progress.store(progress, Ordering::SeqCst);
    }

    /// True exactly once; guards the completion handler.
    pub(crate) fn claim_completion(&self) -> bool {
        !self.completion_claimed.swap(true, Ordering::SeqCst)
    }

    async fn update<F>(&self, f: F) -> OperationStatus
    where
        F: FnOnce(&mut OperationStatus),
    {
        {
            let mut status = self.status.write().await;
            f(&mut status);
        }
        self.status().await
    }
}

/// All operations started by this process, mirrored to the object store.
pub struct OperationRegistry {
    operations: DashMap<Uuid, Arc<Operation>>,
    store: Option<Arc<dyn ObjectStore>>,
    event_bus: Arc<EventBus>,
}

impl OperationRegistry {
    pub fn new(event_bus: Arc<EventBus>, store: Option<Arc<dyn ObjectStore>>) -> Self {
        Self {
            operations: DashMap::new(),
            store,
            event_bus,
        }
    }

    pub(crate) async fn create(
        &self,
        registration: &Registration,
        depth: usize,
        token: CancellationToken,
    ) -> Arc<Operation> {
        let uuid = Uuid::new_v4();
        let status = OperationStatus {
            uuid,
            name: registration.name.clone(),
            kind: registration.kind,
            handler: registration.describe(),
            state: OperationState::Queued,
            cancelled: false,
            progress: 0,
            depth,
            queued_at: Utc::now(),
            started_at: None,
            stopped_at: None,
            fault: None,
        };
        self.persist(&status).await;
        let operation = Arc::new(Operation {
            uuid,
            token,
            status: RwLock::new(status),
            progress: AtomicU64::new(0),
            completion_claimed: AtomicBool::new(false),
        });
        self.operations.insert(uuid, operation.clone());
        operation
    }

    pub(crate) async fn start(&self, operation: &Operation) {
        let status = operation
            .update(|s| {
                s.state = OperationState::Running;
                s.started_at = Some(Utc::now());
            })
            .await;
        self.persist(&status).await;
        self.notify(EventType::OperationStarted { uuid: status.uuid }, &status);
    }

    pub(crate) async fn finish(
        &self,
        operation: &Operation,
        state: OperationState,
        fault: Option<Fault>,
    ) -> OperationStatus {
        let cancelled = operation.is_cancelled();
        let status = operation
            .update(|s| {
                s.state = state;
                s.cancelled = s.cancelled || cancelled;
                s.stopped_at = Some(Utc::now());
                s.fault = fault;
            })
            .await;
        self.persist(&status).await;
        // the store keeps the record from here on
        if self.store.is_some() {
            self.operations.remove(&status.uuid);
        }
        let event = match state {
            OperationState::Cancelled => EventType::OperationCancelled { uuid: status.uuid },
            OperationState::Failed => EventType::OperationFailed { uuid: status.uuid },
            _ => EventType::OperationCompleted { uuid: status.uuid },
        };
        self.notify(event, &status);
        status
    }

    pub fn get(&self, uuid: Uuid) -> Option<Arc<Operation>> {
        self.operations.get(&uuid).map(|e| e.value().clone())
    }

    /// Live record first, then the store's copy.
    pub async fn find(&self, uuid: Uuid) -> Option<OperationStatus> {
        if let Some(operation) = self.get(uuid) {
            return Some(operation.status().await);
        }
        let store = self.store.as_ref()?;
        match store.load_operation(uuid).await {
            Ok(status) => status,
            Err(e) => {
                warn!(%uuid, error = %e, "failed to load operation");
                None
            }
        }
    }

    /// Requests cancellation. Finished operations are returned unchanged.
    pub async fn cancel(&self, uuid: Uuid) -> Result<OperationStatus, DispatchError> {
        let Some(operation) = self.get(uuid) else {
            return self
                .find(uuid)
                .await
                .ok_or(DispatchError::OperationNotFound(uuid));
        };
        let current = operation.status().await;
        if current.state.is_finished() {
            return Ok(current);
        }
        debug!(%uuid, "cancelling operation");
        operation.token.cancel();
        let status = operation.update(|s| s.cancelled = true).await;
        self.persist(&status).await;
        Ok(status)
    }

    /// Operations not yet finished.
    pub async fn active(&self) -> Vec<OperationStatus> {
        let operations: Vec<_> = self.operations.iter().map(|e| e.value().clone()).collect();
        let mut active = Vec::new();
        for operation in operations {
            let status = operation.status().await;
            if !status.state.is_finished() {
                active.push(status);
            }
        }
        active
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    async fn persist(&self, status: &OperationStatus) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_operation(status).await {
                warn!(uuid = %status.uuid, error = %e, "failed to persist operation status");
            }
        }
    }

    fn notify(&self, event_type: EventType, status: &OperationStatus) {
        let event = Event::new(event_type)
            .with_parameter("name", status.name.as_str())
            .with_parameter("handler", status.handler.as_str());
        if let Err(e) = self.event_bus.publish(event) {
            debug!(error = %e, "operation event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handler::handler_fn;
    use crate::registry::{HandlerRef, ModuleLoader};
    use crate::store::InMemoryObjectStore;
    use serde_json::json;

    fn registration() -> Registration {
        let mut loader = ModuleLoader::new("production");
        loader
            .module("c_lib")
            .register_handler(
                HandlerKind::Event,
                "run",
                json!({ "event": "x" }),
                HandlerRef::Direct(handler_fn(|_| async { Ok(Value::Null) })),
            )
            .unwrap();
        loader.finish().get(HandlerKind::Event)[0].as_ref().clone()
    }

    #[tokio::test]
    async fn test_lifecycle_is_mirrored_to_store() {
        let store = InMemoryObjectStore::new();
        let registry = OperationRegistry::new(Arc::new(EventBus::new(16)), Some(Arc::new(store.clone())));
        let operation = registry
            .create(&registration(), 1, CancellationToken::new())
            .await;
        registry.start(&operation).await;
        operation.set_progress(3);
        let status = registry
            .finish(&operation, OperationState::Completed, None)
            .await;
        assert_eq!(status.state, OperationState::Completed);
        assert_eq!(status.progress, 3);
        assert!(!status.cancelled);

        let stored = store.operations();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, OperationState::Completed);

        assert!(registry.get(operation.uuid()).is_none());
        let found = registry.find(operation.uuid()).await.unwrap();
        assert_eq!(found.state, OperationState::Completed);
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_finished() {
        let registry = OperationRegistry::new(Arc::new(EventBus::new(16)), None);
        let missing = Uuid::new_v4();
        assert!(matches!(
            registry.cancel(missing).await,
            Err(DispatchError::OperationNotFound(uuid)) if uuid == missing
        ));

        let operation = registry
            .create(&registration(), 1, CancellationToken::new())
            .await;
        registry
            .finish(&operation, OperationState::Completed, None)
            .await;
        let status = registry.cancel(operation.uuid()).await.unwrap();
        assert!(!status.cancelled);
        assert!(!operation.is_cancelled());
    }

    #[tokio::test]
    async fn test_completion_claimed_once() {
        let registry = OperationRegistry::new(Arc::new(EventBus::new(16)), None);
        let operation = registry
            .create(&registration(), 1, CancellationToken::new())
            .await;
        assert!(operation.claim_completion());
        assert!(!operation.claim_completion());
    }
}
