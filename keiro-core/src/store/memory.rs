use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::{LiveQuery, ObjectStore, QueryOptions, StoreError, StoreResult};
use crate::dispatch::operation::OperationStatus;
use crate::eval::value::Value;

/// Collections and operation records held in memory.
#[derive(Debug, Default, Clone)]
pub struct InMemoryObjectStore {
    collections: Arc<DashMap<String, Vec<Value>>>,
    operations: Arc<DashMap<Uuid, OperationStatus>>,
    open_queries: Arc<AtomicUsize>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: impl Into<String>, document: Value) {
        self.collections
            .entry(object.into())
            .or_default()
            .push(document);
    }

    pub fn insert_many<I>(&self, object: impl Into<String>, documents: I)
    where
        I: IntoIterator<Item = Value>,
    {
        self.collections
            .entry(object.into())
            .or_default()
            .extend(documents);
    }

    /// Live queries opened and not yet closed.
    pub fn open_queries(&self) -> usize {
        self.open_queries.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> Vec<OperationStatus> {
        self.operations.iter().map(|e| e.value().clone()).collect()
    }
}

struct MemoryQuery {
    remaining: VecDeque<Value>,
    open_queries: Arc<AtomicUsize>,
    closed: bool,
}

#[async_trait]
impl LiveQuery for MemoryQuery {
    async fn fetch(&mut self, batch_size: usize) -> StoreResult<Vec<Value>> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        let take = batch_size.max(1).min(self.remaining.len());
        Ok(self.remaining.drain(..take).collect())
    }

    async fn close(&mut self) -> StoreResult<()> {
        if !self.closed {
            self.closed = true;
            self.remaining.clear();
            self.open_queries.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryQuery {
    fn drop(&mut self) {
        if !self.closed {
            self.open_queries.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn open(&self, options: QueryOptions) -> StoreResult<Box<dyn LiveQuery>> {
        let documents = self
            .collections
            .get(&options.object)
            .ok_or_else(|| StoreError::UnknownObject(options.object.clone()))?;
        let matching = documents
            .iter()
            .filter(|doc| options.matches(doc))
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        self.open_queries.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryQuery {
            remaining: matching,
            open_queries: self.open_queries.clone(),
            closed: false,
        }))
    }

    async fn save_operation(&self, status: &OperationStatus) -> StoreResult<()> {
        self.operations.insert(status.uuid, status.clone());
        Ok(())
    }

    async fn load_operation(&self, uuid: Uuid) -> StoreResult<Option<OperationStatus>> {
        Ok(self.operations.get(&uuid).map(|e| e.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_in_batches_then_close() {
        let store = InMemoryObjectStore::new();
        store.insert_many("c_item", (0..5).map(|i| Value::from(json!({ "i": i }))));

        let mut query = store.open(QueryOptions::new("c_item")).await.unwrap();
        assert_eq!(store.open_queries(), 1);
        assert_eq!(query.fetch(2).await.unwrap().len(), 2);
        assert_eq!(query.fetch(2).await.unwrap().len(), 2);
        assert_eq!(query.fetch(2).await.unwrap().len(), 1);
        assert!(query.fetch(2).await.unwrap().is_empty());
        query.close().await.unwrap();
        query.close().await.unwrap();
        assert_eq!(store.open_queries(), 0);
        assert_eq!(query.fetch(1).await, Err(StoreError::Closed));
    }

    #[tokio::test]
    async fn test_unknown_object() {
        let store = InMemoryObjectStore::new();
        let err = store.open(QueryOptions::new("c_none")).await.err().unwrap();
        assert_eq!(err, StoreError::UnknownObject("c_none".to_string()));
    }
}
