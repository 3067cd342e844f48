use std::collections::VecDeque;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::EvalResult;
use super::value::Value;
use crate::store::LiveQuery;

/// Lazy, closeable sequence of values.
///
/// Pulling past exhaustion keeps returning `None`. Closing a cursor closes its
/// upstream cursors before it returns, and closing twice is harmless.
#[async_trait]
pub trait Cursor: Send + Sync {
    async fn next(&mut self) -> EvalResult<Option<Value>>;

    async fn close(&mut self) -> EvalResult<()>;

    fn is_closed(&self) -> bool;

    /// Drains the remaining values and closes the cursor.
    async fn to_array(&mut self) -> EvalResult<Vec<Value>> {
        let mut values = Vec::new();
        let drained = loop {
            match self.next().await {
                Ok(Some(value)) => values.push(value),
                Ok(None) => break Ok(values),
                Err(e) => break Err(e),
            }
        };
        self.close().await?;
        drained
    }
}

pub type BoxCursor = Box<dyn Cursor>;

/// Cursor over values already in memory.
#[derive(Debug, Default)]
pub struct IterCursor {
    items: VecDeque<Value>,
    closed: bool,
}

impl IterCursor {
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        Self {
            items: items.into_iter().collect(),
            closed: false,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn boxed<I>(items: I) -> BoxCursor
    where
        I: IntoIterator<Item = Value>,
    {
        Box::new(Self::new(items))
    }
}

#[async_trait]
impl Cursor for IterCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.items.pop_front())
    }

    async fn close(&mut self) -> EvalResult<()> {
        self.closed = true;
        self.items.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Cursor over a live query, fetching in batches. The query is closed as soon
/// as it is exhausted.
pub struct StoreCursor {
    query: Box<dyn LiveQuery>,
    buffer: VecDeque<Value>,
    batch_size: usize,
    exhausted: bool,
    closed: bool,
}

impl StoreCursor {
    pub fn new(query: Box<dyn LiveQuery>, batch_size: usize) -> Self {
        Self {
            query,
            buffer: VecDeque::new(),
            batch_size: batch_size.max(1),
            exhausted: false,
            closed: false,
        }
    }
}

#[async_trait]
impl Cursor for StoreCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        if self.closed {
            return Ok(None);
        }
        if self.buffer.is_empty() && !self.exhausted {
            let batch = self.query.fetch(self.batch_size).await?;
            if batch.is_empty() {
                self.exhausted = true;
                self.query.close().await?;
            }
            self.buffer.extend(batch);
        }
        Ok(self.buffer.pop_front())
    }

    async fn close(&mut self) -> EvalResult<()> {
        if !self.closed {
            self.closed = true;
            self.buffer.clear();
            self.query.close().await?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Stops yielding once the token is cancelled and closes the upstream.
pub struct CancellableCursor {
    upstream: BoxCursor,
    token: CancellationToken,
}

impl CancellableCursor {
    pub fn new(upstream: BoxCursor, token: CancellationToken) -> Self {
        Self { upstream, token }
    }
}

#[async_trait]
impl Cursor for CancellableCursor {
    async fn next(&mut self) -> EvalResult<Option<Value>> {
        if self.token.is_cancelled() {
            self.upstream.close().await?;
            return Ok(None);
        }
        self.upstream.next().await
    }

    async fn close(&mut self) -> EvalResult<()> {
        self.upstream.close().await
    }

    fn is_closed(&self) -> bool {
        self.upstream.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pull_past_exhaustion_is_idempotent() {
        let mut cursor = IterCursor::new(vec![Value::Integer(1)]);
        assert_eq!(cursor.next().await.unwrap(), Some(Value::Integer(1)));
        assert_eq!(cursor.next().await.unwrap(), None);
        assert_eq!(cursor.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_stops_pulling() {
        let token = CancellationToken::new();
        let mut cursor = CancellableCursor::new(
            IterCursor::boxed((0..10).map(Value::Integer)),
            token.clone(),
        );
        assert_eq!(cursor.next().await.unwrap(), Some(Value::Integer(0)));
        token.cancel();
        assert_eq!(cursor.next().await.unwrap(), None);
        assert!(cursor.is_closed());
    }
}
