//! Producer side of a named job queue.

use std::collections::HashMap;

use crate::error::Result;
use crate::keys::{KeySpace, QueueKeys};
use crate::store::Store;
use crate::token::{JobToken, Payload};

/// A named queue. Pushing only needs the store; consuming is done by a
/// [`QueueWorker`](crate::QueueWorker) bound to the same queue.
#[derive(Clone)]
pub struct Queue<S: Store + Clone> {
    name: String,
    keys: QueueKeys,
    store: S,
}

impl<S: Store + Clone> Queue<S> {
    /// Create a queue handle.
    pub fn new(store: S, space: &KeySpace, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            keys: space.queue(&name),
            name,
            store,
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store keys of this queue.
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Append a job to the pending list. Returns the pending length.
    pub async fn push(&self, name: &str, id: &str, payload: Payload) -> Result<usize> {
        let token = JobToken::new(name, id, payload).encode()?;
        let len = self
            .store
            .lpush(&self.keys.pending, std::slice::from_ref(&token))
            .await?;

        tracing::debug!(queue = %self.name, token = %token, "Job pushed");
        Ok(len)
    }

    /// Bind a job name, producing a `(id, payload)` pusher.
    pub fn pusher(&self, name: impl Into<String>) -> Pusher<S> {
        Pusher {
            queue: self.clone(),
            name: name.into(),
        }
    }

    /// Number of tokens waiting to be claimed.
    pub async fn pending_len(&self) -> Result<usize> {
        self.store.llen(&self.keys.pending).await
    }

    /// Number of tokens claimed and not yet released.
    pub async fn doing_len(&self) -> Result<usize> {
        self.store.llen(&self.keys.doing).await
    }

    /// In-flight tokens with their last claim or heartbeat timestamp.
    /// Unparseable timestamps read as 0.
    pub async fn doing_map(&self) -> Result<HashMap<String, i64>> {
        let map = self.store.hgetall(&self.keys.doing_map).await?;
        Ok(map
            .into_iter()
            .map(|(token, at)| {
                let at = at.parse().unwrap_or(0);
                (token, at)
            })
            .collect())
    }
}

/// Pushes jobs of one name onto a queue.
#[derive(Clone)]
pub struct Pusher<S: Store + Clone> {
    queue: Queue<S>,
    name: String,
}

impl<S: Store + Clone> Pusher<S> {
    /// Job name this pusher writes.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Push a job with the bound name.
    pub async fn push(&self, id: &str, payload: Payload) -> Result<usize> {
        self.queue.push(&self.name, id, payload).await
    }
}
