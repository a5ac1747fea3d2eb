//! Shared test stores and arbitrary generators for property-based testing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use crate::store::{MemoryStore, Notifier, QueueStore, Result, StoreError};
use crate::types::{Message, QueueName};

pub fn arb_body() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 ]{1,40}".prop_filter("non-blank", |s| !s.trim().is_empty())
}

pub fn arb_message() -> impl Strategy<Value = Message> {
    (arb_body(), 0u32..20).prop_map(|(body, attempts)| {
        let mut message = Message::new(body);
        message.attempts = attempts;
        message
    })
}

fn unavailable() -> StoreError {
    StoreError::Unavailable("connection refused".to_string())
}

/// A store whose every call fails as if the server were down.
///
/// Records when each `rotate_pop` was attempted.
#[derive(Debug, Default)]
pub struct UnavailableStore {
    rotate_calls: Mutex<Vec<Instant>>,
}

impl UnavailableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instants of every `rotate_pop` call, in order.
    pub fn rotate_calls(&self) -> Vec<Instant> {
        self.rotate_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl QueueStore for UnavailableStore {
    async fn enqueue(&self, _queue: &QueueName, _payload: &str) -> Result<usize> {
        Err(unavailable())
    }

    async fn rotate_pop(&self, _queue: &QueueName, _timeout: Duration) -> Result<Option<String>> {
        self.rotate_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Instant::now());
        Err(unavailable())
    }

    async fn remove(&self, _queue: &QueueName, _payload: &str, _count: usize) -> Result<usize> {
        Err(unavailable())
    }

    async fn transfer(
        &self,
        _from: &QueueName,
        _payload: &str,
        _to: &QueueName,
        _replacement: &str,
    ) -> Result<bool> {
        Err(unavailable())
    }

    async fn len(&self, _queue: &QueueName) -> Result<usize> {
        Err(unavailable())
    }
}

impl Notifier for UnavailableStore {
    async fn notify(&self, _channel: &str, _payload: &str) -> Result<usize> {
        Err(unavailable())
    }
}

/// A memory store that counts retrieved values and can drop notifications.
#[derive(Debug, Default)]
pub struct CountingStore {
    pub inner: MemoryStore,
    retrieved: AtomicUsize,
    fail_notify: bool,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose queues work but whose broadcast is down.
    pub fn with_failing_notify() -> Self {
        CountingStore {
            fail_notify: true,
            ..Self::default()
        }
    }

    /// Number of `rotate_pop` calls that returned a value.
    pub fn retrieved(&self) -> usize {
        self.retrieved.load(Ordering::SeqCst)
    }
}

impl QueueStore for CountingStore {
    async fn enqueue(&self, queue: &QueueName, payload: &str) -> Result<usize> {
        self.inner.enqueue(queue, payload).await
    }

    async fn rotate_pop(&self, queue: &QueueName, timeout: Duration) -> Result<Option<String>> {
        let value = self.inner.rotate_pop(queue, timeout).await?;
        if value.is_some() {
            self.retrieved.fetch_add(1, Ordering::SeqCst);
        }
        Ok(value)
    }

    async fn remove(&self, queue: &QueueName, payload: &str, count: usize) -> Result<usize> {
        self.inner.remove(queue, payload, count).await
    }

    async fn transfer(
        &self,
        from: &QueueName,
        payload: &str,
        to: &QueueName,
        replacement: &str,
    ) -> Result<bool> {
        self.inner.transfer(from, payload, to, replacement).await
    }

    async fn len(&self, queue: &QueueName) -> Result<usize> {
        self.inner.len(queue).await
    }
}

impl Notifier for CountingStore {
    async fn notify(&self, channel: &str, payload: &str) -> Result<usize> {
        if self.fail_notify {
            return Err(unavailable());
        }
        self.inner.notify(channel, payload).await
    }
}
