//! In-process queue store.
//!
//! Mirrors the Redis list semantics exactly (same orientation, same `LREM`
//! scan direction) so the dispatcher can run embedded or under test without a
//! server. Blocked `rotate_pop` calls are woken by `enqueue`/`transfer`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, broadcast};

use super::{Notifier, QueueStore, Result};
use crate::types::QueueName;

/// Capacity of each notify channel's broadcast buffer.
const NOTIFY_BUFFER: usize = 256;

/// Queue store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Lists keyed by queue. Index 0 is the tail (left end).
    lists: Mutex<HashMap<QueueName, VecDeque<String>>>,

    /// Signalled whenever a value is pushed onto any list.
    pushed: Notify,

    /// Broadcast senders keyed by notify channel, created on first subscribe.
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a notify channel.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut channels = lock(&self.channels);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(NOTIFY_BUFFER).0)
            .subscribe()
    }

    /// Returns a copy of the list, tail first (the order `LRANGE 0 -1` gives).
    pub fn contents(&self, queue: &QueueName) -> Vec<String> {
        lock(&self.lists)
            .get(queue)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Pops the head and pushes it back onto the tail, if the list is non-empty.
    fn try_rotate(&self, queue: &QueueName) -> Option<String> {
        let mut lists = lock(&self.lists);
        let list = lists.get_mut(queue)?;
        let value = list.pop_back()?;
        list.push_front(value.clone());
        Some(value)
    }

    fn push(&self, queue: &QueueName, payload: &str) -> usize {
        let len = {
            let mut lists = lock(&self.lists);
            let list = lists.entry(queue.clone()).or_default();
            list.push_front(payload.to_string());
            list.len()
        };
        self.pushed.notify_waiters();
        len
    }
}

/// Removes up to `count` occurrences of `payload`, scanning from the tail.
fn remove_from(list: &mut VecDeque<String>, payload: &str, count: usize) -> usize {
    let mut removed = 0;
    let mut index = 0;
    while removed < count && index < list.len() {
        if list[index] == payload {
            list.remove(index);
            removed += 1;
        } else {
            index += 1;
        }
    }
    removed
}

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section here leaves the lists consistent before any point
/// that could panic, so the data behind a poisoned lock is still valid.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QueueStore for MemoryStore {
    async fn enqueue(&self, queue: &QueueName, payload: &str) -> Result<usize> {
        Ok(self.push(queue, payload))
    }

    async fn rotate_pop(&self, queue: &QueueName, timeout: Duration) -> Result<Option<String>> {
        let deadline = (!timeout.is_zero()).then(|| tokio::time::Instant::now() + timeout);

        loop {
            // Register for wakeups before looking, so a push between the
            // check and the wait is not missed.
            let pushed = self.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(value) = self.try_rotate(queue) {
                return Ok(Some(value));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                        return Ok(None);
                    }
                }
                None => pushed.await,
            }
        }
    }

    async fn remove(&self, queue: &QueueName, payload: &str, count: usize) -> Result<usize> {
        let mut lists = lock(&self.lists);
        let removed = match lists.get_mut(queue) {
            Some(list) => remove_from(list, payload, count),
            None => 0,
        };
        if lists.get(queue).is_some_and(VecDeque::is_empty) {
            lists.remove(queue);
        }
        Ok(removed)
    }

    async fn transfer(
        &self,
        from: &QueueName,
        payload: &str,
        to: &QueueName,
        replacement: &str,
    ) -> Result<bool> {
        {
            let mut lists = lock(&self.lists);
            let removed = match lists.get_mut(from) {
                Some(list) => remove_from(list, payload, 1),
                None => 0,
            };
            if removed == 0 {
                return Ok(false);
            }
            lists
                .entry(to.clone())
                .or_default()
                .push_front(replacement.to_string());
            if lists.get(from).is_some_and(VecDeque::is_empty) {
                lists.remove(from);
            }
        }
        self.pushed.notify_waiters();
        Ok(true)
    }

    async fn len(&self, queue: &QueueName) -> Result<usize> {
        Ok(lock(&self.lists).get(queue).map_or(0, VecDeque::len))
    }
}

impl Notifier for MemoryStore {
    async fn notify(&self, channel: &str, payload: &str) -> Result<usize> {
        let channels = lock(&self.channels);
        let receivers = channels
            .get(channel)
            .and_then(|sender| sender.send(payload.to_string()).ok())
            .unwrap_or(0);
        Ok(receivers)
    }
}
