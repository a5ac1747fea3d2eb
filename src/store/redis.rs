//! Redis-backed queue store.
//!
//! Command mapping:
//!
//! | Operation    | Command                               |
//! |--------------|---------------------------------------|
//! | `enqueue`    | `LPUSH queue payload`                 |
//! | `rotate_pop` | `BRPOPLPUSH queue queue timeout`      |
//! | `remove`     | `LREM queue count payload`            |
//! | `transfer`   | Lua script (`LREM` then `LPUSH`)      |
//! | `len`        | `LLEN queue`                          |
//! | `notify`     | `PUBLISH channel payload`             |
//!
//! # Connections
//!
//! Regular commands share one auto-reconnecting `ConnectionManager`. The
//! blocking rotate runs on its own multiplexed connection so a long
//! `BRPOPLPUSH` never stalls acknowledgments or publishes queued behind it on
//! the shared pipeline. That connection is discarded after any error and
//! re-established on the next call.
//!
//! # Undecodable values
//!
//! Queue values are UTF-8 text. A value that is not (written by some other
//! producer) can never be delivered or acknowledged by content, so when the
//! rotate returns one it is moved, byte for byte, to the dead-letter queue and
//! the rotate reports nothing retrieved.

use std::time::Duration;

use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, RedisError, Script};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use super::{Notifier, QueueStore, Result, StoreError};
use crate::types::QueueName;

/// Removes one occurrence of ARGV[1] from KEYS[1]; if found, pushes ARGV[2]
/// onto KEYS[2]. Scripts run atomically on the server.
const TRANSFER_SCRIPT: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 1 then
    redis.call('LPUSH', KEYS[2], ARGV[2])
    return 1
end
return 0
";

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
            || err.kind() == redis::ErrorKind::IoError
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Queue store backed by a Redis server.
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    blocking: Mutex<Option<MultiplexedConnection>>,
    transfer_script: Script,
    dead_letter: Option<QueueName>,
}

impl RedisStore {
    /// Connects to the server at `url` (e.g. `redis://localhost:6379/0`).
    ///
    /// Fails if the URL is invalid or the server cannot be reached.
    #[instrument(skip_all)]
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        debug!("Connected to Redis");

        Ok(RedisStore {
            client,
            manager,
            blocking: Mutex::new(None),
            transfer_script: Script::new(TRANSFER_SCRIPT),
            dead_letter: None,
        })
    }

    /// Sets where undecodable values are moved. Defaults to the queue's own
    /// `<queue>:dead`.
    pub fn with_dead_letter_queue(mut self, queue: QueueName) -> Self {
        self.dead_letter = Some(queue);
        self
    }

    fn dead_letter_for(&self, queue: &QueueName) -> QueueName {
        self.dead_letter
            .clone()
            .unwrap_or_else(|| queue.dead_letter())
    }

    /// Moves a value that is not valid UTF-8 out of the rotation unchanged.
    async fn quarantine(&self, queue: &QueueName, value: &[u8]) -> Result<()> {
        let target = self.dead_letter_for(queue);
        let mut conn = self.connection();
        let moved: i64 = self
            .transfer_script
            .key(queue.as_str())
            .key(target.as_str())
            .arg(value)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        warn!(
            queue = %queue,
            dead_letter = %target,
            len = value.len(),
            moved = moved == 1,
            "Value is not valid UTF-8, moved to dead-letter queue"
        );
        Ok(())
    }

    fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// Redis takes blocking timeouts in (fractional) seconds; 0 blocks forever.
fn timeout_arg(timeout: Duration) -> f64 {
    timeout.as_secs_f64()
}

fn to_count(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

/// Returns the value as text, or hands the raw bytes back if it is not UTF-8.
fn decode_value(bytes: Vec<u8>) -> std::result::Result<String, Vec<u8>> {
    String::from_utf8(bytes).map_err(|e| e.into_bytes())
}

impl QueueStore for RedisStore {
    async fn enqueue(&self, queue: &QueueName, payload: &str) -> Result<usize> {
        let mut conn = self.connection();
        let len: i64 = redis::cmd("LPUSH")
            .arg(queue.as_str())
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(to_count(len))
    }

    async fn rotate_pop(&self, queue: &QueueName, timeout: Duration) -> Result<Option<String>> {
        let mut slot = self.blocking.lock().await;
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };

        // Read as bytes: the value has already rotated by the time it is
        // decoded, so a decode error must not look like a failed command.
        let value: Option<Vec<u8>> = redis::cmd("BRPOPLPUSH")
            .arg(queue.as_str())
            .arg(queue.as_str())
            .arg(timeout_arg(timeout))
            .query_async(&mut conn)
            .await?;

        // Only a connection that just succeeded goes back in the slot.
        *slot = Some(conn);
        drop(slot);

        match value.map(decode_value) {
            None => Ok(None),
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(bytes)) => {
                self.quarantine(queue, &bytes).await?;
                Ok(None)
            }
        }
    }

    async fn remove(&self, queue: &QueueName, payload: &str, count: usize) -> Result<usize> {
        if count == 0 {
            // LREM treats 0 as "remove all".
            return Ok(0);
        }
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        let mut conn = self.connection();
        let removed: i64 = redis::cmd("LREM")
            .arg(queue.as_str())
            .arg(count)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(to_count(removed))
    }

    async fn transfer(
        &self,
        from: &QueueName,
        payload: &str,
        to: &QueueName,
        replacement: &str,
    ) -> Result<bool> {
        let mut conn = self.connection();
        let moved: i64 = self
            .transfer_script
            .key(from.as_str())
            .key(to.as_str())
            .arg(payload)
            .arg(replacement)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn len(&self, queue: &QueueName) -> Result<usize> {
        let mut conn = self.connection();
        let len: i64 = redis::cmd("LLEN")
            .arg(queue.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(to_count(len))
    }
}

impl Notifier for RedisStore {
    async fn notify(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.connection();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(to_count(receivers))
    }
}
