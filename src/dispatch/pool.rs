//! The worker pool.
//!
//! `W` worker tasks share the receiving end of the dispatch channel. Each
//! worker takes one envelope at a time, runs the handler, and settles the
//! outcome in the store:
//!
//! - success: remove exactly one occurrence of the stored value (the ack)
//! - failure or timeout: rewrite the value with `attempts + 1` in place, or
//!   move it to the dead-letter queue once `max_attempts` is reached
//!
//! Store errors while settling are logged and otherwise ignored. The value is
//! still in the rotation, so it will simply be delivered again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::envelope::DispatchEnvelope;
use super::handler::{Handler, HandlerError};
use crate::store::QueueStore;
use crate::types::{Message, QueueName};

/// Failure policy shared by all workers.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Upper bound on a single handler call. `None` lets handlers run forever.
    pub handler_timeout: Option<Duration>,

    /// Failed attempts after which a message is dead-lettered. `None` retries
    /// forever.
    pub max_attempts: Option<u32>,

    /// Where exhausted messages go.
    pub dead_letter: QueueName,
}

/// How a worker settled one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded and the value was removed.
    Acknowledged,
    /// Handler failed; the value was rewritten with the new attempt count.
    Requeued { attempts: u32 },
    /// Handler failed for the last allowed time; the value was moved.
    DeadLettered { attempts: u32 },
    /// The value was no longer in the queue, so nothing was written.
    AlreadyGone,
    /// The store rejected the settlement; the value stays in the rotation.
    StoreFailed,
}

/// A fixed set of workers draining the dispatch channel.
pub struct WorkerPool {
    tasks: JoinSet<()>,
    stop: CancellationToken,
}

impl WorkerPool {
    /// Spawns `workers` tasks (at least one) consuming `rx`.
    pub fn spawn<S, H>(
        workers: usize,
        rx: mpsc::Receiver<DispatchEnvelope>,
        store: Arc<S>,
        handler: Arc<H>,
        settings: WorkerSettings,
    ) -> Self
    where
        S: QueueStore,
        H: Handler,
    {
        let rx = Arc::new(Mutex::new(rx));
        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for worker in 0..workers.max(1) {
            tasks.spawn(run_worker(
                worker,
                Arc::clone(&rx),
                Arc::clone(&store),
                Arc::clone(&handler),
                settings.clone(),
                stop.clone(),
            ));
        }

        WorkerPool { tasks, stop }
    }

    /// Number of workers that have not exited yet.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true once every worker has exited.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every worker to exit.
    ///
    /// Workers exit once the channel is closed and drained. A worker that
    /// panicked is logged and counted as exited.
    pub async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => debug!("Worker aborted"),
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }
    }

    /// Stops all workers immediately. Returns how many were still running.
    ///
    /// Envelopes held by aborted workers are dropped without settling; their
    /// values stay in the queue.
    pub fn abort(&mut self) -> usize {
        self.stop.cancel();
        let running = self.tasks.len();
        self.tasks.abort_all();
        running
    }
}

#[instrument(skip(rx, store, handler, settings, stop))]
async fn run_worker<S: QueueStore, H: Handler>(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<DispatchEnvelope>>>,
    store: Arc<S>,
    handler: Arc<H>,
    settings: WorkerSettings,
    stop: CancellationToken,
) {
    debug!("Worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = async { rx.lock().await.recv().await } => next,
        };

        let Some(envelope) = next else {
            break;
        };

        let result = deliver(&handler, envelope.message.clone(), settings.handler_timeout).await;
        let outcome = settle(store.as_ref(), &settings, &envelope, result).await;
        debug!(pass = envelope.pass, outcome = ?outcome, "Settled message");

        // The envelope (and its in-flight claim) goes away only after settling.
        drop(envelope);
    }

    info!("Worker stopped");
}

/// Runs the handler on its own task, bounded by `timeout` if one is set.
///
/// A panic in the handler is reported as a failure instead of unwinding the
/// worker. The call task lives in a local `JoinSet`, so it is aborted if the
/// timeout fires or the worker itself is aborted.
async fn deliver<H: Handler>(
    handler: &Arc<H>,
    message: Message,
    timeout: Option<Duration>,
) -> Result<(), HandlerError> {
    let handler = Arc::clone(handler);
    let mut call = JoinSet::new();
    call.spawn(async move { handler.handle(message).await });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call.join_next()).await {
            Ok(joined) => joined,
            Err(_) => return Err(HandlerError::TimedOut(limit)),
        },
        None => call.join_next().await,
    };

    match joined {
        Some(Ok(result)) => result,
        Some(Err(e)) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e))),
        Some(Err(e)) => Err(HandlerError::failed(e.to_string())),
        None => Err(HandlerError::failed("handler task vanished")),
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Writes the result of one delivery back to the store.
pub(crate) async fn settle<S: QueueStore>(
    store: &S,
    settings: &WorkerSettings,
    envelope: &DispatchEnvelope,
    result: Result<(), HandlerError>,
) -> Outcome {
    let queue = &envelope.queue;
    let id = envelope.message.id;

    let failure = match result {
        Ok(()) => {
            return match store.remove(queue, envelope.stored(), 1).await {
                Ok(0) => {
                    debug!(id = ?id, "Message was already removed");
                    Outcome::AlreadyGone
                }
                Ok(_) => Outcome::Acknowledged,
                Err(e) => {
                    error!(
                        id = ?id,
                        error = %e,
                        "Failed to acknowledge message, it will be redelivered"
                    );
                    Outcome::StoreFailed
                }
            };
        }
        Err(e) => e,
    };

    let retried = envelope.message.with_incremented_attempts();
    let attempts = retried.attempts;
    let exhausted = settings.max_attempts.is_some_and(|max| attempts >= max);
    let target = if exhausted { &settings.dead_letter } else { queue };

    let replacement = match retried.encode() {
        Ok(replacement) => replacement,
        Err(e) => {
            error!(id = ?id, error = %e, "Failed to encode retried message");
            return Outcome::StoreFailed;
        }
    };

    match store
        .transfer(queue, envelope.stored(), target, &replacement)
        .await
    {
        Ok(true) if exhausted => {
            warn!(
                id = ?retried.id,
                attempts,
                error = %failure,
                dead_letter = %target,
                "Message exhausted its attempts, moved to dead-letter queue"
            );
            Outcome::DeadLettered { attempts }
        }
        Ok(true) => {
            warn!(
                id = ?retried.id,
                attempts,
                error = %failure,
                "Handler failed, message will be redelivered"
            );
            Outcome::Requeued { attempts }
        }
        Ok(false) => {
            debug!(id = ?id, error = %failure, "Failed message was already removed");
            Outcome::AlreadyGone
        }
        Err(e) => {
            error!(id = ?id, error = %e, "Failed to record failed attempt");
            Outcome::StoreFailed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::envelope::InFlight;
    use crate::store::MemoryStore;
    use crate::test_utils::UnavailableStore;

    fn settings(max_attempts: Option<u32>) -> WorkerSettings {
        WorkerSettings {
            handler_timeout: None,
            max_attempts,
            dead_letter: QueueName::new("q:dead"),
        }
    }

    async fn claimed(
        store: &MemoryStore,
        in_flight: &Arc<InFlight>,
        message: &Message,
    ) -> DispatchEnvelope {
        let queue = QueueName::new("q");
        let stored = message.encode().unwrap();
        store.enqueue(&queue, &stored).await.unwrap();
        DispatchEnvelope::new(queue, 1, in_flight.try_claim(&stored).unwrap())
    }

    // ─── Settlement tests ───

    #[tokio::test]
    async fn success_removes_exactly_one_copy() {
        let store = MemoryStore::new();
        let in_flight = Arc::new(InFlight::new());
        let message = Message::new("work");
        let envelope = claimed(&store, &in_flight, &message).await;
        // A second identical copy, as after a duplicate publish.
        store
            .enqueue(&envelope.queue, envelope.stored())
            .await
            .unwrap();

        let outcome = settle(&store, &settings(None), &envelope, Ok(())).await;

        assert_eq!(outcome, Outcome::Acknowledged);
        assert_eq!(store.len(&envelope.queue).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn success_after_removal_is_already_gone() {
        let store = MemoryStore::new();
        let in_flight = Arc::new(InFlight::new());
        let envelope = claimed(&store, &in_flight, &Message::new("work")).await;
        store
            .remove(&envelope.queue, envelope.stored(), 1)
            .await
            .unwrap();

        let outcome = settle(&store, &settings(None), &envelope, Ok(())).await;

        assert_eq!(outcome, Outcome::AlreadyGone);
    }

    #[tokio::test]
    async fn failure_rewrites_attempts_in_place() {
        let store = MemoryStore::new();
        let in_flight = Arc::new(InFlight::new());
        let message = Message::new("work");
        let envelope = claimed(&store, &in_flight, &message).await;

        let outcome = settle(
            &store,
            &settings(Some(3)),
            &envelope,
            Err(HandlerError::failed("boom")),
        )
        .await;

        assert_eq!(outcome, Outcome::Requeued { attempts: 1 });
        let contents = store.contents(&envelope.queue);
        assert_eq!(contents.len(), 1);
        let stored = Message::decode(&contents[0]);
        assert_eq!(stored.id, message.id);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn last_failure_moves_to_dead_letter() {
        let store = MemoryStore::new();
        let in_flight = Arc::new(InFlight::new());
        let mut message = Message::new("work");
        message.attempts = 2;
        let envelope = claimed(&store, &in_flight, &message).await;

        let outcome = settle(
            &store,
            &settings(Some(3)),
            &envelope,
            Err(HandlerError::TimedOut(Duration::from_secs(1))),
        )
        .await;

        assert_eq!(outcome, Outcome::DeadLettered { attempts: 3 });
        assert_eq!(store.len(&envelope.queue).await.unwrap(), 0);
        let dead = store.contents(&QueueName::new("q:dead"));
        assert_eq!(dead.len(), 1);
        assert_eq!(Message::decode(&dead[0]).attempts, 3);
    }

    #[tokio::test]
    async fn unlimited_attempts_never_dead_letter() {
        let store = MemoryStore::new();
        let in_flight = Arc::new(InFlight::new());
        let mut message = Message::new("work");
        message.attempts = 1_000;
        let envelope = claimed(&store, &in_flight, &message).await;

        let outcome = settle(
            &store,
            &settings(None),
            &envelope,
            Err(HandlerError::failed("boom")),
        )
        .await;

        assert_eq!(outcome, Outcome::Requeued { attempts: 1_001 });
    }

    #[tokio::test]
    async fn raw_value_is_rewritten_as_envelope() {
        let store = MemoryStore::new();
        let in_flight = Arc::new(InFlight::new());
        let queue = QueueName::new("q");
        store.enqueue(&queue, "Yeni görev").await.unwrap();
        let value = store.rotate_pop(&queue, Duration::ZERO).await.unwrap().unwrap();
        let envelope =
            DispatchEnvelope::new(queue.clone(), 1, in_flight.try_claim(&value).unwrap());

        settle(
            &store,
            &settings(Some(5)),
            &envelope,
            Err(HandlerError::failed("x")),
        )
        .await;

        let stored = Message::decode(&store.contents(&queue)[0]);
        assert!(!stored.is_raw());
        assert_eq!(stored.body, "Yeni görev");
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn store_failure_is_reported_not_raised() {
        let store = UnavailableStore::new();
        let in_flight = Arc::new(InFlight::new());
        let envelope = DispatchEnvelope::new(
            QueueName::new("q"),
            1,
            in_flight.try_claim("value").unwrap(),
        );

        assert_eq!(
            settle(&store, &settings(None), &envelope, Ok(())).await,
            Outcome::StoreFailed
        );
        let outcome = settle(
            &store,
            &settings(None),
            &envelope,
            Err(HandlerError::failed("x")),
        )
        .await;
        assert_eq!(outcome, Outcome::StoreFailed);
    }

    // ─── Delivery tests ───

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out() {
        let handler = |_message: Message| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        };

        let result = deliver(
            &Arc::new(handler),
            Message::new("x"),
            Some(Duration::from_secs(1)),
        )
        .await;

        assert!(matches!(result, Err(HandlerError::TimedOut(d)) if d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn handler_panic_is_a_failure() {
        let handler = |message: Message| async move {
            if message.body == "poison" {
                panic!("cannot handle {}", message.body);
            }
            Ok::<(), HandlerError>(())
        };
        let handler = Arc::new(handler);

        let result = deliver(&handler, Message::new("poison"), None).await;

        assert!(
            matches!(result, Err(HandlerError::Panicked(ref m)) if m == "cannot handle poison")
        );
        assert!(deliver(&handler, Message::new("fine"), None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_call_is_cancelled() {
        let finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let finished_clone = Arc::clone(&finished);
        let handler = move |_message: Message| {
            let finished = Arc::clone(&finished_clone);
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                finished.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        };

        let result = deliver(
            &Arc::new(handler),
            Message::new("x"),
            Some(Duration::from_secs(1)),
        )
        .await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert!(matches!(result, Err(HandlerError::TimedOut(_))));
        assert!(!finished.load(std::sync::atomic::Ordering::SeqCst));
    }

    // ─── Pool tests ───

    #[tokio::test(start_paused = true)]
    async fn workers_drain_channel_then_exit() {
        let store = Arc::new(MemoryStore::new());
        let in_flight = Arc::new(InFlight::new());
        let (tx, rx) = mpsc::channel(8);
        for i in 0..5 {
            let envelope = claimed(&store, &in_flight, &Message::new(format!("m{i}"))).await;
            tx.send(envelope).await.unwrap();
        }
        drop(tx);

        let handler = |_message: Message| async { Ok(()) };
        let mut pool = WorkerPool::spawn(
            2,
            rx,
            Arc::clone(&store),
            Arc::new(handler),
            settings(None),
        );
        assert_eq!(pool.len(), 2);

        pool.join().await;

        assert!(pool.is_empty());
        assert_eq!(store.len(&QueueName::new("q")).await.unwrap(), 0);
        assert!(in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_handler_does_not_kill_workers() {
        let store = Arc::new(MemoryStore::new());
        let in_flight = Arc::new(InFlight::new());
        let (tx, rx) = mpsc::channel(8);
        for body in ["poison", "poison", "fine"] {
            let envelope = claimed(&store, &in_flight, &Message::new(body)).await;
            tx.send(envelope).await.unwrap();
        }

        let handler = |message: Message| async move {
            if message.body == "poison" {
                panic!("cannot handle poison");
            }
            Ok::<(), HandlerError>(())
        };
        let mut pool = WorkerPool::spawn(
            1,
            rx,
            Arc::clone(&store),
            Arc::new(handler),
            settings(None),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.len(), 1);
        drop(tx);
        pool.join().await;

        // Both poison copies were requeued with an attempt recorded; the good
        // message was acknowledged by the same worker.
        let contents = store.contents(&QueueName::new("q"));
        assert_eq!(contents.len(), 2);
        for stored in &contents {
            let message = Message::decode(stored);
            assert_eq!(message.body, "poison");
            assert_eq!(message.attempts, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_stuck_workers() {
        let store = Arc::new(MemoryStore::new());
        let in_flight = Arc::new(InFlight::new());
        let (tx, rx) = mpsc::channel(8);
        let envelope = claimed(&store, &in_flight, &Message::new("stuck")).await;
        tx.send(envelope).await.unwrap();

        let handler = |_message: Message| std::future::pending::<Result<(), HandlerError>>();
        let mut pool = WorkerPool::spawn(
            1,
            rx,
            Arc::clone(&store),
            Arc::new(handler),
            settings(None),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.abort(), 1);
        pool.join().await;

        // Unsettled: the value is still queued and no longer claimed.
        assert_eq!(store.len(&QueueName::new("q")).await.unwrap(), 1);
        assert!(in_flight.is_empty());
    }
}
