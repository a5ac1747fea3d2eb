//! Process configuration from the environment.
//!
//! Every setting has a default, so an empty environment yields a working
//! local setup (Redis on localhost, HTTP on port 3000). A variable that is set
//! but cannot be parsed, or is out of range, is an error: the process refuses
//! to start rather than silently running with a default.
//!
//! | Variable                         | Default                   |
//! |----------------------------------|---------------------------|
//! | `CAROUSEL_REDIS_URL`             | `redis://127.0.0.1:6379`  |
//! | `CAROUSEL_LISTEN_ADDR`           | `0.0.0.0:3000`            |
//! | `CAROUSEL_QUEUE`                 | `message_queue`           |
//! | `CAROUSEL_DEAD_LETTER_QUEUE`     | `<queue>:dead`            |
//! | `CAROUSEL_NOTIFY_CHANNEL`        | `messages`                |
//! | `CAROUSEL_CHANNEL_CAPACITY`      | `64`                      |
//! | `CAROUSEL_WORKERS`               | `4`                       |
//! | `CAROUSEL_ROTATE_TIMEOUT_MS`     | `0` (block indefinitely)  |
//! | `CAROUSEL_BACKOFF_INITIAL_MS`    | `100`                     |
//! | `CAROUSEL_BACKOFF_MAX_MS`        | `30000`                   |
//! | `CAROUSEL_MAX_ATTEMPTS`          | `10` (`0` never gives up) |
//! | `CAROUSEL_HANDLER_TIMEOUT_MS`    | `0` (no limit)            |
//! | `CAROUSEL_SHUTDOWN_GRACE_SECS`   | `30`                      |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::dispatch::{
    BackoffConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_ATTEMPTS, DEFAULT_WORKERS,
    DispatcherConfig,
};
use crate::gateway::DEFAULT_NOTIFY_CHANNEL;
use crate::types::QueueName;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_QUEUE: &str = "message_queue";

/// Errors in the process configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("{key}: cannot parse {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// A variable parses but is out of range.
    #[error("{key}: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

/// Result type for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub listen_addr: SocketAddr,
    pub queue: QueueName,
    pub dead_letter_queue: QueueName,
    pub notify_channel: String,
    pub channel_capacity: usize,
    pub workers: usize,
    pub rotate_timeout: Duration,
    pub backoff: BackoffConfig,
    pub max_attempts: Option<u32>,
    pub handler_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup };

        let queue = QueueName::new(
            vars.string("CAROUSEL_QUEUE")
                .unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
        );
        let dead_letter_queue = vars
            .string("CAROUSEL_DEAD_LETTER_QUEUE")
            .map(QueueName::new)
            .unwrap_or_else(|| queue.dead_letter());
        if dead_letter_queue == queue {
            return Err(out_of_range(
                "CAROUSEL_DEAD_LETTER_QUEUE",
                "must differ from CAROUSEL_QUEUE",
            ));
        }

        let channel_capacity =
            vars.parse("CAROUSEL_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY)?;
        if channel_capacity == 0 {
            return Err(out_of_range("CAROUSEL_CHANNEL_CAPACITY", "must be at least 1"));
        }

        let workers = vars.parse("CAROUSEL_WORKERS", DEFAULT_WORKERS)?;
        if workers == 0 {
            return Err(out_of_range("CAROUSEL_WORKERS", "must be at least 1"));
        }

        let backoff = BackoffConfig {
            initial_delay: vars.millis(
                "CAROUSEL_BACKOFF_INITIAL_MS",
                BackoffConfig::DEFAULT.initial_delay,
            )?,
            max_delay: vars.millis("CAROUSEL_BACKOFF_MAX_MS", BackoffConfig::DEFAULT.max_delay)?,
            ..BackoffConfig::DEFAULT
        };
        if backoff.initial_delay.is_zero() {
            return Err(out_of_range("CAROUSEL_BACKOFF_INITIAL_MS", "must be at least 1"));
        }
        if backoff.max_delay < backoff.initial_delay {
            return Err(out_of_range(
                "CAROUSEL_BACKOFF_MAX_MS",
                "must not be below CAROUSEL_BACKOFF_INITIAL_MS",
            ));
        }

        let max_attempts = match vars.parse("CAROUSEL_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)? {
            0 => None,
            n => Some(n),
        };

        let handler_timeout = vars.millis("CAROUSEL_HANDLER_TIMEOUT_MS", Duration::ZERO)?;
        let handler_timeout = (!handler_timeout.is_zero()).then_some(handler_timeout);

        Ok(Config {
            redis_url: vars
                .string("CAROUSEL_REDIS_URL")
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            listen_addr: vars.parse(
                "CAROUSEL_LISTEN_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 3000)),
            )?,
            queue,
            dead_letter_queue,
            notify_channel: vars
                .string("CAROUSEL_NOTIFY_CHANNEL")
                .unwrap_or_else(|| DEFAULT_NOTIFY_CHANNEL.to_string()),
            channel_capacity,
            workers,
            rotate_timeout: vars.millis("CAROUSEL_ROTATE_TIMEOUT_MS", Duration::ZERO)?,
            backoff,
            max_attempts,
            handler_timeout,
            shutdown_grace: Duration::from_secs(
                vars.parse("CAROUSEL_SHUTDOWN_GRACE_SECS", 30u64)?,
            ),
        })
    }

    /// Returns the dispatcher part of the configuration.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::new(self.queue.clone())
            .with_dead_letter_queue(self.dead_letter_queue.clone())
            .with_channel_capacity(self.channel_capacity)
            .with_workers(self.workers)
            .with_rotate_timeout(self.rotate_timeout)
            .with_backoff(self.backoff)
            .with_max_attempts(self.max_attempts)
            .with_handler_timeout(self.handler_timeout)
            .with_shutdown_grace(self.shutdown_grace)
    }
}

fn out_of_range(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::OutOfRange {
        key,
        reason: reason.to_string(),
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// Returns the trimmed value, treating blank values as unset.
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default_ms).map(Duration::from_millis)
    }
}
