//! Carousel - an at-least-once message dispatcher over a rotating Redis list.
//!
//! Messages are published over HTTP into a durable list. A single consumer
//! rotates the list (`BRPOPLPUSH` onto itself) and hands each value to a
//! bounded worker pool; a value only leaves the list once its handler has
//! succeeded, so a crash at any point loses nothing.

pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod server;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_utils;
