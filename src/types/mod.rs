//! Core domain types for the dispatcher.

pub mod ids;
pub mod message;

pub use ids::{MessageId, QueueName};
pub use message::Message;
