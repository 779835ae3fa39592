//! Server-pushed events and their subscribers.
//!
//! Events arrive as JSON-RPC notifications whose `method` is a
//! [`SubscriptionId`] and whose `params` is the payload.

mod publisher;
mod subscription_id;

pub use publisher::{Event, EventPublisher, EventSubscriber, Subscription, PURGE_INTERVAL};
pub use subscription_id::{SubscriptionId, DELIMITER, SUBSCRIPTION_ALL, WILDCARD};
