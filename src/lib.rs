//! Client-side event stream engine for pool and cycle feeds.
//!
//! Payloads arrive from an on-chain log subscription, a fallback socket or
//! HTTP polling, are decoded into [`events::CanonicalEvent`]s, filtered for
//! recency, throttled, deduplicated, and then broadcast to every consumer
//! subscribed to that event type. See [`engine::StreamEngine`].

pub mod config;
pub mod decode;
pub mod engine;
pub mod events;
pub mod pipeline;
pub mod registry;
pub mod storage;
pub mod transport;

pub use engine::{StreamEngine, Subscription};
pub use events::{CanonicalEvent, EventType};
