//! Source lifecycle event handling.
//!
//! Events arrive at-least-once from the catalog's event stream; the
//! service makes every effect idempotent on `event_id` via the
//! processed-event ledger.

pub mod consumer;
pub mod service;
pub mod stream;

pub use consumer::EventConsumer;
pub use service::EventService;
pub use stream::{ChannelEventStream, EventPublisher, EventStreamClient, EventSubscription};
