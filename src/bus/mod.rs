//! Message bus: one publish/subscribe interface over two broker technologies.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Application code                            │
//! │  publish(topic, message, options) / subscribe(topic, h)     │
//! └─────────────────────────────────────────────────────────────┘
//!                            │  Arc<dyn MessageBroker>
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │     select_broker(MESSAGE_BROKER)  ── exactly one adapter    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//! ┌───────────────────────┐          ┌────────────────────────────┐
//! │ AmqpBroker            │          │ KafkaBroker                │
//! │ exchange/routing key  │          │ topic/consumer group       │
//! │ publisher confirms    │          │ shared lazy producer       │
//! │ no bootstrap rollback │          │ bootstrap rollback         │
//! └───────────────────────┘          └────────────────────────────┘
//!          │                                      │
//!          ▼                                      ▼
//!   AmqpConnection (trait)               LogBrokerClient (trait)
//! ```
//!
//! `subscribe` only records intent in a [`PendingSubscriptions`] list. The
//! host calls `bootstrap` once, after all wiring, to start real consumers,
//! and `shutdown` once at teardown.

mod broker;
mod handler;
mod pending;
mod selector;

pub use broker::{MessageBroker, PublishExt, PublishOptions};
pub use handler::{handler, typed_handler, MessageHandler};
pub use pending::PendingSubscriptions;
pub use selector::{select_broker, BrokerAdapters, BrokerKind};
