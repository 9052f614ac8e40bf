//! Subscription session core for a channel-based pub/sub broker.
//!
//! One [`Client`] keeps one logical long-poll session to the broker,
//! multiplexing every subscribed channel and channel group over it.
//!
//! # Features
//! - Channel and channel-group subscriptions with optional presence
//! - Interrupt-on-change: a subscription change restarts the in-flight poll
//! - Automatic reconnection with capped exponential backoff
//! - Listener dispatch in registration order, or a pull-based [`EventStream`]
//! - One-shot publishes with an explicit retry for transient failures
//! - Pluggable [`Transport`]; [`HttpTransport`] is the default
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pubsub_session::Error> {
//! use std::sync::Arc;
//!
//! use pubsub_session::{CallbackListener, Client, Config};
//!
//! let config = Config::new("demo").with_publish_key("demo");
//! let client = Client::with_http(config)?;
//!
//! client.add_listener(Arc::new(
//!     CallbackListener::new()
//!         .with_message(|m| println!("{}: {}", m.channel, m.payload))
//!         .with_status(|s| println!("status: {:?}", s.category)),
//! ));
//! client.subscribe(["room1"], true);
//!
//! match client.publish("room1", "hello", false).await {
//!     Ok(timetoken) => println!("published at {timetoken}"),
//!     Err(failure) => println!("{failure}"),
//! }
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
mod http;
mod listener;
mod protocol;
mod publish;
mod registry;
mod session;
mod transport;
mod types;

pub use client::{Client, WeakClient};
pub use config::{Config, ReconnectPolicy};
pub use error::{Error, PublishError, TransportError};
pub use http::HttpTransport;
pub use listener::{CallbackListener, EventStream, Listener, ListenerId};
pub use publish::{PublishFailure, PublishHandle};
pub use registry::SubscriptionSet;
pub use transport::{PollRequest, PollResponse, PublishRequest, Transport};
pub use types::{
    Event, MessageEvent, PresenceAction, PresenceEvent, SessionState, StatusCategory, StatusEvent,
    Timetoken,
};
