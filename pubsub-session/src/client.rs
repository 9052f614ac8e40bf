//! Public entry point: [`Client`].

use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, PublishError};
use crate::http::HttpTransport;
use crate::listener::{Dispatcher, EventStream, Listener, ListenerId};
use crate::publish::{PublishHandle, Publisher};
use crate::registry::Registry;
use crate::session::{SessionLoop, run_session};
use crate::transport::{PublishRequest, Transport};
use crate::types::{SessionState, Timetoken};

/// Handle to one subscription session.
///
/// Cloning is cheap; all clones share the session. Subscription calls only
/// swap the registry snapshot and return immediately, so they are safe to
/// make from inside listener callbacks. The session stops on
/// [`shutdown`](Client::shutdown) or when the last clone is dropped.
///
/// Listeners are owned by the client, so a listener that calls back into it
/// should capture a [`WeakClient`] from [`downgrade`](Client::downgrade);
/// a captured `Client` keeps the session alive until `shutdown`.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Client`], for use inside listener callbacks.
#[derive(Clone)]
pub struct WeakClient {
    inner: Weak<Inner>,
}

impl WeakClient {
    /// `None` once every `Client` clone has been dropped.
    pub fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

struct Inner {
    config: Arc<Config>,
    registry: Registry,
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<Publisher>,
    state_rx: watch::Receiver<SessionState>,
    cursor_rx: watch::Receiver<Timetoken>,
    shutdown: CancellationToken,
    session: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Client {
    /// Starts a session over `transport`. Must be called within a Tokio
    /// runtime; the session loop runs on its own task.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        config.validate()?;
        let config = Arc::new(config);

        let registry = Registry::new();
        let dispatcher = Arc::new(Dispatcher::new());
        let shutdown = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (cursor_tx, cursor_rx) = watch::channel(Timetoken::ZERO);

        let publisher = Arc::new(Publisher::new(
            Arc::clone(&transport),
            shutdown.clone(),
            config.request_timeout,
            config.max_publish_size,
        ));

        let session = tokio::spawn(run_session(SessionLoop {
            transport,
            dispatcher: Arc::clone(&dispatcher),
            registry_rx: registry.watch(),
            state_tx,
            cursor_tx,
            shutdown: shutdown.clone(),
            poll_timeout: config.poll_timeout,
            policy: config.reconnect.clone(),
        }));
        tracing::info!(uuid = %config.uuid, origin = %config.origin, "Client started");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                dispatcher,
                publisher,
                state_rx,
                cursor_rx,
                shutdown,
                session: Mutex::new(Some(session)),
            }),
        })
    }

    /// Starts a session over the default [`HttpTransport`].
    pub fn with_http(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Self::new(config, Arc::new(transport))
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Adds channels; already subscribed channels are left as they are,
    /// except that `with_presence` can turn presence on.
    pub fn subscribe<I, S>(&self, channels: I, with_presence: bool)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .registry
            .subscribe_channels(channels, with_presence, None);
    }

    /// Like [`subscribe`](Client::subscribe), and resumes the session from
    /// `cursor` on the next poll.
    pub fn subscribe_with_cursor<I, S>(&self, channels: I, with_presence: bool, cursor: Timetoken)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .registry
            .subscribe_channels(channels, with_presence, Some(cursor));
    }

    pub fn subscribe_groups<I, S>(&self, groups: I, with_presence: bool)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.registry.subscribe_groups(groups, with_presence);
    }

    /// Removes channels. Unknown channels are ignored.
    pub fn unsubscribe<I, S>(&self, channels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.inner.registry.unsubscribe_channels(channels) {
            tracing::debug!("Unsubscribe matched no channel");
        }
    }

    pub fn unsubscribe_groups<I, S>(&self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.inner.registry.unsubscribe_groups(groups) {
            tracing::debug!("Unsubscribe matched no group");
        }
    }

    pub fn unsubscribe_all(&self) {
        self.inner.registry.clear();
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.inner.registry.snapshot().channels()
    }

    pub fn subscribed_groups(&self) -> Vec<String> {
        self.inner.registry.snapshot().groups()
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Publishes `payload` as JSON to `channel`. Independent of the
    /// subscription state; await the handle for the assigned timetoken.
    ///
    /// Takes the channel first, like [`subscribe`](Client::subscribe), not
    /// the payload-first `publish(payload, channel, compressed)` order.
    pub fn publish<T>(&self, channel: impl Into<String>, payload: &T, compressed: bool) -> PublishHandle
    where
        T: Serialize + ?Sized,
    {
        let channel = channel.into();
        match serde_json::to_vec(payload) {
            Ok(bytes) => self.inner.publisher.publish(PublishRequest {
                channel,
                payload: Bytes::from(bytes),
                compressed,
            }),
            Err(e) => {
                let request = PublishRequest {
                    channel,
                    payload: Bytes::new(),
                    compressed,
                };
                self.inner
                    .publisher
                    .rejected(Arc::new(request), PublishError::Encode(e.to_string()))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Listeners
    // -----------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> ListenerId {
        self.inner.dispatcher.add(listener)
    }

    /// Takes effect from the next dispatch pass.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.dispatcher.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.dispatcher.len()
    }

    /// Registers a buffered listener and returns its receiving end.
    pub fn event_stream(&self) -> EventStream {
        EventStream::register(&self.inner.dispatcher, self.inner.config.event_capacity)
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        *self.inner.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_rx.clone()
    }

    /// Last cursor committed by the session.
    pub fn cursor(&self) -> Timetoken {
        *self.inner.cursor_rx.borrow()
    }

    /// Cancels the in-flight poll and every pending publish, then waits for
    /// the session to reach [`SessionState::Stopped`].
    pub async fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!("Shutting down client");
            self.inner.shutdown.cancel();
        }
        let task = self
            .inner
            .session
            .lock()
            .ok()
            .and_then(|mut session| session.take());
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!("Session task ended abnormally: {e}");
        }
        let mut state = self.inner.state_rx.clone();
        let _ = state.wait_for(|s| *s == SessionState::Stopped).await;
    }
}
