//! Listener capability trait and event fan-out.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

use crate::types::{Event, MessageEvent, PresenceEvent, StatusEvent};

/// Receiver of session events.
///
/// Every method defaults to a no-op, so a listener implements only the
/// capabilities it cares about. Callbacks run on the session task: they must
/// not block, but they may call back into the [`Client`](crate::Client).
pub trait Listener: Send + Sync {
    fn on_message(&self, _event: &MessageEvent) {}
    fn on_presence(&self, _event: &PresenceEvent) {}
    fn on_status(&self, _event: &StatusEvent) {}
}

type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// [`Listener`] assembled from closures.
///
/// ```
/// use pubsub_session::CallbackListener;
///
/// let listener = CallbackListener::new()
///     .with_message(|m| println!("{}: {}", m.channel, m.payload))
///     .with_status(|s| println!("status: {:?}", s.category));
/// # drop(listener);
/// ```
#[derive(Default)]
pub struct CallbackListener {
    message: Option<Callback<MessageEvent>>,
    presence: Option<Callback<PresenceEvent>>,
    status: Option<Callback<StatusEvent>>,
}

impl CallbackListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, f: impl Fn(&MessageEvent) + Send + Sync + 'static) -> Self {
        self.message = Some(Box::new(f));
        self
    }

    pub fn with_presence(mut self, f: impl Fn(&PresenceEvent) + Send + Sync + 'static) -> Self {
        self.presence = Some(Box::new(f));
        self
    }

    pub fn with_status(mut self, f: impl Fn(&StatusEvent) + Send + Sync + 'static) -> Self {
        self.status = Some(Box::new(f));
        self
    }
}

impl Listener for CallbackListener {
    fn on_message(&self, event: &MessageEvent) {
        if let Some(f) = &self.message {
            f(event);
        }
    }

    fn on_presence(&self, event: &PresenceEvent) {
        if let Some(f) = &self.presence {
            f(event);
        }
    }

    fn on_status(&self, event: &StatusEvent) {
        if let Some(f) = &self.status {
            f(event);
        }
    }
}

/// Handle returned by [`Client::add_listener`](crate::Client::add_listener).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
struct Entry {
    id: ListenerId,
    listener: Arc<dyn Listener>,
}

/// Registration-ordered listener list.
///
/// Dispatch walks a snapshot, so listeners added or removed from inside a
/// callback take effect from the next event on.
pub(crate) struct Dispatcher {
    listeners: ArcSwap<Vec<Entry>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            listeners: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry { id, listener };
        self.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(entry.clone());
            next
        });
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            let next: Vec<Entry> = current.iter().filter(|e| e.id != id).cloned().collect();
            removed = next.len() != current.len();
            next
        });
        removed
    }

    pub fn clear(&self) {
        self.listeners.store(Arc::new(Vec::new()));
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn dispatch(&self, event: &Event) {
        let snapshot = self.listeners.load_full();
        for entry in snapshot.iter() {
            match event {
                Event::Message(m) => entry.listener.on_message(m),
                Event::Presence(p) => entry.listener.on_presence(p),
                Event::Status(s) => entry.listener.on_status(s),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event stream adapter
// ---------------------------------------------------------------------------

/// Forwards events into a channel. Messages and presence events are bounded
/// by `capacity` and dropped when the consumer lags; status events are never
/// dropped.
struct StreamListener {
    tx: mpsc::UnboundedSender<Event>,
    pending: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl StreamListener {
    fn forward_data(&self, event: Event) {
        if self.pending.load(Ordering::Acquire) >= self.capacity {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(total_dropped = total, "event stream full, dropping event");
            return;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(event).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Listener for StreamListener {
    fn on_message(&self, event: &MessageEvent) {
        self.forward_data(Event::Message(event.clone()));
    }

    fn on_presence(&self, event: &PresenceEvent) {
        self.forward_data(Event::Presence(event.clone()));
    }

    fn on_status(&self, event: &StatusEvent) {
        let _ = self.tx.send(Event::Status(event.clone()));
    }
}

/// Pull-based view of the client's events, created by
/// [`Client::event_stream`](crate::Client::event_stream).
///
/// Dropping the stream unregisters it.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Event>,
    pending: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    id: ListenerId,
    dispatcher: Weak<Dispatcher>,
}

impl EventStream {
    pub(crate) fn register(dispatcher: &Arc<Dispatcher>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let id = dispatcher.add(Arc::new(StreamListener {
            tx,
            pending: Arc::clone(&pending),
            dropped: Arc::clone(&dropped),
            capacity: capacity.max(1),
        }));
        Self {
            rx,
            pending,
            dropped,
            id,
            dispatcher: Arc::downgrade(dispatcher),
        }
    }

    /// Receive the next event. Returns `None` once the client has stopped.
    pub async fn next(&mut self) -> Option<Event> {
        let event = self.rx.recv().await?;
        if !matches!(event, Event::Status(_)) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        Some(event)
    }

    /// Number of messages and presence events dropped because the stream was
    /// full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.remove(self.id);
        }
    }
}
