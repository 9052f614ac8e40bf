//! Session loop: long-poll cycle, reconnect backoff, and state transitions.
//!
//! One task per client. Each cycle polls with the registry snapshot taken
//! when the request is issued; a registry change abandons the in-flight
//! poll and issues a new one, so a poll never mixes two snapshots.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ReconnectPolicy;
use crate::error::TransportError;
use crate::listener::Dispatcher;
use crate::registry::SubscriptionSet;
use crate::transport::{PollRequest, PollResponse, Transport};
use crate::types::{Event, SessionState, StatusCategory, StatusEvent, Timetoken};

type Snapshot = Arc<SubscriptionSet>;

pub(crate) struct SessionLoop {
    pub transport: Arc<dyn Transport>,
    pub dispatcher: Arc<Dispatcher>,
    pub registry_rx: watch::Receiver<Snapshot>,
    pub state_tx: watch::Sender<SessionState>,
    pub cursor_tx: watch::Sender<Timetoken>,
    pub shutdown: CancellationToken,
    pub poll_timeout: Duration,
    pub policy: ReconnectPolicy,
}

/// What woke a waiting session.
enum Wake<T> {
    Shutdown,
    /// The registry published a new snapshot (`false`: registry dropped).
    Registry(bool),
    Done(T),
}

pub(crate) async fn run_session(session: SessionLoop) {
    let mut runner = Runner::new(session);
    runner.run().await;
}

struct Runner {
    s: SessionLoop,
    snapshot: Snapshot,
    cursor: Timetoken,
    /// Consecutive reconnect attempts since the last successful poll.
    attempt: u32,
    malformed_failures: u32,
    /// Status to emit on the next successful poll.
    announce: Option<StatusCategory>,
    /// Catch-up revision already applied to the cursor.
    applied_catch_up: u64,
    /// Subscribe revision that was current when the session halted.
    halted_at_revision: u64,
}

impl Runner {
    fn new(mut s: SessionLoop) -> Self {
        let snapshot = Arc::clone(&s.registry_rx.borrow_and_update());
        let cursor = *s.cursor_tx.borrow();
        Self {
            s,
            snapshot,
            cursor,
            attempt: 0,
            malformed_failures: 0,
            announce: None,
            applied_catch_up: 0,
            halted_at_revision: 0,
        }
    }

    async fn run(&mut self) {
        let mut state = if self.snapshot.is_empty() {
            SessionState::Idle
        } else {
            self.announce = Some(StatusCategory::Connected);
            SessionState::Connecting
        };

        loop {
            self.set_state(state);
            state = match state {
                SessionState::Idle => self.idle().await,
                SessionState::Halted => self.halted().await,
                SessionState::Connecting | SessionState::Connected => self.poll(state).await,
                SessionState::Reconnecting => self.backoff().await,
                SessionState::Stopped => break,
            };
        }

        tracing::info!("Session stopped");
        self.emit_status(StatusCategory::Cancelled, &self.snapshot, None);
        self.s.dispatcher.clear();
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.s.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Session state changed");
        }
    }

    // -----------------------------------------------------------------------
    // Waiting states
    // -----------------------------------------------------------------------

    async fn idle(&mut self) -> SessionState {
        loop {
            if !self.next_snapshot().await {
                return SessionState::Stopped;
            }
            if !self.snapshot.is_empty() {
                tracing::info!(channels = ?self.snapshot.channels(), "Subscribing");
                self.announce = Some(StatusCategory::Connected);
                return SessionState::Connecting;
            }
        }
    }

    async fn halted(&mut self) -> SessionState {
        loop {
            if !self.next_snapshot().await {
                return SessionState::Stopped;
            }
            if self.snapshot.is_empty() {
                return SessionState::Idle;
            }
            if self.snapshot.subscribe_revision() > self.halted_at_revision {
                tracing::info!("Subscribe after halt, restarting session");
                self.attempt = 0;
                self.malformed_failures = 0;
                self.announce = Some(StatusCategory::Connected);
                return SessionState::Connecting;
            }
        }
    }

    /// Waits for the next registry snapshot. Returns `false` on shutdown.
    async fn next_snapshot(&mut self) -> bool {
        let wake: Wake<()> = tokio::select! {
            biased;
            _ = self.s.shutdown.cancelled() => Wake::Shutdown,
            changed = self.s.registry_rx.changed() => Wake::Registry(changed.is_ok()),
        };
        match wake {
            Wake::Registry(true) => {
                self.snapshot = Arc::clone(&self.s.registry_rx.borrow_and_update());
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Poll cycle
    // -----------------------------------------------------------------------

    async fn poll(&mut self, state: SessionState) -> SessionState {
        let latest = Arc::clone(&self.s.registry_rx.borrow_and_update());
        let previous = std::mem::replace(&mut self.snapshot, latest);
        if self.snapshot.is_empty() {
            return self.enter_idle(&previous);
        }
        self.apply_catch_up();
        let issued = Arc::clone(&self.snapshot);
        let request = PollRequest {
            channels: issued.poll_channels(),
            groups: issued.poll_groups(),
            cursor: self.cursor,
            timeout: self.s.poll_timeout,
        };
        tracing::trace!(cursor = %request.cursor, channels = ?request.channels, "Polling");

        let transport = Arc::clone(&self.s.transport);
        let in_flight = transport.poll(request);
        tokio::pin!(in_flight);

        let result = loop {
            let wake = tokio::select! {
                biased;
                _ = self.s.shutdown.cancelled() => Wake::Shutdown,
                result = &mut in_flight => Wake::Done(result),
                changed = self.s.registry_rx.changed() => Wake::Registry(changed.is_ok()),
            };
            match wake {
                Wake::Shutdown | Wake::Registry(false) => return SessionState::Stopped,
                Wake::Done(result) => break result,
                Wake::Registry(true) => {
                    self.snapshot = Arc::clone(&self.s.registry_rx.borrow_and_update());
                    if self.snapshot.is_empty() {
                        return self.enter_idle(&issued);
                    }
                    if *self.snapshot == *issued && !self.catch_up_pending() {
                        // Idempotent subscribe: keep the current poll.
                        continue;
                    }
                    tracing::debug!("Subscriptions changed, restarting poll");
                    return state;
                }
            }
        };

        match result {
            Ok(response) => self.on_success(response, &issued),
            Err(error) => self.on_failure(error, &issued, state),
        }
    }

    fn on_success(&mut self, response: PollResponse, issued: &SubscriptionSet) -> SessionState {
        self.attempt = 0;
        self.malformed_failures = 0;
        self.commit_cursor(response.next_cursor);
        self.set_state(SessionState::Connected);

        if let Some(category) = self.announce.take() {
            tracing::info!(cursor = %self.cursor, ?category, "Connected");
            self.emit_status(category, issued, None);
        }
        for event in &response.events {
            self.s.dispatcher.dispatch(event);
        }
        SessionState::Connected
    }

    fn on_failure(
        &mut self,
        error: TransportError,
        issued: &SubscriptionSet,
        state: SessionState,
    ) -> SessionState {
        match &error {
            TransportError::Auth { .. } => {
                tracing::error!("Access denied, halting session: {error}");
                self.emit_status(StatusCategory::AccessDenied, issued, Some(error.to_string()));
                self.halt();
                return SessionState::Halted;
            }
            TransportError::Malformed(_) => {
                self.malformed_failures += 1;
                if self.malformed_failures <= self.s.policy.malformed_retry_limit {
                    tracing::warn!(
                        attempt = self.malformed_failures,
                        limit = self.s.policy.malformed_retry_limit,
                        "Malformed response, retrying: {error}"
                    );
                    return state;
                }
                self.malformed_failures = 0;
            }
            TransportError::Network(_) | TransportError::Timeout => {
                self.malformed_failures = 0;
            }
        }

        tracing::warn!(attempt = self.attempt + 1, "Poll failed: {error}");
        self.announce.get_or_insert(StatusCategory::Reconnected);
        self.emit_status(failure_category(&error), issued, Some(error.to_string()));
        SessionState::Reconnecting
    }

    // -----------------------------------------------------------------------
    // Reconnect backoff
    // -----------------------------------------------------------------------

    async fn backoff(&mut self) -> SessionState {
        self.attempt += 1;
        if self.s.policy.attempts_exhausted(self.attempt) {
            let message = format!(
                "reconnect failed after {} attempts",
                self.attempt.saturating_sub(1)
            );
            tracing::error!("{message}");
            let snapshot = Arc::clone(&self.snapshot);
            self.emit_status(StatusCategory::ReconnectionFailed, &snapshot, Some(message));
            self.halt();
            return SessionState::Halted;
        }

        let delay = self.s.policy.delay_for_attempt(self.attempt);
        tracing::debug!(
            attempt = self.attempt,
            ?delay,
            "Reconnecting after backoff"
        );
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.s.shutdown.cancelled() => Wake::Shutdown,
                _ = &mut sleep => Wake::Done(()),
                changed = self.s.registry_rx.changed() => Wake::Registry(changed.is_ok()),
            };
            match wake {
                Wake::Shutdown | Wake::Registry(false) => return SessionState::Stopped,
                Wake::Done(()) => return SessionState::Connecting,
                Wake::Registry(true) => {
                    let previous = Arc::clone(&self.snapshot);
                    self.snapshot = Arc::clone(&self.s.registry_rx.borrow_and_update());
                    if self.snapshot.is_empty() {
                        return self.enter_idle(&previous);
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn enter_idle(&mut self, previous: &SubscriptionSet) -> SessionState {
        tracing::info!("All subscriptions removed, session idle");
        self.attempt = 0;
        self.malformed_failures = 0;
        self.announce = None;
        self.emit_status(StatusCategory::Disconnected, previous, None);
        SessionState::Idle
    }

    fn halt(&mut self) {
        self.halted_at_revision = self.s.registry_rx.borrow().subscribe_revision();
        self.attempt = 0;
        self.malformed_failures = 0;
        self.announce = None;
    }

    fn catch_up_pending(&self) -> bool {
        self.snapshot
            .catch_up()
            .is_some_and(|c| c.revision > self.applied_catch_up)
    }

    /// Explicit reset requested by a catch-up subscribe; the only rewind.
    fn apply_catch_up(&mut self) {
        if let Some(catch_up) = self.snapshot.catch_up()
            && catch_up.revision > self.applied_catch_up
        {
            self.applied_catch_up = catch_up.revision;
            tracing::info!(cursor = %catch_up.cursor, "Resetting cursor for catch-up");
            self.cursor = catch_up.cursor;
            self.s.cursor_tx.send_replace(self.cursor);
        }
    }

    fn commit_cursor(&mut self, next: Timetoken) {
        if next > self.cursor {
            tracing::trace!(from = %self.cursor, to = %next, "Cursor advanced");
            self.cursor = next;
            self.s.cursor_tx.send_replace(next);
        } else if next < self.cursor {
            tracing::debug!(current = %self.cursor, received = %next, "Ignoring older cursor");
        }
    }

    fn emit_status(
        &self,
        category: StatusCategory,
        subscriptions: &SubscriptionSet,
        error: Option<String>,
    ) {
        let event = Event::Status(StatusEvent {
            category,
            channels: subscriptions.channels(),
            groups: subscriptions.groups(),
            timetoken: self.cursor,
            error,
        });
        self.s.dispatcher.dispatch(&event);
    }
}

fn failure_category(error: &TransportError) -> StatusCategory {
    match error {
        TransportError::Auth { .. } => StatusCategory::AccessDenied,
        TransportError::Network(_) => StatusCategory::NetworkIssues,
        TransportError::Timeout => StatusCategory::Timeout,
        TransportError::Malformed(_) => StatusCategory::MalformedResponse,
    }
}
