//! Subscription registry: the channel and group set the session loop polls.
//!
//! Every mutation builds a new [`SubscriptionSet`] and swaps it in whole, so
//! readers only ever see complete snapshots. The swap also wakes the session
//! loop through the `watch` channel; no network work happens here.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::types::Timetoken;

/// Suffix of the companion channel carrying presence events.
pub(crate) const PRESENCE_SUFFIX: &str = "-pnpres";

/// Immutable snapshot of the current subscriptions.
///
/// Equality compares the subscribed channels and groups only.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    /// Channel name → presence enabled.
    channels: BTreeMap<String, bool>,
    /// Group name → presence enabled.
    groups: BTreeMap<String, bool>,
    /// Bumped by every subscribe call, including idempotent ones.
    subscribe_revision: u64,
    catch_up: Option<CatchUp>,
}

/// Cursor requested by a catch-up subscribe, tagged with the revision that
/// requested it so the session applies it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CatchUp {
    pub revision: u64,
    pub cursor: Timetoken,
}

impl PartialEq for SubscriptionSet {
    fn eq(&self, other: &Self) -> bool {
        self.channels == other.channels && self.groups == other.groups
    }
}

impl Eq for SubscriptionSet {}

impl SubscriptionSet {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.groups.is_empty()
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    pub fn contains_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    pub fn contains_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn presence_enabled(&self, channel: &str) -> bool {
        self.channels.get(channel).copied().unwrap_or(false)
    }

    /// Channels sent on the wire: every channel plus the presence companion
    /// of each presence-enabled one.
    pub fn poll_channels(&self) -> Vec<String> {
        expand_presence(&self.channels)
    }

    pub fn poll_groups(&self) -> Vec<String> {
        expand_presence(&self.groups)
    }

    pub(crate) fn subscribe_revision(&self) -> u64 {
        self.subscribe_revision
    }

    pub(crate) fn catch_up(&self) -> Option<CatchUp> {
        self.catch_up
    }
}

fn expand_presence(entries: &BTreeMap<String, bool>) -> Vec<String> {
    let mut out = Vec::with_capacity(entries.len());
    for (name, presence) in entries {
        out.push(name.clone());
        if *presence {
            out.push(format!("{name}{PRESENCE_SUFFIX}"));
        }
    }
    out
}

#[derive(Clone, Copy)]
enum Kind {
    Channel,
    Group,
}

/// Owner of the current [`SubscriptionSet`].
pub(crate) struct Registry {
    tx: watch::Sender<Arc<SubscriptionSet>>,
}

impl Registry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(SubscriptionSet::default()));
        Self { tx }
    }

    /// Current snapshot. Never waits on the session loop.
    pub fn snapshot(&self) -> Arc<SubscriptionSet> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn watch(&self) -> watch::Receiver<Arc<SubscriptionSet>> {
        self.tx.subscribe()
    }

    pub fn subscribe_channels<I, S>(&self, channels: I, with_presence: bool, catch_up: Option<Timetoken>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe(Kind::Channel, channels, with_presence, catch_up);
    }

    pub fn subscribe_groups<I, S>(&self, groups: I, with_presence: bool)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe(Kind::Group, groups, with_presence, None);
    }

    /// Returns whether anything was removed.
    pub fn unsubscribe_channels<I, S>(&self, channels: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unsubscribe(Kind::Channel, channels)
    }

    pub fn unsubscribe_groups<I, S>(&self, groups: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unsubscribe(Kind::Group, groups)
    }

    pub fn clear(&self) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_empty() {
                return false;
            }
            let mut next = SubscriptionSet::clone(current);
            next.channels.clear();
            next.groups.clear();
            *current = Arc::new(next);
            true
        })
    }

    fn subscribe<I, S>(&self, kind: Kind, names: I, with_presence: bool, catch_up: Option<Timetoken>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names
            .into_iter()
            .map(Into::into)
            .filter(|n| !n.trim().is_empty())
            .collect();
        if names.is_empty() {
            return;
        }
        self.tx.send_modify(|current| {
            let mut next = SubscriptionSet::clone(current);
            next.subscribe_revision += 1;
            let entries = match kind {
                Kind::Channel => &mut next.channels,
                Kind::Group => &mut next.groups,
            };
            for name in names {
                // Presence stays enabled once requested.
                let presence = entries.entry(name).or_insert(false);
                *presence |= with_presence;
            }
            if let Some(cursor) = catch_up {
                next.catch_up = Some(CatchUp {
                    revision: next.subscribe_revision,
                    cursor,
                });
            }
            *current = Arc::new(next);
        });
    }

    fn unsubscribe<I, S>(&self, kind: Kind, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        self.tx.send_if_modified(|current| {
            let existing = match kind {
                Kind::Channel => &current.channels,
                Kind::Group => &current.groups,
            };
            if !names.iter().any(|n| existing.contains_key(n)) {
                return false;
            }
            let mut next = SubscriptionSet::clone(current);
            let entries = match kind {
                Kind::Channel => &mut next.channels,
                Kind::Group => &mut next.groups,
            };
            for name in &names {
                entries.remove(name);
            }
            *current = Arc::new(next);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_is_idempotent() {
        let registry = Registry::new();
        registry.subscribe_channels(["A"], false, None);
        let once = registry.snapshot();
        registry.subscribe_channels(["A"], false, None);
        let twice = registry.snapshot();
        assert_eq!(*once, *twice);
        assert_eq!(twice.channels(), vec!["A".to_string()]);
    }

    #[test]
    fn unsubscribe_unknown_channel_is_noop() {
        let registry = Registry::new();
        registry.subscribe_channels(["A"], false, None);
        let mut rx = registry.watch();
        rx.borrow_and_update();

        assert!(!registry.unsubscribe_channels(["B"]));
        assert!(!rx.has_changed().unwrap());
        assert_eq!(registry.snapshot().channels(), vec!["A".to_string()]);
    }

    #[test]
    fn snapshot_is_not_affected_by_later_mutation() {
        let registry = Registry::new();
        registry.subscribe_channels(["room1"], false, None);
        let before = registry.snapshot();
        registry.subscribe_channels(["room2"], false, None);
        registry.unsubscribe_channels(["room1"]);

        assert_eq!(before.channels(), vec!["room1".to_string()]);
        assert_eq!(registry.snapshot().channels(), vec!["room2".to_string()]);
    }

    #[test]
    fn presence_expands_poll_channels() {
        let registry = Registry::new();
        registry.subscribe_channels(["a", "b"], false, None);
        registry.subscribe_channels(["b"], true, None);
        registry.subscribe_groups(["g"], true);

        let snap = registry.snapshot();
        assert_eq!(
            snap.poll_channels(),
            vec!["a".to_string(), "b".to_string(), "b-pnpres".to_string()]
        );
        assert_eq!(snap.poll_groups(), vec!["g".to_string(), "g-pnpres".to_string()]);
        assert!(snap.presence_enabled("b"));
        assert!(!snap.presence_enabled("a"));
    }

    #[test]
    fn presence_is_sticky() {
        let registry = Registry::new();
        registry.subscribe_channels(["a"], true, None);
        registry.subscribe_channels(["a"], false, None);
        assert!(registry.snapshot().presence_enabled("a"));
    }

    #[test]
    fn subscribe_notifies_watchers() {
        let registry = Registry::new();
        let mut rx = registry.watch();
        rx.borrow_and_update();
        registry.subscribe_channels(["a"], false, None);
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().contains_channel("a"));
    }

    #[test]
    fn empty_names_are_ignored() {
        let registry = Registry::new();
        registry.subscribe_channels(["", "  "], false, None);
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.snapshot().subscribe_revision(), 0);
    }

    #[test]
    fn catch_up_is_tagged_with_revision() {
        let registry = Registry::new();
        registry.subscribe_channels(["a"], false, None);
        registry.subscribe_channels(["b"], false, Some(Timetoken(100)));
        registry.subscribe_channels(["c"], false, None);

        let snap = registry.snapshot();
        assert_eq!(
            snap.catch_up(),
            Some(CatchUp {
                revision: 2,
                cursor: Timetoken(100)
            })
        );
        assert_eq!(snap.subscribe_revision(), 3);
    }

    #[test]
    fn clear_removes_channels_and_groups() {
        let registry = Registry::new();
        registry.subscribe_channels(["a"], false, None);
        registry.subscribe_groups(["g"], false);
        assert!(registry.clear());
        assert!(registry.snapshot().is_empty());
        assert!(!registry.clear());
    }

    #[test]
    fn groups_and_channels_are_separate() {
        let registry = Registry::new();
        registry.subscribe_groups(["shared"], false);
        assert!(!registry.unsubscribe_channels(["shared"]));
        assert!(registry.snapshot().contains_group("shared"));
        assert!(registry.unsubscribe_groups(["shared"]));
        assert!(registry.snapshot().is_empty());
    }
}
