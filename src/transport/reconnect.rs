//! Subscription bookkeeping and the connect handler
//!
//! With a clean session the broker forgets every subscription when the link
//! drops. The [`ReconnectionHandler`] owns the set of subscriptions that must be
//! active while connected and re-applies all of it on each fresh session.

use super::{Qos, Session, TransportError};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Re-subscription failure on a fresh session
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Failed to subscribe to {topic}")]
pub struct SubscribeError {
    pub topic: String,
    #[source]
    pub source: TransportError,
}

/// Topic filters that must be active while the link is up
///
/// Keyed by topic so repeated inserts never create duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    entries: BTreeMap<String, Qos>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a subscription; returns true if the set changed
    pub fn insert(&mut self, topic: impl Into<String>, qos: Qos) -> bool {
        let topic = topic.into();
        match self.entries.insert(topic, qos) {
            Some(previous) => previous != qos,
            None => true,
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscriptions in topic order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Qos)> {
        self.entries.iter().map(|(topic, qos)| (topic.as_str(), *qos))
    }
}

impl<S: Into<String>> FromIterator<(S, Qos)> for SubscriptionSet {
    fn from_iter<I: IntoIterator<Item = (S, Qos)>>(iter: I) -> Self {
        let mut set = SubscriptionSet::new();
        for (topic, qos) in iter {
            set.insert(topic, qos);
        }
        set
    }
}

/// Runs on every fresh session before the link is reported up
#[derive(Debug, Clone, Default)]
pub struct ReconnectionHandler {
    subscriptions: SubscriptionSet,
}

impl ReconnectionHandler {
    pub fn new(subscriptions: SubscriptionSet) -> Self {
        Self { subscriptions }
    }

    pub fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }

    pub fn subscriptions_mut(&mut self) -> &mut SubscriptionSet {
        &mut self.subscriptions
    }

    /// Re-apply the full subscription set, stopping at the first failure
    pub async fn on_connect<S>(&self, session: &mut S) -> Result<usize, SubscribeError>
    where
        S: Session + ?Sized,
    {
        for (topic, qos) in self.subscriptions.iter() {
            session
                .subscribe(topic, qos)
                .await
                .map_err(|source| SubscribeError {
                    topic: topic.to_string(),
                    source,
                })?;
            debug!(topic = %topic, qos = ?qos, "Re-subscribed");
        }

        if !self.subscriptions.is_empty() {
            info!(
                count = self.subscriptions.len(),
                "Subscriptions re-applied on new session"
            );
        }
        Ok(self.subscriptions.len())
    }
}
