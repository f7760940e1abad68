// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Subscription Registry: reference-counted bookkeeping over broker
//! subscriptions, so the broker only sees a `subscribe`/`unsubscribe` call
//! when the local observer count for a filter transitions across zero.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::broker::{BrokerClient, IncomingMessage, QoS};
use crate::error::CommunicationError;
use crate::topic::filter_matches;

const DISPATCH_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Entry {
    observers: usize,
    sender: broadcast::Sender<IncomingMessage>,
}

/// Tracks, per MQTT filter, how many local observers are attached, issuing a
/// broker subscribe on the 0→1 transition and an unsubscribe on 1→0.
#[derive(Debug)]
pub struct SubscriptionRegistry<B: BrokerClient> {
    broker: Arc<B>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl<B: BrokerClient> SubscriptionRegistry<B> {
    /// Creates a registry over `broker`, with no filters attached.
    #[must_use]
    pub fn new(broker: Arc<B>) -> Self {
        Self {
            broker,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Attaches a new observer to `filter`, issuing a broker subscribe if
    /// this is the first observer. Returns a receiver fed by [`Self::dispatch`].
    pub async fn attach(&self, filter: &str) -> Result<broadcast::Receiver<IncomingMessage>, CommunicationError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(filter) {
            entry.observers += 1;
            return Ok(entry.sender.subscribe());
        }

        self.broker.subscribe(filter, QoS::AtLeastOnce).await?;
        let (sender, receiver) = broadcast::channel(DISPATCH_CHANNEL_CAPACITY);
        entries.insert(
            filter.to_string(),
            Entry {
                observers: 1,
                sender,
            },
        );
        Ok(receiver)
    }

    /// Detaches one observer from `filter`, issuing a broker unsubscribe once
    /// the last observer detaches. A filter with no attached observers is a
    /// no-op.
    pub async fn detach(&self, filter: &str) -> Result<(), CommunicationError> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(filter) else {
            return Ok(());
        };
        entry.observers = entry.observers.saturating_sub(1);
        if entry.observers == 0 {
            entries.remove(filter);
            self.broker.unsubscribe(filter).await?;
        }
        Ok(())
    }

    /// Routes an inbound message to every attached filter it matches. A
    /// message matching no filter (already detached, or delivered after an
    /// unsubscribe raced with a broker flush) is silently dropped.
    pub async fn dispatch(&self, message: IncomingMessage) {
        let entries = self.entries.lock().await;
        for (filter, entry) in entries.iter() {
            if filter_matches(filter, &message.topic) {
                let _ = entry.sender.send(message.clone());
            }
        }
    }

    /// Re-issues broker subscribes for every currently attached filter.
    /// Called after a reconnect, since the broker does not remember
    /// subscriptions made before a dropped connection.
    pub async fn resubscribe_all(&self) -> Result<(), CommunicationError> {
        let entries = self.entries.lock().await;
        for filter in entries.keys() {
            self.broker.subscribe(filter, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Returns the number of distinct filters currently attached. Exposed for
    /// tests and diagnostics.
    #[must_use]
    pub async fn filter_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}
