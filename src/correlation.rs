// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Correlation Engine: allocates message tokens, binds an outgoing request to
//! a response filter, and multiplexes concurrent requests over one shared
//! subscription registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};

use crate::broker::{BrokerClient, IncomingMessage};
use crate::error::{CommunicationError, CommunicationErrorKind};
use crate::registry::SubscriptionRegistry;

/// Whether a response stream for a token is still open or has already been
/// torn down. Retained after close so a second attach on the same token is
/// rejected rather than silently re-subscribing.
#[derive(Debug)]
enum TokenState {
    Open,
    Closed,
}

#[derive(Debug)]
struct Shared<B: BrokerClient> {
    registry: Arc<SubscriptionRegistry<B>>,
    tokens: Mutex<HashMap<String, TokenState>>,
}

/// Generates message tokens for one component and correlates outgoing
/// requests with their responses. Owns no broker connection of its own; it
/// dispatches subscribes through the shared [`SubscriptionRegistry`].
pub struct CorrelationEngine<B: BrokerClient> {
    shared: Arc<Shared<B>>,
    source_id_wire: String,
    counter: AtomicU64,
}

impl<B: BrokerClient> CorrelationEngine<B> {
    /// Creates a correlation engine for a component whose wire-encoded
    /// source id is `source_id_wire`. `has_associated_user` selects the
    /// initial counter value per the token counter convention: 0 when an
    /// associated user is configured, 1 otherwise.
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry<B>>, source_id_wire: String, has_associated_user: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                tokens: Mutex::new(HashMap::new()),
            }),
            source_id_wire,
            counter: AtomicU64::new(u64::from(!has_associated_user)),
        }
    }

    /// Allocates a fresh, process-local message token and increments the
    /// counter.
    #[must_use]
    pub fn next_token(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}_{}", self.source_id_wire, n)
    }

    /// Opens a response stream for `token`, subscribing to `response_filter`.
    /// Fails with `ResubscribeForbidden` if a stream for this token was ever
    /// opened before, per the single-PendingRequest-per-token invariant.
    pub async fn open_response_stream(&self, token: &str, response_filter: &str) -> Result<ResponseStream<B>, CommunicationError> {
        let mut tokens = self.shared.tokens.lock().await;
        if tokens.contains_key(token) {
            return Err(CommunicationErrorKind::ResubscribeForbidden(token.to_string()).into());
        }
        tokens.insert(token.to_string(), TokenState::Open);
        drop(tokens);

        match self.shared.registry.attach(response_filter).await {
            Ok(receiver) => Ok(ResponseStream {
                token: token.to_string(),
                filter: response_filter.to_string(),
                receiver,
                shared: Arc::clone(&self.shared),
            }),
            Err(e) => {
                self.shared.tokens.lock().await.remove(token);
                Err(e)
            }
        }
    }
}

/// A live subscription to responses for one outstanding request. Dropping
/// this without calling [`Self::close`] leaks the broker subscription until
/// the registry's other observers (if any) detach it; callers should always
/// close explicitly once they stop awaiting responses.
#[derive(Debug)]
pub struct ResponseStream<B: BrokerClient> {
    token: String,
    filter: String,
    receiver: broadcast::Receiver<IncomingMessage>,
    shared: Arc<Shared<B>>,
}

impl<B: BrokerClient> ResponseStream<B> {
    /// Waits for the next matching response. Returns `None` once the
    /// underlying channel is closed (registry torn down, or sender dropped).
    pub async fn recv(&mut self) -> Option<IncomingMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Detaches from the registry and marks this token's request sequence as
    /// closed, so a later [`CorrelationEngine::open_response_stream`] call
    /// for the same token is rejected.
    pub async fn close(self) -> Result<(), CommunicationError> {
        let mut tokens = self.shared.tokens.lock().await;
        tokens.insert(self.token.clone(), TokenState::Closed);
        drop(tokens);
        self.shared.registry.detach(&self.filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBrokerHub;
    use bytes::Bytes;

    fn engine(has_user: bool) -> (CorrelationEngine<crate::broker::fake::FakeBrokerClient>, crate::broker::fake::FakeBrokerClient) {
        let hub = FakeBrokerHub::new();
        let (client, _incoming) = hub.connect();
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(client.clone())));
        (
            CorrelationEngine::new(registry, "3d34eb53-2536-4134-b0cd-8c406b94bb80".to_string(), has_user),
            client,
        )
    }

    #[test]
    fn first_token_starts_at_zero_with_associated_user() {
        let (engine, _client) = engine(true);
        assert_eq!(engine.next_token(), "3d34eb53-2536-4134-b0cd-8c406b94bb80_0");
        assert_eq!(engine.next_token(), "3d34eb53-2536-4134-b0cd-8c406b94bb80_1");
    }

    #[test]
    fn first_token_starts_at_one_without_associated_user() {
        let (engine, _client) = engine(false);
        assert_eq!(engine.next_token(), "3d34eb53-2536-4134-b0cd-8c406b94bb80_1");
        assert_eq!(engine.next_token(), "3d34eb53-2536-4134-b0cd-8c406b94bb80_2");
    }

    #[tokio::test]
    async fn response_is_delivered_to_open_stream() {
        let (engine, client) = engine(true);
        let token = engine.next_token();
        let filter = format!("coaty/1/Resolve/+/+/{token}");
        let mut stream = engine.open_response_stream(&token, &filter).await.unwrap();

        client
            .publish(
                &format!("coaty/1/Resolve/-/peer/{token}"),
                Bytes::from_static(b"{}"),
                crate::broker::QoS::AtLeastOnce,
                false,
            )
            .await
            .unwrap();

        let message = stream.recv().await.unwrap();
        assert_eq!(message.topic, format!("coaty/1/Resolve/-/peer/{token}"));
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn reattach_after_close_is_forbidden() {
        let (engine, _client) = engine(true);
        let token = engine.next_token();
        let filter = format!("coaty/1/Resolve/+/+/{token}");

        let stream = engine.open_response_stream(&token, &filter).await.unwrap();
        stream.close().await.unwrap();

        let second = engine.open_response_stream(&token, &filter).await;
        assert!(matches!(
            second.unwrap_err().kind(),
            CommunicationErrorKind::ResubscribeForbidden(_)
        ));
    }

    #[tokio::test]
    async fn second_open_while_first_still_open_is_forbidden() {
        let (engine, _client) = engine(true);
        let token = engine.next_token();
        let filter = format!("coaty/1/Resolve/+/+/{token}");

        let _first = engine.open_response_stream(&token, &filter).await.unwrap();
        let second = engine.open_response_stream(&token, &filter).await;
        assert!(second.is_err());
    }
}
