// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Communication Manager: operating-state machine, deferred publish queue,
//! identity advertisement, and the public observe/publish/request API.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use derive_builder::Builder;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

use crate::broker::{BrokerClient, BrokerEvent, IncomingMessage, LastWill, QoS};
use crate::correlation::CorrelationEngine;
use crate::error::{CommunicationError, CommunicationErrorKind};
use crate::event::{CommunicationEvent, DeadvertiseData, EventData};
use crate::object::{CoatyObject, Component};
use crate::registry::SubscriptionRegistry;
use crate::topic::{decode_identifier, encode_identifier, validate_raw_publish_topic, validate_raw_subscribe_filter, EventKind, Topic, PROTOCOL_VERSION};

/// Operating states of a [`CommunicationManager`]. Transitions form a cycle;
/// observers see a strictly monotone subsequence of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingState {
    /// Constructed, never started.
    Initial,
    /// `start()` called, broker connection in progress.
    Starting,
    /// Connected, subscriptions restored, identity advertised.
    Online,
    /// `stop()`/`shutdown()` called, draining and unsubscribing.
    Stopping,
    /// Disconnected, either after a clean stop or a dropped connection.
    Offline,
}

/// Typed configuration for a [`CommunicationManager`]. Construct with
/// [`CommunicationOptionsBuilder`].
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", setter(into))]
pub struct CommunicationOptions {
    /// Broker endpoint, e.g. `mqtt://localhost:1883`.
    pub broker_url: String,
    /// Friendly name of the manager's own Component.
    #[builder(default)]
    pub identity_name: String,
    /// Start the manager automatically once constructed. Consumed by the
    /// container boundary; the manager itself does not act on it.
    #[builder(default = "false")]
    pub should_auto_start: bool,
    /// Advertise the manager's own Component on Online.
    #[builder(default = "true")]
    pub should_advertise_identity: bool,
    /// Advertise the configured associated Device on Online.
    #[builder(default = "false")]
    pub should_advertise_device: bool,
    /// Use name-prefixed readable identifiers in topics.
    #[builder(default = "false")]
    pub use_readable_topics: bool,
    /// User object included in topics as the associated-user level.
    #[builder(default, setter(strip_option))]
    pub associated_user: Option<CoatyObject>,
    /// Device object advertised when `should_advertise_device` is set.
    #[builder(default, setter(strip_option))]
    pub associated_device: Option<CoatyObject>,
    /// Maximum number of queued publishes while offline. `None` means
    /// unbounded; `Some(n)` drops the oldest entry past `n` with a warning.
    #[builder(default, setter(strip_option))]
    pub deferred_publish_queue_bound: Option<usize>,
}

struct DeferredPublish {
    topic: String,
    payload: Bytes,
}

struct Inner<B: BrokerClient> {
    identity: Component,
    own_source_wire: String,
    options: CommunicationOptions,
    broker: Arc<B>,
    registry: Arc<SubscriptionRegistry<B>>,
    correlation: CorrelationEngine<B>,
    state_tx: watch::Sender<OperatingState>,
    deferred: Mutex<VecDeque<DeferredPublish>>,
    shut_down: AtomicBool,
}

/// The event bus handle controllers publish and observe through. Cheap to
/// clone; clones share the same broker connection, registry, and state.
pub struct CommunicationManager<B: BrokerClient> {
    inner: Arc<Inner<B>>,
}

impl<B: BrokerClient> Clone for CommunicationManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Synthesizes the last-will payload: a Deadvertise for `identity`, encoded
/// exactly as the manager would publish it itself on an orderly stop.
fn last_will_for(identity: &Component, own_source_wire: &str, user_wire: Option<&str>) -> Result<LastWill, CommunicationError> {
    let data = DeadvertiseData {
        object_ids: vec![identity.object_id()],
    };
    let token = format!("{own_source_wire}_will");
    let topic = Topic {
        version: PROTOCOL_VERSION,
        event_kind: EventKind::Deadvertise,
        filter: None,
        associated_user_id: user_wire.map(str::to_string),
        source_id: own_source_wire.to_string(),
        message_token: token,
    };
    Ok(LastWill {
        topic: topic.encode()?,
        payload: Bytes::from(serde_json::to_vec(&data).map_err(|e| {
            CommunicationErrorKind::InvalidPayload {
                event_kind: EventKind::Deadvertise.as_str(),
                reason: e.to_string(),
            }
        })?),
        qos: QoS::AtLeastOnce,
    })
}

impl<B: BrokerClient + 'static> CommunicationManager<B> {
    /// Builds a manager around an already-constructed broker adapter. Use
    /// [`crate::broker::MqttBrokerClient::connect`] (or a test fake) to
    /// obtain `broker`, `incoming`, and `broker_events`, then pass them here.
    /// Spawns the background dispatch task that drives state transitions and
    /// inbound routing; it runs for the lifetime of the last clone.
    #[must_use]
    pub fn new(options: CommunicationOptions, broker: B, incoming: mpsc::Receiver<IncomingMessage>, broker_events: watch::Receiver<BrokerEvent>) -> Self {
        let identity = Component::new("coaty.CommunicationManager", options.identity_name.clone());
        Self::new_with_identity(identity, options, broker, incoming, broker_events)
    }

    fn new_with_identity(identity: Component, options: CommunicationOptions, broker: B, incoming: mpsc::Receiver<IncomingMessage>, broker_events: watch::Receiver<BrokerEvent>) -> Self {
        let readable = options.use_readable_topics;
        let own_source_wire = encode_identifier(identity.object_id(), Some(identity.name()), readable);
        let broker = Arc::new(broker);
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&broker)));
        let has_user = options.associated_user.is_some();
        let correlation = CorrelationEngine::new(Arc::clone(&registry), own_source_wire.clone(), has_user);
        let (state_tx, _) = watch::channel(OperatingState::Initial);

        let manager = Self {
            inner: Arc::new(Inner {
                identity,
                own_source_wire,
                options,
                broker,
                registry,
                correlation,
                state_tx,
                deferred: Mutex::new(VecDeque::new()),
                shut_down: AtomicBool::new(false),
            }),
        };

        manager.spawn_dispatch_loop(incoming, broker_events);
        manager
    }

    fn spawn_dispatch_loop(&self, mut incoming: mpsc::Receiver<IncomingMessage>, mut broker_events: watch::Receiver<BrokerEvent>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = incoming.recv() => {
                        match message {
                            Some(message) => manager.inner.registry.dispatch(message).await,
                            None => return,
                        }
                    }
                    changed = broker_events.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let event = broker_events.borrow_and_update().clone();
                        manager.handle_broker_event(event).await;
                    }
                }
            }
        });
    }

    async fn handle_broker_event(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                let was_online = *self.inner.state_tx.borrow() == OperatingState::Online;
                if !was_online {
                    self.set_state(OperatingState::Starting);
                }
                if let Err(e) = self.inner.registry.resubscribe_all().await {
                    log::error!("failed to restore subscriptions on reconnect: {e}");
                }
                self.drain_deferred().await;
                self.set_state(OperatingState::Online);
                if self.inner.options.should_advertise_identity {
                    if let Err(e) = self.advertise_identity().await {
                        log::error!("failed to advertise identity: {e}");
                    }
                }
                if self.inner.options.should_advertise_device {
                    if let Err(e) = self.advertise_device().await {
                        log::error!("failed to advertise associated device: {e}");
                    }
                }
            }
            BrokerEvent::Disconnected => {
                log::warn!("broker disconnected");
                self.set_state(OperatingState::Offline);
            }
            BrokerEvent::Error(reason) => {
                log::error!("broker error: {reason}");
            }
        }
    }

    fn set_state(&self, state: OperatingState) {
        log::info!("communication manager transitioning to {state:?}");
        let _ = self.inner.state_tx.send(state);
    }

    /// Subscribes to operating-state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<OperatingState> {
        self.inner.state_tx.subscribe()
    }

    /// Returns the manager's own identity Component.
    #[must_use]
    pub fn identity(&self) -> &Component {
        &self.inner.identity
    }

    async fn advertise_identity(&self) -> Result<(), CommunicationError> {
        let data = crate::event::AdvertiseData {
            object: self.inner.identity.object.clone(),
        };
        let event = CommunicationEvent::try_new(data, self.inner.identity.object_id(), self.associated_user_id(), self.inner.correlation.next_token())?;
        self.publish(&event).await
    }

    async fn advertise_device(&self) -> Result<(), CommunicationError> {
        let Some(device) = self.inner.options.associated_device.clone() else {
            log::warn!("should_advertise_device is set but no associated_device is configured");
            return Ok(());
        };
        let data = crate::event::AdvertiseData { object: device };
        let event = CommunicationEvent::try_new(data, self.inner.identity.object_id(), self.associated_user_id(), self.inner.correlation.next_token())?;
        self.publish(&event).await
    }

    async fn deadvertise_identity(&self) -> Result<(), CommunicationError> {
        let data = DeadvertiseData {
            object_ids: vec![self.inner.identity.object_id()],
        };
        let event = CommunicationEvent::try_new(data, self.inner.identity.object_id(), self.associated_user_id(), self.inner.correlation.next_token())?;
        self.publish(&event).await
    }

    fn associated_user_id(&self) -> Option<uuid::Uuid> {
        self.inner.options.associated_user.as_ref().map(|u| u.object_id)
    }

    fn associated_user_wire(&self) -> Option<String> {
        self.inner
            .options
            .associated_user
            .as_ref()
            .map(|u| encode_identifier(u.object_id, Some(&u.name), self.inner.options.use_readable_topics))
    }

    /// Starts the manager: opens the broker connection's advertised state
    /// machine, restores subscriptions, and drains deferred publishes once
    /// the connection comes up.
    ///
    /// # Errors
    /// Returns `InvalidState` if the manager is not `Initial` or `Offline`.
    pub async fn start(&self) -> Result<(), CommunicationError> {
        self.ensure_not_shut_down()?;
        let current = *self.inner.state_tx.borrow();
        if !matches!(current, OperatingState::Initial | OperatingState::Offline) {
            return Err(CommunicationErrorKind::InvalidState(format!("cannot start from {current:?}")).into());
        }
        self.set_state(OperatingState::Starting);
        Ok(())
    }

    /// Stops the manager: advertises a self-Deadvertise, drains pending
    /// publishes, unsubscribes everything, and transitions to `Offline`.
    ///
    /// # Errors
    /// Returns `InvalidState` if the manager is not `Starting` or `Online`.
    pub async fn stop(&self) -> Result<(), CommunicationError> {
        let current = *self.inner.state_tx.borrow();
        if !matches!(current, OperatingState::Starting | OperatingState::Online) {
            return Err(CommunicationErrorKind::InvalidState(format!("cannot stop from {current:?}")).into());
        }
        self.set_state(OperatingState::Stopping);
        if self.inner.options.should_advertise_identity {
            if let Err(e) = self.deadvertise_identity().await {
                log::error!("failed to publish self-deadvertise: {e}");
            }
        }
        self.drain_deferred().await;
        self.set_state(OperatingState::Offline);
        Ok(())
    }

    /// Stops the manager (if running) and marks it permanently shut down:
    /// every subsequent publish/observe call fails with `ShutDown`.
    pub async fn shutdown(&self) -> Result<(), CommunicationError> {
        let current = *self.inner.state_tx.borrow();
        if matches!(current, OperatingState::Starting | OperatingState::Online) {
            self.stop().await?;
        }
        self.inner.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn ensure_not_shut_down(&self) -> Result<(), CommunicationError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(CommunicationErrorKind::ShutDown.into());
        }
        Ok(())
    }

    async fn drain_deferred(&self) {
        let mut queue = self.inner.deferred.lock().await;
        while let Some(entry) = queue.pop_front() {
            if let Err(e) = self.inner.broker.publish(&entry.topic, entry.payload, QoS::AtLeastOnce, false).await {
                log::error!("failed to flush deferred publish to '{}': {e}", entry.topic);
            }
        }
    }

    async fn enqueue_or_publish(&self, topic: String, payload: Bytes) -> Result<(), CommunicationError> {
        if *self.inner.state_tx.borrow() == OperatingState::Online {
            return self.inner.broker.publish(&topic, payload, QoS::AtLeastOnce, false).await;
        }
        let mut queue = self.inner.deferred.lock().await;
        if let Some(bound) = self.inner.options.deferred_publish_queue_bound {
            if queue.len() >= bound {
                log::warn!("deferred publish queue full (bound {bound}); dropping oldest entry");
                queue.pop_front();
            }
        }
        queue.push_back(DeferredPublish { topic, payload });
        Ok(())
    }

    /// Publishes `event`. Queued if the manager is not `Online`.
    ///
    /// # Errors
    /// Returns `ShutDown` if the manager has been shut down, or a topic
    /// encoding error if `event`'s data fails its own filter validation.
    pub async fn publish<D: EventData>(&self, event: &CommunicationEvent<D>) -> Result<(), CommunicationError> {
        self.ensure_not_shut_down()?;
        let topic = Topic {
            version: PROTOCOL_VERSION,
            event_kind: D::KIND,
            filter: event.data.filter(),
            associated_user_id: self.associated_user_wire(),
            source_id: self.inner.own_source_wire.clone(),
            message_token: event.message_token.clone(),
        };
        let wire_topic = topic.encode()?;
        let payload = Bytes::from(event.to_payload()?);
        self.enqueue_or_publish(wire_topic, payload).await
    }

    /// Observes inbound events of kind `D`, optionally narrowed to a single
    /// filter value (object type, operation name, or channel id). Events
    /// whose source is this manager's own identity are dropped.
    ///
    /// # Errors
    /// Returns `ShutDown` if the manager has been shut down.
    pub async fn observe<D: EventData>(&self, filter_value: Option<&str>) -> Result<EventStream<D>, CommunicationError> {
        self.ensure_not_shut_down()?;
        let event_type_level = match filter_value {
            Some(f) => format!("{}:{}", D::KIND.as_str(), f),
            // Every publish of a filter-carrying kind encodes that filter into
            // this same topic level (`Kind:filter`), so there is no literal
            // string that means "this kind, any filter" — the whole level
            // must be wildcarded, and `decode_inbound` re-checks the kind.
            None if D::KIND.allows_filter() => crate::topic::WILDCARD_ONE.to_string(),
            None => D::KIND.as_str().to_string(),
        };
        let filter = format!(
            "{}/{}/{}/{}/{}/{}",
            crate::topic::PROTOCOL_NAME,
            PROTOCOL_VERSION,
            event_type_level,
            crate::topic::WILDCARD_ONE,
            crate::topic::WILDCARD_ONE,
            crate::topic::WILDCARD_ONE
        );
        let receiver = self.inner.registry.attach(&filter).await?;
        Ok(EventStream {
            receiver,
            own_source_wire: self.inner.own_source_wire.clone(),
            _marker: PhantomData,
        })
    }

    /// Sends a request of kind `Req` and returns a lazy stream of `Res`
    /// responses correlated on a fresh message token.
    ///
    /// # Errors
    /// Propagates validation, encoding, and broker errors.
    pub async fn request<Req: EventData, Res: EventData>(&self, data: Req) -> Result<RequestStream<B, Res>, CommunicationError> {
        self.ensure_not_shut_down()?;
        data.validate()?;

        let token = self.inner.correlation.next_token();
        let request_filter = data.filter();
        let response_filter = Topic::response_filter(PROTOCOL_VERSION, Res::KIND, request_filter.as_deref(), &token);
        let response_stream = self.inner.correlation.open_response_stream(&token, &response_filter).await?;

        let event = CommunicationEvent::try_new(data, self.inner.identity.object_id(), self.associated_user_id(), token)?;
        self.publish(&event).await?;

        Ok(RequestStream {
            inner: response_stream,
            own_source_wire: self.inner.own_source_wire.clone(),
            _marker: PhantomData,
        })
    }

    /// Publishes an opaque byte payload directly to `topic`, bypassing the
    /// structured envelope. Never echo-suppressed on the receive side.
    ///
    /// # Errors
    /// Returns `InvalidTopic` if `topic` contains a wildcard or `NUL`.
    pub async fn publish_raw(&self, topic: &str, payload: Bytes) -> Result<(), CommunicationError> {
        self.ensure_not_shut_down()?;
        validate_raw_publish_topic(topic)?;
        self.enqueue_or_publish(topic.to_string(), payload).await
    }

    /// Observes raw byte messages on `filter`.
    ///
    /// # Errors
    /// Returns `InvalidTopic` if `filter` is empty or contains `NUL`.
    pub async fn observe_raw(&self, filter: &str) -> Result<RawStream, CommunicationError> {
        self.ensure_not_shut_down()?;
        validate_raw_subscribe_filter(filter)?;
        let receiver = self.inner.registry.attach(filter).await?;
        Ok(RawStream { receiver })
    }
}

impl CommunicationManager<crate::broker::MqttBrokerClient> {
    /// Connects to the broker named in `options.broker_url` and builds a
    /// manager around it, registering a last-will Deadvertise for the
    /// manager's own identity so an unexpected disconnect is still visible
    /// to peers.
    ///
    /// # Errors
    /// Propagates broker URL parsing and connection failures.
    pub fn connect(options: CommunicationOptions) -> Result<Self, CommunicationError> {
        let identity = Component::new("coaty.CommunicationManager", options.identity_name.clone());
        let readable = options.use_readable_topics;
        let own_source_wire = encode_identifier(identity.object_id(), Some(identity.name()), readable);
        let user_wire = options
            .associated_user
            .as_ref()
            .map(|u| encode_identifier(u.object_id, Some(&u.name), readable));
        let will = last_will_for(&identity, &own_source_wire, user_wire.as_deref())?;

        let connection = crate::broker::MqttBrokerClient::connect(&options.broker_url, &own_source_wire, Some(will))?;
        Ok(Self::new_with_identity(identity, options, connection.client, connection.incoming, connection.events))
    }
}

/// A stream of decoded, echo-suppressed events of kind `D`.
pub struct EventStream<D: EventData> {
    receiver: broadcast::Receiver<IncomingMessage>,
    own_source_wire: String,
    _marker: PhantomData<D>,
}

impl<D: EventData> EventStream<D> {
    /// Waits for the next event. Malformed messages and version mismatches
    /// are logged and skipped rather than surfaced.
    pub async fn recv(&mut self) -> Option<CommunicationEvent<D>> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => {
                    if let Some(event) = decode_inbound(&message, &self.own_source_wire) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }
}

/// A correlated stream of `Res` responses to one outgoing request.
pub struct RequestStream<B: BrokerClient, Res: EventData> {
    inner: crate::correlation::ResponseStream<B>,
    own_source_wire: String,
    _marker: PhantomData<Res>,
}

impl<B: BrokerClient, Res: EventData> RequestStream<B, Res> {
    /// Waits for the next matching response.
    pub async fn recv(&mut self) -> Option<CommunicationEvent<Res>> {
        loop {
            let message = self.inner.recv().await?;
            if let Some(event) = decode_inbound(&message, &self.own_source_wire) {
                return Some(event);
            }
        }
    }

    /// Detaches this request's response subscription. A second `request`
    /// call that reuses the same token is never possible since tokens are
    /// generated fresh per call; this only tears down the broker filter.
    ///
    /// # Errors
    /// Propagates broker unsubscribe failures.
    pub async fn close(self) -> Result<(), CommunicationError> {
        self.inner.close().await
    }
}

/// A stream of raw `(topic, payload)` pairs, undecoded and not echo-suppressed.
pub struct RawStream {
    receiver: broadcast::Receiver<IncomingMessage>,
}

impl RawStream {
    /// Waits for the next raw message.
    pub async fn recv(&mut self) -> Option<(String, Bytes)> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some((message.topic, message.payload)),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }
}

fn decode_inbound<D: EventData>(message: &IncomingMessage, own_source_wire: &str) -> Option<CommunicationEvent<D>> {
    let topic = match Topic::decode(&message.topic) {
        Ok(topic) => topic,
        Err(e) => {
            log::warn!("dropping message on unparseable topic '{}': {e}", message.topic);
            return None;
        }
    };
    if topic.version != PROTOCOL_VERSION {
        log::warn!("dropping message at unsupported protocol version {}", topic.version);
        return None;
    }
    if topic.event_kind != D::KIND {
        return None;
    }
    if topic.source_id == own_source_wire {
        return None;
    }
    let source_id = match decode_identifier(&topic.source_id) {
        Ok(id) => id,
        Err(e) => {
            log::warn!("dropping message with unparseable source id: {e}");
            return None;
        }
    };
    let user_id = match topic.associated_user_id.as_deref().map(decode_identifier) {
        Some(Ok(id)) => Some(id),
        Some(Err(e)) => {
            log::warn!("dropping message with unparseable associated user id: {e}");
            return None;
        }
        None => None,
    };
    match CommunicationEvent::<D>::from_wire(&message.payload, source_id, user_id, topic.message_token) {
        Ok(event) => {
            log::trace!("dispatching {} event, token '{}'", D::KIND, event.message_token);
            Some(event)
        }
        Err(e) => {
            log::warn!("dropping malformed payload for {}: {e}", D::KIND);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBrokerHub;
    use crate::event::{AdvertiseData, DiscoverData, ResolveData};
    use crate::object::CoreType;

    fn options(name: &str) -> CommunicationOptions {
        CommunicationOptionsBuilder::default()
            .broker_url("mqtt://localhost:1883")
            .identity_name(name)
            .build()
            .unwrap()
    }

    fn spawn_manager(hub: &FakeBrokerHub, name: &str) -> (CommunicationManager<crate::broker::fake::FakeBrokerClient>, watch::Sender<BrokerEvent>) {
        let (client, incoming) = hub.connect();
        let (events_tx, events_rx) = watch::channel(BrokerEvent::Disconnected);
        let manager = CommunicationManager::new(options(name), client, incoming, events_rx);
        (manager, events_tx)
    }

    /// Starts `manager` and drives its broker event stream to `Connected`,
    /// waiting for the background dispatch loop to reach `Online`.
    async fn start_and_connect(manager: &CommunicationManager<crate::broker::fake::FakeBrokerClient>, events_tx: &watch::Sender<BrokerEvent>) {
        manager.start().await.unwrap();
        events_tx.send(BrokerEvent::Connected).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn start_transitions_through_online_and_drains_deferred_queue() {
        let hub = FakeBrokerHub::new();
        let (manager, events_tx) = spawn_manager(&hub, "agent-a");
        let mut states = manager.state();

        start_and_connect(&manager, &events_tx).await;
        assert_eq!(*states.borrow_and_update(), OperatingState::Online);
    }

    #[tokio::test]
    async fn discover_resolve_round_trip_across_two_managers() {
        let hub = FakeBrokerHub::new();
        let (requester, requester_events) = spawn_manager(&hub, "requester");
        let (responder, responder_events) = spawn_manager(&hub, "responder");
        start_and_connect(&requester, &requester_events).await;
        start_and_connect(&responder, &responder_events).await;

        let mut discover_inbox = responder.observe::<DiscoverData>(None).await.unwrap();
        let mut resolve_stream = requester
            .request::<DiscoverData, ResolveData>(DiscoverData {
                object_id: None,
                external_id: None,
                object_types: Some(vec!["coaty.test.MockObject".to_string()]),
                core_types: None,
            })
            .await
            .unwrap();

        let discover_event = discover_inbox.recv().await.unwrap();
        assert_eq!(discover_event.data.object_types.as_deref(), Some(&["coaty.test.MockObject".to_string()][..]));

        let object = CoatyObject::new(uuid::Uuid::new_v4(), CoreType::Object, "coaty.test.MockObject", "mock");
        let response = discover_event
            .respond(
                ResolveData {
                    object: Some(object.clone()),
                    related_objects: None,
                },
                responder.identity().object_id(),
            )
            .unwrap();
        responder.publish(&response).await.unwrap();

        let resolved = resolve_stream.recv().await.unwrap();
        assert_eq!(resolved.data.object.unwrap().object_id, object.object_id);
        resolve_stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn echo_suppression_drops_events_from_self() {
        let hub = FakeBrokerHub::new();
        let (manager, events_tx) = spawn_manager(&hub, "agent-a");
        start_and_connect(&manager, &events_tx).await;

        let mut inbox = manager.observe::<AdvertiseData>(None).await.unwrap();
        let object = CoatyObject::new(uuid::Uuid::new_v4(), CoreType::Object, "coaty.test.MockObject", "mock");
        let event = CommunicationEvent::try_new(AdvertiseData { object }, manager.identity().object_id(), None, "tok_1".to_string()).unwrap();
        manager.publish(&event).await.unwrap();

        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), inbox.recv()).await;
        assert!(timed_out.is_err(), "self-published event should have been echo-suppressed");
    }

    #[tokio::test]
    async fn publish_before_online_is_deferred_then_flushed() {
        let hub = FakeBrokerHub::new();
        let (client, incoming) = hub.connect();
        let (events_tx, events_rx) = watch::channel(BrokerEvent::Disconnected);
        let manager = CommunicationManager::new(options("agent-a"), client, incoming, events_rx);

        let (observer_client, observer_incoming) = hub.connect();
        let (obs_events_tx, obs_events_rx) = watch::channel(BrokerEvent::Disconnected);
        let observer = CommunicationManager::new(options("observer"), observer_client, observer_incoming, obs_events_rx);
        start_and_connect(&observer, &obs_events_tx).await;
        let mut inbox = observer.observe::<AdvertiseData>(None).await.unwrap();

        manager.start().await.unwrap();
        let object = CoatyObject::new(uuid::Uuid::new_v4(), CoreType::Object, "coaty.test.MockObject", "mock");
        let event = CommunicationEvent::try_new(AdvertiseData { object }, manager.identity().object_id(), None, "tok_1".to_string()).unwrap();
        manager.publish(&event).await.unwrap();

        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), inbox.recv()).await.is_err());

        events_tx.send(BrokerEvent::Connected).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let received = tokio::time::timeout(std::time::Duration::from_millis(50), inbox.recv()).await;
        assert!(received.is_ok_and(|e| e.is_some()));
    }

    #[tokio::test]
    async fn should_advertise_device_publishes_the_associated_device_on_online() {
        let hub = FakeBrokerHub::new();
        let (observer_client, observer_incoming) = hub.connect();
        let (observer_events_tx, observer_events_rx) = watch::channel(BrokerEvent::Disconnected);
        let observer = CommunicationManager::new(options("observer"), observer_client, observer_incoming, observer_events_rx);
        start_and_connect(&observer, &observer_events_tx).await;
        let mut inbox = observer.observe::<AdvertiseData>(None).await.unwrap();

        let device = CoatyObject::new(uuid::Uuid::new_v4(), CoreType::Device, "com.example.Thermostat", "thermostat-1");
        let (agent_client, agent_incoming) = hub.connect();
        let (agent_events_tx, agent_events_rx) = watch::channel(BrokerEvent::Disconnected);
        let agent_options = CommunicationOptionsBuilder::default()
            .broker_url("mqtt://localhost:1883")
            .identity_name("agent-a")
            .should_advertise_device(true)
            .associated_device(device.clone())
            .build()
            .unwrap();
        let agent = CommunicationManager::new(agent_options, agent_client, agent_incoming, agent_events_rx);
        start_and_connect(&agent, &agent_events_tx).await;

        let identity_advertise = inbox.recv().await.unwrap();
        assert_eq!(identity_advertise.data.object.object_id, agent.identity().object_id());

        let device_advertise = inbox.recv().await.unwrap();
        assert_eq!(device_advertise.data.object.object_id, device.object_id);
    }
}
