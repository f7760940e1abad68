// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Broker Client Adapter: a thin contract over an MQTT client, plus a real
//! adapter backed by `rumqttc` and (for tests) an in-process fake broker.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::error::{BrokerError, CommunicationError, CommunicationErrorKind};

/// Delivery guarantee requested for a publish or subscribe. Mirrors the
/// broker's own QoS levels; the core does not add anything beyond them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// At most once.
    AtMostOnce,
    /// At least once.
    AtLeastOnce,
    /// Exactly once.
    ExactlyOnce,
}

/// A last-will message registered at connect time, delivered by the broker
/// if the client disconnects without a clean shutdown.
#[derive(Debug, Clone)]
pub struct LastWill {
    /// Topic the will is published to.
    pub topic: String,
    /// Will payload.
    pub payload: Bytes,
    /// QoS for the will publish.
    pub qos: QoS,
}

/// An inbound publish delivered by the broker.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// The concrete topic the message was published to.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

/// Connection lifecycle events surfaced by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The client is connected and ready to publish/subscribe.
    Connected,
    /// The client has lost its connection to the broker.
    Disconnected,
    /// The client hit a non-fatal error while connected.
    Error(String),
}

/// Thin contract over an MQTT client: connect, subscribe, unsubscribe,
/// publish, receive. Implementations must accept `subscribe`/`unsubscribe`/
/// `publish` calls before the connection is established; the underlying
/// client is responsible for queueing them until it can flush to the wire.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publishes `payload` to `topic`.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<(), CommunicationError>;

    /// Subscribes to `filter`.
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), CommunicationError>;

    /// Unsubscribes from `filter`.
    async fn unsubscribe(&self, filter: &str) -> Result<(), CommunicationError>;
}

fn into_client_error(e: impl std::fmt::Display) -> CommunicationError {
    CommunicationErrorKind::Broker(BrokerError::Client(e.to_string())).into()
}

/// Real adapter over [`rumqttc`]. Owns a background task that drives the
/// client's event loop, forwarding inbound publishes on `incoming` and
/// connection lifecycle transitions on `events`.
pub struct MqttBrokerClient {
    client: rumqttc::AsyncClient,
}

/// Handles returned alongside a freshly connected [`MqttBrokerClient`].
pub struct MqttConnection {
    /// The adapter used to publish/subscribe/unsubscribe.
    pub client: MqttBrokerClient,
    /// Inbound publishes, delivered in the order the broker sent them.
    pub incoming: mpsc::Receiver<IncomingMessage>,
    /// Connection lifecycle transitions.
    pub events: watch::Receiver<BrokerEvent>,
}

impl MqttBrokerClient {
    /// Connects to `broker_url` (`mqtt://host:port` or `mqtts://host:port`)
    /// using `client_id`, registering `will` as the last-will message.
    ///
    /// # Errors
    /// Returns `ConfigurationInvalid` if `broker_url` cannot be parsed.
    pub fn connect(broker_url: &str, client_id: &str, will: Option<LastWill>) -> Result<MqttConnection, CommunicationError> {
        let (host, port, use_tls) = parse_broker_url(broker_url)?;

        let mut options = rumqttc::MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if use_tls {
            options.set_transport(rumqttc::Transport::Tls(rumqttc::TlsConfiguration::Native));
        }
        if let Some(will) = will {
            options.set_last_will(rumqttc::LastWill::new(
                will.topic,
                will.payload,
                to_rumqttc_qos(will.qos),
                false,
            ));
        }

        let (client, mut event_loop) = rumqttc::AsyncClient::new(options, 256);

        let (incoming_tx, incoming_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = watch::channel(BrokerEvent::Disconnected);

        tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(publish))) => {
                        let message = IncomingMessage {
                            topic: publish.topic,
                            payload: publish.payload,
                        };
                        if incoming_tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        log::info!("mqtt connection established");
                        let _ = events_tx.send(BrokerEvent::Connected);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("mqtt event loop error: {e}");
                        let _ = events_tx.send(BrokerEvent::Disconnected);
                        if events_tx.is_closed() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(MqttConnection {
            client: MqttBrokerClient { client },
            incoming: incoming_rx,
            events: events_rx,
        })
    }
}

fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn parse_broker_url(broker_url: &str) -> Result<(String, u16, bool), CommunicationError> {
    let uri = fluent_uri::Uri::parse(broker_url).map_err(|e| {
        CommunicationErrorKind::ConfigurationInvalid {
            property: "brokerUrl".to_string(),
            reason: e.to_string(),
        }
    })?;
    let scheme = uri.scheme().as_str();
    let use_tls = match scheme {
        "mqtt" => false,
        "mqtts" => true,
        other => {
            return Err(CommunicationErrorKind::ConfigurationInvalid {
                property: "brokerUrl".to_string(),
                reason: format!("unsupported scheme '{other}', expected mqtt or mqtts"),
            }
            .into());
        }
    };
    let authority = uri.authority().ok_or_else(|| {
        CommunicationError::from(CommunicationErrorKind::ConfigurationInvalid {
            property: "brokerUrl".to_string(),
            reason: "missing host".to_string(),
        })
    })?;
    let host = authority.host().to_string();
    let port = authority
        .port()
        .and_then(|p| p.as_str().parse::<u16>().ok())
        .unwrap_or(if use_tls { 8883 } else { 1883 });
    Ok((host, port, use_tls))
}

#[async_trait]
impl BrokerClient for MqttBrokerClient {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<(), CommunicationError> {
        self.client
            .publish(topic, to_rumqttc_qos(qos), retain, payload)
            .await
            .map_err(into_client_error)
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), CommunicationError> {
        self.client
            .subscribe(filter, to_rumqttc_qos(qos))
            .await
            .map_err(into_client_error)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), CommunicationError> {
        self.client.unsubscribe(filter).await.map_err(into_client_error)
    }
}

/// In-process fake broker used by tests: a shared hub that routes publishes
/// from any connected [`FakeBrokerClient`] to every other client whose
/// subscribed filters match, using the same topic-matching rules as a real
/// broker. Lets multi-manager scenarios (§8) run without a live MQTT server.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::{BrokerClient, BrokerError, CommunicationError, CommunicationErrorKind, IncomingMessage, QoS};
    use crate::topic::filter_matches;
    use async_trait::async_trait;
    use bytes::Bytes;

    #[derive(Debug)]
    struct Subscriber {
        filter: String,
        sender: mpsc::Sender<IncomingMessage>,
    }

    /// Shared routing hub for [`FakeBrokerClient`]s.
    #[derive(Clone, Default, Debug)]
    pub struct FakeBrokerHub {
        subscribers: Arc<Mutex<Vec<Subscriber>>>,
    }

    impl FakeBrokerHub {
        /// Creates a fresh, empty hub.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Connects a new client to this hub, returning its adapter and
        /// inbound message receiver.
        #[must_use]
        pub fn connect(&self) -> (FakeBrokerClient, mpsc::Receiver<IncomingMessage>) {
            let (sender, receiver) = mpsc::channel(256);
            (
                FakeBrokerClient {
                    hub: self.clone(),
                    sender,
                },
                receiver,
            )
        }
    }

    /// A single client's handle into a [`FakeBrokerHub`].
    #[derive(Clone, Debug)]
    pub struct FakeBrokerClient {
        hub: FakeBrokerHub,
        sender: mpsc::Sender<IncomingMessage>,
    }

    #[async_trait]
    impl BrokerClient for FakeBrokerClient {
        async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS, _retain: bool) -> Result<(), CommunicationError> {
            let subscribers = self.hub.subscribers.lock().unwrap();
            for sub in subscribers.iter() {
                if filter_matches(&sub.filter, topic) {
                    let _ = sub.sender.try_send(IncomingMessage {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                    });
                }
            }
            Ok(())
        }

        async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), CommunicationError> {
            self.hub.subscribers.lock().unwrap().push(Subscriber {
                filter: filter.to_string(),
                sender: self.sender.clone(),
            });
            Ok(())
        }

        async fn unsubscribe(&self, filter: &str) -> Result<(), CommunicationError> {
            let mut subscribers = self.hub.subscribers.lock().unwrap();
            if let Some(pos) = subscribers
                .iter()
                .position(|sub| sub.filter == filter && sub.sender.same_channel(&self.sender))
            {
                subscribers.remove(pos);
                Ok(())
            } else {
                Err(CommunicationErrorKind::Broker(BrokerError::Client(format!(
                    "not subscribed to '{filter}'"
                )))
                .into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case::test_case("mqtt://localhost:1883", "localhost", 1883, false; "explicit port")]
    #[test_case::test_case("mqtt://localhost", "localhost", 1883, false; "default mqtt port")]
    #[test_case::test_case("mqtts://broker.example.com", "broker.example.com", 8883, true; "default mqtts port")]
    fn parses_broker_url(url: &str, host: &str, port: u16, tls: bool) {
        let (h, p, t) = parse_broker_url(url).unwrap();
        assert_eq!(h, host);
        assert_eq!(p, port);
        assert_eq!(t, tls);
    }

    #[test]
    fn rejects_unsupported_scheme() {
        assert!(parse_broker_url("http://localhost").is_err());
    }
}
