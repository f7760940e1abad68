// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Raw publish/subscribe bypasses the structured envelope entirely: no JSON
//! decoding, no echo suppression, and — since a single sender's messages
//! preserve wire order per §5 — three sequential sends arrive in order.

use std::time::Duration;

use bytes::Bytes;
use communication_core::broker::{fake::FakeBrokerHub, BrokerEvent};
use communication_core::manager::{CommunicationManager, CommunicationOptionsBuilder};
use tokio::sync::watch;

fn options(name: &str) -> communication_core::manager::CommunicationOptions {
    CommunicationOptionsBuilder::default()
        .broker_url("mqtt://localhost:1883")
        .identity_name(name)
        .build()
        .unwrap()
}

async fn spawn(hub: &FakeBrokerHub, name: &str) -> CommunicationManager<communication_core::broker::fake::FakeBrokerClient> {
    let (client, incoming) = hub.connect();
    let (events_tx, events_rx) = watch::channel(BrokerEvent::Disconnected);
    let manager = CommunicationManager::new(options(name), client, incoming, events_rx);
    manager.start().await.unwrap();
    events_tx.send(BrokerEvent::Connected).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager
}

#[tokio::test]
async fn three_sequential_raw_messages_are_received_in_order() {
    let hub = FakeBrokerHub::new();
    let sender = spawn(&hub, "sensor").await;
    let receiver = spawn(&hub, "dashboard").await;

    let mut inbox = receiver.observe_raw("devices/sensor-1/readings").await.unwrap();

    for value in ["21.0", "21.4", "21.9"] {
        sender.publish_raw("devices/sensor-1/readings", Bytes::from(value)).await.unwrap();
    }

    for expected in ["21.0", "21.4", "21.9"] {
        let (topic, payload) = inbox.recv().await.unwrap();
        assert_eq!(topic, "devices/sensor-1/readings");
        assert_eq!(payload, Bytes::from(expected));
    }
}

#[tokio::test]
async fn raw_publish_rejects_wildcards_but_subscribe_allows_them() {
    let hub = FakeBrokerHub::new();
    let sender = spawn(&hub, "sensor").await;
    let receiver = spawn(&hub, "dashboard").await;

    assert!(sender.publish_raw("devices/+/readings", Bytes::from_static(b"x")).await.is_err());

    let mut inbox = receiver.observe_raw("devices/+/readings").await.unwrap();
    sender.publish_raw("devices/sensor-7/readings", Bytes::from_static(b"42")).await.unwrap();
    let (topic, payload) = inbox.recv().await.unwrap();
    assert_eq!(topic, "devices/sensor-7/readings");
    assert_eq!(payload, Bytes::from_static(b"42"));
}

#[tokio::test]
async fn raw_messages_are_not_echo_suppressed() {
    let hub = FakeBrokerHub::new();
    let agent = spawn(&hub, "agent").await;

    let mut inbox = agent.observe_raw("devices/self/readings").await.unwrap();
    agent.publish_raw("devices/self/readings", Bytes::from_static(b"loopback")).await.unwrap();

    let (topic, payload) = inbox.recv().await.unwrap();
    assert_eq!(topic, "devices/self/readings");
    assert_eq!(payload, Bytes::from_static(b"loopback"));
}
