// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Connects two agents to a live broker, has one discover objects of a given
//! type and the other resolve the request. Requires a reachable broker at
//! `mqtt://localhost:1883` (see `ENABLE_NETWORK_TESTS` in the test suite for
//! the same assumption).

use std::time::Duration;

use env_logger::Builder;

use communication_core::event::{CommunicationEvent, DiscoverData, ResolveData};
use communication_core::manager::{CommunicationManager, CommunicationOptionsBuilder};
use communication_core::object::{CoatyObject, CoreType};

const BROKER_URL: &str = "mqtt://localhost:1883";
const THERMOSTAT_TYPE: &str = "com.example.Thermostat";

#[tokio::main(flavor = "current_thread")]
async fn main() {
    Builder::new()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .init();

    let responder_options = CommunicationOptionsBuilder::default()
        .broker_url(BROKER_URL)
        .identity_name("thermostat-controller")
        .build()
        .unwrap();
    let responder = CommunicationManager::connect(responder_options).unwrap();
    responder.start().await.unwrap();

    let requester_options = CommunicationOptionsBuilder::default()
        .broker_url(BROKER_URL)
        .identity_name("discovery-client")
        .build()
        .unwrap();
    let requester = CommunicationManager::connect(requester_options).unwrap();
    requester.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::task::spawn(respond_to_discovers(responder));

    let mut resolved = requester
        .request::<DiscoverData, ResolveData>(DiscoverData {
            object_types: Some(vec![THERMOSTAT_TYPE.to_string()]),
            ..Default::default()
        })
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(5), resolved.recv()).await {
        Ok(Some(event)) => log::info!("resolved: {:?}", event.data.object),
        Ok(None) => log::warn!("response stream closed with no answer"),
        Err(_) => log::warn!("no response within 5s"),
    }
    resolved.close().await.unwrap();
}

async fn respond_to_discovers(responder: CommunicationManager<communication_core::broker::MqttBrokerClient>) {
    let mut discovers = responder.observe::<DiscoverData>(None).await.unwrap();
    while let Some(discover) = discovers.recv().await {
        if discover.data.object_types.iter().flatten().any(|t| t == THERMOSTAT_TYPE) {
            let thermostat = CoatyObject::new(uuid::Uuid::new_v4(), CoreType::Device, THERMOSTAT_TYPE, "living-room");
            let response: CommunicationEvent<ResolveData> = discover
                .respond(
                    ResolveData {
                        object: Some(thermostat),
                        related_objects: None,
                    },
                    responder.identity().object_id(),
                )
                .unwrap();
            if let Err(e) = responder.publish(&response).await {
                log::error!("failed to publish resolve response: {e}");
            }
        }
    }
}
