// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Call/Return scenarios across two executors: context-filter gating (one
//! receiver matches, one does not) and parameter-shape validation.

use std::time::Duration;

use communication_core::broker::{fake::FakeBrokerHub, BrokerEvent};
use communication_core::context::{Condition, ContextFilter, Operator};
use communication_core::event::{CallData, CallParameters, ReturnData, INVALID_PARAMETERS_CODE};
use communication_core::manager::{CommunicationManager, CommunicationOptionsBuilder};
use communication_core::object::{CoatyObject, CoreType};
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
async fn context_filter_gates_which_executor_answers() {
    let hub = FakeBrokerHub::new();
    let caller = spawn(&hub, "caller").await;
    let basement = spawn(&hub, "basement-light").await;
    let attic = spawn(&hub, "attic-light").await;

    let local_room = |floor: i64| {
        let mut obj = CoatyObject::new(uuid::Uuid::new_v4(), CoreType::Device, "com.example.Light", "light");
        obj.extra.insert("floor".to_string(), serde_json::json!(floor));
        obj
    };
    let basement_room = local_room(0);
    let attic_room = local_room(3);

    let filter = ContextFilter::Condition(Condition {
        property: "floor".to_string(),
        operator: Operator::Equals,
        operand: Some(serde_json::json!(0)),
    });

    let mut basement_calls = basement.observe::<CallData>(Some("switchOn")).await.unwrap();
    let mut attic_calls = attic.observe::<CallData>(Some("switchOn")).await.unwrap();

    let mut returns = caller
        .request::<CallData, ReturnData>(CallData {
            operation: "switchOn".to_string(),
            parameters: None,
            condition: Some(filter),
        })
        .await
        .unwrap();

    let basement_call = basement_calls.recv().await.unwrap();
    assert!(basement_call.data.condition.as_ref().unwrap().matches(&basement_room));
    let response = basement_call.respond(ReturnData::success("switchOn", serde_json::json!(true)), basement.identity().object_id()).unwrap();
    basement.publish(&response).await.unwrap();

    let attic_call = attic_calls.recv().await.unwrap();
    assert!(!attic_call.data.condition.as_ref().unwrap().matches(&attic_room));

    let returned = returns.recv().await.unwrap();
    assert_eq!(returned.event_source_id, basement.identity().object_id());
    assert!(tokio::time::timeout(Duration::from_millis(50), returns.recv()).await.is_err(), "attic should never have answered");
    returns.close().await.unwrap();
}

#[tokio::test]
async fn call_with_unusable_parameters_yields_invalid_parameters_error() {
    let hub = FakeBrokerHub::new();
    let caller = spawn(&hub, "caller").await;
    let executor = spawn(&hub, "calculator").await;

    let mut calls = executor.observe::<CallData>(Some("add")).await.unwrap();
    let mut returns = caller
        .request::<CallData, ReturnData>(CallData {
            operation: "add".to_string(),
            parameters: Some(CallParameters::Positional(vec![])),
            condition: None,
        })
        .await
        .unwrap();

    let call = calls.recv().await.unwrap();
    let response = match &call.data.parameters {
        Some(CallParameters::Positional(args)) if args.len() == 2 => {
            let sum = args[0].as_f64().unwrap_or_default() + args[1].as_f64().unwrap_or_default();
            call.respond(ReturnData::success("add", serde_json::json!(sum)), executor.identity().object_id()).unwrap()
        }
        _ => call.respond(ReturnData::invalid_parameters("add"), executor.identity().object_id()).unwrap(),
    };
    executor.publish(&response).await.unwrap();

    let returned = returns.recv().await.unwrap();
    match (&returned.data.result, &returned.data.error) {
        (None, Some(error)) => assert_eq!(error.code, INVALID_PARAMETERS_CODE),
        _ => panic!("expected an invalid-parameters error"),
    }
    returns.close().await.unwrap();
}

#[tokio::test]
async fn call_with_valid_parameters_returns_a_result() {
    let hub = FakeBrokerHub::new();
    let caller = spawn(&hub, "caller").await;
    let executor = spawn(&hub, "calculator").await;

    let mut calls = executor.observe::<CallData>(Some("add")).await.unwrap();
    let mut returns = caller
        .request::<CallData, ReturnData>(CallData {
            operation: "add".to_string(),
            parameters: Some(CallParameters::Positional(vec![serde_json::json!(2), serde_json::json!(3)])),
            condition: None,
        })
        .await
        .unwrap();

    let call = calls.recv().await.unwrap();
    let Some(CallParameters::Positional(args)) = &call.data.parameters else {
        panic!("expected positional parameters");
    };
    let sum = args[0].as_f64().unwrap() + args[1].as_f64().unwrap();
    let response = call.respond(ReturnData::success("add", serde_json::json!(sum)), executor.identity().object_id()).unwrap();
    executor.publish(&response).await.unwrap();

    let returned = returns.recv().await.unwrap();
    match (&returned.data.result, &returned.data.error) {
        (Some(value), None) => assert_eq!(*value, serde_json::json!(5.0)),
        _ => panic!("expected a result"),
    }
    returns.close().await.unwrap();
}
