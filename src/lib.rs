// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A distributed event bus for collaborative IoT agents, layered over MQTT.
//!
//! Independent agents exchange structured, typed events — object
//! advertisements, discovery requests with correlated responses, channel
//! broadcasts, partial/full updates with acknowledgements, and remote
//! operation invocations — over a single canonical topic grammar and a
//! single payload envelope.

#![warn(missing_docs)]
#![allow(clippy::result_large_err)]

pub mod broker;
pub mod context;
pub mod correlation;
pub mod error;
pub mod event;
pub mod manager;
pub mod object;
pub mod registry;
pub mod topic;

#[macro_use]
extern crate derive_builder;
