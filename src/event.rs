// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Event Envelope: typed event payloads with validated construction and a
//! generic [`CommunicationEvent`] wrapper carrying correlation metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::ContextFilter;
use crate::error::{CommunicationError, CommunicationErrorKind};
use crate::object::{CoatyObject, CoreType};
use crate::topic::{validate_filter_identifier, EventKind};

/// Implemented by every event payload type. Ties the payload to its
/// [`EventKind`], the optional topic filter suffix it carries, and the
/// validation that must pass at construction time.
pub trait EventData: Clone + std::fmt::Debug + Serialize + for<'de> Deserialize<'de> {
    /// The event kind this payload belongs to.
    const KIND: EventKind;

    /// The object type / operation name / channel id carried in the topic's
    /// event-type-name suffix, if `KIND` allows one.
    fn filter(&self) -> Option<String> {
        None
    }

    /// Validates the payload's shape per §4.2. The default accepts anything;
    /// kinds with mandatory invariants override this.
    fn validate(&self) -> Result<(), CommunicationError> {
        Ok(())
    }
}

fn invalid_payload(kind: EventKind, reason: impl Into<String>) -> CommunicationError {
    CommunicationErrorKind::InvalidPayload {
        event_kind: kind.as_str(),
        reason: reason.into(),
    }
    .into()
}

/// Payload for [`EventKind::Advertise`]: announces a single object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvertiseData {
    /// The object being advertised.
    pub object: CoatyObject,
}

impl EventData for AdvertiseData {
    const KIND: EventKind = EventKind::Advertise;

    fn filter(&self) -> Option<String> {
        Some(self.object.object_type.clone())
    }
}

/// Payload for [`EventKind::Deadvertise`]: retracts one or more previously
/// advertised objects by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadvertiseData {
    /// Ids of the objects being retracted.
    #[serde(rename = "objectIds")]
    pub object_ids: Vec<Uuid>,
}

impl EventData for DeadvertiseData {
    const KIND: EventKind = EventKind::Deadvertise;

    fn validate(&self) -> Result<(), CommunicationError> {
        if self.object_ids.is_empty() {
            return Err(invalid_payload(Self::KIND, "must carry at least one objectId"));
        }
        Ok(())
    }
}

/// Payload for [`EventKind::Channel`]: broadcasts objects on a named channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelData {
    /// Objects broadcast on the channel.
    pub objects: Vec<CoatyObject>,
    /// The channel identifier, also carried in the topic suffix.
    #[serde(rename = "channelId")]
    pub channel_id: String,
}

impl EventData for ChannelData {
    const KIND: EventKind = EventKind::Channel;

    fn filter(&self) -> Option<String> {
        Some(self.channel_id.clone())
    }

    fn validate(&self) -> Result<(), CommunicationError> {
        validate_filter_identifier("channelId", &self.channel_id)?;
        if self.objects.is_empty() {
            return Err(invalid_payload(Self::KIND, "must carry at least one object"));
        }
        Ok(())
    }
}

/// Payload for [`EventKind::Discover`]: requests objects matching criteria.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverData {
    /// Match by exact object id.
    #[serde(rename = "objectId", skip_serializing_if = "Option::is_none")]
    pub object_id: Option<Uuid>,
    /// Match by external (foreign-system) id.
    #[serde(rename = "externalId", skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Match by one of these object types. Mutually exclusive with `core_types`.
    #[serde(rename = "objectTypes", skip_serializing_if = "Option::is_none")]
    pub object_types: Option<Vec<String>>,
    /// Match by one of these core types. Mutually exclusive with `object_types`.
    #[serde(rename = "coreTypes", skip_serializing_if = "Option::is_none")]
    pub core_types: Option<Vec<CoreType>>,
}

impl EventData for DiscoverData {
    const KIND: EventKind = EventKind::Discover;

    fn validate(&self) -> Result<(), CommunicationError> {
        if self.object_id.is_none()
            && self.external_id.is_none()
            && self.object_types.is_none()
            && self.core_types.is_none()
        {
            return Err(invalid_payload(
                Self::KIND,
                "must specify at least one of objectId, externalId, objectTypes, coreTypes",
            ));
        }
        if self.object_types.is_some() && self.core_types.is_some() {
            return Err(invalid_payload(
                Self::KIND,
                "objectTypes and coreTypes are mutually exclusive",
            ));
        }
        Ok(())
    }
}

/// Payload for [`EventKind::Resolve`]: responds to a [`DiscoverData`] request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveData {
    /// A single matching object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<CoatyObject>,
    /// Multiple matching objects. Mutually exclusive with `object`.
    #[serde(rename = "relatedObjects", skip_serializing_if = "Option::is_none")]
    pub related_objects: Option<Vec<CoatyObject>>,
}

impl EventData for ResolveData {
    const KIND: EventKind = EventKind::Resolve;

    fn validate(&self) -> Result<(), CommunicationError> {
        match (&self.object, &self.related_objects) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(invalid_payload(
                Self::KIND,
                "must specify exactly one of object, relatedObjects",
            )),
        }
    }
}

/// Payload for [`EventKind::Query`]: requests objects matching a schema/filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryData {
    /// Object type (or core type name) being queried for.
    pub schema: String,
    /// Optional structured filter narrowing the result set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<ContextFilter>,
}

impl EventData for QueryData {
    const KIND: EventKind = EventKind::Query;

    fn validate(&self) -> Result<(), CommunicationError> {
        if self.schema.is_empty() {
            return Err(invalid_payload(Self::KIND, "schema must be non-empty"));
        }
        Ok(())
    }
}

/// Payload for [`EventKind::Retrieve`]: responds to a [`QueryData`] request
/// with an ordered list of matching objects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrieveData {
    /// Matching objects, in the responder's chosen order.
    pub objects: Vec<CoatyObject>,
}

impl EventData for RetrieveData {
    const KIND: EventKind = EventKind::Retrieve;
}

/// Payload for [`EventKind::Update`]: proposes a full or partial update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdateData {
    /// Replace the object wholesale.
    Full(CoatyObject),
    /// Apply `changes` to the object identified by `object_id`. The topic's
    /// filter suffix still needs an object type, so partial updates must
    /// name one explicitly.
    Partial {
        /// Id of the object being updated.
        #[serde(rename = "objectId")]
        object_id: Uuid,
        /// Object type of the target, used for the topic filter suffix.
        #[serde(rename = "objectType")]
        object_type: String,
        /// Fields to change.
        changes: BTreeMap<String, Value>,
    },
}

impl EventData for UpdateData {
    const KIND: EventKind = EventKind::Update;

    fn filter(&self) -> Option<String> {
        match self {
            UpdateData::Full(object) => Some(object.object_type.clone()),
            UpdateData::Partial { object_type, .. } => Some(object_type.clone()),
        }
    }
}

/// Payload for [`EventKind::Complete`]: the authoritative post-update state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteData {
    /// The object in its post-update state.
    pub object: CoatyObject,
}

impl EventData for CompleteData {
    const KIND: EventKind = EventKind::Complete;

    fn filter(&self) -> Option<String> {
        Some(self.object.object_type.clone())
    }
}

/// Positional or named parameters for a [`CallData`] invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallParameters {
    /// Ordered positional arguments.
    Positional(Vec<Value>),
    /// Named arguments.
    Named(BTreeMap<String, Value>),
}

/// Payload for [`EventKind::Call`]: invokes a remote operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallData {
    /// Name of the operation to invoke, also carried in the topic suffix.
    pub operation: String,
    /// Optional arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<CallParameters>,
    /// Optional context filter gating which receivers should execute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<ContextFilter>,
}

impl EventData for CallData {
    const KIND: EventKind = EventKind::Call;

    fn filter(&self) -> Option<String> {
        Some(self.operation.clone())
    }

    fn validate(&self) -> Result<(), CommunicationError> {
        validate_filter_identifier("operation", &self.operation)
    }
}

/// Reserved JSON-RPC-style error code for a parameter-shape mismatch.
pub const INVALID_PARAMETERS_CODE: i32 = -32602;

/// A JSON-RPC-style error code/message, reserved range -32768..-32000.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnError {
    /// Reserved range: -32768..-32000.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

/// Payload for [`EventKind::Return`]: responds to a [`CallData`] invocation
/// with exactly one of `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnData {
    /// Name of the operation this response answers, also carried in the
    /// topic suffix.
    pub operation: String,
    /// Successful invocation result. Mutually exclusive with `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failed invocation's error code/message. Mutually exclusive with `result`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReturnError>,
    /// Optional implementation-defined execution metadata.
    #[serde(rename = "executionInfo", skip_serializing_if = "Option::is_none")]
    pub execution_info: Option<Value>,
}

impl ReturnData {
    /// Builds a successful [`ReturnData`] for `operation`.
    #[must_use]
    pub fn success(operation: impl Into<String>, result: Value) -> Self {
        Self {
            operation: operation.into(),
            result: Some(result),
            error: None,
            execution_info: None,
        }
    }

    /// Builds an error [`ReturnData`] for `operation`.
    #[must_use]
    pub fn error(operation: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            result: None,
            error: Some(ReturnError { code, message: message.into() }),
            execution_info: None,
        }
    }

    /// Builds the standard "invalid parameters" error response.
    #[must_use]
    pub fn invalid_parameters(operation: impl Into<String>) -> Self {
        Self::error(operation, INVALID_PARAMETERS_CODE, "Invalid params")
    }
}

impl EventData for ReturnData {
    const KIND: EventKind = EventKind::Return;

    fn filter(&self) -> Option<String> {
        Some(self.operation.clone())
    }

    fn validate(&self) -> Result<(), CommunicationError> {
        validate_filter_identifier("operation", &self.operation)?;
        match (&self.result, &self.error) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(invalid_payload(Self::KIND, "must specify exactly one of result, error")),
        }
    }
}

/// Payload for [`EventKind::Associate`]: links two objects together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociateData {
    /// The object being associated.
    pub object: CoatyObject,
    /// Id of the object it is being associated with.
    #[serde(rename = "relatedObjectId")]
    pub related_object_id: Uuid,
    /// Optional name for the kind of association.
    #[serde(rename = "associationType", skip_serializing_if = "Option::is_none")]
    pub association_type: Option<String>,
}

impl EventData for AssociateData {
    const KIND: EventKind = EventKind::Associate;

    fn filter(&self) -> Option<String> {
        Some(self.object.object_type.clone())
    }
}

/// Payload for [`EventKind::IoValue`]: reports a value on an IO route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoValueData {
    /// The reported value.
    pub value: Value,
}

impl EventData for IoValueData {
    const KIND: EventKind = EventKind::IoValue;
}

/// A decoded, correlation-addressable event. The wire payload is exactly
/// `data`'s own JSON serialization; `message_token`, `event_source_id`, and
/// `event_user_id` live in the topic, not the payload body.
#[derive(Debug, Clone)]
pub struct CommunicationEvent<D: EventData> {
    /// The event's payload.
    pub data: D,
    /// Message token correlating this event with request/response peers.
    pub message_token: String,
    /// Id of the component that published this event. For outbound events,
    /// this is the local manager's own identity.
    pub event_source_id: Uuid,
    /// Id of the user associated with this event, if any.
    pub event_user_id: Option<Uuid>,
}

impl<D: EventData> CommunicationEvent<D> {
    /// Constructs a new event, validating `data` per its [`EventData::validate`].
    pub fn try_new(
        data: D,
        event_source_id: Uuid,
        event_user_id: Option<Uuid>,
        message_token: impl Into<String>,
    ) -> Result<Self, CommunicationError> {
        data.validate()?;
        Ok(Self {
            data,
            message_token: message_token.into(),
            event_source_id,
            event_user_id,
        })
    }

    /// Serializes this event's payload to its wire JSON form.
    pub fn to_payload(&self) -> Result<Vec<u8>, CommunicationError> {
        serde_json::to_vec(&self.data).map_err(|e| {
            CommunicationErrorKind::InvalidPayload {
                event_kind: D::KIND.as_str(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Deserializes a wire payload into an event, attaching the correlation
    /// metadata decoded from `source_id`/`associated_user_id`/`message_token`.
    pub fn from_wire(
        payload: &[u8],
        event_source_id: Uuid,
        event_user_id: Option<Uuid>,
        message_token: impl Into<String>,
    ) -> Result<Self, CommunicationError> {
        let data: D = serde_json::from_slice(payload).map_err(|e| {
            CommunicationError::from(CommunicationErrorKind::InvalidPayload {
                event_kind: D::KIND.as_str(),
                reason: e.to_string(),
            })
        })?;
        data.validate()?;
        Ok(Self {
            data,
            message_token: message_token.into(),
            event_source_id,
            event_user_id,
        })
    }

    /// Builds a response event correlated to this (request) event: same
    /// message token and associated user, published by `responder_id`. This
    /// is the generic form of the source's `resolveEvent`/`retrieveEvent`/
    /// `completeEvent`/`returnEvent` hooks.
    pub fn respond<R: EventData>(&self, data: R, responder_id: Uuid) -> Result<CommunicationEvent<R>, CommunicationError> {
        CommunicationEvent::try_new(data, responder_id, self.event_user_id, self.message_token.clone())
    }
}
