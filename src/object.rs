// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Data model: [`CoatyObject`] and its [`Component`] specialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of core object discriminators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreType {
    /// A plain object with no further specialization.
    Object,
    /// A running controller or communication manager.
    Component,
    /// A physical or virtual device.
    Device,
    /// A human or service principal.
    User,
    /// A unit of work.
    Task,
    /// A physical or logical place.
    Location,
    /// A point-in-time capture of other objects.
    Snapshot,
    /// A log entry.
    Log,
    /// A configuration value.
    Config,
    /// A free-form annotation attached to another object.
    Annotation,
}

/// The base entity exchanged on the wire. Extra fields beyond the ones named
/// here are preserved verbatim in `extra` and re-emitted on the round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoatyObject {
    /// Globally unique identifier.
    #[serde(rename = "objectId")]
    pub object_id: Uuid,
    /// Discriminator from the closed [`CoreType`] set.
    #[serde(rename = "coreType")]
    pub core_type: CoreType,
    /// Extensible, reverse-DNS-style object type, e.g. `com.example.Sensor`.
    #[serde(rename = "objectType")]
    pub object_type: String,
    /// Human-readable name.
    pub name: String,
    /// Optional owning object.
    #[serde(rename = "parentObjectId", skip_serializing_if = "Option::is_none")]
    pub parent_object_id: Option<Uuid>,
    /// Unknown/extra fields, preserved verbatim for the round-trip law.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl CoatyObject {
    /// Creates a new object with no extra fields.
    #[must_use]
    pub fn new(object_id: Uuid, core_type: CoreType, object_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            object_id,
            core_type,
            object_type: object_type.into(),
            name: name.into(),
            parent_object_id: None,
            extra: BTreeMap::new(),
        }
    }
}

/// A [`CoatyObject`] specialized as `coreType: Component`, identifying a
/// running controller or the communication manager itself. Its `object_id`
/// serves as the sender identity on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    /// The underlying object; `core_type` is always [`CoreType::Component`].
    #[serde(flatten)]
    pub object: CoatyObject,
}

impl Component {
    /// Creates a new [`Component`] identity with a fresh random object id.
    #[must_use]
    pub fn new(object_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            object: CoatyObject::new(Uuid::new_v4(), CoreType::Component, object_type, name),
        }
    }

    /// Returns the sender identity used on the wire.
    #[must_use]
    pub fn object_id(&self) -> Uuid {
        self.object.object_id
    }

    /// Returns the human-readable name used for readable-mode topic encoding.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.object.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json_preserving_extra_fields() {
        let mut obj = CoatyObject::new(Uuid::new_v4(), CoreType::Device, "com.example.Thermostat", "living-room");
        obj.extra.insert("firmwareVersion".to_string(), serde_json::json!("1.2.3"));

        let json = serde_json::to_value(&obj).unwrap();
        let back: CoatyObject = serde_json::from_value(json.clone()).unwrap();
        let json_again = serde_json::to_value(&back).unwrap();

        assert_eq!(json, json_again);
        assert_eq!(back.extra.get("firmwareVersion").unwrap(), "1.2.3");
    }

    #[test]
    fn component_flattens_into_object_json() {
        let comp = Component::new("com.example.Controller", "ctrl-1");
        let json = serde_json::to_value(&comp).unwrap();
        assert_eq!(json["coreType"], "Component");
        assert_eq!(json["name"], "ctrl-1");
    }
}
