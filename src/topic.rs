// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Topic Codec: the bijective encoding between semantic event descriptors and
//! MQTT topic strings, including the readable (name-prefixed) identifier form.
//!
//! Wire format:
//! ```text
//! coaty/<version>/<eventTypeName>/<associatedUserId|-> /<sourceId>/<messageToken>
//! ```

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use uuid::Uuid;

use crate::error::{CommunicationError, CommunicationErrorKind};

/// Fixed protocol name embedded as the first topic level.
pub const PROTOCOL_NAME: &str = "coaty";

/// Protocol version embedded as the second topic level. Receivers drop topics
/// at any other version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Single-level MQTT wildcard.
pub const WILDCARD_ONE: &str = "+";

/// Multi-level MQTT wildcard, used only for Raw tail matching.
pub const WILDCARD_TAIL: &str = "#";

const NO_USER: &str = "-";

/// The closed set of event kinds exchanged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Announces the existence of an object.
    Advertise,
    /// Retracts a previously advertised object.
    Deadvertise,
    /// Broadcasts one or more objects on a named channel.
    Channel,
    /// Requests objects matching a set of criteria.
    Discover,
    /// Responds to a [`EventKind::Discover`] request.
    Resolve,
    /// Requests objects matching a schema/filter.
    Query,
    /// Responds to a [`EventKind::Query`] request.
    Retrieve,
    /// Proposes a full or partial update to an object.
    Update,
    /// Responds to an [`EventKind::Update`] request with the post-update state.
    Complete,
    /// Invokes a remote operation.
    Call,
    /// Responds to a [`EventKind::Call`] request with a result or error.
    Return,
    /// Associates two objects.
    Associate,
    /// Reports an IO value on a named route.
    IoValue,
    /// Opaque byte payload, bypassing JSON encoding and the structured grammar.
    Raw,
}

impl EventKind {
    /// Returns the wire name of this event kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Advertise => "Advertise",
            EventKind::Deadvertise => "Deadvertise",
            EventKind::Channel => "Channel",
            EventKind::Discover => "Discover",
            EventKind::Resolve => "Resolve",
            EventKind::Query => "Query",
            EventKind::Retrieve => "Retrieve",
            EventKind::Update => "Update",
            EventKind::Complete => "Complete",
            EventKind::Call => "Call",
            EventKind::Return => "Return",
            EventKind::Associate => "Associate",
            EventKind::IoValue => "IoValue",
            EventKind::Raw => "Raw",
        }
    }

    /// Returns `true` if this event kind carries a filter suffix (object type,
    /// operation name, or channel id) in its event-type-name topic level.
    #[must_use]
    pub fn allows_filter(self) -> bool {
        matches!(
            self,
            EventKind::Advertise
                | EventKind::Channel
                | EventKind::Update
                | EventKind::Complete
                | EventKind::Associate
                | EventKind::Call
                | EventKind::Return
        )
    }

    /// Returns the request kind that this response kind answers, if any.
    #[must_use]
    pub fn request_kind(self) -> Option<EventKind> {
        match self {
            EventKind::Resolve => Some(EventKind::Discover),
            EventKind::Retrieve => Some(EventKind::Query),
            EventKind::Complete => Some(EventKind::Update),
            EventKind::Return => Some(EventKind::Call),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Advertise" => EventKind::Advertise,
            "Deadvertise" => EventKind::Deadvertise,
            "Channel" => EventKind::Channel,
            "Discover" => EventKind::Discover,
            "Resolve" => EventKind::Resolve,
            "Query" => EventKind::Query,
            "Retrieve" => EventKind::Retrieve,
            "Update" => EventKind::Update,
            "Complete" => EventKind::Complete,
            "Call" => EventKind::Call,
            "Return" => EventKind::Return,
            "Associate" => EventKind::Associate,
            "IoValue" => EventKind::IoValue,
            "Raw" => EventKind::Raw,
            _ => return Err(()),
        })
    }
}

/// Returns `true` if `s` contains a character that is never allowed in an
/// operation name, channel identifier, or object-type filter: `NUL`, `#`,
/// `+`, or `/`.
#[must_use]
pub fn contains_invalid_char(s: &str) -> bool {
    s.chars().any(|c| matches!(c, '\0' | '#' | '+' | '/'))
}

/// Validates an operation name, channel identifier, or object-type filter per
/// §4.1: non-empty, and free of `NUL`, `#`, `+`, `/`.
pub fn validate_filter_identifier(kind: &str, value: &str) -> Result<(), CommunicationError> {
    if value.is_empty() || contains_invalid_char(value) {
        return Err(CommunicationErrorKind::InvalidOperation {
            name: value.to_string(),
            reason: format!("{kind} must be non-empty and must not contain NUL, '#', '+', or '/'"),
        }
        .into());
    }
    Ok(())
}

/// Sanitizes a human-readable name for use as a readable-mode identifier
/// prefix, replacing every `NUL`, `#`, `+`, `/` with `_`.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if matches!(c, '\0' | '#' | '+' | '/') { '_' } else { c })
        .collect()
}

fn uuid_tail_regex() -> Regex {
    Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
    )
    .expect("static uuid regex is valid")
}

/// Encodes an identifier (UUID plus optional human name) for use on the wire.
/// In readable mode, the result is `<sanitizedName>_<uuid>`; otherwise it is
/// the plain UUID string.
#[must_use]
pub fn encode_identifier(id: Uuid, name: Option<&str>, readable: bool) -> String {
    match (readable, name) {
        (true, Some(name)) if !name.is_empty() => {
            format!("{}_{}", sanitize_name(name), id)
        }
        _ => id.to_string(),
    }
}

/// Decodes an identifier from its wire form, recovering the trailing UUID by
/// matching the last 36 characters against the canonical UUID shape. The
/// leading name portion, if any, is discarded (it is informational only).
pub fn decode_identifier(s: &str) -> Result<Uuid, CommunicationError> {
    if s.len() < 36 {
        return Err(invalid_topic(s, "identifier is shorter than a UUID"));
    }
    let (prefix, tail) = s.split_at(s.len() - 36);
    if !uuid_tail_regex().is_match(tail) {
        return Err(invalid_topic(s, "identifier does not end in a UUID"));
    }
    if !prefix.is_empty() && !prefix.ends_with('_') {
        return Err(invalid_topic(s, "readable identifier missing '_' separator"));
    }
    Uuid::parse_str(tail).map_err(|_| invalid_topic(s, "malformed UUID"))
}

fn invalid_topic(topic: &str, reason: &str) -> CommunicationError {
    CommunicationErrorKind::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Structured, authoritative descriptor for a topic on the wire. Every
/// non-Raw event is published and matched through a [`Topic`]; the wire
/// string is always derived from it, never hand-assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    /// Protocol version; currently always [`PROTOCOL_VERSION`].
    pub version: u32,
    /// The event kind this topic carries.
    pub event_kind: EventKind,
    /// Object type, operation name, or channel id, when `event_kind` allows one.
    pub filter: Option<String>,
    /// Wire form of the associated user id, if any (already encoded, readable
    /// or not).
    pub associated_user_id: Option<String>,
    /// Wire form of the sender/source component id (already encoded).
    pub source_id: String,
    /// Canonical message token, `<senderObjectId>_<counter>`.
    pub message_token: String,
}

impl Topic {
    /// Builds the topic level for `event_kind`/`filter`, validating the filter
    /// when present.
    fn event_type_level(event_kind: EventKind, filter: Option<&str>) -> Result<String, CommunicationError> {
        match filter {
            Some(f) => {
                if !event_kind.allows_filter() {
                    return Err(CommunicationErrorKind::InvalidTopic {
                        topic: event_kind.as_str().to_string(),
                        reason: "event kind does not accept a filter suffix".to_string(),
                    }
                    .into());
                }
                validate_filter_identifier("filter", f)?;
                Ok(format!("{}:{}", event_kind.as_str(), f))
            }
            None => Ok(event_kind.as_str().to_string()),
        }
    }

    /// Encodes this topic to its wire string.
    pub fn encode(&self) -> Result<String, CommunicationError> {
        let event_type_level = Self::event_type_level(self.event_kind, self.filter.as_deref())?;
        let user_level = self.associated_user_id.as_deref().unwrap_or(NO_USER);
        Ok(format!(
            "{}/{}/{}/{}/{}/{}",
            PROTOCOL_NAME,
            self.version,
            event_type_level,
            user_level,
            self.source_id,
            self.message_token
        ))
    }

    /// Builds the subscription filter for responses to a request pinned on
    /// `message_token`, wildcarding the source and user levels and using the
    /// response event kind's own filter (if any).
    #[must_use]
    pub fn response_filter(
        version: u32,
        response_kind: EventKind,
        filter: Option<&str>,
        message_token: &str,
    ) -> String {
        let event_type_level = filter.map_or_else(
            || response_kind.as_str().to_string(),
            |f| format!("{}:{}", response_kind.as_str(), f),
        );
        format!(
            "{PROTOCOL_NAME}/{version}/{event_type_level}/{WILDCARD_ONE}/{WILDCARD_ONE}/{message_token}"
        )
    }

    /// Decodes a wire topic string into a [`Topic`]. Returns `InvalidTopic` on
    /// any structural violation: wrong level count, wrong protocol name, bad
    /// version, or an event kind that is not in the closed set.
    pub fn decode(topic: &str) -> Result<Self, CommunicationError> {
        if topic.is_empty() || topic.contains('\0') {
            return Err(invalid_topic(topic, "topic is empty or contains NUL"));
        }
        let levels: Vec<&str> = topic.split('/').collect();
        if levels.len() != 6 {
            return Err(invalid_topic(topic, "topic must have exactly 6 levels"));
        }
        let [protocol, version, event_type, user, source, token] = levels[..] else {
            unreachable!("length checked above")
        };
        if protocol != PROTOCOL_NAME {
            return Err(invalid_topic(topic, "unrecognized protocol name"));
        }
        let version: u32 = version
            .parse()
            .map_err(|_| invalid_topic(topic, "non-integer protocol version"))?;

        let (kind_name, filter) = match event_type.split_once(':') {
            Some((k, f)) => (k, Some(f.to_string())),
            None => (event_type, None),
        };
        let event_kind = EventKind::from_str(kind_name)
            .map_err(|()| invalid_topic(topic, "unrecognized event kind"))?;
        if filter.is_some() && !event_kind.allows_filter() {
            return Err(invalid_topic(topic, "event kind does not accept a filter suffix"));
        }

        if source.is_empty() || token.is_empty() {
            return Err(invalid_topic(topic, "missing source id or message token"));
        }

        Ok(Topic {
            version,
            event_kind,
            filter,
            associated_user_id: if user == NO_USER { None } else { Some(user.to_string()) },
            source_id: source.to_string(),
            message_token: token.to_string(),
        })
    }
}

/// Validates a Raw topic for publish: non-empty, no `NUL`, and — unlike
/// subscription filters — no `+` or `#` wildcards.
pub fn validate_raw_publish_topic(topic: &str) -> Result<(), CommunicationError> {
    if topic.is_empty() || topic.contains('\0') {
        return Err(invalid_topic(topic, "raw topic must be non-empty and free of NUL"));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(invalid_topic(topic, "raw publish topic must not contain wildcards"));
    }
    Ok(())
}

/// Validates a Raw topic filter for subscription: non-empty, no `NUL`.
/// Wildcards are permitted.
pub fn validate_raw_subscribe_filter(filter: &str) -> Result<(), CommunicationError> {
    if filter.is_empty() || filter.contains('\0') {
        return Err(invalid_topic(filter, "raw filter must be non-empty and free of NUL"));
    }
    Ok(())
}

/// Returns `true` if `filter` (an MQTT subscription filter, possibly
/// containing `+`/`#`) matches `topic` (a concrete published topic), per the
/// standard MQTT topic matching rules.
#[must_use]
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    let mut fi = 0;
    let mut ti = 0;
    while fi < filter_levels.len() {
        match filter_levels[fi] {
            "#" => return true,
            "+" => {
                if ti >= topic_levels.len() {
                    return false;
                }
            }
            lvl => {
                if ti >= topic_levels.len() || topic_levels[ti] != lvl {
                    return false;
                }
            }
        }
        fi += 1;
        ti += 1;
    }
    ti == topic_levels.len()
}
