// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for the communication core.

use thiserror::Error;

/// Error type returned by the communication core. The category of failure is
/// given by [`CommunicationErrorKind`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct CommunicationError(#[from] pub(crate) CommunicationErrorKind);

impl CommunicationError {
    /// Returns the [`CommunicationErrorKind`] describing this error.
    #[must_use]
    pub fn kind(&self) -> &CommunicationErrorKind {
        &self.0
    }
}

/// Category of failure raised by the communication core. See the error handling
/// design for when each variant is produced.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CommunicationErrorKind {
    /// Malformed topic on decode, or a publish attempt that contains a wildcard.
    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic {
        /// The offending topic or filter string.
        topic: String,
        /// Human-readable reason the topic was rejected.
        reason: String,
    },

    /// Event-data schema violation at construction time.
    #[error("invalid payload for event of kind {event_kind}: {reason}")]
    InvalidPayload {
        /// Name of the event kind whose payload failed validation.
        event_kind: &'static str,
        /// Human-readable reason the payload was rejected.
        reason: String,
    },

    /// Illegal operation name or channel identifier.
    #[error("invalid operation or channel identifier '{name}': {reason}")]
    InvalidOperation {
        /// The offending identifier.
        name: String,
        /// Human-readable reason the identifier was rejected.
        reason: String,
    },

    /// A publish/observe call was made after shutdown, or `start` was called on
    /// an already-started manager.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A second observer attached to a response sequence whose first observer
    /// already detached.
    #[error("cannot resubscribe to response stream for message token '{0}'")]
    ResubscribeForbidden(String),

    /// The communication manager has been shut down and cannot be restarted.
    #[error("communication manager has been shut down")]
    ShutDown,

    /// The underlying MQTT client reported an error.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A configured value (broker URL, options) was invalid.
    #[error("invalid configuration for '{property}': {reason}")]
    ConfigurationInvalid {
        /// Name of the offending configuration property.
        property: String,
        /// Human-readable reason the value was rejected.
        reason: String,
    },
}

/// Error surfaced by the broker client adapter.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Failure establishing or maintaining the MQTT connection.
    #[error("mqtt connection error: {0}")]
    Connection(String),

    /// Failure performing a publish, subscribe, or unsubscribe operation.
    #[error("mqtt client error: {0}")]
    Client(String),
}

/// Convenience alias for results returned by the communication core.
pub type Result<T> = std::result::Result<T, CommunicationError>;
