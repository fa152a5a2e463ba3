//! Error types shared by the hub core.
//!
//! | Error | Raised by | Handling |
//! |-------|-----------|----------|
//! | [`ParseFieldError`] | payload parser | field dropped, payload kept |
//! | [`ValidationError`] | decision engine, actuator | rejected, never retried |
//! | [`TransportError`] | link manager | reconnect / next attempt |
//! | [`EvaluationError::Internal`] | decision engine | fatal to that call only |
//!
//! A confirmation timeout is not an error: it is counted against the
//! actuator's attempt budget and reported through
//! [`crate::actuator::ControlOutcome`].

use std::time::Duration;

use thiserror::Error;

/// A single `key:value` token whose value could not be converted.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {key} value '{value}': {reason}")]
pub struct ParseFieldError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

/// Input rejected before any work is done.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("temperature {0} is outside 0-50 °C")]
    TemperatureOutOfRange(f64),

    #[error("humidity {0} is outside 0-100 %")]
    HumidityOutOfRange(f64),

    #[error("invalid action '{0}' (use 'buka' or 'tutup')")]
    InvalidAction(String),
}

/// Failure of a single `evaluate` call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("internal fuzzy computation error: {0}")]
    Internal(String),
}

/// Broker-side failures: connect, publish, closed channels.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),

    #[error("publish did not complete within {0:?}")]
    PublishTimeout(Duration),

    #[error("broker not connected after waiting {0:?}")]
    ConnectTimeout(Duration),

    #[error("link driver has stopped")]
    LinkClosed,
}

/// A telemetry message that cannot become a record at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("payload carries no telemetry fields")]
    NoTelemetryFields,
}
