use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Error types surfaced by the bridging engine
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Envelope carried a `body_type` outside value/data/sequence
    #[error("Unsupported body type: {body_type}")]
    UnsupportedBodyType { body_type: String },

    /// Body cannot be represented in the section its `body_type` asks for
    #[error("Body does not match body type '{body_type}': {reason}")]
    BodyTypeMismatch { body_type: String, reason: String },

    /// A header/properties/annotation value has no AMQP representation
    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// Consumer credit window below 1
    #[error("Invalid credit window {window}: must be at least 1")]
    InvalidCreditWindow { window: u32 },

    /// The AMQP link backing a producer or consumer is gone
    #[error("Link for address '{address}' closed")]
    LinkClosed { address: String },

    /// Consumer reached its terminal state
    #[error("Consumer for address '{address}' is closed")]
    ConsumerClosed { address: String },

    /// Transport level connect/auth failure or a lost connection
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// The owning bridge has been stopped
    #[error("Bridge stopped")]
    BridgeStopped,

    /// Generated message-id already pending. Never expected to happen.
    #[error("Message id '{message_id}' collides with a pending reply")]
    InternalCorrelationCollision { message_id: String },

    /// Envelope (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Flat classification of [`BridgeError`] for matching without payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    UnsupportedBodyType,
    BodyTypeMismatch,
    InvalidField,
    InvalidCreditWindow,
    LinkClosed,
    ConsumerClosed,
    ConnectionFailed,
    BridgeStopped,
    InternalCorrelationCollision,
    Serialization,
    Config,
}

impl BridgeError {
    /// Create a new config error
    pub fn config_error<T: ToString>(message: T) -> Self {
        Self::Config(message.to_string())
    }

    /// Create a new connection failure
    pub fn connection_failed<T: ToString>(reason: T) -> Self {
        Self::ConnectionFailed {
            reason: reason.to_string(),
        }
    }

    /// Create a link closed error for an address
    pub fn link_closed(address: impl Into<String>) -> Self {
        Self::LinkClosed {
            address: address.into(),
        }
    }

    pub(crate) fn mismatch(body_type: impl ToString, reason: impl Into<String>) -> Self {
        Self::BodyTypeMismatch {
            body_type: body_type.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedBodyType { .. } => ErrorKind::UnsupportedBodyType,
            Self::BodyTypeMismatch { .. } => ErrorKind::BodyTypeMismatch,
            Self::InvalidField { .. } => ErrorKind::InvalidField,
            Self::InvalidCreditWindow { .. } => ErrorKind::InvalidCreditWindow,
            Self::LinkClosed { .. } => ErrorKind::LinkClosed,
            Self::ConsumerClosed { .. } => ErrorKind::ConsumerClosed,
            Self::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Self::BridgeStopped => ErrorKind::BridgeStopped,
            Self::InternalCorrelationCollision { .. } => ErrorKind::InternalCorrelationCollision,
            Self::Serialization(_) => ErrorKind::Serialization,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Check if error originated in the transport (a fresh link or bridge may succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LinkClosed { .. } | Self::ConnectionFailed { .. }
        )
    }
}

impl From<config::ConfigError> for BridgeError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
