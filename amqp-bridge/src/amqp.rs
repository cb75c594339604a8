//! Typed model of an AMQP 1.0 bare message as handed to and received from the
//! transport collaborator.
//!
//! Only the sections the bridge maps are modelled: header, message
//! annotations, properties, application properties and the body. Delivery
//! annotations and footers never reach application code.

use std::fmt;
use uuid::Uuid;

/// AMQP 1.0 primitive and compound values
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpValue {
    Null,
    Boolean(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    /// Milliseconds since the unix epoch
    Timestamp(i64),
    Uuid(Uuid),
    Binary(Vec<u8>),
    String(String),
    Symbol(String),
    List(Vec<AmqpValue>),
    /// Ordered key/value pairs; AMQP map keys are arbitrary values
    Map(Vec<(AmqpValue, AmqpValue)>),
}

impl AmqpValue {
    /// True for values allowed in the application-properties section
    pub fn is_simple(&self) -> bool {
        !matches!(self, Self::List(_) | Self::Map(_))
    }
}

/// Values allowed in `message-id` and `correlation-id`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Ulong(u64),
    Uuid(Uuid),
    Binary(Vec<u8>),
    String(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ulong(id) => write!(f, "{}", id),
            Self::Uuid(id) => write!(f, "{}", id),
            Self::Binary(bytes) => {
                for byte in bytes {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Self::String(id) => f.write_str(id),
        }
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

/// Default priority of the AMQP header section
pub const DEFAULT_PRIORITY: u8 = 4;

/// Header section. Every field has a wire-level default, so there is no
/// "unset" apart from `ttl`.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub durable: bool,
    pub priority: u8,
    /// Milliseconds
    pub ttl: Option<u32>,
    pub first_acquirer: bool,
    pub delivery_count: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            durable: false,
            priority: DEFAULT_PRIORITY,
            ttl: None,
            first_acquirer: false,
            delivery_count: 0,
        }
    }
}

/// Properties section
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub message_id: Option<MessageId>,
    pub user_id: Option<Vec<u8>>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<MessageId>,
    /// Symbol on the wire
    pub content_type: Option<String>,
    /// Symbol on the wire
    pub content_encoding: Option<String>,
    pub absolute_expiry_time: Option<i64>,
    pub creation_time: Option<i64>,
    pub group_id: Option<String>,
    pub group_sequence: Option<u32>,
    pub reply_to_group_id: Option<String>,
}

/// Message annotation keys are symbols or ulongs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnnotationKey {
    Symbol(String),
    Ulong(u64),
}

impl fmt::Display for AnnotationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Symbol(key) => f.write_str(key),
            Self::Ulong(key) => write!(f, "{}", key),
        }
    }
}

/// Body section(s) of a message
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Body {
    /// No body section present
    #[default]
    Empty,
    /// Single amqp-value section
    Value(AmqpValue),
    /// One or more data sections
    Data(Vec<Vec<u8>>),
    /// One or more amqp-sequence sections
    Sequence(Vec<Vec<AmqpValue>>),
}

/// An AMQP 1.0 message as exchanged with the transport
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AmqpMessage {
    pub header: Option<Header>,
    pub message_annotations: Option<Vec<(AnnotationKey, AmqpValue)>>,
    pub properties: Option<Properties>,
    pub application_properties: Option<Vec<(String, AmqpValue)>>,
    pub body: Body,
}

impl AmqpMessage {
    /// Message with a single amqp-value body
    pub fn with_value(value: AmqpValue) -> Self {
        Self {
            body: Body::Value(value),
            ..Default::default()
        }
    }

    /// Properties section, created on first access
    pub fn properties_mut(&mut self) -> &mut Properties {
        self.properties.get_or_insert_with(Properties::default)
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        self.properties.as_ref()?.message_id.as_ref()
    }

    pub fn correlation_id(&self) -> Option<&MessageId> {
        self.properties.as_ref()?.correlation_id.as_ref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.as_ref()?.reply_to.as_deref()
    }
}
