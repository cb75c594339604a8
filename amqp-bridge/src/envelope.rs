use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::amqp::DEFAULT_PRIORITY;
use crate::error::{BridgeError, Result};

/// Which AMQP body section the `body` element represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    /// Single amqp-value section
    #[default]
    Value,
    /// Data section; `body` holds base64 encoded bytes
    Data,
    /// amqp-sequence section; `body` holds an array
    Sequence,
}

impl BodyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Data => "data",
            Self::Sequence => "sequence",
        }
    }
}

impl fmt::Display for BodyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BodyType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "value" => Ok(Self::Value),
            "data" => Ok(Self::Data),
            "sequence" => Ok(Self::Sequence),
            other => Err(BridgeError::UnsupportedBodyType {
                body_type: other.to_string(),
            }),
        }
    }
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

/// Envelope view of the AMQP header section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default)]
    pub durable: bool,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Time to live in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub first_acquirer: bool,
    /// Number of previous failed delivery attempts
    #[serde(default)]
    pub delivery_count: u64,
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

/// Envelope view of the AMQP properties section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Properties {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_sequence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_group_id: Option<String>,
    /// Only meaningful for data bodies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Only meaningful for data bodies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    /// Milliseconds since the unix epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<u64>,
    /// Milliseconds since the unix epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub absolute_expiry_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Generic message envelope exchanged with application code.
///
/// The JSON form uses the keys `body`, `body_type`, `header`, `properties`,
/// `application_properties` and `message_annotations`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub body_type: BodyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<Header>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Properties>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_properties: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_annotations: Option<Map<String, Value>>,
}

impl Envelope {
    /// Envelope with an amqp-value body
    pub fn value(body: impl Into<Value>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Envelope with a data body
    pub fn data(bytes: impl AsRef<[u8]>) -> Self {
        Self {
            body: Value::String(BASE64.encode(bytes)),
            body_type: BodyType::Data,
            ..Default::default()
        }
    }

    /// Envelope with an amqp-sequence body
    pub fn sequence(items: Vec<Value>) -> Self {
        Self {
            body: Value::Array(items),
            body_type: BodyType::Sequence,
            ..Default::default()
        }
    }

    /// Parse the JSON form; an unknown `body_type` is reported as such
    pub fn from_json(value: Value) -> Result<Self> {
        if let Some(body_type) = value.get("body_type") {
            match body_type.as_str() {
                Some(name) => {
                    BodyType::from_str(name)?;
                }
                None => {
                    return Err(BridgeError::UnsupportedBodyType {
                        body_type: body_type.to_string(),
                    })
                }
            }
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Render the JSON form
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decoded bytes of a data body
    pub fn data_bytes(&self) -> Result<Vec<u8>> {
        match &self.body {
            Value::String(encoded) => BASE64
                .decode(encoded)
                .map_err(|e| BridgeError::mismatch(BodyType::Data, format!("body is not base64: {}", e))),
            other => Err(BridgeError::mismatch(
                BodyType::Data,
                format!("expected base64 string, found {}", json_kind(other)),
            )),
        }
    }

    /// Deserialize body to specific type
    pub fn deserialize_body<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Properties section, created on first access
    pub fn properties_mut(&mut self) -> &mut Properties {
        self.properties.get_or_insert_with(Properties::default)
    }

    /// Header section, created on first access
    pub fn header_mut(&mut self) -> &mut Header {
        self.header.get_or_insert_with(Header::default)
    }

    /// Add an application property to the envelope
    pub fn with_application_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.application_properties
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Get an application property
    pub fn application_property(&self, key: &str) -> Option<&Value> {
        self.application_properties.as_ref()?.get(key)
    }

    /// Add a message annotation to the envelope
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.message_annotations
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.as_ref()?.message_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.as_ref()?.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.as_ref()?.reply_to.as_deref()
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
