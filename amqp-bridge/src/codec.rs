//! Conversion between [`Envelope`] and [`AmqpMessage`].
//!
//! Both directions are pure. `decode(encode(e)) == e` holds for every field
//! that was set on `e`. Header fields with wire-level defaults come back with
//! their default when the header section is present.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::amqp::{self, AmqpMessage, AmqpValue, AnnotationKey, Body, MessageId};
use crate::envelope::{json_kind, BodyType, Envelope, Header, Properties};
use crate::error::{BridgeError, Result};

/// Translate an envelope into the AMQP message handed to the transport
pub fn encode(envelope: &Envelope) -> Result<AmqpMessage> {
    let body = encode_body(envelope)?;

    if let Some(props) = &envelope.properties {
        if envelope.body_type != BodyType::Data
            && (props.content_type.is_some() || props.content_encoding.is_some())
        {
            debug!(
                body_type = %envelope.body_type,
                "content_type/content_encoding set on a non-data body"
            );
        }
    }

    Ok(AmqpMessage {
        header: envelope.header.as_ref().map(encode_header).transpose()?,
        message_annotations: envelope
            .message_annotations
            .as_ref()
            .map(encode_annotations),
        properties: envelope.properties.as_ref().map(encode_properties).transpose()?,
        application_properties: envelope
            .application_properties
            .as_ref()
            .map(encode_application_properties)
            .transpose()?,
        body,
    })
}

/// Translate an AMQP message received from the transport into an envelope
pub fn decode(message: &AmqpMessage) -> Result<Envelope> {
    let (body, body_type) = decode_body(&message.body)?;

    Ok(Envelope {
        body,
        body_type,
        header: message.header.as_ref().map(decode_header),
        properties: message.properties.as_ref().map(decode_properties).transpose()?,
        application_properties: message
            .application_properties
            .as_ref()
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, value)| {
                        if !value.is_simple() {
                            return Err(BridgeError::invalid_field(
                                format!("application_properties.{}", key),
                                "compound values are not allowed",
                            ));
                        }
                        Ok((key.clone(), to_json(value, "application_properties")?))
                    })
                    .collect::<Result<Map<String, Value>>>()
            })
            .transpose()?,
        message_annotations: message
            .message_annotations
            .as_ref()
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, value)| Ok((key.to_string(), to_json(value, "message_annotations")?)))
                    .collect::<Result<Map<String, Value>>>()
            })
            .transpose()?,
    })
}

fn encode_body(envelope: &Envelope) -> Result<Body> {
    match envelope.body_type {
        BodyType::Value => Ok(Body::Value(to_amqp(&envelope.body))),
        BodyType::Data => Ok(Body::Data(vec![envelope.data_bytes()?])),
        BodyType::Sequence => match &envelope.body {
            Value::Array(items) => Ok(Body::Sequence(vec![items.iter().map(to_amqp).collect()])),
            other => Err(BridgeError::mismatch(
                BodyType::Sequence,
                format!("expected array, found {}", json_kind(other)),
            )),
        },
    }
}

fn decode_body(body: &Body) -> Result<(Value, BodyType)> {
    match body {
        Body::Empty => Ok((Value::Null, BodyType::Value)),
        Body::Value(value) => Ok((to_json(value, "body")?, BodyType::Value)),
        Body::Data(sections) => {
            let bytes: Vec<u8> = sections.concat();
            Ok((Value::String(BASE64.encode(bytes)), BodyType::Data))
        }
        Body::Sequence(sections) => {
            let items = sections
                .iter()
                .flatten()
                .map(|item| to_json(item, "body"))
                .collect::<Result<Vec<_>>>()?;
            Ok((Value::Array(items), BodyType::Sequence))
        }
    }
}

fn encode_header(header: &Header) -> Result<amqp::Header> {
    let ttl = header
        .ttl
        .map(|ttl| u32::try_from(ttl).map_err(|_| out_of_range("header.ttl", ttl, "uint")))
        .transpose()?;
    let delivery_count = u32::try_from(header.delivery_count)
        .map_err(|_| out_of_range("header.delivery_count", header.delivery_count, "uint"))?;

    Ok(amqp::Header {
        durable: header.durable,
        priority: header.priority,
        ttl,
        first_acquirer: header.first_acquirer,
        delivery_count,
    })
}

fn decode_header(header: &amqp::Header) -> Header {
    Header {
        durable: header.durable,
        priority: header.priority,
        ttl: header.ttl.map(u64::from),
        first_acquirer: header.first_acquirer,
        delivery_count: u64::from(header.delivery_count),
    }
}

fn encode_properties(props: &Properties) -> Result<amqp::Properties> {
    Ok(amqp::Properties {
        message_id: props.message_id.clone().map(MessageId::String),
        user_id: props.user_id.as_ref().map(|user| user.as_bytes().to_vec()),
        to: props.to.clone(),
        subject: props.subject.clone(),
        reply_to: props.reply_to.clone(),
        correlation_id: props.correlation_id.clone().map(MessageId::String),
        content_type: props.content_type.clone(),
        content_encoding: props.content_encoding.clone(),
        absolute_expiry_time: props
            .absolute_expiry_time
            .map(|t| encode_timestamp("properties.absolute_expiry_time", t))
            .transpose()?,
        creation_time: props
            .creation_time
            .map(|t| encode_timestamp("properties.creation_time", t))
            .transpose()?,
        group_id: props.group_id.clone(),
        group_sequence: props.group_sequence,
        reply_to_group_id: props.reply_to_group_id.clone(),
    })
}

fn decode_properties(props: &amqp::Properties) -> Result<Properties> {
    Ok(Properties {
        to: props.to.clone(),
        reply_to: props.reply_to.clone(),
        message_id: props.message_id.as_ref().map(MessageId::to_string),
        correlation_id: props.correlation_id.as_ref().map(MessageId::to_string),
        subject: props.subject.clone(),
        group_id: props.group_id.clone(),
        group_sequence: props.group_sequence,
        reply_to_group_id: props.reply_to_group_id.clone(),
        content_type: props.content_type.clone(),
        content_encoding: props.content_encoding.clone(),
        creation_time: props
            .creation_time
            .map(|t| decode_timestamp("properties.creation_time", t))
            .transpose()?,
        absolute_expiry_time: props
            .absolute_expiry_time
            .map(|t| decode_timestamp("properties.absolute_expiry_time", t))
            .transpose()?,
        user_id: props
            .user_id
            .as_ref()
            .map(|user| String::from_utf8_lossy(user).into_owned()),
    })
}

fn encode_application_properties(entries: &Map<String, Value>) -> Result<Vec<(String, AmqpValue)>> {
    entries
        .iter()
        .map(|(key, value)| match value {
            Value::Array(_) | Value::Object(_) => Err(BridgeError::invalid_field(
                format!("application_properties.{}", key),
                format!("expected a simple value, found {}", json_kind(value)),
            )),
            scalar => Ok((key.clone(), to_amqp(scalar))),
        })
        .collect()
}

fn encode_annotations(entries: &Map<String, Value>) -> Vec<(AnnotationKey, AmqpValue)> {
    entries
        .iter()
        .map(|(key, value)| {
            // only the canonical decimal form maps to a ulong key so it decodes unchanged
            let key = match key.parse::<u64>() {
                Ok(code) if code.to_string() == *key => AnnotationKey::Ulong(code),
                _ => AnnotationKey::Symbol(key.clone()),
            };
            (key, to_amqp(value))
        })
        .collect()
}

fn encode_timestamp(field: &str, millis: u64) -> Result<i64> {
    i64::try_from(millis).map_err(|_| out_of_range(field, millis, "timestamp"))
}

fn decode_timestamp(field: &str, millis: i64) -> Result<u64> {
    u64::try_from(millis)
        .map_err(|_| BridgeError::invalid_field(field, format!("timestamp {} precedes the unix epoch", millis)))
}

fn out_of_range(field: &str, value: u64, wire_type: &str) -> BridgeError {
    BridgeError::invalid_field(field, format!("{} does not fit in an AMQP {}", value, wire_type))
}

/// JSON value to its natural AMQP type
fn to_amqp(value: &Value) -> AmqpValue {
    match value {
        Value::Null => AmqpValue::Null,
        Value::Bool(b) => AmqpValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AmqpValue::Long(i)
            } else if let Some(u) = n.as_u64() {
                AmqpValue::Ulong(u)
            } else {
                AmqpValue::Double(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => AmqpValue::String(s.clone()),
        Value::Array(items) => AmqpValue::List(items.iter().map(to_amqp).collect()),
        Value::Object(map) => AmqpValue::Map(
            map.iter()
                .map(|(k, v)| (AmqpValue::String(k.clone()), to_amqp(v)))
                .collect(),
        ),
    }
}

/// AMQP value to JSON. Binary renders as base64, symbols and uuids as strings.
fn to_json(value: &AmqpValue, field: &str) -> Result<Value> {
    Ok(match value {
        AmqpValue::Null => Value::Null,
        AmqpValue::Boolean(b) => Value::Bool(*b),
        AmqpValue::Ubyte(n) => Value::from(*n),
        AmqpValue::Ushort(n) => Value::from(*n),
        AmqpValue::Uint(n) => Value::from(*n),
        AmqpValue::Ulong(n) => Value::from(*n),
        AmqpValue::Byte(n) => Value::from(*n),
        AmqpValue::Short(n) => Value::from(*n),
        AmqpValue::Int(n) => Value::from(*n),
        AmqpValue::Long(n) => Value::from(*n),
        AmqpValue::Timestamp(n) => Value::from(*n),
        AmqpValue::Float(f) => float(f64::from(*f), field)?,
        AmqpValue::Double(f) => float(*f, field)?,
        AmqpValue::Char(c) => Value::String(c.to_string()),
        AmqpValue::Uuid(id) => Value::String(id.to_string()),
        AmqpValue::Binary(bytes) => Value::String(BASE64.encode(bytes)),
        AmqpValue::String(s) | AmqpValue::Symbol(s) => Value::String(s.clone()),
        AmqpValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| to_json(item, field))
                .collect::<Result<Vec<_>>>()?,
        ),
        AmqpValue::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let key = match key {
                    AmqpValue::String(s) | AmqpValue::Symbol(s) => s.clone(),
                    other => to_json(other, field)?.to_string(),
                };
                map.insert(key, to_json(value, field)?);
            }
            Value::Object(map)
        }
    })
}

fn float(f: f64, field: &str) -> Result<Value> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| BridgeError::invalid_field(field, format!("{} has no JSON representation", f)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use serde_json::json;

    fn full_envelope() -> Envelope {
        Envelope {
            body: json!({ "order": 17, "items": ["a", "b"], "total": 12.5 }),
            body_type: BodyType::Value,
            header: Some(Header {
                durable: true,
                priority: 7,
                ttl: Some(30_000),
                first_acquirer: true,
                delivery_count: 2,
            }),
            properties: Some(Properties {
                to: Some("orders".into()),
                reply_to: Some("replies".into()),
                message_id: Some("m-1".into()),
                correlation_id: Some("c-1".into()),
                subject: Some("new-order".into()),
                group_id: Some("g".into()),
                group_sequence: Some(3),
                reply_to_group_id: Some("rg".into()),
                content_type: None,
                content_encoding: None,
                creation_time: Some(1_700_000_000_000),
                absolute_expiry_time: Some(1_700_000_060_000),
                user_id: Some("alice".into()),
            }),
            application_properties: Some(
                json!({ "region": "eu", "retries": 3, "urgent": true, "none": null })
                    .as_object()
                    .cloned()
                    .unwrap(),
            ),
            message_annotations: Some(
                json!({ "x-opt-partition": 2, "42": "numeric" })
                    .as_object()
                    .cloned()
                    .unwrap(),
            ),
        }
    }

    #[test]
    fn test_round_trip_all_fields() {
        let envelope = full_envelope();
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_unset_sections_stay_absent() {
        let envelope = Envelope::value("plain");
        let message = encode(&envelope).unwrap();

        assert!(message.header.is_none());
        assert!(message.properties.is_none());
        assert!(message.application_properties.is_none());
        assert!(message.message_annotations.is_none());
        assert_eq!(decode(&message).unwrap(), envelope);
    }

    #[test]
    fn test_header_defaults_on_decode() {
        let message = AmqpMessage {
            header: Some(amqp::Header::default()),
            ..AmqpMessage::with_value(AmqpValue::Null)
        };
        let header = decode(&message).unwrap().header.unwrap();
        assert_eq!(header.priority, 4);
        assert!(!header.durable);
        assert_eq!(header.ttl, None);
    }

    #[test]
    fn test_data_body() {
        let envelope = Envelope::data([0u8, 159, 146, 150]);
        let message = encode(&envelope).unwrap();
        assert_eq!(message.body, Body::Data(vec![vec![0, 159, 146, 150]]));
        assert_eq!(decode(&message).unwrap(), envelope);
    }

    #[test]
    fn test_data_body_mismatch() {
        let envelope = Envelope {
            body: json!(42),
            body_type: BodyType::Data,
            ..Default::default()
        };
        assert_eq!(encode(&envelope).unwrap_err().kind(), ErrorKind::BodyTypeMismatch);
    }

    #[test]
    fn test_sequence_body() {
        let envelope = Envelope::sequence(vec![json!(1), json!("two"), json!([3])]);
        let message = encode(&envelope).unwrap();
        assert_eq!(
            message.body,
            Body::Sequence(vec![vec![
                AmqpValue::Long(1),
                AmqpValue::String("two".into()),
                AmqpValue::List(vec![AmqpValue::Long(3)]),
            ]])
        );
        assert_eq!(decode(&message).unwrap(), envelope);

        let not_a_list = Envelope {
            body: json!("one"),
            body_type: BodyType::Sequence,
            ..Default::default()
        };
        assert_eq!(encode(&not_a_list).unwrap_err().kind(), ErrorKind::BodyTypeMismatch);
    }

    #[test]
    fn test_multiple_sections_decode() {
        let message = AmqpMessage {
            body: Body::Data(vec![b"ab".to_vec(), b"cd".to_vec()]),
            ..Default::default()
        };
        assert_eq!(decode(&message).unwrap().data_bytes().unwrap(), b"abcd".to_vec());

        let message = AmqpMessage {
            body: Body::Sequence(vec![vec![AmqpValue::Int(1)], vec![AmqpValue::Int(2)]]),
            ..Default::default()
        };
        assert_eq!(decode(&message).unwrap().body, json!([1, 2]));
    }

    #[test]
    fn test_empty_body_decodes_to_null_value() {
        let envelope = decode(&AmqpMessage::default()).unwrap();
        assert_eq!(envelope.body, Value::Null);
        assert_eq!(envelope.body_type, BodyType::Value);
    }

    #[test]
    fn test_foreign_identifiers_render_as_strings() {
        let id = uuid::Uuid::new_v4();
        let mut message = AmqpMessage::with_value(AmqpValue::Binary(vec![1, 2, 3]));
        message.properties_mut().message_id = Some(MessageId::Uuid(id));
        message.properties_mut().correlation_id = Some(MessageId::Ulong(99));
        message.properties_mut().content_type = Some("application/octet-stream".into());

        let envelope = decode(&message).unwrap();
        assert_eq!(envelope.message_id(), Some(id.to_string().as_str()));
        assert_eq!(envelope.correlation_id(), Some("99"));
        assert_eq!(envelope.body, json!("AQID"));
    }

    #[test]
    fn test_annotation_keys() {
        let envelope = Envelope::value(1)
            .with_annotation("x-opt-key", "v")
            .with_annotation("7", 1);
        let message = encode(&envelope).unwrap();
        let keys: Vec<_> = message
            .message_annotations
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(
            keys,
            vec![AnnotationKey::Symbol("x-opt-key".into()), AnnotationKey::Ulong(7)]
        );
    }

    #[test]
    fn test_non_canonical_numeric_annotation_keys_stay_symbols() {
        let envelope = Envelope::value(1)
            .with_annotation("007", "a")
            .with_annotation("+5", "b")
            .with_annotation("42", "c");
        let message = encode(&envelope).unwrap();
        let keys: Vec<_> = message
            .message_annotations
            .clone()
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(
            keys,
            vec![
                AnnotationKey::Symbol("007".into()),
                AnnotationKey::Symbol("+5".into()),
                AnnotationKey::Ulong(42),
            ]
        );

        let decoded = decode(&message).unwrap();
        let decoded_keys: Vec<_> = decoded.message_annotations.unwrap().keys().cloned().collect();
        assert_eq!(decoded_keys, vec!["007", "+5", "42"]);
    }

    #[test]
    fn test_application_property_must_be_simple() {
        let envelope = Envelope::value(1).with_application_property("nested", json!({ "a": 1 }));
        assert_eq!(encode(&envelope).unwrap_err().kind(), ErrorKind::InvalidField);
    }

    #[test]
    fn test_inbound_compound_application_property_rejected() {
        let mut message = AmqpMessage::with_value(AmqpValue::Int(1));
        message.application_properties = Some(vec![(
            "tags".to_string(),
            AmqpValue::List(vec![AmqpValue::String("a".into())]),
        )]);
        assert_eq!(decode(&message).unwrap_err().kind(), ErrorKind::InvalidField);

        message.application_properties = Some(vec![("tag".to_string(), AmqpValue::Symbol("a".into()))]);
        let envelope = decode(&message).unwrap();
        assert_eq!(envelope.application_property("tag"), Some(&json!("a")));
    }

    #[test]
    fn test_out_of_range_header() {
        let mut envelope = Envelope::value(1);
        envelope.header_mut().ttl = Some(u64::from(u32::MAX) + 1);
        assert_eq!(encode(&envelope).unwrap_err().kind(), ErrorKind::InvalidField);
    }

    #[test]
    fn test_non_finite_double_fails_decode() {
        let message = AmqpMessage::with_value(AmqpValue::Double(f64::INFINITY));
        assert_eq!(decode(&message).unwrap_err().kind(), ErrorKind::InvalidField);
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            any::<u64>().prop_map(Value::from),
            (-1.0e9f64..1.0e9).prop_map(|f| json!(f)),
            "[a-z0-9 ]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::vec(("[a-z]{1,6}", inner), 0..4)
                    .prop_map(|entries| Value::Object(entries.into_iter().collect())),
            ]
        })
    }

    fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::String),
        ]
    }

    fn arb_properties() -> impl Strategy<Value = Properties> {
        (
            proptest::option::of("[a-z]{1,8}"),
            proptest::option::of("[a-z0-9-]{1,16}"),
            proptest::option::of("[a-z0-9-]{1,16}"),
            proptest::option::of(any::<u32>()),
            proptest::option::of(0u64..=i64::MAX as u64),
            proptest::option::of("[a-z]{1,8}"),
        )
            .prop_map(|(to, message_id, correlation_id, group_sequence, creation_time, user_id)| {
                Properties {
                    to,
                    message_id,
                    correlation_id,
                    group_sequence,
                    creation_time,
                    user_id,
                    ..Default::default()
                }
            })
    }

    fn arb_annotation_key() -> impl Strategy<Value = String> {
        prop_oneof![
            "x-opt-[a-z]{1,8}",
            any::<u64>().prop_map(|code| code.to_string()),
            "[+0]{1,2}[0-9]{1,4}",
            Just("007".to_string()),
        ]
    }

    fn arb_envelope() -> impl Strategy<Value = Envelope> {
        let body = prop_oneof![
            arb_json().prop_map(|body| (body, BodyType::Value)),
            prop::collection::vec(any::<u8>(), 0..32)
                .prop_map(|bytes| (Value::String(BASE64.encode(bytes)), BodyType::Data)),
            prop::collection::vec(arb_json(), 0..4)
                .prop_map(|items| (Value::Array(items), BodyType::Sequence)),
        ];
        let header = proptest::option::of(
            (any::<bool>(), any::<u8>(), proptest::option::of(0u64..=u32::MAX as u64), 0u64..=u32::MAX as u64)
                .prop_map(|(durable, priority, ttl, delivery_count)| Header {
                    durable,
                    priority,
                    ttl,
                    first_acquirer: false,
                    delivery_count,
                }),
        );
        let app_props = proptest::option::of(
            prop::collection::vec(("[a-z]{1,6}", arb_scalar()), 0..4)
                .prop_map(|entries| entries.into_iter().collect::<Map<String, Value>>()),
        );
        let annotations = proptest::option::of(
            prop::collection::vec((arb_annotation_key(), arb_scalar()), 0..4)
                .prop_map(|entries| entries.into_iter().collect::<Map<String, Value>>()),
        );
        (body, header, proptest::option::of(arb_properties()), app_props, annotations).prop_map(
            |((body, body_type), header, properties, application_properties, message_annotations)| Envelope {
                body,
                body_type,
                header,
                properties,
                application_properties,
                message_annotations,
            },
        )
    }

    proptest! {
        #[test]
        fn property_decode_inverts_encode(envelope in arb_envelope()) {
            let message = encode(&envelope).unwrap();
            prop_assert_eq!(decode(&message).unwrap(), envelope);
        }
    }
}
