use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Reply sent for every ingress request, regardless of outcome.
pub const SUCCESS: &[u8] = b"success";

pub const TRAIN_PACKET_TAG: &str = "protocol.TrainPacket";
pub const TEST_PACKET_TAG: &str = "protocol.TestPacket";
pub const RULE_REQUEST_TAG: &str = "protocol.RuleRequest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn from_incoming(incoming: bool) -> Self {
        if incoming {
            Direction::Incoming
        } else {
            Direction::Outgoing
        }
    }

    pub fn is_incoming(&self) -> bool {
        matches!(self, Direction::Incoming)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{dataset}-{direction}` routing key for one side of one dataset.
pub fn handler_key(dataset: &str, direction: Direction) -> String {
    format!("{dataset}-{direction}")
}

/// Inverse of [`handler_key`]. Datasets may themselves contain `-`, so the
/// direction suffix is matched from the end.
pub fn split_handler_key(key: &str) -> Option<(&str, Direction)> {
    if let Some(dataset) = key.strip_suffix("-incoming") {
        Some((dataset, Direction::Incoming))
    } else if let Some(dataset) = key.strip_suffix("-outgoing") {
        Some((dataset, Direction::Outgoing))
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrainPacket {
    pub dataset: String,
    pub allow_block: bool,
    pub incoming: bool,
    pub payload: Bytes,
}

impl TrainPacket {
    pub fn handler_key(&self) -> String {
        handler_key(&self.dataset, Direction::from_incoming(self.incoming))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestPacket {
    pub dataset: String,
    pub incoming: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleRequest {
    pub dataset: String,
    pub incoming: bool,
}

/// Published on the rule egress for every newly best rule candidate. The
/// sequence carries the stored key bytes verbatim: a 2-byte little-endian
/// offset (always zero today) followed by the discriminating prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rule {
    pub dataset: String,
    pub require_forbid: bool,
    pub incoming: bool,
    pub sequence: Bytes,
}

impl Rule {
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| EncodeError(e.to_string()))?;
        Ok(buf.into())
    }

    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        ciborium::from_reader(frame).map_err(|e| DecodeError::Cbor(e.to_string()))
    }
}

/// Self-describing tagged object wrapping every ingress request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope {
    name: String,
    value: ciborium::Value,
}

/// Closed sum of the recognized ingress tags. `Test` and `Rule` are reserved
/// names the learning core acknowledges but ignores.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Train(TrainPacket),
    Test(TestPacket),
    Rule(RuleRequest),
}

impl Request {
    pub fn tag(&self) -> &'static str {
        match self {
            Request::Train(_) => TRAIN_PACKET_TAG,
            Request::Test(_) => TEST_PACKET_TAG,
            Request::Rule(_) => RULE_REQUEST_TAG,
        }
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let value = match self {
            Request::Train(packet) => ciborium::Value::serialized(packet),
            Request::Test(packet) => ciborium::Value::serialized(packet),
            Request::Rule(request) => ciborium::Value::serialized(request),
        }
        .map_err(|e| EncodeError(e.to_string()))?;
        let envelope = Envelope {
            name: self.tag().to_owned(),
            value,
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&envelope, &mut buf).map_err(|e| EncodeError(e.to_string()))?;
        Ok(buf.into())
    }

    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let Envelope { name, value } =
            ciborium::from_reader(frame).map_err(|e| DecodeError::Cbor(e.to_string()))?;
        let malformed = |error: ciborium::value::Error| DecodeError::Value {
            tag: name.clone(),
            error: error.to_string(),
        };
        match name.as_str() {
            TRAIN_PACKET_TAG => Ok(Request::Train(value.deserialized().map_err(malformed)?)),
            TEST_PACKET_TAG => Ok(Request::Test(value.deserialized().map_err(malformed)?)),
            RULE_REQUEST_TAG => Ok(Request::Rule(value.deserialized().map_err(malformed)?)),
            _ => Err(DecodeError::UnknownTag(name.clone())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("cbor encode: {0}")]
pub struct EncodeError(String);

#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("cbor decode: {0}")]
    Cbor(String),
    #[error("unknown message tag `{0}`")]
    UnknownTag(String),
    #[error("malformed `{tag}` value: {error}")]
    Value { tag: String, error: String },
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn train_packet_envelope_round_trip() {
        let packet = TrainPacket {
            dataset: "d".to_owned(),
            allow_block: false,
            incoming: true,
            payload: Bytes::from_static(&[0x41, 0x42, 0x43]),
        };
        let frame = Request::Train(packet.clone()).encode().unwrap();
        match Request::decode(&frame).unwrap() {
            Request::Train(decoded) => assert_eq!(decoded, packet),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected_with_its_name() {
        let envelope = Envelope {
            name: "protocol.Bogus".to_owned(),
            value: ciborium::Value::Null,
        };
        let mut frame = Vec::new();
        ciborium::into_writer(&envelope, &mut frame).unwrap();
        match Request::decode(&frame) {
            Err(DecodeError::UnknownTag(tag)) => assert_eq!(tag, "protocol.Bogus"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn mis_shaped_value_is_a_value_error() {
        let envelope = Envelope {
            name: TRAIN_PACKET_TAG.to_owned(),
            value: ciborium::Value::Integer(7.into()),
        };
        let mut frame = Vec::new();
        ciborium::into_writer(&envelope, &mut frame).unwrap();
        assert!(matches!(
            Request::decode(&frame),
            Err(DecodeError::Value { .. })
        ));
    }

    #[rstest]
    #[case("d", Direction::Incoming, "d-incoming")]
    #[case("my-data-set", Direction::Outgoing, "my-data-set-outgoing")]
    fn handler_keys_round_trip(
        #[case] dataset: &str,
        #[case] direction: Direction,
        #[case] expected: &str,
    ) {
        let key = handler_key(dataset, direction);
        assert_eq!(key, expected);
        assert_eq!(split_handler_key(&key), Some((dataset, direction)));
    }

    #[test]
    fn keys_without_direction_suffix_do_not_split() {
        assert_eq!(split_handler_key("dataset"), None);
    }

    #[test]
    fn rule_round_trip_preserves_sequence_bytes() {
        let rule = Rule {
            dataset: "d".to_owned(),
            require_forbid: true,
            incoming: false,
            sequence: Bytes::from_static(&[0x00, 0x00, 0x41]),
        };
        let frame = rule.encode().unwrap();
        assert_eq!(Rule::decode(&frame).unwrap(), rule);
    }
}
