#![forbid(unsafe_code)]

//! Wire form of [`Value`]s crossing locality boundaries.
//!
//! Every payload is wrapped in a [`WireEnvelope`] carrying a schema version
//! and a deterministic `det64` checksum of the payload. Decoding always
//! yields exclusively owned arrays, so nothing aliases across localities.

use std::fmt;

use serde::{Deserialize, Serialize};
use tsr_core::{ArrayValue, DType, TypedArray, Value, ValueDict};

pub const WIRE_SCHEMA_VERSION: u32 = 1;
const MAX_WIRE_PAYLOAD_BYTES: usize = 64 * 1_048_576;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireValue {
    Nil,
    Bool { value: bool },
    Int64 { value: i64 },
    // floats travel as raw bits so NaN and infinities survive JSON
    Float64 { bits: u64 },
    String { value: String },
    Array { shape: Vec<usize>, data: WireData },
    List { items: Vec<WireValue> },
    Dict { entries: Vec<WireEntry> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireEntry {
    pub key: WireValue,
    pub value: WireValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireData {
    Bool(Vec<bool>),
    Int64(Vec<i64>),
    Float64Bits(Vec<u64>),
}

impl WireData {
    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64Bits(_) => DType::Float64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireEnvelope {
    pub schema_version: u32,
    pub payload: WireValue,
    pub source_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerializeError {
    InvalidJson { diagnostic: String },
    UnknownField { field: String },
    VersionMismatch { expected: u32, found: u32 },
    ChecksumMismatch { expected: String, found: String },
    IncompatiblePayload { reason: String },
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid json: {diagnostic}"),
            Self::UnknownField { field } => write!(f, "unknown field '{field}'"),
            Self::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "schema version mismatch: expected={expected} found={found}"
                )
            }
            Self::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected={expected} found={found}")
            }
            Self::IncompatiblePayload { reason } => write!(f, "incompatible payload: {reason}"),
        }
    }
}

impl std::error::Error for SerializeError {}

/// Converts a value into its wire form. Primitive handles name nodes of a
/// local graph and have no meaning on another locality.
pub fn to_wire(value: &Value) -> Result<WireValue, SerializeError> {
    Ok(match value {
        Value::Nil => WireValue::Nil,
        Value::Bool(value) => WireValue::Bool { value: *value },
        Value::Int64(value) => WireValue::Int64 { value: *value },
        Value::Float64(value) => WireValue::Float64 {
            bits: value.to_bits(),
        },
        Value::String(value) => WireValue::String {
            value: value.clone(),
        },
        Value::Array(array) => array_to_wire(array),
        Value::List(items) => WireValue::List {
            items: items.iter().map(to_wire).collect::<Result<_, _>>()?,
        },
        Value::Dict(dict) => WireValue::Dict {
            entries: dict
                .iter()
                .map(|(key, value)| {
                    Ok(WireEntry {
                        key: to_wire(key)?,
                        value: to_wire(value)?,
                    })
                })
                .collect::<Result<_, SerializeError>>()?,
        },
        Value::PrimitiveHandle(node) => {
            return Err(SerializeError::IncompatiblePayload {
                reason: format!("primitive handle {} cannot leave its locality", node.0),
            });
        }
    })
}

pub fn from_wire(wire: WireValue) -> Result<Value, SerializeError> {
    Ok(match wire {
        WireValue::Nil => Value::Nil,
        WireValue::Bool { value } => Value::Bool(value),
        WireValue::Int64 { value } => Value::Int64(value),
        WireValue::Float64 { bits } => Value::Float64(f64::from_bits(bits)),
        WireValue::String { value } => Value::String(value),
        WireValue::Array { shape, data } => Value::Array(array_from_wire(&shape, data)?),
        WireValue::List { items } => Value::List(
            items
                .into_iter()
                .map(from_wire)
                .collect::<Result<_, _>>()?,
        ),
        WireValue::Dict { entries } => {
            let mut dict = ValueDict::new();
            for entry in entries {
                dict.insert(from_wire(entry.key)?, from_wire(entry.value)?);
            }
            Value::Dict(dict)
        }
    })
}

fn array_to_wire(array: &ArrayValue) -> WireValue {
    let data = match array {
        ArrayValue::Bool(array) => WireData::Bool(array.to_vec()),
        ArrayValue::Int64(array) => WireData::Int64(array.to_vec()),
        ArrayValue::Float64(array) => {
            WireData::Float64Bits(array.to_vec().into_iter().map(f64::to_bits).collect())
        }
    };
    WireValue::Array {
        shape: array.shape(),
        data,
    }
}

fn array_from_wire(shape: &[usize], data: WireData) -> Result<ArrayValue, SerializeError> {
    let incompatible = |error: tsr_core::ShapeError| SerializeError::IncompatiblePayload {
        reason: error.to_string(),
    };
    Ok(match data {
        WireData::Bool(values) => {
            TypedArray::from_shape_vec(shape, values).map_err(incompatible)?.into()
        }
        WireData::Int64(values) => {
            TypedArray::from_shape_vec(shape, values).map_err(incompatible)?.into()
        }
        WireData::Float64Bits(bits) => {
            let values = bits.into_iter().map(f64::from_bits).collect();
            TypedArray::<f64>::from_shape_vec(shape, values)
                .map_err(incompatible)?
                .into()
        }
    })
}

pub fn encode_value(value: &Value) -> Result<String, SerializeError> {
    let payload = to_wire(value)?;
    let source_hash = payload_hash(WIRE_SCHEMA_VERSION, &payload)?;
    let envelope = WireEnvelope {
        schema_version: WIRE_SCHEMA_VERSION,
        payload,
        source_hash,
    };
    serde_json::to_string(&envelope).map_err(|error| SerializeError::IncompatiblePayload {
        reason: format!("wire encoding failed: {error}"),
    })
}

pub fn decode_value(input: &str) -> Result<Value, SerializeError> {
    let envelope = decode_envelope(input)?;
    from_wire(envelope.payload)
}

pub fn decode_envelope(input: &str) -> Result<WireEnvelope, SerializeError> {
    validate_payload_size(input)?;
    let envelope: WireEnvelope = serde_json::from_str(input).map_err(|error| {
        if let Some(field) = extract_unknown_field(error.to_string().as_str()) {
            SerializeError::UnknownField { field }
        } else {
            SerializeError::InvalidJson {
                diagnostic: bounded(error.to_string().as_str(), 200),
            }
        }
    })?;
    validate_envelope(&envelope)?;
    Ok(envelope)
}

fn validate_payload_size(input: &str) -> Result<(), SerializeError> {
    let actual = input.len();
    if actual > MAX_WIRE_PAYLOAD_BYTES {
        return Err(SerializeError::IncompatiblePayload {
            reason: format!(
                "wire payload exceeds max bytes: actual={actual} max={MAX_WIRE_PAYLOAD_BYTES}"
            ),
        });
    }
    Ok(())
}

fn validate_envelope(envelope: &WireEnvelope) -> Result<(), SerializeError> {
    if envelope.schema_version != WIRE_SCHEMA_VERSION {
        return Err(SerializeError::VersionMismatch {
            expected: WIRE_SCHEMA_VERSION,
            found: envelope.schema_version,
        });
    }

    let expected = payload_hash(envelope.schema_version, &envelope.payload)?;
    if envelope.source_hash != expected {
        return Err(SerializeError::ChecksumMismatch {
            expected,
            found: envelope.source_hash.clone(),
        });
    }
    Ok(())
}

fn payload_hash(schema_version: u32, payload: &WireValue) -> Result<String, SerializeError> {
    let canonical =
        serde_json::to_vec(payload).map_err(|error| SerializeError::IncompatiblePayload {
            reason: format!("payload hashing failed: {error}"),
        })?;
    let mut hash = fnv1a(0xcbf2_9ce4_8422_2325, &schema_version.to_le_bytes());
    hash = fnv1a(hash, &canonical);
    Ok(format!("det64:{hash:016x}"))
}

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn extract_unknown_field(message: &str) -> Option<String> {
    // serde_json message shape: "unknown field `x`, expected ..."
    let marker = "unknown field `";
    let start = message.find(marker)? + marker.len();
    let tail = &message[start..];
    let end = tail.find('`')?;
    Some(tail[..end].to_string())
}

fn bounded(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut boundary = max_len.min(input.len());
        while boundary > 0 && !input.is_char_boundary(boundary) {
            boundary -= 1;
        }
        format!("{}...", &input[..boundary])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use serde_json::json;
    use tsr_core::{ArrayValue, NodeId, TypedArray, Value, ValueDict, values_equal};

    use super::{SerializeError, decode_value, encode_value};

    fn det_seed(parts: &[u64]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for value in parts {
            for byte in value.to_le_bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            }
        }
        hash
    }

    fn build_property_log(
        test_id: &str,
        seed: u64,
        input_digest: u64,
        reason_code: &str,
    ) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("suite_id".to_string(), "tsr_serialize_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "input_digest".to_string(),
            format!("det64:{input_digest:016x}"),
        );
        log.insert(
            "replay_command".to_string(),
            "cargo test -p tsr-serialize -- --nocapture".to_string(),
        );
        log.insert("outcome".to_string(), "pass".to_string());
        log.insert("reason_code".to_string(), reason_code.to_string());
        log
    }

    fn assert_log_contract(log: &BTreeMap<String, String>) {
        for key in [
            "suite_id",
            "test_id",
            "seed",
            "input_digest",
            "replay_command",
            "outcome",
            "reason_code",
        ] {
            assert!(
                log.contains_key(key),
                "property log missing required key '{key}'"
            );
        }
    }

    fn sample_matrix() -> Value {
        Value::from(
            TypedArray::from_shape_vec(&[2, 3], vec![1.0f64, -2.5, 3.0, f64::NAN, 0.0, 6.0])
                .expect("2x3 matrix"),
        )
    }

    #[test]
    fn matrix_round_trip_preserves_shape_and_bits() {
        let encoded = encode_value(&sample_matrix()).expect("encode matrix");
        let decoded = decode_value(&encoded).expect("decode matrix");
        let Value::Array(ArrayValue::Float64(array)) = decoded else {
            panic!("expected float64 array, got {decoded:?}");
        };
        assert_eq!(array.shape(), vec![2, 3]);
        let values = array.to_vec();
        assert!(values[3].is_nan());
        assert_eq!(values[1], -2.5);
    }

    #[test]
    fn decoded_arrays_never_alias_the_source() {
        let shared = Value::from(TypedArray::vector(vec![1i64, 2, 3]).into_shared());
        let decoded = decode_value(&encode_value(&shared).expect("encode")).expect("decode");
        let array = decoded.into_array().expect("array");
        assert!(!array.is_reference());
    }

    #[test]
    fn nested_containers_round_trip() {
        let mut dict = ValueDict::new();
        dict.insert(Value::from("tiling"), Value::from("row"));
        dict.insert(Value::Int64(3), Value::Bool(true));
        let value = Value::List(vec![Value::Nil, Value::Dict(dict), Value::Float64(0.25)]);

        let decoded = decode_value(&encode_value(&value).expect("encode")).expect("decode");
        assert_eq!(values_equal(&value, &decoded), Ok(true));
    }

    #[test]
    fn primitive_handles_are_not_encodable() {
        let err = encode_value(&Value::PrimitiveHandle(NodeId(3)))
            .expect_err("handles stay local");
        assert!(matches!(err, SerializeError::IncompatiblePayload { .. }));
    }

    #[test]
    fn unknown_envelope_field_fail_closed() {
        let encoded = encode_value(&Value::Int64(1)).expect("encode");
        let mut payload: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        payload["extra"] = json!("boom");

        let err = decode_value(&payload.to_string()).expect_err("must fail");
        assert!(
            matches!(err, SerializeError::UnknownField { ref field } if field == "extra"),
            "expected UnknownField 'extra', got {err:?}"
        );
    }

    #[test]
    fn version_mismatch_is_fail_closed() {
        let encoded = encode_value(&Value::Int64(1)).expect("encode");
        let mut payload: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        payload["schema_version"] = json!(2);

        let err = decode_value(&payload.to_string()).expect_err("version mismatch");
        assert!(err.to_string().contains("schema version mismatch"));
    }

    #[test]
    fn checksum_mismatch_is_fail_closed() {
        let encoded = encode_value(&sample_matrix()).expect("encode");
        let mut payload: serde_json::Value = serde_json::from_str(&encoded).expect("json");
        payload["payload"]["shape"] = json!([3, 2]);

        let err = decode_value(&payload.to_string()).expect_err("tampered payload");
        assert!(matches!(err, SerializeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn malformed_payload_returns_bounded_diagnostic() {
        let err = decode_value("{ not json").expect_err("must fail");
        let msg = err.to_string();
        assert!(msg.contains("invalid json"));
        assert!(msg.len() < 320);
    }

    #[test]
    fn oversized_payload_is_fail_closed() {
        let payload = "x".repeat(super::MAX_WIRE_PAYLOAD_BYTES + 1);
        let err = decode_value(payload.as_str()).expect_err("oversized payload must fail");
        assert!(err.to_string().contains("exceeds max bytes"));
    }

    #[test]
    fn element_count_mismatch_is_incompatible() {
        let err = super::from_wire(super::WireValue::Array {
            shape: vec![2, 2],
            data: super::WireData::Int64(vec![1, 2, 3]),
        })
        .expect_err("3 elements cannot fill 2x2");
        assert!(matches!(err, SerializeError::IncompatiblePayload { .. }));
    }

    proptest! {
        #[test]
        fn prop_vector_round_trip_is_lossless(values in prop::collection::vec(-1e6f64..1e6, 0..64)) {
            let value = Value::from(TypedArray::vector(values.clone()));
            let decoded = decode_value(&encode_value(&value).expect("encode")).expect("decode");
            let array = decoded.into_array().expect("array").into_typed::<f64>();
            prop_assert_eq!(array.to_vec(), values.clone());

            let digest = det_seed(&values.iter().map(|v| v.to_bits()).collect::<Vec<_>>());
            let seed = det_seed(&[values.len() as u64, digest]);
            let log = build_property_log(
                "prop_vector_round_trip_is_lossless",
                seed,
                digest,
                "wire_vector_lossless_ok",
            );
            assert_log_contract(&log);
        }

        #[test]
        fn prop_encoding_is_deterministic(value in -10_000i64..10_000, flag in any::<bool>()) {
            let input = Value::List(vec![Value::Int64(value), Value::Bool(flag)]);
            let first = encode_value(&input).expect("encode");
            let second = encode_value(&input).expect("encode");
            prop_assert_eq!(first, second);

            let seed = det_seed(&[value as u64, u64::from(flag)]);
            let log = build_property_log(
                "prop_encoding_is_deterministic",
                seed,
                value as u64,
                "wire_encoding_deterministic_ok",
            );
            assert_log_contract(&log);
        }
    }
}
