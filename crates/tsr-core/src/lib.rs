#![forbid(unsafe_code)]

mod array;
mod value;

use std::fmt;

pub use array::{ArrayValue, TypedArray};
pub use value::{NodeId, Value, ValueDict, ValueKind, values_equal};

/// Highest rank an [`ArrayValue`] may carry (quats, pages, rows, columns).
pub const MAX_DIMS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    Bool,
    Int64,
    Float64,
}

impl DType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "bool" => Some(Self::Bool),
            "int" | "int64" => Some(Self::Int64),
            "float" | "float64" | "double" => Some(Self::Float64),
            _ => None,
        }
    }

    /// Common dtype of two operands: bool < int64 < float64.
    #[must_use]
    pub fn promote(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar element stored by a [`TypedArray`].
pub trait Element:
    Copy + Default + PartialEq + PartialOrd + fmt::Debug + Send + Sync + 'static
{
    const DTYPE: DType;

    fn from_bool(value: bool) -> Self;
    fn from_i64(value: i64) -> Self;
    fn from_f64(value: f64) -> Self;
    fn to_bool(self) -> bool;
    fn to_i64(self) -> i64;
    fn to_f64(self) -> f64;

    fn into_value(array: TypedArray<Self>) -> ArrayValue;

    /// Converts any array into this element type. Arrays already of this
    /// dtype are moved through untouched, keeping their reference state.
    fn from_value(value: ArrayValue) -> TypedArray<Self>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    RankTooHigh {
        dims: usize,
        max: usize,
    },
    ElementCount {
        shape: Vec<usize>,
        len: usize,
    },
    NotBroadcastable {
        name: String,
        from: Vec<usize>,
        to: Vec<usize>,
    },
    Mismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    IndexOutOfBounds {
        axis: usize,
        index: i64,
        extent: usize,
    },
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RankTooHigh { dims, max } => {
                write!(f, "array rank {dims} exceeds supported maximum {max}")
            }
            Self::ElementCount { shape, len } => {
                write!(f, "shape {shape:?} cannot hold {len} elements")
            }
            Self::NotBroadcastable { name, from, to } => {
                write!(f, "{name}: cannot broadcast shape {from:?} into {to:?}")
            }
            Self::Mismatch { lhs, rhs } => {
                write!(f, "shape mismatch: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::IndexOutOfBounds {
                axis,
                index,
                extent,
            } => write!(
                f,
                "index {index} out of bounds for axis {axis} with extent {extent}"
            ),
        }
    }
}

impl std::error::Error for ShapeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    KindMismatch {
        expected: &'static str,
        actual: ValueKind,
    },
    Unsupported {
        lhs: ValueKind,
        rhs: ValueKind,
    },
    Nil {
        expected: &'static str,
    },
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KindMismatch { expected, actual } => {
                write!(f, "expected {expected}, got {actual:?}")
            }
            Self::Unsupported { lhs, rhs } => {
                write!(f, "operation unsupported between {lhs:?} and {rhs:?}")
            }
            Self::Nil { expected } => write!(f, "expected {expected}, got nil"),
        }
    }
}

impl std::error::Error for ValueError {}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::{
        ArrayValue, DType, NodeId, ShapeError, TypedArray, Value, ValueDict, ValueError,
        ValueKind, values_equal,
    };

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

    fn build_property_log(test_id: &str, seed: u64, reason_code: &str) -> BTreeMap<String, String> {
        let mut log = BTreeMap::new();
        log.insert("suite_id".to_string(), "tsr_core_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p tsr-core {test_id} -- --nocapture"),
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

    #[test]
    fn dtype_promotion_orders_bool_int_float() {
        assert_eq!(DType::Bool.promote(DType::Int64), DType::Int64);
        assert_eq!(DType::Float64.promote(DType::Int64), DType::Float64);
        assert_eq!(DType::Bool.promote(DType::Bool), DType::Bool);
        assert_eq!(DType::parse("double"), Some(DType::Float64));
        assert_eq!(DType::parse("complex"), None);
    }

    #[test]
    fn scalar_array_has_zero_dims() {
        let scalar = TypedArray::scalar(42.0f64);
        assert_eq!(scalar.dims(), 0);
        assert_eq!(scalar.len(), 1);
        assert_eq!(scalar.scalar_value(), Some(42.0));
        assert!(!scalar.is_reference());
    }

    #[test]
    fn rank_above_four_is_rejected() {
        let err = TypedArray::from_elem(&[1, 1, 1, 1, 1], 0i64)
            .expect_err("rank five must fail closed");
        assert!(matches!(err, ShapeError::RankTooHigh { dims: 5, max: 4 }));
    }

    #[test]
    fn from_shape_vec_checks_element_count() {
        let err = TypedArray::from_shape_vec(&[2, 3], vec![1i64, 2, 3])
            .expect_err("element count mismatch must fail");
        assert!(matches!(err, ShapeError::ElementCount { len: 3, .. }));
    }

    #[test]
    fn share_turns_owned_into_aliased_reference() {
        let mut owner = TypedArray::vector(vec![1.0f64, 2.0, 3.0]);
        let alias = owner.share();

        assert!(owner.is_reference());
        assert!(alias.is_reference());
        assert!(owner.shares_storage_with(&alias));

        owner.with_view_mut(|mut view| view[[1]] = 20.0);
        assert_eq!(alias.to_vec(), vec![1.0, 20.0, 3.0]);
    }

    #[test]
    fn copy_of_reference_is_exclusively_owned() {
        let shared = TypedArray::vector(vec![1i64, 2]).into_shared();
        let mut copy = shared.copy();
        assert!(!copy.is_reference());
        assert!(!copy.shares_storage_with(&shared));

        copy.with_view_mut(|mut view| view[[0]] = 9);
        assert_eq!(shared.to_vec(), vec![1, 2]);
    }

    #[test]
    fn into_array_reclaims_unique_shared_buffer() {
        let shared = TypedArray::vector(vec![5i64, 6]).into_shared();
        let array = shared.into_array();
        assert_eq!(array.as_slice(), Some(&[5i64, 6][..]));
    }

    #[test]
    fn into_typed_converts_across_dtypes() {
        let ints = ArrayValue::from(TypedArray::vector(vec![0i64, 2, -3]));
        let floats = ints.clone().into_typed::<f64>();
        assert_eq!(floats.to_vec(), vec![0.0, 2.0, -3.0]);

        let bools = ints.into_typed::<bool>();
        assert_eq!(bools.to_vec(), vec![false, true, true]);
    }

    #[test]
    fn into_typed_keeps_reference_for_same_dtype() {
        let shared = ArrayValue::from(TypedArray::vector(vec![1.5f64]).into_shared());
        let typed = shared.clone().into_typed::<f64>();
        assert!(typed.is_reference());
        assert!(shared.shares_storage_with(&ArrayValue::from(typed)));
    }

    #[test]
    fn array_values_equal_ignores_dtype() {
        let ints = ArrayValue::from(TypedArray::vector(vec![1i64, 0]));
        let floats = ArrayValue::from(TypedArray::vector(vec![1.0f64, 0.0]));
        let bools = ArrayValue::from(TypedArray::vector(vec![true, false]));
        assert!(ints.values_equal(&floats));
        assert!(floats.values_equal(&bools));
        assert_ne!(ints, floats);
    }

    #[test]
    fn value_scalars_compare_numerically() {
        assert_eq!(values_equal(&Value::Int64(3), &Value::Float64(3.0)), Ok(true));
        assert_eq!(values_equal(&Value::Bool(true), &Value::Int64(1)), Ok(true));
        assert_eq!(
            values_equal(
                &Value::Array(ArrayValue::from(TypedArray::scalar(2.0f64))),
                &Value::Int64(2)
            ),
            Ok(true)
        );
        assert_eq!(values_equal(&Value::Nil, &Value::Nil), Ok(true));
    }

    #[test]
    fn value_equality_rejects_mixed_kinds() {
        let err = values_equal(&Value::from("abc"), &Value::Int64(1))
            .expect_err("string/int comparison must fail");
        assert_eq!(
            err,
            ValueError::Unsupported {
                lhs: ValueKind::String,
                rhs: ValueKind::Int64
            }
        );

        let err = values_equal(&Value::Nil, &Value::PrimitiveHandle(NodeId(0)))
            .expect_err("nil/handle comparison must fail");
        assert!(matches!(err, ValueError::Unsupported { .. }));
    }

    #[test]
    fn lists_compare_elementwise() {
        let lhs = Value::List(vec![Value::Int64(1), Value::from("x")]);
        let rhs = Value::List(vec![Value::Float64(1.0), Value::from("x")]);
        assert_eq!(values_equal(&lhs, &rhs), Ok(true));

        let shorter = Value::List(vec![Value::Int64(1)]);
        assert_eq!(values_equal(&lhs, &shorter), Ok(false));
    }

    #[test]
    fn dict_insert_replaces_structurally_equal_key() {
        let mut dict = ValueDict::new();
        assert_eq!(dict.insert(Value::Int64(1), Value::from("one")), None);
        let previous = dict.insert(Value::Float64(1.0), Value::from("uno"));
        assert_eq!(previous, Some(Value::from("one")));
        assert_eq!(dict.len(), 1);
        assert_eq!(dict.get(&Value::Int64(1)), Some(&Value::from("uno")));
        assert_eq!(dict.get(&Value::from("1")), None);
    }

    #[test]
    fn scalar_values_become_zero_dim_arrays() {
        let array = Value::Float64(2.5)
            .into_array()
            .expect("float converts to array");
        assert_eq!(array.dtype(), DType::Float64);
        assert_eq!(array.dims(), 0);

        let err = Value::Nil.into_array().expect_err("nil has no array form");
        assert!(matches!(err, ValueError::Nil { .. }));
    }

    #[test]
    fn value_accessors_validate_kind() {
        assert_eq!(Value::Int64(7).as_i64(), Ok(7));
        assert_eq!(Value::Bool(true).as_i64(), Ok(1));
        assert!(Value::Float64(7.5).as_i64().is_err());
        assert_eq!(Value::from("row").as_str(), Ok("row"));
        assert!(Value::Int64(0).as_str().is_err());
        assert_eq!(Value::PrimitiveHandle(NodeId(4)).as_handle(), Ok(NodeId(4)));
    }

    proptest! {
        #[test]
        fn prop_vector_roundtrips_through_value(values in prop::collection::vec(-1_000i64..1_000, 0..32)) {
            let value = Value::from(TypedArray::vector(values.clone()));
            let array = value.into_array().expect("array value");
            prop_assert_eq!(array.shape(), vec![values.len()]);
            prop_assert_eq!(array.into_typed::<i64>().to_vec(), values.clone());

            let seed = det_seed(&[values.len() as u64]);
            let log = build_property_log("prop_vector_roundtrips_through_value", seed, "vector_value_contract_ok");
            assert_log_contract(&log);
        }

        #[test]
        fn prop_alias_observes_writes(len in 1usize..16, index in 0usize..16, value in -100.0f64..100.0) {
            let index = index % len;
            let mut owner = TypedArray::from_elem(&[len], 0.0f64).expect("vector");
            let alias = owner.share();
            owner.with_view_mut(|mut view| view[[index]] = value);
            prop_assert_eq!(alias.get(&[index]), Some(value));

            let seed = det_seed(&[len as u64, index as u64, value.to_bits()]);
            let log = build_property_log("prop_alias_observes_writes", seed, "alias_write_visible_ok");
            assert_log_contract(&log);
        }
    }
}
