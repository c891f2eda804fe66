#![forbid(unsafe_code)]

mod broadcast;
mod reduce;
mod slice;

use std::fmt;

use ndarray::IxDyn;
use tsr_core::{DType, Element, ShapeError, TypedArray};

pub use broadcast::{as_matrix, as_scalar, as_tensor, as_vector, broadcast_into, broadcast_shape};
pub use reduce::{ReduceOp, UnaryOp, map_in_place, reduce, unary};
pub use slice::{SliceSpec, slice_assign, slice_read};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    Shape(ShapeError),
    DivisionByZero,
    ZeroSliceStep {
        axis: usize,
    },
    TooManyIndices {
        dims: usize,
        given: usize,
    },
    EmptyReduction {
        op: &'static str,
    },
    Unsupported {
        op: &'static str,
        dtype: DType,
    },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shape(error) => write!(f, "{error}"),
            Self::DivisionByZero => write!(f, "integer division by zero"),
            Self::ZeroSliceStep { axis } => write!(f, "slice step cannot be zero (axis {axis})"),
            Self::TooManyIndices { dims, given } => {
                write!(f, "too many indices: array has {dims} dims, {given} given")
            }
            Self::EmptyReduction { op } => write!(f, "{op} of an empty array"),
            Self::Unsupported { op, dtype } => write!(f, "{op} is not supported for {dtype}"),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<ShapeError> for KernelError {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}

/// Result of an elementwise kernel together with the ownership decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Elementwise<T: Element> {
    pub array: TypedArray<T>,
    pub reused: Reuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reuse {
    Lhs,
    Rhs,
    Fresh,
}

/// Combines two operands of the same element type into `shape`.
///
/// The first operand that is exclusively owned and already has the result
/// shape is overwritten and returned; otherwise a new buffer is allocated.
/// `f` always receives its arguments in operand order.
pub fn zip_in_place<T: Element>(
    lhs: TypedArray<T>,
    rhs: TypedArray<T>,
    shape: &[usize],
    f: impl Fn(T, T) -> Result<T, KernelError>,
) -> Result<Elementwise<T>, KernelError> {
    let (mut out, other, reused) = if !lhs.is_reference() && lhs.shape() == shape {
        (lhs, rhs, Reuse::Lhs)
    } else if !rhs.is_reference() && rhs.shape() == shape {
        (rhs, lhs, Reuse::Rhs)
    } else {
        let array = zip_map(&lhs, &rhs, shape, f)?;
        return Ok(Elementwise {
            array,
            reused: Reuse::Fresh,
        });
    };

    if let Some(buffer) = out.owned_mut() {
        other.with_view(|view| -> Result<(), KernelError> {
            let view = view
                .broadcast(IxDyn(shape))
                .ok_or_else(|| ShapeError::Mismatch {
                    lhs: buffer.shape().to_vec(),
                    rhs: view.shape().to_vec(),
                })?;
            for (slot, value) in buffer.iter_mut().zip(view.iter()) {
                *slot = match reused {
                    Reuse::Rhs => f(*value, *slot)?,
                    Reuse::Lhs | Reuse::Fresh => f(*slot, *value)?,
                };
            }
            Ok(())
        })?;
        return Ok(Elementwise { array: out, reused });
    }

    let (lhs, rhs) = match reused {
        Reuse::Rhs => (other, out),
        Reuse::Lhs | Reuse::Fresh => (out, other),
    };
    let array = zip_map(&lhs, &rhs, shape, f)?;
    Ok(Elementwise {
        array,
        reused: Reuse::Fresh,
    })
}

/// Allocating elementwise combination; both operands broadcast to `shape`.
pub fn zip_map<T: Element, R: Element>(
    lhs: &TypedArray<T>,
    rhs: &TypedArray<T>,
    shape: &[usize],
    f: impl Fn(T, T) -> Result<R, KernelError>,
) -> Result<TypedArray<R>, KernelError> {
    let target = IxDyn(shape);
    let mismatch = || ShapeError::Mismatch {
        lhs: lhs.shape(),
        rhs: rhs.shape(),
    };
    // both sides read-lock the same buffer when they alias
    let detached;
    let rhs = if lhs.shares_storage_with(rhs) {
        detached = rhs.copy();
        &detached
    } else {
        rhs
    };
    let values = lhs.with_view(|l| {
        rhs.with_view(|r| {
            let l = l.broadcast(target.clone());
            let r = r.broadcast(target.clone());
            match (l, r) {
                (Some(l), Some(r)) => l
                    .iter()
                    .zip(r.iter())
                    .map(|(a, b)| f(*a, *b))
                    .collect::<Result<Vec<R>, KernelError>>(),
                _ => Err(KernelError::Shape(mismatch())),
            }
        })
    })?;
    Ok(TypedArray::from_shape_vec(shape, values)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;
    use tsr_core::{ShapeError, TypedArray};

    use super::{KernelError, Reuse, zip_in_place, zip_map};

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
        log.insert("suite_id".to_string(), "tsr_kernel_cpu_property".to_string());
        log.insert("test_id".to_string(), test_id.to_string());
        log.insert("seed".to_string(), seed.to_string());
        log.insert(
            "replay_command".to_string(),
            format!("cargo test -p tsr-kernel-cpu {test_id} -- --nocapture"),
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

    fn sub(lhs: f64, rhs: f64) -> Result<f64, KernelError> {
        Ok(lhs - rhs)
    }

    #[test]
    fn owned_lhs_is_reused() {
        let lhs = TypedArray::vector(vec![5.0f64, 6.0]);
        let rhs = TypedArray::scalar(1.0f64);
        let result = zip_in_place(lhs, rhs, &[2], sub).expect("sub");
        assert_eq!(result.reused, Reuse::Lhs);
        assert_eq!(result.array.to_vec(), vec![4.0, 5.0]);
    }

    #[test]
    fn reused_rhs_keeps_operand_order() {
        let lhs = TypedArray::scalar(10.0f64);
        let rhs = TypedArray::vector(vec![1.0f64, 2.0]);
        let result = zip_in_place(lhs, rhs, &[2], sub).expect("sub");
        assert_eq!(result.reused, Reuse::Rhs);
        assert_eq!(result.array.to_vec(), vec![9.0, 8.0]);
    }

    #[test]
    fn references_are_never_overwritten() {
        let lhs = TypedArray::vector(vec![1.0f64, 2.0]).into_shared();
        let rhs = TypedArray::vector(vec![1.0f64, 1.0]).into_shared();
        let observer = lhs.alias().expect("alias");
        let result = zip_in_place(lhs, rhs, &[2], sub).expect("sub");
        assert_eq!(result.reused, Reuse::Fresh);
        assert!(!result.array.is_reference());
        assert_eq!(observer.to_vec(), vec![1.0, 2.0]);
        assert_eq!(result.array.to_vec(), vec![0.0, 1.0]);
    }

    #[test]
    fn aliased_operands_combine() {
        let shared = TypedArray::vector(vec![3i64, 4]).into_shared();
        let result = zip_map(&shared, &shared.clone(), &[2], |a, b| Ok(a * b)).expect("square");
        assert_eq!(result.to_vec(), vec![9, 16]);
    }

    #[test]
    fn unbroadcastable_operands_fail() {
        let lhs = TypedArray::vector(vec![1i64, 2, 3]);
        let rhs = TypedArray::vector(vec![1i64, 2]);
        let err = zip_map::<i64, bool>(&lhs, &rhs, &[3], |a, b| Ok(a == b))
            .expect_err("length mismatch");
        assert!(matches!(err, KernelError::Shape(ShapeError::Mismatch { .. })));
    }

    #[test]
    fn kernel_errors_propagate_from_the_combinator() {
        let lhs = TypedArray::vector(vec![1i64, 2]);
        let rhs = TypedArray::vector(vec![1i64, 0]);
        let err = zip_in_place(lhs, rhs, &[2], |a, b| {
            if b == 0 {
                Err(KernelError::DivisionByZero)
            } else {
                Ok(a / b)
            }
        })
        .expect_err("division by zero");
        assert_eq!(err, KernelError::DivisionByZero);
    }

    proptest! {
        #[test]
        fn prop_reuse_is_unobservable(values in prop::collection::vec(-1_000.0f64..1_000.0, 1..32), shift in -10.0f64..10.0) {
            let len = values.len();
            let owned = zip_in_place(
                TypedArray::vector(values.clone()),
                TypedArray::scalar(shift),
                &[len],
                sub,
            )
            .expect("owned path");
            let shared = zip_in_place(
                TypedArray::vector(values.clone()).into_shared(),
                TypedArray::scalar(shift),
                &[len],
                sub,
            )
            .expect("shared path");
            prop_assert_eq!(owned.reused, Reuse::Lhs);
            prop_assert_eq!(shared.reused, Reuse::Fresh);
            prop_assert_eq!(owned.array.to_vec(), shared.array.to_vec());

            let seed = det_seed(&[len as u64, shift.to_bits()]);
            let log = build_property_log("prop_reuse_is_unobservable", seed, "reuse_unobservable_ok");
            assert_log_contract(&log);
        }
    }
}
