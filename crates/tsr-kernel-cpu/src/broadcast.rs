use ndarray::IxDyn;
use tsr_core::{ArrayValue, Element, ShapeError, TypedArray};

/// Extracts the element of a 0-d array. Higher ranks never narrow.
pub fn as_scalar<T: Element>(value: &ArrayValue, name: &str) -> Result<T, ShapeError> {
    let typed = value.to_typed::<T>();
    typed
        .scalar_value()
        .ok_or_else(|| ShapeError::NotBroadcastable {
            name: name.to_string(),
            from: value.shape(),
            to: Vec::new(),
        })
}

pub fn as_vector<T: Element>(
    value: ArrayValue,
    size: usize,
    name: &str,
) -> Result<TypedArray<T>, ShapeError> {
    broadcast_into(value, &[size], name)
}

/// Broadcasts into `rows x cols`: scalars and single-element vectors fill,
/// a vector of length `cols` is repeated for every row, and a 2-d operand
/// with one row or one column is stretched across the other axis.
pub fn as_matrix<T: Element>(
    value: ArrayValue,
    rows: usize,
    cols: usize,
    name: &str,
) -> Result<TypedArray<T>, ShapeError> {
    broadcast_into(value, &[rows, cols], name)
}

pub fn as_tensor<T: Element>(
    value: ArrayValue,
    pages: usize,
    rows: usize,
    cols: usize,
    name: &str,
) -> Result<TypedArray<T>, ShapeError> {
    broadcast_into(value, &[pages, rows, cols], name)
}

/// Coerces `value` to `T` and broadcasts it to `target`.
///
/// An operand already of the target shape is returned as is, so a reference
/// of the right dtype stays a reference. Stretching follows right-aligned
/// extents where only a size-1 axis may grow; an operand of higher rank than
/// the target is rejected.
pub fn broadcast_into<T: Element>(
    value: ArrayValue,
    target: &[usize],
    name: &str,
) -> Result<TypedArray<T>, ShapeError> {
    let from = value.shape();
    let typed = value.into_typed::<T>();
    if from == target {
        return Ok(typed);
    }
    let not_broadcastable = || ShapeError::NotBroadcastable {
        name: name.to_string(),
        from: from.clone(),
        to: target.to_vec(),
    };
    if from.len() > target.len() {
        return Err(not_broadcastable());
    }
    let stretched = typed.with_view(|view| {
        view.broadcast(IxDyn(target))
            .map(|broadcast| broadcast.to_owned())
    });
    let stretched = stretched.ok_or_else(not_broadcastable)?;
    TypedArray::new(stretched)
}

/// Shape both operands broadcast to, aligning extents from the right.
pub fn broadcast_shape(lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>, ShapeError> {
    let rank = lhs.len().max(rhs.len());
    let mut shape = vec![0; rank];
    for axis in 0..rank {
        let l = axis
            .checked_sub(rank - lhs.len())
            .map_or(1, |index| lhs[index]);
        let r = axis
            .checked_sub(rank - rhs.len())
            .map_or(1, |index| rhs[index]);
        shape[axis] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => {
                return Err(ShapeError::Mismatch {
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                });
            }
        };
    }
    Ok(shape)
}
