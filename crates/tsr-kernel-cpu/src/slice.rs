use ndarray::{ArrayD, Dimension, IxDyn};
use tsr_core::{Element, ShapeError, TypedArray};

use crate::KernelError;

/// One axis of a NumPy-style subscript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceSpec {
    All,
    /// Selects one position and drops the axis; negative counts from the end.
    Index(i64),
    Range {
        start: Option<i64>,
        stop: Option<i64>,
        step: i64,
    },
}

impl SliceSpec {
    #[must_use]
    pub fn range(start: i64, stop: i64) -> Self {
        Self::Range {
            start: Some(start),
            stop: Some(stop),
            step: 1,
        }
    }

    fn resolve(self, axis: usize, extent: usize) -> Result<AxisSelection, KernelError> {
        let len = extent as i64;
        match self {
            Self::All => Ok(AxisSelection::Keep((0..extent).collect())),
            Self::Index(index) => {
                let wrapped = if index < 0 { index + len } else { index };
                if !(0..len).contains(&wrapped) {
                    return Err(ShapeError::IndexOutOfBounds {
                        axis,
                        index,
                        extent,
                    }
                    .into());
                }
                Ok(AxisSelection::Drop(wrapped as usize))
            }
            Self::Range { start, stop, step } => {
                if step == 0 {
                    return Err(KernelError::ZeroSliceStep { axis });
                }
                let wrap = |bound: i64| if bound < 0 { bound + len } else { bound };
                let positions = if step > 0 {
                    let start = start.map_or(0, |bound| wrap(bound).clamp(0, len));
                    let stop = stop.map_or(len, |bound| wrap(bound).clamp(0, len));
                    stepped(start, stop, step)
                } else {
                    let start = start.map_or(len - 1, |bound| wrap(bound).clamp(-1, len - 1));
                    let stop = stop.map_or(-1, |bound| wrap(bound).clamp(-1, len - 1));
                    stepped(start, stop, step)
                };
                Ok(AxisSelection::Keep(positions))
            }
        }
    }
}

fn stepped(start: i64, stop: i64, step: i64) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut current = start;
    while (step > 0 && current < stop) || (step < 0 && current > stop) {
        positions.push(current as usize);
        match current.checked_add(step) {
            Some(next) => current = next,
            None => break,
        }
    }
    positions
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AxisSelection {
    Keep(Vec<usize>),
    Drop(usize),
}

/// Source positions selected by a subscript, one entry per source axis.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Selection {
    axes: Vec<AxisSelection>,
}

impl Selection {
    fn new(shape: &[usize], specs: &[SliceSpec]) -> Result<Self, KernelError> {
        if specs.len() > shape.len() {
            return Err(KernelError::TooManyIndices {
                dims: shape.len(),
                given: specs.len(),
            });
        }
        let axes = shape
            .iter()
            .enumerate()
            .map(|(axis, extent)| {
                specs
                    .get(axis)
                    .copied()
                    .unwrap_or(SliceSpec::All)
                    .resolve(axis, *extent)
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { axes })
    }

    fn shape(&self) -> Vec<usize> {
        self.axes
            .iter()
            .filter_map(|axis| match axis {
                AxisSelection::Keep(positions) => Some(positions.len()),
                AxisSelection::Drop(_) => None,
            })
            .collect()
    }

    fn source_index(&self, index: &[usize]) -> Vec<usize> {
        let mut kept = index.iter();
        self.axes
            .iter()
            .map(|axis| match axis {
                AxisSelection::Keep(positions) => {
                    kept.next().map_or(0, |position| positions[*position])
                }
                AxisSelection::Drop(position) => *position,
            })
            .collect()
    }
}

/// Copies the selected region out of `array`.
pub fn slice_read<T: Element>(
    array: &TypedArray<T>,
    specs: &[SliceSpec],
) -> Result<TypedArray<T>, KernelError> {
    let selection = Selection::new(&array.shape(), specs)?;
    let shape = selection.shape();
    let selected = array.with_view(|view| {
        ArrayD::from_shape_fn(IxDyn(&shape), |index| {
            view[IxDyn(&selection.source_index(index.slice()))]
        })
    });
    Ok(TypedArray::new(selected)?)
}

/// Writes `value` into the selected region of `target`, broadcasting it to
/// the selection shape. When `target` is a reference every alias observes
/// the write.
pub fn slice_assign<T: Element>(
    target: &mut TypedArray<T>,
    specs: &[SliceSpec],
    value: TypedArray<T>,
) -> Result<(), KernelError> {
    let selection = Selection::new(&target.shape(), specs)?;
    let shape = selection.shape();
    let value = if value.shares_storage_with(target) {
        value.copy()
    } else {
        value
    };
    let source = value.with_view(|view| {
        view.broadcast(IxDyn(&shape))
            .map(|broadcast| broadcast.to_owned())
    });
    let source = source.ok_or_else(|| ShapeError::NotBroadcastable {
        name: "slice assignment".to_string(),
        from: value.shape(),
        to: shape.clone(),
    })?;
    target.with_view_mut(|mut view| {
        for (index, element) in source.indexed_iter() {
            view[IxDyn(&selection.source_index(index.slice()))] = *element;
        }
    });
    Ok(())
}
