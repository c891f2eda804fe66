use tsr_core::{ArrayValue, DType, Element, TypedArray, Value};
use tsr_kernel_cpu::{KernelError, SliceSpec, slice_assign};
use tsr_primitive::DistributedContext;
use tsr_runtime::{EvidenceKind, RuntimeContext};
use tsr_tiling::{
    AnnotationInfo, DistributedArrayHandle, LocalityInfo, RegisteredArray, TileInfo,
    TilingError, TilingScheme, TilingSpan, check_partition, prefix_spans, sym_factors,
};

use crate::DistributedError;

#[derive(Debug, Clone, PartialEq)]
pub struct GatherReport {
    pub value: ArrayValue,
    /// Annotation the assembled array was registered under.
    pub annotation: AnnotationInfo,
    /// Where each locality's tile was placed.
    pub spans: Vec<TileInfo>,
    /// Collective round, `None` when no exchange was needed.
    pub round: Option<u64>,
}

/// Collects every locality's tile and assembles the full array on all of
/// them.
///
/// Tile placement comes from the recorded annotation when `name` refers to a
/// registered tiled array; otherwise tiles are placed by their shapes. A
/// failure on any locality fails the call everywhere.
pub async fn all_gather(
    dist: &DistributedContext,
    runtime: &RuntimeContext,
    tile: ArrayValue,
    scheme: TilingScheme,
    name: Option<&str>,
) -> Result<GatherReport, DistributedError> {
    let locality = dist.locality()?;
    let registered = name.and_then(|name| dist.arrays().get(name));

    if let Some(entry) = registered.as_ref().filter(|entry| is_replicated(&entry.handle)) {
        // Already whole on every locality.
        if tile.shape() == entry.handle.global_shape() {
            return Ok(GatherReport {
                value: tile,
                annotation: entry.handle.annotation().clone(),
                spans: entry.handle.localities_information().to_vec(),
                round: None,
            });
        }
    }
    // A replicated entry records no tile layout; its tiles are placed by shape.
    let registered = registered.filter(|entry| !is_replicated(&entry.handle));

    let tag = format!("all_gather/{}", name.unwrap_or("anonymous"));
    let round = dist.next_round(&tag);
    let local = check_local_tile(&tile, registered.as_ref(), locality).map(|()| Value::Array(tile));
    if let Err(message) = &local {
        tracing::warn!(%tag, round, %message, "rejecting local tile");
    }
    let gathered = dist
        .fabric()
        .collective_exchange(&tag, round, local, locality.num_localities())
        .await?;
    tracing::debug!(%tag, round, tiles = gathered.len(), "tiles exchanged");

    let tiles = gathered
        .into_iter()
        .map(Value::into_array)
        .collect::<Result<Vec<_>, _>>()?;
    let (spans, global_shape) = match &registered {
        Some(entry) => (
            entry.handle.localities_information().to_vec(),
            entry.handle.global_shape(),
        ),
        None => infer_spans(&tiles, scheme)?,
    };
    for (index, (tile, info)) in tiles.iter().zip(&spans).enumerate() {
        if tile.shape() != info.shape() {
            return Err(TilingError::Inconsistent {
                message: format!(
                    "tile of locality {index} has shape {:?}, span {info} requires {:?}",
                    tile.shape(),
                    info.shape()
                ),
            }
            .into());
        }
    }
    check_partition(&spans, &global_shape)?;

    let dtype = tiles
        .iter()
        .map(ArrayValue::dtype)
        .fold(DType::Bool, DType::promote);
    let value = match dtype {
        DType::Bool => ArrayValue::from(assemble::<bool>(&tiles, &spans, &global_shape)?),
        DType::Int64 => ArrayValue::from(assemble::<i64>(&tiles, &spans, &global_shape)?),
        DType::Float64 => ArrayValue::from(assemble::<f64>(&tiles, &spans, &global_shape)?),
    };

    let base = match name {
        Some(name) => name.to_string(),
        None => runtime.names().next("all_gathered"),
    };
    let annotation = derived_annotation(dist, &base);
    let handle = DistributedArrayHandle::replicated(locality, annotation.clone(), &global_shape)?;
    dist.arrays().register(dist.fabric(), handle, value.copy())?;

    let source = if registered.is_some() {
        "annotation"
    } else {
        "prefix"
    };
    runtime.record(
        EvidenceKind::Distributed,
        format!(
            "all_gather name={annotation} round={round} shape={global_shape:?} spans={source}"
        ),
    );
    Ok(GatherReport {
        value,
        annotation,
        spans,
        round: Some(round),
    })
}

/// Next generation of `base`, never the initial one: gathered arrays are
/// always derived.
fn derived_annotation(dist: &DistributedContext, base: &str) -> AnnotationInfo {
    let next = dist.arrays().next_annotation(base);
    if next.generation() == 0 {
        next.derive()
    } else {
        next
    }
}

fn is_replicated(handle: &DistributedArrayHandle) -> bool {
    let full = TileInfo::full(&handle.global_shape());
    handle
        .localities_information()
        .iter()
        .all(|tile| *tile == full)
}

fn check_local_tile(
    tile: &ArrayValue,
    registered: Option<&RegisteredArray>,
    locality: LocalityInfo,
) -> Result<(), String> {
    if !matches!(tile.dims(), 1 | 2) {
        return Err(format!(
            "all_gather supports vectors and matrices, got a {}-d tile",
            tile.dims()
        ));
    }
    if let Some(entry) = registered {
        let expected = entry
            .handle
            .tile(locality.locality_id())
            .map(TileInfo::shape)
            .unwrap_or_default();
        if tile.shape() != expected {
            return Err(format!(
                "local tile has shape {:?}, '{}' expects {expected:?}",
                tile.shape(),
                entry.handle.annotation()
            ));
        }
    }
    Ok(())
}

/// Lays tiles end to end. Vectors use their only axis. `sym` matrices sit on
/// the `sym_factors` grid; other matrices stack along rows when every
/// non-empty tile has the same column count (unless `scheme` asks for columns
/// and the row counts agree too), otherwise along columns.
fn infer_spans(
    tiles: &[ArrayValue],
    scheme: TilingScheme,
) -> Result<(Vec<TileInfo>, Vec<usize>), TilingError> {
    let dims = tiles.first().map_or(0, ArrayValue::dims);
    if let Some(tile) = tiles.iter().find(|tile| tile.dims() != dims) {
        return Err(TilingError::RankMismatch {
            expected: dims,
            found: tile.dims(),
        });
    }
    let shapes: Vec<Vec<usize>> = tiles.iter().map(ArrayValue::shape).collect();

    if dims == 1 {
        let extents: Vec<usize> = shapes.iter().map(|shape| shape[0]).collect();
        let total = extents.iter().sum();
        let infos = prefix_spans(&extents)
            .into_iter()
            .map(|span| TileInfo::new(vec![span]))
            .collect();
        return Ok((infos, vec![total]));
    }
    if dims != 2 {
        return Err(TilingError::Unsupported {
            what: format!("gathering {dims}-d tiles"),
        });
    }

    if scheme == TilingScheme::Sym {
        return sym_grid_spans(&shapes);
    }

    let non_empty: Vec<&Vec<usize>> = shapes
        .iter()
        .filter(|shape| shape.iter().product::<usize>() > 0)
        .collect();
    let agree = |axis: usize| non_empty.windows(2).all(|pair| pair[0][axis] == pair[1][axis]);
    let axis = match (agree(0), agree(1)) {
        (true, true) if scheme == TilingScheme::Column => 1,
        (_, true) => 0,
        (true, false) => 1,
        (false, false) => {
            return Err(TilingError::Inconsistent {
                message: "tiles agree on neither rows nor columns".to_string(),
            });
        }
    };
    let other = 1 - axis;
    let other_extent = non_empty
        .first()
        .map(|shape| shape[other])
        .or_else(|| shapes.first().map(|shape| shape[other]))
        .unwrap_or(0);
    let extents: Vec<usize> = shapes.iter().map(|shape| shape[axis]).collect();
    let total: usize = extents.iter().sum();

    let infos = prefix_spans(&extents)
        .into_iter()
        .zip(&shapes)
        .map(|(span, shape)| {
            let orthogonal = if shape.iter().product::<usize>() == 0 {
                TilingSpan::new(0, shape[other])
            } else {
                TilingSpan::full(other_extent)
            };
            let mut spans = [orthogonal, orthogonal];
            spans[axis] = span;
            TileInfo::new(spans.to_vec())
        })
        .collect();
    let mut global = [other_extent, other_extent];
    global[axis] = total;
    Ok((infos, global.to_vec()))
}

/// Places tile `i` at grid cell `(i / c, i % c)` of the `r x c` sym grid.
/// Tiles sharing a grid row must agree on their row count, tiles sharing a
/// grid column on their column count.
fn sym_grid_spans(shapes: &[Vec<usize>]) -> Result<(Vec<TileInfo>, Vec<usize>), TilingError> {
    let (grid_rows, grid_cols) = sym_factors(shapes.len());
    let heights = (0..grid_rows)
        .map(|row| grid_extent(shapes, 0, (0..grid_cols).map(|col| row * grid_cols + col)))
        .collect::<Result<Vec<_>, _>>()?;
    let widths = (0..grid_cols)
        .map(|col| grid_extent(shapes, 1, (0..grid_rows).map(|row| row * grid_cols + col)))
        .collect::<Result<Vec<_>, _>>()?;

    let row_spans = prefix_spans(&heights);
    let col_spans = prefix_spans(&widths);
    let infos = (0..shapes.len())
        .map(|index| {
            TileInfo::new(vec![
                row_spans[index / grid_cols],
                col_spans[index % grid_cols],
            ])
        })
        .collect();
    Ok((infos, vec![heights.iter().sum(), widths.iter().sum()]))
}

fn grid_extent(
    shapes: &[Vec<usize>],
    axis: usize,
    cells: impl Iterator<Item = usize>,
) -> Result<usize, TilingError> {
    let mut extents = cells.map(|index| shapes[index][axis]);
    let first = extents.next().unwrap_or(0);
    match extents.find(|extent| *extent != first) {
        None => Ok(first),
        Some(other) => Err(TilingError::Inconsistent {
            message: format!(
                "sym tiles sharing a grid {} disagree on extent ({first} vs {other})",
                if axis == 0 { "row" } else { "column" }
            ),
        }),
    }
}

fn assemble<T: Element>(
    tiles: &[ArrayValue],
    spans: &[TileInfo],
    shape: &[usize],
) -> Result<TypedArray<T>, KernelError> {
    let mut out = TypedArray::from_elem(shape, T::default())?;
    for (tile, info) in tiles.iter().zip(spans) {
        if info.volume() == 0 {
            continue;
        }
        let specs: Vec<SliceSpec> = info
            .spans
            .iter()
            .map(|span| SliceSpec::range(span.start as i64, span.stop as i64))
            .collect();
        slice_assign(&mut out, &specs, tile.to_typed::<T>())?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use tsr_core::{ArrayValue, DType, TypedArray};
    use tsr_primitive::{Classify, ErrorKind};
    use tsr_tiling::{AnnotationState, TilingScheme, TilingSpan};

    use super::all_gather;
    use crate::testing::world;

    fn matrix(rows: usize, cols: usize, values: Vec<i64>) -> ArrayValue {
        ArrayValue::from(TypedArray::from_shape_vec(&[rows, cols], values).expect("matrix"))
    }

    #[tokio::test]
    async fn three_uneven_vector_tiles_reassemble_everywhere() {
        let localities = world(3, None);
        let tiles = [vec![0.0, 1.0, 2.0], vec![3.0, 4.0, 5.0], vec![6.0, 7.0, 8.0, 9.0]];
        let gathers = localities.iter().zip(tiles).map(|(loc, tile)| {
            let tile = ArrayValue::from(TypedArray::vector(tile));
            all_gather(&loc.dist, &loc.runtime, tile, TilingScheme::Row, None)
        });
        let expected: Vec<f64> = (0..10u8).map(f64::from).collect();
        for report in join_all(gathers).await {
            let report = report.expect("gather");
            assert_eq!(report.value.to_f64_vec(), expected);
            assert_eq!(report.spans[2].spans, vec![TilingSpan::new(6, 10)]);
            assert_eq!(report.annotation.generation(), 1);
        }
        assert_eq!(
            localities[0].dist.arrays().state("all_gathered_0"),
            AnnotationState::Derived
        );
    }

    #[tokio::test]
    async fn matrices_stack_by_rows_or_columns() {
        let localities = world(2, None);
        let row_tiles = [matrix(2, 2, vec![1, 2, 3, 4]), matrix(1, 2, vec![5, 6])];
        let gathers = localities.iter().zip(row_tiles).map(|(loc, tile)| {
            all_gather(&loc.dist, &loc.runtime, tile, TilingScheme::Row, Some("rows"))
        });
        for report in join_all(gathers).await {
            let value = report.expect("row gather").value;
            assert_eq!(value.shape(), vec![3, 2]);
            assert_eq!(value.to_f64_vec(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        }

        let column_tiles = [matrix(2, 1, vec![1, 2]), matrix(2, 2, vec![3, 4, 5, 6])];
        let gathers = localities.iter().zip(column_tiles).map(|(loc, tile)| {
            all_gather(&loc.dist, &loc.runtime, tile, TilingScheme::Column, None)
        });
        for report in join_all(gathers).await {
            let value = report.expect("column gather").value;
            assert_eq!(value.shape(), vec![2, 3]);
            assert_eq!(value.to_f64_vec(), vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
        }
    }

    #[tokio::test]
    async fn mixed_dtypes_promote() {
        let localities = world(2, None);
        let tiles = [
            ArrayValue::from(TypedArray::vector(vec![1i64])),
            ArrayValue::from(TypedArray::vector(vec![2.5f64])),
        ];
        let gathers = localities.iter().zip(tiles).map(|(loc, tile)| {
            all_gather(&loc.dist, &loc.runtime, tile, TilingScheme::Row, None)
        });
        for report in join_all(gathers).await {
            let value = report.expect("gather").value;
            assert_eq!(value.dtype(), DType::Float64);
            assert_eq!(value.to_f64_vec(), vec![1.0, 2.5]);
        }
    }

    #[tokio::test]
    async fn one_bad_tile_fails_every_participant() {
        let localities = world(2, None);
        let tiles = [
            ArrayValue::from(TypedArray::vector(vec![1.0f64])),
            ArrayValue::from(TypedArray::from_elem(&[1, 1, 1], 2.0f64).expect("cube")),
        ];
        let gathers = localities.iter().zip(tiles).map(|(loc, tile)| {
            all_gather(&loc.dist, &loc.runtime, tile, TilingScheme::Row, None)
        });
        for report in join_all(gathers).await {
            let err = report.expect_err("aborted");
            assert_eq!(err.kind(), ErrorKind::DistributedConsistency);
            assert!(err.to_string().contains("3-d tile"));
        }
    }

    #[tokio::test]
    async fn repeated_gathers_use_fresh_rounds() {
        let localities = world(2, None);
        for expected_round in 0..3u64 {
            let gathers = localities.iter().map(|loc| {
                let id = loc.dist.fabric().locality_id() as i64;
                let tile = ArrayValue::from(TypedArray::vector(vec![id]));
                all_gather(&loc.dist, &loc.runtime, tile, TilingScheme::Row, None)
            });
            for report in join_all(gathers).await {
                assert_eq!(report.expect("gather").round, Some(expected_round));
            }
        }
    }

    #[tokio::test]
    async fn named_gather_in_a_loop_assembles_every_iteration() {
        let localities = world(2, None);
        let tiles = [vec![1i64, 2], vec![3]];
        for (iteration, expected_round) in [(1u64, 0u64), (2, 1)] {
            let gathers = localities.iter().zip(&tiles).map(|(loc, tile)| {
                let tile = ArrayValue::from(TypedArray::vector(tile.clone()));
                all_gather(&loc.dist, &loc.runtime, tile, TilingScheme::Row, Some("v"))
            });
            for report in join_all(gathers).await {
                let report = report.expect("gather");
                assert_eq!(report.value.to_f64_vec(), vec![1.0, 2.0, 3.0]);
                assert_eq!(report.round, Some(expected_round));
                assert_eq!(report.annotation.generation(), iteration);
            }
        }

        let whole = localities.iter().map(|loc| {
            let tile = ArrayValue::from(TypedArray::vector(vec![1i64, 2, 3]));
            all_gather(&loc.dist, &loc.runtime, tile, TilingScheme::Row, Some("v"))
        });
        for report in join_all(whole).await {
            let report = report.expect("already whole");
            assert_eq!(report.round, None);
            assert_eq!(report.annotation.name(), "v@2");
        }
    }

    #[tokio::test]
    async fn unnamed_gather_after_a_name_reset_moves_to_a_new_generation() {
        let localities = world(2, None);
        for pass in 0..2 {
            let gathers = localities.iter().map(|loc| {
                let id = loc.dist.fabric().locality_id() as i64;
                let tile = ArrayValue::from(TypedArray::vector(vec![id, id]));
                all_gather(&loc.dist, &loc.runtime, tile, TilingScheme::Row, None)
            });
            for report in join_all(gathers).await {
                let report = report.expect("gather");
                assert_eq!(report.value.to_f64_vec(), vec![0.0, 0.0, 1.0, 1.0]);
                assert_eq!(report.annotation.name(), format!("all_gathered_0@{}", pass + 1));
            }
            for loc in &localities {
                loc.runtime.names().reset();
            }
        }
    }

    #[tokio::test]
    async fn unannotated_sym_tiles_land_on_the_grid() {
        let localities = world(4, None);
        let blocks = [
            vec![0, 1, 4, 5],
            vec![2, 3, 6, 7],
            vec![8, 9, 12, 13],
            vec![10, 11, 14, 15],
        ];
        let gathers = localities.iter().zip(blocks).map(|(loc, block)| {
            all_gather(&loc.dist, &loc.runtime, matrix(2, 2, block), TilingScheme::Sym, None)
        });
        let expected: Vec<f64> = (0..16u8).map(f64::from).collect();
        for report in join_all(gathers).await {
            let report = report.expect("sym gather");
            assert_eq!(report.value.shape(), vec![4, 4]);
            assert_eq!(report.value.to_f64_vec(), expected);
            assert_eq!(
                report.spans[2].spans,
                vec![TilingSpan::new(2, 4), TilingSpan::new(0, 2)]
            );
        }

        let ragged = [
            matrix(2, 2, vec![0; 4]),
            matrix(1, 2, vec![0; 2]),
            matrix(2, 2, vec![0; 4]),
            matrix(2, 2, vec![0; 4]),
        ];
        let gathers = localities.iter().zip(ragged).map(|(loc, tile)| {
            all_gather(&loc.dist, &loc.runtime, tile, TilingScheme::Sym, None)
        });
        for report in join_all(gathers).await {
            let err = report.expect_err("grid row heights differ");
            assert_eq!(err.kind(), ErrorKind::DistributedConsistency);
        }
    }
}
