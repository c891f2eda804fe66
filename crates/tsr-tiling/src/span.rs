use std::fmt;

use crate::TilingError;

/// Half-open index range `[start, stop)` along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TilingSpan {
    pub start: usize,
    pub stop: usize,
}

impl TilingSpan {
    #[must_use]
    pub const fn new(start: usize, stop: usize) -> Self {
        Self { start, stop }
    }

    #[must_use]
    pub const fn full(extent: usize) -> Self {
        Self {
            start: 0,
            stop: extent,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.stop.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.stop <= self.start
    }

    #[must_use]
    pub const fn intersects(&self, other: &Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.stop && other.start < self.stop
    }
}

impl fmt::Display for TilingSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// One locality's spans, one per dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TileInfo {
    pub spans: Vec<TilingSpan>,
}

impl TileInfo {
    #[must_use]
    pub fn new(spans: Vec<TilingSpan>) -> Self {
        Self { spans }
    }

    /// Spans covering a whole array of `shape`.
    #[must_use]
    pub fn full(shape: &[usize]) -> Self {
        Self {
            spans: shape.iter().map(|extent| TilingSpan::full(*extent)).collect(),
        }
    }

    #[must_use]
    pub fn dims(&self) -> usize {
        self.spans.len()
    }

    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.spans.iter().map(TilingSpan::len).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.iter().any(TilingSpan::is_empty)
    }

    #[must_use]
    pub fn volume(&self) -> usize {
        self.spans.iter().map(TilingSpan::len).product()
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.spans
            .iter()
            .zip(&other.spans)
            .all(|(lhs, rhs)| lhs.intersects(rhs))
    }
}

impl fmt::Display for TileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let spans: Vec<String> = self.spans.iter().map(ToString::to_string).collect();
        write!(f, "{}", spans.join(" x "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TilingScheme {
    Row,
    Column,
    Sym,
}

impl TilingScheme {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Row => "row",
            Self::Column => "column",
            Self::Sym => "sym",
        }
    }

    pub fn parse(name: &str) -> Result<Self, TilingError> {
        match name {
            "row" => Ok(Self::Row),
            "column" => Ok(Self::Column),
            "sym" => Ok(Self::Sym),
            other => Err(TilingError::UnknownScheme {
                name: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for TilingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Span of tile `tile_idx` when `dim` elements are split into `numtiles`
/// near-equal parts; the first `dim % numtiles` tiles are one longer.
pub fn tile_calculation(
    tile_idx: usize,
    dim: usize,
    numtiles: usize,
) -> Result<TilingSpan, TilingError> {
    if numtiles == 0 {
        return Err(TilingError::ZeroTiles);
    }
    if tile_idx >= numtiles {
        return Err(TilingError::TileIndexOutOfRange {
            index: tile_idx,
            numtiles,
        });
    }
    let size = dim / numtiles;
    let rem = dim % numtiles;
    let start = tile_idx * size + tile_idx.min(rem);
    let len = if tile_idx < rem { size + 1 } else { size };
    Ok(TilingSpan::new(start, start + len))
}

/// Most square `r x c == numtiles` with `r <= c`.
#[must_use]
pub fn sym_factors(numtiles: usize) -> (usize, usize) {
    let mut rows = 1;
    let mut candidate = 1;
    while candidate * candidate <= numtiles {
        if numtiles % candidate == 0 {
            rows = candidate;
        }
        candidate += 1;
    }
    (rows, numtiles / rows.max(1))
}

/// Spans owned by `tile_idx` out of `numtiles` for an array of `shape`.
///
/// Vectors split their only axis under every scheme. For higher ranks the
/// scheme applies to the last two axes and leading axes stay whole.
pub fn tile_spans_for(
    tile_idx: usize,
    numtiles: usize,
    shape: &[usize],
    scheme: TilingScheme,
) -> Result<TileInfo, TilingError> {
    if numtiles == 0 {
        return Err(TilingError::ZeroTiles);
    }
    if tile_idx >= numtiles {
        return Err(TilingError::TileIndexOutOfRange {
            index: tile_idx,
            numtiles,
        });
    }
    match shape {
        [] => Err(TilingError::Unsupported {
            what: "tiling a 0-d array".to_string(),
        }),
        [len] => Ok(TileInfo::new(vec![tile_calculation(
            tile_idx, *len, numtiles,
        )?])),
        [leading @ .., rows, cols] => {
            let (row_span, col_span) = match scheme {
                TilingScheme::Row => (
                    tile_calculation(tile_idx, *rows, numtiles)?,
                    TilingSpan::full(*cols),
                ),
                TilingScheme::Column => (
                    TilingSpan::full(*rows),
                    tile_calculation(tile_idx, *cols, numtiles)?,
                ),
                TilingScheme::Sym => {
                    let (grid_rows, grid_cols) = sym_factors(numtiles);
                    (
                        tile_calculation(tile_idx / grid_cols, *rows, grid_rows)?,
                        tile_calculation(tile_idx % grid_cols, *cols, grid_cols)?,
                    )
                }
            };
            let mut spans: Vec<TilingSpan> =
                leading.iter().map(|extent| TilingSpan::full(*extent)).collect();
            spans.push(row_span);
            spans.push(col_span);
            Ok(TileInfo::new(spans))
        }
    }
}

/// Spans along one axis laid end to end from per-tile extents.
#[must_use]
pub fn prefix_spans(extents: &[usize]) -> Vec<TilingSpan> {
    let mut start = 0;
    extents
        .iter()
        .map(|extent| {
            let span = TilingSpan::new(start, start + extent);
            start += extent;
            span
        })
        .collect()
}

/// Checks that `tiles` cover an array of `shape` exactly once.
pub fn check_partition(tiles: &[TileInfo], shape: &[usize]) -> Result<(), TilingError> {
    for (index, tile) in tiles.iter().enumerate() {
        if tile.dims() != shape.len() {
            return Err(TilingError::RankMismatch {
                expected: shape.len(),
                found: tile.dims(),
            });
        }
        if let Some((span, extent)) = tile
            .spans
            .iter()
            .zip(shape)
            .find(|(span, extent)| !span.is_empty() && span.stop > **extent)
        {
            return Err(TilingError::Inconsistent {
                message: format!("tile {index} span {span} exceeds extent {extent}"),
            });
        }
    }
    for (index, tile) in tiles.iter().enumerate() {
        if let Some(other) = tiles[index + 1..]
            .iter()
            .position(|other| tile.overlaps(other))
        {
            return Err(TilingError::Inconsistent {
                message: format!("tiles {index} and {} overlap", index + 1 + other),
            });
        }
    }
    let covered: usize = tiles.iter().map(TileInfo::volume).sum();
    let expected: usize = shape.iter().product();
    if covered != expected {
        return Err(TilingError::Inconsistent {
            message: format!("tiles cover {covered} of {expected} elements"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{
        TileInfo, TilingScheme, TilingSpan, check_partition, prefix_spans, sym_factors,
        tile_calculation, tile_spans_for,
    };
    use crate::TilingError;

    #[test]
    fn ten_over_four_gives_three_three_two_two() {
        let spans: Vec<TilingSpan> = (0..4)
            .map(|i| tile_calculation(i, 10, 4).expect("span"))
            .collect();
        assert_eq!(
            spans,
            vec![
                TilingSpan::new(0, 3),
                TilingSpan::new(3, 6),
                TilingSpan::new(6, 8),
                TilingSpan::new(8, 10),
            ]
        );
    }

    #[test]
    fn more_tiles_than_elements_leaves_empty_tiles() {
        let span = tile_calculation(4, 3, 5).expect("span");
        assert!(span.is_empty());
        assert_eq!(span.start, 3);
    }

    #[test]
    fn invalid_tile_requests_fail() {
        assert_eq!(tile_calculation(0, 5, 0), Err(TilingError::ZeroTiles));
        assert!(matches!(
            tile_calculation(4, 5, 4),
            Err(TilingError::TileIndexOutOfRange { index: 4, numtiles: 4 })
        ));
    }

    #[test]
    fn sym_picks_most_square_grid() {
        assert_eq!(sym_factors(1), (1, 1));
        assert_eq!(sym_factors(4), (2, 2));
        assert_eq!(sym_factors(6), (2, 3));
        assert_eq!(sym_factors(7), (1, 7));
        assert_eq!(sym_factors(12), (3, 4));
    }

    #[test]
    fn matrix_schemes_split_the_expected_axis() {
        let row = tile_spans_for(1, 2, &[4, 6], TilingScheme::Row).expect("row");
        assert_eq!(row.spans, vec![TilingSpan::new(2, 4), TilingSpan::new(0, 6)]);

        let column = tile_spans_for(1, 2, &[4, 6], TilingScheme::Column).expect("column");
        assert_eq!(column.spans, vec![TilingSpan::new(0, 4), TilingSpan::new(3, 6)]);

        let sym = tile_spans_for(3, 4, &[4, 6], TilingScheme::Sym).expect("sym");
        assert_eq!(sym.spans, vec![TilingSpan::new(2, 4), TilingSpan::new(3, 6)]);
    }

    #[test]
    fn vectors_split_their_only_axis_and_pages_stay_whole() {
        let vector = tile_spans_for(1, 3, &[10], TilingScheme::Column).expect("vector");
        assert_eq!(vector.spans, vec![TilingSpan::new(4, 7)]);

        let tensor = tile_spans_for(0, 2, &[3, 4, 5], TilingScheme::Row).expect("tensor");
        assert_eq!(tensor.shape(), vec![3, 2, 5]);

        assert!(matches!(
            tile_spans_for(0, 1, &[], TilingScheme::Row),
            Err(TilingError::Unsupported { .. })
        ));
    }

    #[test]
    fn partition_check_detects_overlap_and_gaps() {
        let shape = [10];
        let good: Vec<TileInfo> = prefix_spans(&[3, 3, 4])
            .into_iter()
            .map(|span| TileInfo::new(vec![span]))
            .collect();
        assert!(check_partition(&good, &shape).is_ok());

        let overlap = vec![
            TileInfo::new(vec![TilingSpan::new(0, 6)]),
            TileInfo::new(vec![TilingSpan::new(5, 10)]),
        ];
        assert!(matches!(
            check_partition(&overlap, &shape),
            Err(TilingError::Inconsistent { .. })
        ));

        let gap = vec![TileInfo::new(vec![TilingSpan::new(0, 4)])];
        assert!(check_partition(&gap, &shape).is_err());
    }

    proptest! {
        #[test]
        fn prop_tile_calculation_partitions(dim in 0usize..500, numtiles in 1usize..17) {
            let spans: Vec<TilingSpan> = (0..numtiles)
                .map(|i| tile_calculation(i, dim, numtiles).expect("span"))
                .collect();
            prop_assert_eq!(spans[0].start, 0);
            prop_assert_eq!(spans[numtiles - 1].stop, dim);
            for pair in spans.windows(2) {
                prop_assert_eq!(pair[0].stop, pair[1].start);
                prop_assert!(pair[0].len() >= pair[1].len());
                prop_assert!(pair[0].len() - pair[1].len() <= 1);
            }
        }

        #[test]
        fn prop_every_scheme_partitions_matrices(
            rows in 1usize..40,
            cols in 1usize..40,
            numtiles in 1usize..10,
            scheme_idx in 0usize..3,
        ) {
            let scheme = [TilingScheme::Row, TilingScheme::Column, TilingScheme::Sym][scheme_idx];
            let shape = [rows, cols];
            let tiles: Vec<TileInfo> = (0..numtiles)
                .map(|i| tile_spans_for(i, numtiles, &shape, scheme).expect("tile"))
                .collect();
            prop_assert!(check_partition(&tiles, &shape).is_ok());
        }
    }
}
