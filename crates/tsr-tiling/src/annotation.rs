use std::fmt;

use crate::{TileInfo, TilingError, TilingScheme, TilingSpan, tile_spans_for};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalityInfo {
    locality_id: usize,
    num_localities: usize,
}

impl LocalityInfo {
    pub fn new(locality_id: usize, num_localities: usize) -> Result<Self, TilingError> {
        if locality_id >= num_localities {
            return Err(TilingError::InvalidLocality {
                locality_id,
                num_localities,
            });
        }
        Ok(Self {
            locality_id,
            num_localities,
        })
    }

    #[must_use]
    pub const fn locality_id(&self) -> usize {
        self.locality_id
    }

    #[must_use]
    pub const fn num_localities(&self) -> usize {
        self.num_localities
    }
}

/// Name under which a distributed array is known, plus how many times it
/// has been re-derived.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnotationInfo {
    base_name: String,
    generation: u64,
}

impl AnnotationInfo {
    #[must_use]
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
            generation: 0,
        }
    }

    #[must_use]
    pub fn with_generation(base_name: impl Into<String>, generation: u64) -> Self {
        Self {
            base_name: base_name.into(),
            generation,
        }
    }

    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Same base name, next generation.
    #[must_use]
    pub fn derive(&self) -> Self {
        Self {
            base_name: self.base_name.clone(),
            generation: self.generation + 1,
        }
    }

    /// Fabric registration name.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}@{}", self.base_name, self.generation)
    }
}

impl fmt::Display for AnnotationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Everything a locality knows about one distributed array: who it is, the
/// array's name and generation, and every locality's tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedArrayHandle {
    locality: LocalityInfo,
    annotation: AnnotationInfo,
    localities_information: Vec<TileInfo>,
}

impl DistributedArrayHandle {
    pub fn new(
        locality: LocalityInfo,
        annotation: AnnotationInfo,
        localities_information: Vec<TileInfo>,
    ) -> Result<Self, TilingError> {
        if localities_information.len() != locality.num_localities() {
            return Err(TilingError::Inconsistent {
                message: format!(
                    "{} tile infos for {} localities",
                    localities_information.len(),
                    locality.num_localities()
                ),
            });
        }
        if let Some(first) = localities_information.first() {
            if let Some(other) = localities_information
                .iter()
                .find(|tile| tile.dims() != first.dims())
            {
                return Err(TilingError::RankMismatch {
                    expected: first.dims(),
                    found: other.dims(),
                });
            }
        }
        Ok(Self {
            locality,
            annotation,
            localities_information,
        })
    }

    /// Tiles computed for every locality from `scheme`.
    pub fn tiled(
        locality: LocalityInfo,
        annotation: AnnotationInfo,
        shape: &[usize],
        scheme: TilingScheme,
    ) -> Result<Self, TilingError> {
        let numtiles = locality.num_localities();
        let tiles = (0..numtiles)
            .map(|tile_idx| tile_spans_for(tile_idx, numtiles, shape, scheme))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(locality, annotation, tiles)
    }

    /// Every locality holds the whole array.
    pub fn replicated(
        locality: LocalityInfo,
        annotation: AnnotationInfo,
        shape: &[usize],
    ) -> Result<Self, TilingError> {
        let tiles = vec![TileInfo::full(shape); locality.num_localities()];
        Self::new(locality, annotation, tiles)
    }

    #[must_use]
    pub fn locality(&self) -> LocalityInfo {
        self.locality
    }

    #[must_use]
    pub fn annotation(&self) -> &AnnotationInfo {
        &self.annotation
    }

    #[must_use]
    pub fn localities_information(&self) -> &[TileInfo] {
        &self.localities_information
    }

    #[must_use]
    pub fn local_tile(&self) -> &TileInfo {
        &self.localities_information[self.locality.locality_id()]
    }

    #[must_use]
    pub fn tile(&self, locality: usize) -> Option<&TileInfo> {
        self.localities_information.get(locality)
    }

    #[must_use]
    pub fn dims(&self) -> usize {
        self.localities_information
            .first()
            .map_or(0, TileInfo::dims)
    }

    /// Same tiles under the next generation of the annotation.
    #[must_use]
    pub fn derive(&self) -> Self {
        Self {
            locality: self.locality,
            annotation: self.annotation.derive(),
            localities_information: self.localities_information.clone(),
        }
    }

    /// Global extent along the axis `from_right` places from the last.
    /// Empty tiles do not contribute.
    #[must_use]
    pub fn extent(&self, from_right: usize) -> Option<usize> {
        let dims = self.dims();
        if from_right >= dims {
            return None;
        }
        let axis = dims - 1 - from_right;
        let spans = self
            .localities_information
            .iter()
            .filter(|tile| !tile.is_empty())
            .map(|tile| tile.spans[axis]);
        let (lo, hi) = spans.fold((usize::MAX, 0), |(lo, hi), span: TilingSpan| {
            (lo.min(span.start), hi.max(span.stop))
        });
        Some(if lo == usize::MAX { 0 } else { hi - lo })
    }

    #[must_use]
    pub fn columns(&self) -> Option<usize> {
        self.extent(0)
    }

    #[must_use]
    pub fn rows(&self) -> Option<usize> {
        self.extent(1)
    }

    #[must_use]
    pub fn pages(&self) -> Option<usize> {
        self.extent(2)
    }

    #[must_use]
    pub fn quats(&self) -> Option<usize> {
        self.extent(3)
    }

    #[must_use]
    pub fn global_shape(&self) -> Vec<usize> {
        (0..self.dims())
            .rev()
            .map(|from_right| self.extent(from_right).unwrap_or(0))
            .collect()
    }
}
