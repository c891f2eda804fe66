use ndarray::{ArrayD, IxDyn};
use ndarray_rand::RandomExt;
use ndarray_rand::rand_distr::Normal;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tsr_core::{ArrayValue, TypedArray};
use tsr_primitive::DistributedContext;
use tsr_runtime::{EvidenceKind, RuntimeContext};
use tsr_tiling::{DistributedArrayHandle, RegisteredArray, TilingScheme, tile_spans_for};

use crate::DistributedError;

/// Parameters of one `dist_random` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomRequest {
    pub dims: Vec<usize>,
    pub tile_index: usize,
    pub numtiles: usize,
    pub name: Option<String>,
    pub scheme: TilingScheme,
    pub mean: f64,
    pub std: f64,
}

impl RandomRequest {
    /// Standard normal tile under row tiling.
    #[must_use]
    pub fn new(dims: Vec<usize>, tile_index: usize, numtiles: usize) -> Self {
        Self {
            dims,
            tile_index,
            numtiles,
            name: None,
            scheme: TilingScheme::Row,
            mean: 0.0,
            std: 1.0,
        }
    }
}

/// Generates tile `tile_index` of a normally distributed array and
/// registers it. With a configured `random_seed` the values depend only on
/// the seed, the array name and the tile index.
pub fn dist_random(
    dist: &DistributedContext,
    runtime: &RuntimeContext,
    request: &RandomRequest,
) -> Result<RegisteredArray, DistributedError> {
    let locality = dist.locality()?;
    if (request.tile_index, request.numtiles)
        != (locality.locality_id(), locality.num_localities())
    {
        return Err(DistributedError::InvalidArgument {
            message: format!(
                "tile {}/{} requested on locality {}/{}",
                request.tile_index,
                request.numtiles,
                locality.locality_id(),
                locality.num_localities()
            ),
        });
    }
    let tile = tile_spans_for(
        request.tile_index,
        request.numtiles,
        &request.dims,
        request.scheme,
    )?;
    let normal = Normal::new(request.mean, request.std).map_err(|error| {
        DistributedError::InvalidArgument {
            message: format!(
                "invalid normal distribution (mean {}, std {}): {error}",
                request.mean, request.std
            ),
        }
    })?;
    let name = match &request.name {
        Some(name) => name.clone(),
        None => runtime.names().next("random_array"),
    };

    let mut rng = match runtime.config().random_seed {
        Some(seed) => StdRng::seed_from_u64(tile_seed(seed, &name, request.tile_index)),
        None => StdRng::from_entropy(),
    };
    let values = ArrayD::random_using(IxDyn(&tile.shape()), normal, &mut rng);
    let array = ArrayValue::from(TypedArray::new(values)?);

    let annotation = dist.arrays().next_annotation(&name);
    let handle =
        DistributedArrayHandle::tiled(locality, annotation, &request.dims, request.scheme)?;
    let registered = dist.arrays().register(dist.fabric(), handle, array)?;
    tracing::debug!(
        name = %registered.handle.annotation(),
        tile = %tile,
        "generated random tile"
    );
    runtime.record(
        EvidenceKind::Distributed,
        format!(
            "dist_random name={} tile={}/{} span={tile} scheme={}",
            registered.handle.annotation(),
            request.tile_index,
            request.numtiles,
            request.scheme
        ),
    );
    Ok(registered)
}

fn tile_seed(seed: u64, name: &str, tile_index: usize) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let bytes = seed
        .to_le_bytes()
        .into_iter()
        .chain(name.bytes())
        .chain((tile_index as u64).to_le_bytes());
    for byte in bytes {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use tsr_primitive::{Classify, ErrorKind};
    use tsr_tiling::{AnnotationState, TilingScheme, TilingSpan};

    use super::{RandomRequest, dist_random};
    use crate::testing::world;

    #[test]
    fn tiles_take_the_computed_span_and_a_generated_name() {
        let localities = world(4, Some(7));
        let loc = &localities[1];
        let request = RandomRequest {
            scheme: TilingScheme::Column,
            ..RandomRequest::new(vec![3, 10], 1, 4)
        };
        let registered = dist_random(&loc.dist, &loc.runtime, &request).expect("random");
        assert_eq!(registered.tile.shape(), vec![3, 3]);
        assert_eq!(
            registered.handle.local_tile().spans,
            vec![TilingSpan::new(0, 3), TilingSpan::new(3, 6)]
        );
        assert_eq!(registered.handle.annotation().name(), "random_array_0@0");
        assert_eq!(
            loc.dist.arrays().state("random_array_0"),
            AnnotationState::Registered
        );

        let next = dist_random(&loc.dist, &loc.runtime, &request).expect("second");
        assert_eq!(next.handle.annotation().base_name(), "random_array_1");
    }

    #[test]
    fn seeded_generation_is_reproducible_per_name_and_tile() {
        let first = world(2, Some(42));
        let second = world(2, Some(42));
        let request = RandomRequest {
            name: Some("weights".to_string()),
            ..RandomRequest::new(vec![8], 0, 2)
        };
        let a = dist_random(&first[0].dist, &first[0].runtime, &request).expect("a");
        let b = dist_random(&second[0].dist, &second[0].runtime, &request).expect("b");
        assert_eq!(a.tile.to_f64_vec(), b.tile.to_f64_vec());

        let other_tile = RandomRequest {
            tile_index: 1,
            ..request.clone()
        };
        let c = dist_random(&first[1].dist, &first[1].runtime, &other_tile).expect("c");
        assert_ne!(a.tile.to_f64_vec(), c.tile.to_f64_vec());
    }

    #[test]
    fn mean_and_std_shift_the_sample() {
        let localities = world(1, Some(3));
        let request = RandomRequest {
            mean: 100.0,
            std: 0.5,
            ..RandomRequest::new(vec![256], 0, 1)
        };
        let registered =
            dist_random(&localities[0].dist, &localities[0].runtime, &request).expect("random");
        let values = registered.tile.to_f64_vec();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        assert!((mean - 100.0).abs() < 0.25, "sample mean {mean}");
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let localities = world(1, None);
        let loc = &localities[0];

        let negative_std = RandomRequest {
            std: -1.0,
            ..RandomRequest::new(vec![4], 0, 1)
        };
        let err = dist_random(&loc.dist, &loc.runtime, &negative_std).expect_err("std");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let bad_tile = RandomRequest::new(vec![4], 2, 2);
        let err = dist_random(&loc.dist, &loc.runtime, &bad_tile).expect_err("tile index");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn tiles_are_generated_only_by_their_own_locality() {
        let localities = world(2, Some(5));
        let loc = &localities[1];
        let foreign = RandomRequest::new(vec![6], 0, 2);
        let err = dist_random(&loc.dist, &loc.runtime, &foreign).expect_err("tile 0 on 1");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("tile 0/2 requested on locality 1/2"));

        let wrong_world = RandomRequest::new(vec![6], 1, 3);
        let err = dist_random(&loc.dist, &loc.runtime, &wrong_world).expect_err("3 tiles");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(loc.dist.arrays().state("random_array_0"), AnnotationState::Unregistered);
    }
}
