// THEORY:
// The feature aggregator is the engine of the spatial grouping layer. It takes the
// fully decoded pixel grid from the metric decoder and merges spatially adjacent
// pixels that decoded to the same target into `ConnectedFeature`s ("spots").
//
// Key architectural principles & algorithm steps:
// 1.  **Per-Target Components**: Components are labeled so that only pixels with the
//     same target can join. Two touching pixels decoded to different targets always
//     end up in different features.
// 2.  **Global, Deterministic Ids**: All targets share one id space. Ids are handed out
//     in raster order of each feature's first pixel, so the same input always yields
//     the same label volume.
// 3.  **Data Aggregation**: Each feature gets its area, unweighted centroid, mean raw
//     intensity vector (when the intensities are supplied) and mean decode distance.
// 4.  **Area Filtering**: Features outside `[min_area, max_area]` are dropped from the
//     feature list and marked in the filtered mask. In masking mode their pixels are
//     also removed from the label volume.
// 5.  **Hard Barrier**: Aggregation needs the complete decoded grid. There is no
//     streaming mode; a component cannot be known until all its neighbours are.

use crate::core_modules::connected_feature::{AreaFilter, ConnectedFeature};
use crate::core_modules::labeling::Connectivity;
use crate::core_modules::pixel_vectorizer::Location;
use crate::core_modules::tensor::{Axis, LabeledTensor};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Validated aggregation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateParams {
    pub area: AreaFilter,
    pub connectivity: Connectivity,
    /// Remove area-filtered features from the label volume as well.
    pub mask_filtered_features: bool,
}

impl Default for AggregateParams {
    fn default() -> Self {
        Self {
            area: AreaFilter::default(),
            connectivity: Connectivity::default(),
            mask_filtered_features: true,
        }
    }
}

/// Serializable aggregation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub min_area: i64,
    /// `None` (or absent) means no upper limit.
    pub max_area: Option<i64>,
    /// Neighbour count: 4 or 8 (in-plane), 6, 18 or 26 (3-D).
    pub connectivity: Connectivity,
    pub mask_filtered_features: bool,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            min_area: 2,
            max_area: None,
            connectivity: Connectivity::default(),
            mask_filtered_features: true,
        }
    }
}

impl AggregateConfig {
    pub fn validate(&self) -> Result<AggregateParams> {
        Ok(AggregateParams {
            area: AreaFilter::from_signed(self.min_area, self.max_area)?,
            connectivity: self.connectivity,
            mask_filtered_features: self.mask_filtered_features,
        })
    }
}

/// The final output of decode + aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodingResult {
    /// Features that passed the area filter, ordered by id.
    pub features: Vec<ConnectedFeature>,
    /// Feature id of every pixel of the cropped grid, 0 for none. Axes `(z, y, x)`.
    pub label_volume: LabeledTensor<u32>,
    /// Pixels belonging to features removed by the area filter. Axes `(z, y, x)`.
    pub filtered_mask: LabeledTensor<bool>,
    /// Ids of the features removed by the area filter.
    pub filtered_feature_ids: Vec<u32>,
    /// Absolute location of `(0, 0, 0)` in the label volume and mask.
    pub origin: Location,
}

impl DecodingResult {
    /// Label of an absolute location, `None` outside the grid.
    pub fn label_at(&self, location: Location) -> Option<u32> {
        let (z, y, x) = self.relative(location)?;
        self.label_volume
            .get(&[(Axis::Z, z), (Axis::Y, y), (Axis::X, x)])
    }

    /// Whether an absolute location was removed by the area filter.
    pub fn is_filtered(&self, location: Location) -> Option<bool> {
        let (z, y, x) = self.relative(location)?;
        self.filtered_mask
            .get(&[(Axis::Z, z), (Axis::Y, y), (Axis::X, x)])
    }

    fn relative(&self, location: Location) -> Option<(usize, usize, usize)> {
        Some((
            location.z.checked_sub(self.origin.z)?,
            location.y.checked_sub(self.origin.y)?,
            location.x.checked_sub(self.origin.x)?,
        ))
    }
}

pub mod feature_aggregator {
    use super::*; // Make the result and parameter structs available.
    use crate::core_modules::labeling::label_components;
    use crate::core_modules::metric_decoder::DecodedPixels;
    use crate::core_modules::pixel_vectorizer::PixelIntensities;
    use crate::error::SpotDecodeError;
    use log::{debug, info};

    /// Running sums for one component while the grid is scanned.
    struct FeatureAccumulator {
        target_index: usize,
        members: Vec<Location>,
        coordinate_sum: (f64, f64, f64),
        intensity_sum: Vec<f64>,
        distance_sum: f64,
        magnitude_sum: f64,
    }

    /// The main function of the spatial grouping layer.
    /// Takes a fully decoded grid and returns the labeled, filtered features.
    ///
    /// `intensities`, when given, must be the vectors the grid was decoded from; they are
    /// only used for the per-feature mean intensity.
    pub fn aggregate(
        decoded: &DecodedPixels,
        intensities: Option<&PixelIntensities>,
        params: &AggregateParams,
    ) -> Result<DecodingResult> {
        let shape = decoded.shape;
        if let Some(intensities) = intensities {
            if intensities.pixels.len() != decoded.pixels.len() {
                return Err(SpotDecodeError::GridSizeMismatch {
                    expected: decoded.pixels.len(),
                    found: intensities.pixels.len(),
                });
            }
        }

        // --- 1. Component Labeling ---
        // Only pixels sharing a target can join, so this is per-target labeling in one pass.
        let classes: Vec<Option<usize>> = decoded.pixels.iter().map(|pixel| pixel.target).collect();
        let components = label_components(shape, &classes, params.connectivity)?;

        // --- 2. Data Aggregation ---
        let code_length = intensities.map_or(0, |i| i.code_length());
        let mut accumulators: Vec<Option<FeatureAccumulator>> = (0..components.count).map(|_| None).collect();
        for (index, pixel) in decoded.pixels.iter().enumerate() {
            let Some(target_index) = pixel.target else {
                continue;
            };
            let label = components.labels[index] as usize;
            let accumulator = accumulators[label - 1].get_or_insert_with(|| FeatureAccumulator {
                target_index,
                members: Vec::new(),
                coordinate_sum: (0.0, 0.0, 0.0),
                intensity_sum: vec![0.0; code_length],
                distance_sum: 0.0,
                magnitude_sum: 0.0,
            });
            let location = pixel.location;
            accumulator.members.push(location);
            accumulator.coordinate_sum.0 += location.z as f64;
            accumulator.coordinate_sum.1 += location.y as f64;
            accumulator.coordinate_sum.2 += location.x as f64;
            accumulator.distance_sum += pixel.distance;
            accumulator.magnitude_sum += pixel.magnitude;
            if let Some(intensities) = intensities {
                for (sum, value) in accumulator.intensity_sum.iter_mut().zip(&intensities.pixels[index].values) {
                    *sum += *value as f64;
                }
            }
        }

        let all_features: Vec<ConnectedFeature> = accumulators
            .into_iter()
            .zip(1u32..)
            .filter_map(|(accumulator, id)| accumulator.map(|acc| (id, acc)))
            .map(|(id, acc)| {
                let area = acc.members.len();
                let n = area as f64;
                ConnectedFeature {
                    id,
                    target_index: acc.target_index,
                    target: decoded
                        .target_names
                        .get(acc.target_index)
                        .cloned()
                        .unwrap_or_default(),
                    area,
                    centroid: (acc.coordinate_sum.0 / n, acc.coordinate_sum.1 / n, acc.coordinate_sum.2 / n),
                    mean_intensity: acc.intensity_sum.iter().map(|sum| (sum / n) as f32).collect(),
                    mean_distance: acc.distance_sum / n,
                    mean_magnitude: acc.magnitude_sum / n,
                    passes_area_filter: params.area.passes(area),
                    member_locations: acc.members,
                }
            })
            .collect();

        // --- 3. Area Filtering ---
        let mut labels = components.labels;
        let mut mask = vec![false; labels.len()];
        let mut features = Vec::with_capacity(all_features.len());
        let mut filtered_feature_ids = Vec::new();
        for feature in all_features {
            if feature.passes_area_filter {
                features.push(feature);
                continue;
            }
            for location in &feature.member_locations {
                let index = shape.raster_index(
                    location.z - decoded.origin.z,
                    location.y - decoded.origin.y,
                    location.x - decoded.origin.x,
                );
                mask[index] = true;
                if params.mask_filtered_features {
                    labels[index] = 0;
                }
            }
            debug!("feature {} ({}) filtered with area {}", feature.id, feature.target, feature.area);
            filtered_feature_ids.push(feature.id);
        }

        info!(
            "aggregated {} features ({} filtered by area) with {}",
            features.len() + filtered_feature_ids.len(),
            filtered_feature_ids.len(),
            params.connectivity
        );

        Ok(DecodingResult {
            features,
            label_volume: LabeledTensor::new(shape.axes(), labels)?,
            filtered_mask: LabeledTensor::new(shape.axes(), mask)?,
            filtered_feature_ids,
            origin: decoded.origin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::feature_aggregator::aggregate;
    use super::*;
    use crate::core_modules::metric_decoder::{DecodedPixel, DecodedPixels};
    use crate::core_modules::tensor::SpatialShape;

    /// A single-plane grid from rows of target digits ('.' = unassigned).
    fn decoded(rows: &[&str]) -> DecodedPixels {
        let shape = SpatialShape {
            z: 1,
            y: rows.len(),
            x: rows[0].len(),
        };
        let pixels = rows
            .iter()
            .enumerate()
            .flat_map(|(y, row)| {
                row.chars().enumerate().map(move |(x, c)| DecodedPixel {
                    location: Location::new(0, y, x),
                    target: c.to_digit(10).map(|d| d as usize),
                    distance: 0.1,
                    magnitude: 2.0,
                })
            })
            .collect();
        DecodedPixels {
            shape,
            origin: Location::new(0, 0, 0),
            target_names: vec!["a".into(), "b".into()],
            pixels,
        }
    }

    fn params(min: usize, max: Option<usize>, mask: bool) -> AggregateParams {
        AggregateParams {
            area: AreaFilter::new(min, max).unwrap(),
            connectivity: Connectivity::Four,
            mask_filtered_features: mask,
        }
    }

    #[test]
    fn block_becomes_one_feature_at_its_center() {
        let grid = decoded(&["....", ".000", ".000", ".000"]);
        let result = aggregate(&grid, None, &params(1, None, true)).unwrap();
        assert_eq!(result.features.len(), 1);
        let feature = &result.features[0];
        assert_eq!(feature.area, 9);
        assert_eq!(feature.member_locations.len(), 9);
        assert_eq!(feature.centroid, (0.0, 2.0, 2.0));
        assert_eq!(feature.target, "a");
        assert!(feature.mean_intensity.is_empty());
    }

    #[test]
    fn touching_targets_stay_separate() {
        let grid = decoded(&["0011", "0011"]);
        let result = aggregate(&grid, None, &params(1, None, true)).unwrap();
        let targets: Vec<&str> = result.features.iter().map(|f| f.target.as_str()).collect();
        assert_eq!(targets, vec!["a", "b"]);
        assert_eq!(result.label_volume.data(), &[1, 1, 2, 2, 1, 1, 2, 2]);
    }

    #[test]
    fn area_bounds_are_inclusive() {
        let grid = decoded(&["0.11.000", "0..1...."]);
        // areas: a=2, b=3, a=3
        let result = aggregate(&grid, None, &params(2, Some(3), true)).unwrap();
        assert_eq!(result.features.len(), 3);
        let result = aggregate(&grid, None, &params(3, Some(3), true)).unwrap();
        assert_eq!(result.features.iter().map(|f| f.area).collect::<Vec<_>>(), vec![3, 3]);
        assert_eq!(result.filtered_feature_ids, vec![1]);
    }

    #[test]
    fn masking_mode_clears_filtered_labels() {
        let grid = decoded(&["0..11", "...11"]);
        let masked = aggregate(&grid, None, &params(2, None, true)).unwrap();
        assert_eq!(masked.features.len(), 1);
        assert_eq!(masked.label_at(Location::new(0, 0, 0)), Some(0));
        assert_eq!(masked.is_filtered(Location::new(0, 0, 0)), Some(true));
        assert_eq!(masked.label_at(Location::new(0, 1, 4)), Some(2));

        let unmasked = aggregate(&grid, None, &params(2, None, false)).unwrap();
        assert_eq!(unmasked.features.len(), 1);
        assert_eq!(unmasked.label_at(Location::new(0, 0, 0)), Some(1));
        assert_eq!(unmasked.is_filtered(Location::new(0, 0, 0)), Some(true));
    }

    #[test]
    fn every_pixel_is_explained_exactly_once() {
        let grid = decoded(&["0.1.0", "01110", "..0..", "1...1"]);
        for mask in [true, false] {
            let result = aggregate(&grid, None, &params(2, Some(4), mask)).unwrap();
            let kept: usize = result.features.iter().map(|f| f.area).sum();
            let filtered = result.filtered_mask.data().iter().filter(|m| **m).count();
            let unassigned = grid.pixels.iter().filter(|p| p.target.is_none()).count();
            assert_eq!(kept + filtered + unassigned, grid.pixels.len());
            for feature in &result.features {
                for location in &feature.member_locations {
                    assert_eq!(result.label_at(*location), Some(feature.id));
                    assert_eq!(result.is_filtered(*location), Some(false));
                }
            }
        }
    }

    #[test]
    fn empty_grid_is_not_an_error() {
        let grid = decoded(&["...", "..."]);
        let result = aggregate(&grid, None, &params(0, None, true)).unwrap();
        assert!(result.features.is_empty());
        assert!(result.label_volume.data().iter().all(|label| *label == 0));
        assert!(result.filtered_mask.data().iter().all(|masked| !masked));
    }

    #[test]
    fn config_validation() {
        let config = AggregateConfig {
            min_area: 4,
            max_area: Some(2),
            ..AggregateConfig::default()
        };
        assert!(config.validate().unwrap_err().is_configuration());
        let config = AggregateConfig {
            min_area: -2,
            ..AggregateConfig::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(AggregateConfig::default().validate().unwrap(), AggregateParams::default());
    }
}
