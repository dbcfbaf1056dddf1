// THEORY:
// A `ConnectedFeature` is the spatial unit of the decoder's output: one contiguous
// group of pixels that all decoded to the same target. It is the pixel-level answer
// to "there is one molecule of target T here".
//
// Key architectural principles:
// 1.  **Spatial Cohesion**: Every member touches another member under the configured
//     connectivity and all members share one target.
// 2.  **Data Aggregation**: Instead of carrying dozens of decoded pixels around, the
//     rest of the system works with a single summary: area, centroid, mean intensity
//     vector and mean decode distance.
// 3.  **Dumb Data Container**: Like the decoded pixels it is built from, a feature does
//     not know how to find itself. The aggregator builds it; the feature table reads it.

use crate::core_modules::pixel_vectorizer::Location;
use crate::error::{Result, SpotDecodeError};

/// A spatially connected group of pixels decoded to the same target.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectedFeature {
    /// Id of this feature in the label volume. Ids start at 1.
    pub id: u32,
    /// Index of the target in the codebook.
    pub target_index: usize,
    pub target: String,
    /// Every member location (absolute, uncropped coordinates), in raster order.
    pub member_locations: Vec<Location>,
    /// Number of member pixels.
    pub area: usize,
    /// Unweighted mean of the member coordinates, `(z, y, x)`.
    pub centroid: (f64, f64, f64),
    /// Mean of the members' raw intensity vectors. Empty when intensities were not
    /// supplied to the aggregator.
    pub mean_intensity: Vec<f32>,
    /// Mean decode distance of the members.
    pub mean_distance: f64,
    /// Mean raw magnitude of the members.
    pub mean_magnitude: f64,
    /// Whether `min_area <= area <= max_area`.
    pub passes_area_filter: bool,
}

/// Validated inclusive area bounds. `max = None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaFilter {
    pub min: usize,
    pub max: Option<usize>,
}

impl AreaFilter {
    pub fn new(min: usize, max: Option<usize>) -> Result<Self> {
        if let Some(max) = max {
            if min > max {
                return Err(SpotDecodeError::InvalidAreaBounds { min, max });
            }
        }
        Ok(Self { min, max })
    }

    /// Builds bounds from signed values as they arrive from configuration documents.
    pub fn from_signed(min: i64, max: Option<i64>) -> Result<Self> {
        let checked = |value: i64| usize::try_from(value).map_err(|_| SpotDecodeError::NegativeArea(value));
        Self::new(checked(min)?, max.map(checked).transpose()?)
    }

    pub fn passes(&self, area: usize) -> bool {
        area >= self.min && self.max.is_none_or(|max| area <= max)
    }
}

impl Default for AreaFilter {
    fn default() -> Self {
        Self { min: 2, max: None }
    }
}
