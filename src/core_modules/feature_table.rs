// THEORY:
// The feature table is the hand-off point to everything downstream of the decoder
// (cell assignment, counting, reporting). It flattens the rich `ConnectedFeature`
// structs into one plain row per spot and knows how to persist itself.
//
// Key architectural principles:
// 1.  **Flat Rows**: One row per kept feature, with the target, the centroid in pixel
//     and physical units, the area, the mean intensity per (round, channel) and the
//     mean decode distance.
// 2.  **Structural Round Trip**: Saving a table as JSON and loading it back yields an
//     equal table. Nothing beyond that structural contract is promised about the file.
// 3.  **Diagnostics, Not Visualization**: The label volume and filtered mask can be
//     exported plane by plane as plain grayscale images for external viewers. No
//     colouring or rendering happens here.

use crate::core_modules::feature_aggregator::DecodingResult;
use crate::core_modules::pixel_vectorizer::PixelIntensities;
use crate::core_modules::tensor::{Axis, PhysicalCoordinates, SpatialShape};
use crate::error::{Result, SpotDecodeError};
use image::{GrayImage, ImageBuffer, Luma};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One decoded spot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub feature_id: u32,
    pub target: String,
    /// Centroid in pixels on the uncropped grid.
    pub z: f64,
    pub y: f64,
    pub x: f64,
    /// Centroid in physical units.
    pub zc: f64,
    pub yc: f64,
    pub xc: f64,
    pub area: usize,
    /// Mean raw intensity, indexed by `round * n_channels + channel`.
    pub mean_intensity: Vec<f32>,
    pub distance: f64,
    /// Mean raw magnitude of the member pixels.
    pub magnitude: f64,
}

/// Flat table of decoded spots, ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub n_rounds: usize,
    pub n_channels: usize,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    /// Builds the table from the kept features of a decoding result.
    pub fn from_result(
        result: &DecodingResult,
        n_rounds: usize,
        n_channels: usize,
        coordinates: &PhysicalCoordinates,
        full_shape: SpatialShape,
    ) -> Self {
        let rows = result
            .features
            .iter()
            .map(|feature| {
                let (zc, yc, xc) = coordinates.to_physical(feature.centroid, full_shape);
                FeatureRow {
                    feature_id: feature.id,
                    target: feature.target.clone(),
                    z: feature.centroid.0,
                    y: feature.centroid.1,
                    x: feature.centroid.2,
                    zc,
                    yc,
                    xc,
                    area: feature.area,
                    mean_intensity: feature.mean_intensity.clone(),
                    distance: feature.mean_distance,
                    magnitude: feature.mean_magnitude,
                }
            })
            .collect();
        Self {
            n_rounds,
            n_channels,
            rows,
        }
    }

    /// Convenience wrapper taking the grid description from the intensities.
    pub fn from_intensities(result: &DecodingResult, intensities: &PixelIntensities) -> Self {
        Self::from_result(
            result,
            intensities.n_rounds,
            intensities.n_channels,
            &intensities.coordinates,
            intensities.full_shape,
        )
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of spots per target, in order of first appearance.
    pub fn counts_by_target(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = Vec::new();
        for row in &self.rows {
            match counts.iter_mut().find(|(target, _)| *target == row.target) {
                Some((_, count)) => *count += 1,
                None => counts.push((row.target.clone(), 1)),
            }
        }
        counts
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
}

fn plane_dimensions(result: &DecodingResult) -> Result<(usize, usize, usize)> {
    let size = |axis: Axis| {
        result
            .label_volume
            .size(axis)
            .ok_or_else(|| SpotDecodeError::TensorShape(format!("label volume has no {axis} axis")))
    };
    Ok((size(Axis::Z)?, size(Axis::Y)?, size(Axis::X)?))
}

/// One z-plane of the label volume as a 16-bit image. Ids above `u16::MAX` saturate.
pub fn label_plane_image(result: &DecodingResult, z: usize) -> Result<ImageBuffer<Luma<u16>, Vec<u16>>> {
    let (depth, height, width) = plane_dimensions(result)?;
    if z >= depth {
        return Err(SpotDecodeError::TensorShape(format!("plane {z} is outside a volume of depth {depth}")));
    }
    let plane = &result.label_volume.data()[z * height * width..(z + 1) * height * width];
    let pixels = plane.iter().map(|label| (*label).min(u16::MAX as u32) as u16).collect();
    ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| SpotDecodeError::TensorShape("label plane does not fit an image".to_string()))
}

/// One z-plane of the filtered mask, 255 where a pixel was removed by the area filter.
pub fn filtered_mask_plane_image(result: &DecodingResult, z: usize) -> Result<GrayImage> {
    let (depth, height, width) = plane_dimensions(result)?;
    if z >= depth {
        return Err(SpotDecodeError::TensorShape(format!("plane {z} is outside a volume of depth {depth}")));
    }
    let plane = &result.filtered_mask.data()[z * height * width..(z + 1) * height * width];
    let pixels = plane.iter().map(|masked| if *masked { 255 } else { 0 }).collect();
    GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| SpotDecodeError::TensorShape("mask plane does not fit an image".to_string()))
}

/// Writes `labels_z{z}.png` and `filtered_z{z}.png` for every plane into `directory`.
pub fn save_diagnostic_planes(result: &DecodingResult, directory: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let directory = directory.as_ref();
    std::fs::create_dir_all(directory)?;
    let (depth, _, _) = plane_dimensions(result)?;
    let mut written = Vec::with_capacity(depth * 2);
    for z in 0..depth {
        let labels_path = directory.join(format!("labels_z{z}.png"));
        label_plane_image(result, z)?.save(&labels_path)?;
        written.push(labels_path);

        let mask_path = directory.join(format!("filtered_z{z}.png"));
        filtered_mask_plane_image(result, z)?.save(&mask_path)?;
        written.push(mask_path);
    }
    Ok(written)
}
