// THEORY:
// The `PixelVectorizer` performs the first transformation of the decode pipeline: it
// turns a dense (round, channel, z, y, x) volume into one intensity vector per spatial
// location. This slicing step is the bridge between the image-shaped world of the
// acquisition side and the vector-shaped world of the metric decoder.
//
// Key architectural principles:
// 1.  **Crop First**: Edge pixels are often contaminated by registration and stitching
//     artifacts. The configured margins are removed from both ends of every spatial
//     axis before any vector is built.
// 2.  **Absolute Coordinates**: Every vector remembers its location on the original,
//     uncropped grid, so later stages can report centroids without knowing about the
//     crop.
// 3.  **Lossless**: No arithmetic touches the values. Reassembling the vectors by
//     location reproduces the (cropped) volume bit for bit.
// 4.  **Raster Order**: Vectors are emitted z-major, then y, then x. The aggregator
//     relies on this order to treat the decoded pixels as a dense grid.

use crate::core_modules::tensor::{Axis, ImageVolume, PhysicalCoordinates, SpatialShape, VolumeShape};
use crate::error::{Result, SpotDecodeError};
use log::debug;
use serde::{Deserialize, Serialize};

/// A position on the full, uncropped spatial grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

impl Location {
    pub fn new(z: usize, y: usize, x: usize) -> Self {
        Self { z, y, x }
    }
}

/// Number of pixels removed from *each* end of the spatial axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl CropConfig {
    /// Checks that the crop leaves at least one pixel on every axis of `shape`.
    pub fn validate(&self, shape: SpatialShape) -> Result<SpatialShape> {
        let cropped = |axis: &'static str, margin: usize, size: usize| {
            margin
                .checked_mul(2)
                .and_then(|removed| size.checked_sub(removed))
                .filter(|remaining| *remaining > 0)
                .ok_or(SpotDecodeError::CropTooLarge { axis, margin, size })
        };
        Ok(SpatialShape {
            z: cropped("z", self.z, shape.z)?,
            y: cropped("y", self.y, shape.y)?,
            x: cropped("x", self.x, shape.x)?,
        })
    }

    pub fn origin(&self) -> Location {
        Location::new(self.z, self.y, self.x)
    }
}

/// The intensity vector observed at one location, indexed by `round * n_channels + channel`.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelIntensityVector {
    pub location: Location,
    pub values: Vec<f32>,
}

/// All intensity vectors of a (cropped) volume, in raster order.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelIntensities {
    /// Shape of the cropped grid the vectors cover.
    pub shape: SpatialShape,
    /// Location of the first vector on the uncropped grid.
    pub origin: Location,
    /// Shape of the uncropped volume the vectors were cut from.
    pub full_shape: SpatialShape,
    pub n_rounds: usize,
    pub n_channels: usize,
    /// Physical mapping of the uncropped volume.
    pub coordinates: PhysicalCoordinates,
    pub pixels: Vec<PixelIntensityVector>,
}

impl PixelIntensities {
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn code_length(&self) -> usize {
        self.n_rounds * self.n_channels
    }

    /// Raster index of an absolute location inside the cropped grid.
    pub fn index_of(&self, location: Location) -> Option<usize> {
        let z = location.z.checked_sub(self.origin.z).filter(|z| *z < self.shape.z)?;
        let y = location.y.checked_sub(self.origin.y).filter(|y| *y < self.shape.y)?;
        let x = location.x.checked_sub(self.origin.x).filter(|x| *x < self.shape.x)?;
        Some(self.shape.raster_index(z, y, x))
    }

    pub fn get(&self, location: Location) -> Option<&PixelIntensityVector> {
        self.index_of(location).map(|index| &self.pixels[index])
    }

    /// Reassembles the vectors into a `(round, channel, z, y, x)` volume of the cropped shape.
    pub fn to_volume(&self) -> Result<ImageVolume> {
        let shape = VolumeShape {
            rounds: self.n_rounds,
            channels: self.n_channels,
            z: self.shape.z,
            y: self.shape.y,
            x: self.shape.x,
        };
        let plane_volume = self.shape.volume();
        let mut data = vec![0.0f32; shape.code_length() * plane_volume];
        for (index, pixel) in self.pixels.iter().enumerate() {
            for (slot, value) in pixel.values.iter().enumerate() {
                data[slot * plane_volume + index] = *value;
            }
        }
        ImageVolume::new(shape, data)
    }
}

/// Flattens image volumes into per-pixel intensity vectors.
#[derive(Debug, Clone, Copy, Default)]
pub struct PixelVectorizer {
    crop: CropConfig,
}

impl PixelVectorizer {
    pub fn new(crop: CropConfig) -> Self {
        Self { crop }
    }

    pub fn vectorize(&self, volume: &ImageVolume) -> Result<PixelIntensities> {
        let full = volume.shape();
        let shape = self.crop.validate(full.spatial())?;
        let origin = self.crop.origin();
        let code_length = full.code_length();
        let tensor = volume.tensor();
        let data = tensor.data();

        let mut pixels = Vec::with_capacity(shape.volume());
        for z in origin.z..origin.z + shape.z {
            for y in origin.y..origin.y + shape.y {
                for x in origin.x..origin.x + shape.x {
                    let mut values = Vec::with_capacity(code_length);
                    for round in 0..full.rounds {
                        for channel in 0..full.channels {
                            let offset = tensor
                                .offset(&[
                                    (Axis::Round, round),
                                    (Axis::Channel, channel),
                                    (Axis::Z, z),
                                    (Axis::Y, y),
                                    (Axis::X, x),
                                ])
                                .ok_or_else(|| {
                                    SpotDecodeError::TensorShape(format!("({z}, {y}, {x}) is outside the volume"))
                                })?;
                            values.push(data[offset]);
                        }
                    }
                    pixels.push(PixelIntensityVector {
                        location: Location::new(z, y, x),
                        values,
                    });
                }
            }
        }

        debug!(
            "vectorized {} pixels of length {} (crop z={} y={} x={})",
            pixels.len(),
            code_length,
            self.crop.z,
            self.crop.y,
            self.crop.x
        );

        Ok(PixelIntensities {
            shape,
            origin,
            full_shape: full.spatial(),
            n_rounds: full.rounds,
            n_channels: full.channels,
            coordinates: *volume.coordinates(),
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_volume(shape: VolumeShape) -> ImageVolume {
        let len = shape.code_length() * shape.spatial().volume();
        ImageVolume::new(shape, (0..len).map(|v| v as f32 * 0.25).collect()).unwrap()
    }

    #[test]
    fn vectors_round_trip_to_the_original_volume() {
        let shape = VolumeShape {
            rounds: 1,
            channels: 2,
            z: 3,
            y: 4,
            x: 5,
        };
        let volume = ramp_volume(shape);
        let pixels = PixelVectorizer::default().vectorize(&volume).unwrap();
        assert_eq!(pixels.len(), 60);
        let rebuilt = pixels.to_volume().unwrap();
        assert_eq!(rebuilt.tensor().data(), volume.tensor().data());
    }

    #[test]
    fn vectors_are_indexed_by_round_then_channel() {
        let shape = VolumeShape {
            rounds: 2,
            channels: 3,
            z: 1,
            y: 2,
            x: 2,
        };
        let volume = ramp_volume(shape);
        let pixels = PixelVectorizer::default().vectorize(&volume).unwrap();
        let pixel = pixels.get(Location::new(0, 1, 0)).unwrap();
        for round in 0..2 {
            for channel in 0..3 {
                assert_eq!(pixel.values[round * 3 + channel], volume.value(round, channel, 0, 1, 0).unwrap());
            }
        }
    }

    #[test]
    fn crop_keeps_absolute_locations() {
        let shape = VolumeShape {
            rounds: 1,
            channels: 1,
            z: 3,
            y: 6,
            x: 7,
        };
        let volume = ramp_volume(shape);
        let crop = CropConfig { x: 2, y: 1, z: 1 };
        let pixels = PixelVectorizer::new(crop).vectorize(&volume).unwrap();
        assert_eq!(pixels.shape, SpatialShape { z: 1, y: 4, x: 3 });
        assert_eq!(pixels.pixels[0].location, Location::new(1, 1, 2));
        assert_eq!(pixels.pixels[0].values[0], volume.value(0, 0, 1, 1, 2).unwrap());
        assert_eq!(pixels.pixels.last().unwrap().location, Location::new(1, 4, 4));
        assert!(pixels.get(Location::new(0, 1, 2)).is_none());
    }

    #[test]
    fn crop_that_removes_an_axis_is_rejected() {
        let shape = VolumeShape {
            rounds: 1,
            channels: 1,
            z: 1,
            y: 4,
            x: 4,
        };
        let volume = ramp_volume(shape);
        let result = PixelVectorizer::new(CropConfig { x: 2, y: 0, z: 0 }).vectorize(&volume);
        assert!(matches!(result, Err(SpotDecodeError::CropTooLarge { axis: "x", .. })));

        let huge = CropConfig {
            x: usize::MAX / 2 + 1,
            y: 0,
            z: 0,
        };
        let result = PixelVectorizer::new(huge).vectorize(&volume);
        assert!(matches!(result, Err(SpotDecodeError::CropTooLarge { axis: "x", .. })));
    }
}
