// THEORY:
// The `tensor` module is the data foundation of the decoder. Multiplexed imaging
// produces a 5-D block of numbers (round, channel, z, y, x) and it is very easy to
// index such a block with the axes in the wrong order. `LabeledTensor` carries the
// name of every axis next to its size so that all element access happens by axis
// name, never by bare position.
//
// Key architectural principles:
// 1.  **Named Axes**: A tensor is an ordered list of `(Axis, size)` pairs plus a flat,
//     row-major buffer. Lookups take `(Axis, index)` pairs in any order.
// 2.  **One Container, Many Uses**: The same generic type holds the input image volume
//     (`f32`, 5 axes), the label volume (`u32`, 3 axes) and the filtered-pixel mask
//     (`bool`, 3 axes).
// 3.  **Physical Mapping**: `ImageVolume` pairs the raw tensor with the per-axis
//     physical extent supplied by the acquisition side, so pixel centroids can be
//     reported in microscope units.

use crate::error::{Result, SpotDecodeError};
use image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named tensor axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    Round,
    Channel,
    Z,
    Y,
    X,
}

impl Axis {
    pub fn name(&self) -> &'static str {
        match self {
            Axis::Round => "r",
            Axis::Channel => "c",
            Axis::Z => "z",
            Axis::Y => "y",
            Axis::X => "x",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dense, row-major tensor whose axes are addressed by name.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledTensor<T> {
    axes: Vec<(Axis, usize)>,
    strides: Vec<usize>,
    data: Vec<T>,
}

impl<T: Copy> LabeledTensor<T> {
    pub fn new(axes: Vec<(Axis, usize)>, data: Vec<T>) -> Result<Self> {
        for (i, (axis, _)) in axes.iter().enumerate() {
            if axes[..i].iter().any(|(seen, _)| seen == axis) {
                return Err(SpotDecodeError::TensorShape(format!("axis {axis} appears twice")));
            }
        }
        let expected: usize = axes.iter().map(|(_, size)| size).product();
        if data.len() != expected {
            return Err(SpotDecodeError::TensorShape(format!(
                "buffer holds {} values but axes describe {}",
                data.len(),
                expected
            )));
        }

        let mut strides = vec![1; axes.len()];
        for i in (0..axes.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * axes[i + 1].1;
        }

        Ok(Self { axes, strides, data })
    }

    /// A tensor with every element set to `value`.
    pub fn filled(axes: Vec<(Axis, usize)>, value: T) -> Result<Self> {
        let len = axes.iter().map(|(_, size)| size).product();
        Self::new(axes, vec![value; len])
    }

    pub fn axes(&self) -> &[(Axis, usize)] {
        &self.axes
    }

    pub fn size(&self, axis: Axis) -> Option<usize> {
        self.axes.iter().find(|(a, _)| *a == axis).map(|(_, size)| *size)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The flat buffer, in row-major order of `axes()`.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Flat offset of an element. Every axis must be named exactly once, in any order.
    pub fn offset(&self, index: &[(Axis, usize)]) -> Option<usize> {
        if index.len() != self.axes.len() {
            return None;
        }
        let mut offset = 0;
        for ((axis, size), stride) in self.axes.iter().zip(&self.strides) {
            let (_, i) = index.iter().find(|(a, _)| a == axis)?;
            if i >= size {
                return None;
            }
            offset += i * stride;
        }
        Some(offset)
    }

    pub fn get(&self, index: &[(Axis, usize)]) -> Option<T> {
        self.offset(index).map(|offset| self.data[offset])
    }
}

/// Sizes of the five axes of an image volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeShape {
    pub rounds: usize,
    pub channels: usize,
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

impl VolumeShape {
    pub fn spatial(&self) -> SpatialShape {
        SpatialShape { z: self.z, y: self.y, x: self.x }
    }

    /// Length of one per-pixel intensity vector.
    pub fn code_length(&self) -> usize {
        self.rounds * self.channels
    }

    fn axes(&self) -> Vec<(Axis, usize)> {
        vec![
            (Axis::Round, self.rounds),
            (Axis::Channel, self.channels),
            (Axis::Z, self.z),
            (Axis::Y, self.y),
            (Axis::X, self.x),
        ]
    }
}

/// Sizes of the three spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialShape {
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

impl SpatialShape {
    pub fn volume(&self) -> usize {
        self.z * self.y * self.x
    }

    pub fn axes(&self) -> Vec<(Axis, usize)> {
        vec![(Axis::Z, self.z), (Axis::Y, self.y), (Axis::X, self.x)]
    }

    /// Raster offset of a location relative to the grid origin.
    pub fn raster_index(&self, z: usize, y: usize, x: usize) -> usize {
        (z * self.y + y) * self.x + x
    }
}

/// Inclusive physical extent of one spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalRange {
    pub min: f64,
    pub max: f64,
}

impl PhysicalRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Maps a (possibly fractional) pixel position on an axis of `size` pixels onto the range.
    /// The first pixel sits at `min`, the last at `max`.
    pub fn at(&self, position: f64, size: usize) -> f64 {
        if size <= 1 {
            return self.min;
        }
        self.min + (self.max - self.min) * position / (size - 1) as f64
    }
}

/// Physical coordinate mapping for the three spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalCoordinates {
    pub x: PhysicalRange,
    pub y: PhysicalRange,
    pub z: PhysicalRange,
}

impl PhysicalCoordinates {
    /// Identity mapping: physical units equal pixel indices.
    pub fn pixel_units(shape: SpatialShape) -> Self {
        let range = |size: usize| PhysicalRange::new(0.0, size.saturating_sub(1) as f64);
        Self {
            x: range(shape.x),
            y: range(shape.y),
            z: range(shape.z),
        }
    }

    /// Converts a pixel-space `(z, y, x)` position on the full, uncropped grid into physical units.
    pub fn to_physical(&self, position: (f64, f64, f64), shape: SpatialShape) -> (f64, f64, f64) {
        (
            self.z.at(position.0, shape.z),
            self.y.at(position.1, shape.y),
            self.x.at(position.2, shape.x),
        )
    }
}

/// A single 2-D image plane as handed over by the acquisition side.
pub type Tile = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Position of a tile in the (round, channel, z) stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub round: usize,
    pub channel: usize,
    pub z: usize,
}

/// The read-only 5-D input volume plus its physical coordinate mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageVolume {
    tensor: LabeledTensor<f32>,
    shape: VolumeShape,
    coordinates: PhysicalCoordinates,
}

impl ImageVolume {
    /// Wraps a flat buffer laid out in `(round, channel, z, y, x)` order.
    pub fn new(shape: VolumeShape, data: Vec<f32>) -> Result<Self> {
        let tensor = LabeledTensor::new(shape.axes(), data)?;
        Ok(Self {
            tensor,
            shape,
            coordinates: PhysicalCoordinates::pixel_units(shape.spatial()),
        })
    }

    /// Builds a volume from one 2-D tile per (round, channel, z). Every slot must be
    /// supplied exactly once and all tiles must share the same width and height.
    pub fn from_tiles(rounds: usize, channels: usize, z_planes: usize, tiles: Vec<(TileIndex, Tile)>) -> Result<Self> {
        let (width, height) = match tiles.first() {
            Some((_, tile)) => tile.dimensions(),
            None => return Err(SpotDecodeError::TensorShape("no tiles supplied".to_string())),
        };
        let shape = VolumeShape {
            rounds,
            channels,
            z: z_planes,
            y: height as usize,
            x: width as usize,
        };
        let mut tensor = LabeledTensor::filled(shape.axes(), 0.0f32)?;
        let mut seen = vec![false; rounds * channels * z_planes];
        let plane_len = shape.y * shape.x;

        for (index, tile) in tiles {
            if tile.dimensions() != (width, height) {
                return Err(SpotDecodeError::TensorShape(format!(
                    "tile {index:?} is {:?}, expected {:?}",
                    tile.dimensions(),
                    (width, height)
                )));
            }
            if index.round >= rounds || index.channel >= channels || index.z >= z_planes {
                return Err(SpotDecodeError::TensorShape(format!("tile {index:?} is outside the stack")));
            }
            let slot = (index.round * channels + index.channel) * z_planes + index.z;
            if seen[slot] {
                return Err(SpotDecodeError::TensorShape(format!("tile {index:?} supplied twice")));
            }
            seen[slot] = true;
            let start = slot * plane_len;
            tensor.data_mut()[start..start + plane_len].copy_from_slice(tile.as_raw());
        }

        if seen.iter().any(|present| !present) {
            return Err(SpotDecodeError::TensorShape("tile stack is incomplete".to_string()));
        }

        Ok(Self {
            tensor,
            shape,
            coordinates: PhysicalCoordinates::pixel_units(shape.spatial()),
        })
    }

    pub fn with_coordinates(mut self, coordinates: PhysicalCoordinates) -> Self {
        self.coordinates = coordinates;
        self
    }

    pub fn shape(&self) -> VolumeShape {
        self.shape
    }

    pub fn coordinates(&self) -> &PhysicalCoordinates {
        &self.coordinates
    }

    pub fn tensor(&self) -> &LabeledTensor<f32> {
        &self.tensor
    }

    pub fn value(&self, round: usize, channel: usize, z: usize, y: usize, x: usize) -> Option<f32> {
        self.tensor.get(&[
            (Axis::Round, round),
            (Axis::Channel, channel),
            (Axis::Z, z),
            (Axis::Y, y),
            (Axis::X, x),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_are_independent_of_axis_order() {
        let tensor = LabeledTensor::new(vec![(Axis::Y, 2), (Axis::X, 3)], (0..6).collect::<Vec<i32>>()).unwrap();
        assert_eq!(tensor.get(&[(Axis::Y, 1), (Axis::X, 2)]), Some(5));
        assert_eq!(tensor.get(&[(Axis::X, 2), (Axis::Y, 1)]), Some(5));
        assert_eq!(tensor.get(&[(Axis::X, 3), (Axis::Y, 0)]), None);
        assert_eq!(tensor.get(&[(Axis::Y, 0)]), None);
    }

    #[test]
    fn rejects_mismatched_buffer_and_duplicate_axes() {
        assert!(LabeledTensor::new(vec![(Axis::X, 4)], vec![0u8; 3]).is_err());
        assert!(LabeledTensor::new(vec![(Axis::X, 1), (Axis::X, 1)], vec![0u8; 1]).is_err());
    }

    #[test]
    fn volume_from_tiles_places_planes() {
        let mut tiles = Vec::new();
        for round in 0..2 {
            for channel in 0..1 {
                let value = (round * 10) as f32;
                let tile = Tile::from_fn(3, 2, |x, y| Luma([value + (y * 3 + x) as f32]));
                tiles.push((TileIndex { round, channel, z: 0 }, tile));
            }
        }
        let volume = ImageVolume::from_tiles(2, 1, 1, tiles).unwrap();
        assert_eq!(volume.shape().x, 3);
        assert_eq!(volume.shape().y, 2);
        assert_eq!(volume.value(1, 0, 0, 1, 2), Some(15.0));
        assert_eq!(volume.value(0, 0, 0, 0, 1), Some(1.0));
    }

    #[test]
    fn incomplete_tile_stack_is_rejected() {
        let tile = Tile::new(2, 2);
        let result = ImageVolume::from_tiles(2, 1, 1, vec![(TileIndex { round: 0, channel: 0, z: 0 }, tile)]);
        assert!(matches!(result, Err(SpotDecodeError::TensorShape(_))));
    }

    #[test]
    fn physical_range_spans_first_to_last_pixel() {
        let range = PhysicalRange::new(10.0, 20.0);
        assert_eq!(range.at(0.0, 11), 10.0);
        assert_eq!(range.at(10.0, 11), 20.0);
        assert_eq!(range.at(3.0, 1), 10.0);
    }
}
