// THEORY:
// This file is the main entry point for the `spot_decoder` library crate.
// It follows the standard Rust convention of using `lib.rs` to define the public
// API that will be exposed to external consumers (segmentation, counting and
// reporting tools downstream of the decoder).
//
// The primary goal is to export the `PixelSpotDetector` and its associated data
// structures (`PipelineConfig`, `FeatureTable`, `DecodingResult`, etc.) as the
// high-level interface of the decoder. The stage modules (`core_modules`) stay
// public for callers that want to run a single stage on its own.

pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use crate::core_modules::codebook::{Codebook, CodebookEntry};
pub use crate::core_modules::tensor::{ImageVolume, PhysicalCoordinates, PhysicalRange, Tile, TileIndex, VolumeShape};
pub use crate::error::{Result, SpotDecodeError};
pub use crate::parallel_pipeline::{DecodeWorkerPool, ParallelSpotDetector};
pub use crate::pipeline::{FeatureTable, PipelineConfig, PixelSpotDetector, SpotFinder};
