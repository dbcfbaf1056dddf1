// THEORY:
// The `pipeline` module is the top-level API of the decoder. It wires the full stack
// (crop + vectorize, decode, aggregate, tabulate) into a single entry point so that a
// caller hands over an image volume and a codebook and gets back the spot table.
//
// Key architectural principles:
// 1.  **Validate Before Work**: Every configuration problem (bad thresholds, empty or
//     mismatched codebook, oversized crop) is reported before a single pixel is decoded.
// 2.  **Hard Barrier**: Decoding finishes for the whole grid before aggregation starts.
// 3.  **Plug-in Stages**: The decoder and the spot finder are traits with static,
//     name-keyed registries. The configuration document picks them by name.
// 4.  **Pure Runs**: A detector holds only validated parameters. Running it twice on the
//     same inputs yields identical results.

use crate::core_modules::codebook::Codebook;
use crate::core_modules::feature_aggregator::feature_aggregator;
use crate::core_modules::metric_decoder::{DecodedPixels, Decoder, MetricDecoder, decoder_by_name};
use crate::core_modules::pixel_vectorizer::{PixelIntensities, PixelVectorizer};
use crate::core_modules::tensor::ImageVolume;
use crate::error::{Result, SpotDecodeError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

// Re-export key data structures for the public API.
pub use crate::core_modules::feature_aggregator::{AggregateConfig, AggregateParams, DecodingResult};
pub use crate::core_modules::feature_table::{FeatureRow, FeatureTable};
pub use crate::core_modules::metric_decoder::{DecodeConfig, DecodeParams};
pub use crate::core_modules::pixel_vectorizer::CropConfig;

/// Configuration for the PixelSpotDetector, as read from a JSON document.
/// Every section and every field is optional and falls back to its default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub decode: DecodeConfig,
    pub aggregate: AggregateConfig,
    /// Margins removed from both ends of each spatial axis before decoding.
    pub crop: CropConfig,
}

impl PipelineConfig {
    pub fn from_json_str(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks every section without building anything.
    pub fn validate(&self) -> Result<()> {
        let params = self.decode.validate()?;
        decoder_by_name(&self.decode.algorithm, &params)?;
        self.aggregate.validate()?;
        Ok(())
    }
}

/// Everything a spot finder produces for one volume.
pub type SpotCalls = (FeatureTable, DecodingResult);

/// A complete volume-to-spots algorithm.
pub trait SpotFinder: Send + Sync {
    fn name(&self) -> &'static str;

    fn find_spots(&self, volume: &ImageVolume, codebook: &Codebook) -> Result<SpotCalls>;
}

/// The main, top-level struct of the decoder.
pub struct PixelSpotDetector {
    decoder: Arc<dyn Decoder>,
    aggregate: AggregateParams,
    vectorizer: PixelVectorizer,
}

impl PixelSpotDetector {
    pub const NAME: &'static str = "pixel_spot_detector";

    pub fn new(decoder: Arc<dyn Decoder>, aggregate: AggregateParams, crop: CropConfig) -> Self {
        Self {
            decoder,
            aggregate,
            vectorizer: PixelVectorizer::new(crop),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let params = config.decode.validate()?;
        let decoder: Arc<dyn Decoder> = Arc::from(decoder_by_name(&config.decode.algorithm, &params)?);
        Ok(Self::new(decoder, config.aggregate.validate()?, config.crop))
    }

    pub fn decoder(&self) -> &Arc<dyn Decoder> {
        &self.decoder
    }

    /// Runs the whole pipeline on one volume.
    pub fn run(&self, volume: &ImageVolume, codebook: &Codebook) -> Result<SpotCalls> {
        info!(
            "running {} with {} on {} targets",
            Self::NAME,
            self.decoder.name(),
            codebook.len()
        );

        // Stage 1: Crop + Vectorize
        let intensities = self.prepare(volume, codebook)?;

        // Stage 2: Decode
        let decoded = self.decoder.decode(&intensities, codebook)?;

        // Stage 3 + 4: Aggregate + Tabulate
        self.finish(&intensities, &decoded)
    }

    /// Input checks and vectorization. Nothing is decoded here.
    pub(crate) fn prepare(&self, volume: &ImageVolume, codebook: &Codebook) -> Result<PixelIntensities> {
        if codebook.is_empty() {
            return Err(SpotDecodeError::EmptyCodebook);
        }
        let code_length = volume.shape().code_length();
        if codebook.code_length() != code_length {
            return Err(SpotDecodeError::DimensionMismatch {
                expected: codebook.code_length(),
                found: code_length,
            });
        }
        self.vectorizer.vectorize(volume)
    }

    /// Everything after the decode barrier.
    pub(crate) fn finish(&self, intensities: &PixelIntensities, decoded: &DecodedPixels) -> Result<SpotCalls> {
        let result = feature_aggregator::aggregate(decoded, Some(intensities), &self.aggregate)?;
        let table = FeatureTable::from_intensities(&result, intensities);

        if table.is_empty() && decoded.assigned_count() > 0 {
            warn!(
                "{} pixels decoded but every feature was removed by the area filter",
                decoded.assigned_count()
            );
        }
        info!(
            "{} spots from {} decoded pixels ({} pixels total)",
            table.len(),
            decoded.assigned_count(),
            decoded.pixels.len()
        );
        Ok((table, result))
    }
}

impl SpotFinder for PixelSpotDetector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn find_spots(&self, volume: &ImageVolume, codebook: &Codebook) -> Result<SpotCalls> {
        self.run(volume, codebook)
    }
}

type SpotFinderConstructor = fn(&PipelineConfig) -> Result<Box<dyn SpotFinder>>;

/// Spot finders selectable by name.
pub const SPOT_FINDER_REGISTRY: &[(&str, SpotFinderConstructor)] = &[(PixelSpotDetector::NAME, pixel_spot_detector)];

fn pixel_spot_detector(config: &PipelineConfig) -> Result<Box<dyn SpotFinder>> {
    Ok(Box::new(PixelSpotDetector::from_config(config)?))
}

pub fn spot_finder_by_name(name: &str, config: &PipelineConfig) -> Result<Box<dyn SpotFinder>> {
    let (_, construct) = SPOT_FINDER_REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .ok_or_else(|| SpotDecodeError::UnknownAlgorithm(name.to_string()))?;
    construct(config)
}

/// One-shot run with the nearest-code decoder and explicit parameters.
pub fn run(
    volume: &ImageVolume,
    codebook: &Codebook,
    decode_params: &DecodeParams,
    aggregate_params: &AggregateParams,
    crop: CropConfig,
) -> Result<SpotCalls> {
    PixelSpotDetector::new(Arc::new(MetricDecoder::new(*decode_params)), *aggregate_params, crop).run(volume, codebook)
}
