// THEORY:
// The metric decoder is the per-pixel classification layer. For every intensity vector
// it asks one question: "which barcode in the codebook does this look like, and is the
// resemblance good enough to call it?"
//
// Key architectural principles & algorithm steps:
// 1.  **Normalization**: Codes and pixel vectors are scaled to unit Lp norm so that the
//     comparison is about the *pattern* of fluorescence, not about how bright a spot
//     happens to be. The raw magnitude is kept separately.
// 2.  **Nearest Code**: Every pixel is compared against every code (brute force). The
//     closest code wins; exact or near-exact ties go to the code listed first.
// 3.  **Two Gates**: A pixel is only assigned when it is close enough (distance at or
//     below the distance threshold) AND bright enough (raw magnitude at or above the
//     magnitude threshold). Failing either gate is a normal outcome, not an error.
// 4.  **Embarrassingly Parallel**: A `PixelClassifier` holds everything it needs
//     (normalized codes, thresholds) read-only, and classifying one pixel never looks
//     at another. The same classifier drives the sequential path here and the worker
//     pool in `parallel_pipeline`, so both produce identical results.
// 5.  **Fail Fast**: An empty codebook or a dimensionality mismatch is detected while
//     preparing the classifier, before any pixel is looked at.

use crate::core_modules::codebook::{Codebook, max_channel_per_round};
use crate::core_modules::metric::{Metric, NormOrder};
use crate::core_modules::pixel_vectorizer::{Location, PixelIntensities, PixelIntensityVector};
use crate::core_modules::tensor::SpatialShape;
use crate::error::{Result, SpotDecodeError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Distances closer than this are treated as ties.
const TIE_TOLERANCE: f64 = 1e-9;

/// The decode outcome of one pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPixel {
    pub location: Location,
    /// Index of the assigned codebook entry, `None` when a threshold was not met.
    pub target: Option<usize>,
    /// Distance to the nearest code (kept even when the pixel is unassigned).
    pub distance: f64,
    /// Raw (pre-normalization) magnitude of the pixel vector.
    pub magnitude: f64,
}

/// Decoded pixels covering a dense, raster-ordered grid.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPixels {
    pub shape: SpatialShape,
    pub origin: Location,
    /// Target names in codebook order; `DecodedPixel::target` indexes into this.
    pub target_names: Vec<String>,
    pub pixels: Vec<DecodedPixel>,
}

impl DecodedPixels {
    /// Pairs decoded pixels with the grid description of the intensities they came from.
    pub fn from_parts(intensities: &PixelIntensities, codebook: &Codebook, pixels: Vec<DecodedPixel>) -> Self {
        Self {
            shape: intensities.shape,
            origin: intensities.origin,
            target_names: codebook.target_names(),
            pixels,
        }
    }

    pub fn assigned_count(&self) -> usize {
        self.pixels.iter().filter(|pixel| pixel.target.is_some()).count()
    }

    pub fn target_name(&self, pixel: &DecodedPixel) -> Option<&str> {
        pixel.target.and_then(|index| self.target_names.get(index)).map(String::as_str)
    }
}

/// Validated parameters of the metric decoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeParams {
    pub distance_threshold: f64,
    pub magnitude_threshold: f64,
    pub norm_order: NormOrder,
    pub metric: Metric,
}

impl DecodeParams {
    pub fn new(distance_threshold: f64, magnitude_threshold: f64, norm_order: f64, metric: Metric) -> Result<Self> {
        if distance_threshold.is_nan() || distance_threshold < 0.0 {
            return Err(SpotDecodeError::InvalidThreshold {
                name: "distance_threshold",
                value: distance_threshold,
            });
        }
        if magnitude_threshold.is_nan() {
            return Err(SpotDecodeError::InvalidThreshold {
                name: "magnitude_threshold",
                value: magnitude_threshold,
            });
        }
        Ok(Self {
            distance_threshold,
            magnitude_threshold,
            norm_order: NormOrder::new(norm_order)?,
            metric,
        })
    }
}

/// Serializable decode settings, as they appear in a pipeline configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Name of the decoder plug-in, see `decoder_by_name`.
    pub algorithm: String,
    pub metric: String,
    pub distance_threshold: f64,
    pub magnitude_threshold: f64,
    pub norm_order: f64,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            algorithm: MetricDecoder::NAME.to_string(),
            metric: Metric::Euclidean.name().to_string(),
            distance_threshold: 0.5176,
            magnitude_threshold: 1.0,
            norm_order: 2.0,
        }
    }
}

impl DecodeConfig {
    pub fn validate(&self) -> Result<DecodeParams> {
        DecodeParams::new(
            self.distance_threshold,
            self.magnitude_threshold,
            self.norm_order,
            self.metric.parse()?,
        )
    }
}

/// Classifies single pixels against a prepared codebook.
pub trait PixelClassifier: Send + Sync {
    fn classify(&self, pixel: &PixelIntensityVector) -> DecodedPixel;
}

/// A decoder plug-in: turns intensity vectors into decoded pixels.
pub trait Decoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validates the codebook against the pixel dimensionality and builds a classifier.
    fn prepare(&self, codebook: &Codebook, code_length: usize) -> Result<Arc<dyn PixelClassifier>>;

    fn decode(&self, pixels: &PixelIntensities, codebook: &Codebook) -> Result<DecodedPixels> {
        let classifier = self.prepare(codebook, pixels.code_length())?;
        let decoded: Vec<DecodedPixel> = pixels.pixels.iter().map(|pixel| classifier.classify(pixel)).collect();
        let result = DecodedPixels::from_parts(pixels, codebook, decoded);
        debug!(
            "{} assigned {} of {} pixels",
            self.name(),
            result.assigned_count(),
            result.pixels.len()
        );
        Ok(result)
    }
}

fn check_codebook(codebook: &Codebook, code_length: usize) -> Result<()> {
    if codebook.is_empty() {
        return Err(SpotDecodeError::EmptyCodebook);
    }
    if codebook.code_length() != code_length {
        return Err(SpotDecodeError::DimensionMismatch {
            expected: codebook.code_length(),
            found: code_length,
        });
    }
    Ok(())
}

/// Nearest-code decoder under a normalized distance metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDecoder {
    params: DecodeParams,
}

impl MetricDecoder {
    pub const NAME: &'static str = "metric_distance";

    pub fn new(params: DecodeParams) -> Self {
        Self { params }
    }
}

/// Codes normalized once, shared read-only by every pixel lookup.
struct NearestCodeClassifier {
    params: DecodeParams,
    codes: Vec<Vec<f64>>,
}

impl PixelClassifier for NearestCodeClassifier {
    fn classify(&self, pixel: &PixelIntensityVector) -> DecodedPixel {
        let (normalized, magnitude) = self.params.norm_order.normalize(&pixel.values);

        let mut best: Option<(usize, f64)> = None;
        for (index, code) in self.codes.iter().enumerate() {
            let distance = self.params.metric.distance(&normalized, code);
            // a NaN distance never wins
            if best.is_none_or(|(_, closest)| distance < closest - TIE_TOLERANCE) && !distance.is_nan() {
                best = Some((index, distance));
            }
        }

        let (nearest, distance) = match best {
            Some((index, distance)) => (Some(index), distance),
            None => (None, f64::INFINITY),
        };
        let assigned = magnitude > 0.0
            && distance <= self.params.distance_threshold
            && magnitude >= self.params.magnitude_threshold;

        DecodedPixel {
            location: pixel.location,
            target: if assigned { nearest } else { None },
            distance,
            magnitude,
        }
    }
}

impl Decoder for MetricDecoder {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn prepare(&self, codebook: &Codebook, code_length: usize) -> Result<Arc<dyn PixelClassifier>> {
        check_codebook(codebook, code_length)?;
        let codes = codebook
            .entries()
            .iter()
            .map(|entry| self.params.norm_order.normalize(&entry.code).0)
            .collect();
        Ok(Arc::new(NearestCodeClassifier {
            params: self.params,
            codes,
        }))
    }
}

/// Decodes by taking the brightest channel of each round and looking the resulting
/// one-hot pattern up in the codebook. Exact matches have distance 0.
#[derive(Debug, Clone, Copy)]
pub struct PerRoundMaxChannelDecoder {
    magnitude_threshold: f64,
    norm_order: NormOrder,
}

impl PerRoundMaxChannelDecoder {
    pub const NAME: &'static str = "per_round_max_channel";

    pub fn new(magnitude_threshold: f64, norm_order: NormOrder) -> Self {
        Self {
            magnitude_threshold,
            norm_order,
        }
    }
}

struct MaxChannelClassifier {
    magnitude_threshold: f64,
    norm_order: NormOrder,
    n_rounds: usize,
    n_channels: usize,
    signatures: Vec<Vec<Option<usize>>>,
}

impl PixelClassifier for MaxChannelClassifier {
    fn classify(&self, pixel: &PixelIntensityVector) -> DecodedPixel {
        let magnitude = self.norm_order.norm(&pixel.values);
        let signature = max_channel_per_round(&pixel.values, self.n_rounds, self.n_channels);

        let matched = if signature.iter().all(Option::is_some) {
            self.signatures.iter().position(|code| *code == signature)
        } else {
            None
        };
        let target = matched.filter(|_| magnitude > 0.0 && magnitude >= self.magnitude_threshold);

        DecodedPixel {
            location: pixel.location,
            target,
            distance: if matched.is_some() { 0.0 } else { f64::INFINITY },
            magnitude,
        }
    }
}

impl Decoder for PerRoundMaxChannelDecoder {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn prepare(&self, codebook: &Codebook, code_length: usize) -> Result<Arc<dyn PixelClassifier>> {
        check_codebook(codebook, code_length)?;
        let signatures = codebook
            .entries()
            .iter()
            .map(|entry| max_channel_per_round(&entry.code, codebook.n_rounds(), codebook.n_channels()))
            .collect();
        Ok(Arc::new(MaxChannelClassifier {
            magnitude_threshold: self.magnitude_threshold,
            norm_order: self.norm_order,
            n_rounds: codebook.n_rounds(),
            n_channels: codebook.n_channels(),
            signatures,
        }))
    }
}

type DecoderConstructor = fn(&DecodeParams) -> Box<dyn Decoder>;

/// Decoder plug-ins selectable by name.
pub const DECODER_REGISTRY: &[(&str, DecoderConstructor)] = &[
    (MetricDecoder::NAME, metric_decoder),
    (PerRoundMaxChannelDecoder::NAME, per_round_max_channel_decoder),
];

fn metric_decoder(params: &DecodeParams) -> Box<dyn Decoder> {
    Box::new(MetricDecoder::new(*params))
}

fn per_round_max_channel_decoder(params: &DecodeParams) -> Box<dyn Decoder> {
    Box::new(PerRoundMaxChannelDecoder::new(params.magnitude_threshold, params.norm_order))
}

pub fn decoder_by_name(name: &str, params: &DecodeParams) -> Result<Box<dyn Decoder>> {
    DECODER_REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, construct)| construct(params))
        .ok_or_else(|| SpotDecodeError::UnknownAlgorithm(name.to_string()))
}

/// Decodes every pixel against the codebook with the nearest-code decoder.
pub fn decode(pixels: &PixelIntensities, codebook: &Codebook, params: &DecodeParams) -> Result<DecodedPixels> {
    MetricDecoder::new(*params).decode(pixels, codebook)
}
