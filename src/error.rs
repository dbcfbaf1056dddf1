// THEORY:
// Every failure the decoder can report lives in this single enum. The pipeline is
// a pure, deterministic computation, so errors fall into a small number of buckets:
//
// 1.  **Configuration errors**: the inputs can never produce a valid run (empty
//     codebook, bad norm order, inverted area bounds, ...). These are detected before
//     a single pixel is touched.
// 2.  **Shape errors**: the data handed to a stage does not line up with what the
//     previous stage or the codebook promised.
// 3.  **IO / serialization errors**: only raised by the persistence helpers at the
//     edges of the crate.
//
// Per-pixel outcomes (a pixel that is too dim, too far from every code, or part of a
// feature that is too small) are NOT errors and never flow through this type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpotDecodeError>;

#[derive(Debug, Error)]
pub enum SpotDecodeError {
    #[error("codebook has no entries")]
    EmptyCodebook,
    #[error("duplicate target name in codebook: {0}")]
    DuplicateTarget(String),
    #[error("code for target {target} has {found} values, expected {expected}")]
    CodeShapeMismatch {
        target: String,
        expected: usize,
        found: usize,
    },
    #[error("invalid codebook: {0}")]
    InvalidCodebook(String),
    #[error("norm order must be >= 1, got {0}")]
    InvalidNormOrder(f64),
    #[error("unknown distance metric: {0}")]
    UnknownMetric(String),
    #[error("unknown algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("invalid threshold {name}: {value}")]
    InvalidThreshold { name: &'static str, value: f64 },
    #[error("unsupported connectivity: {0} neighbours")]
    InvalidConnectivity(u8),
    #[error("area bound must be non-negative, got {0}")]
    NegativeArea(i64),
    #[error("min_area ({min}) is greater than max_area ({max})")]
    InvalidAreaBounds { min: usize, max: usize },
    #[error("crop of {margin} on axis {axis} removes the whole axis of size {size}")]
    CropTooLarge {
        axis: &'static str,
        margin: usize,
        size: usize,
    },
    #[error("pixel vectors have {found} values but the codebook expects {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("tensor shape error: {0}")]
    TensorShape(String),
    #[error("decoded grid has {found} pixels, expected {expected}")]
    GridSizeMismatch { expected: usize, found: usize },
    #[error("decode worker failed: {0}")]
    WorkerFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl SpotDecodeError {
    /// True for errors caused by invalid configuration rather than by the data.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SpotDecodeError::EmptyCodebook
                | SpotDecodeError::DuplicateTarget(_)
                | SpotDecodeError::CodeShapeMismatch { .. }
                | SpotDecodeError::InvalidCodebook(_)
                | SpotDecodeError::InvalidNormOrder(_)
                | SpotDecodeError::UnknownMetric(_)
                | SpotDecodeError::UnknownAlgorithm(_)
                | SpotDecodeError::InvalidThreshold { .. }
                | SpotDecodeError::InvalidConnectivity(_)
                | SpotDecodeError::NegativeArea(_)
                | SpotDecodeError::InvalidAreaBounds { .. }
                | SpotDecodeError::CropTooLarge { .. }
        )
    }
}
