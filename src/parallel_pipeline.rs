// THEORY:
// Decoding is the expensive stage of the pipeline and every pixel is decoded on its
// own, so it parallelizes without coordination. This module runs the decode stage on a
// pool of tokio blocking workers and leaves everything else to the sequential detector.
//
// Key architectural principles:
// 1.  **Contiguous Batches**: The raster-ordered pixels are cut into one contiguous
//     batch per worker. Batches are joined back in submission order, so the decoded grid
//     is identical to the one the sequential path produces.
// 2.  **Shared, Read-Only Codebook**: The codebook is prepared once into a classifier
//     and shared by every worker through an `Arc`. Workers hold no mutable state.
// 3.  **Same Barrier**: Aggregation starts only after every batch has come back.
// 4.  **Nothing Blocks the Runtime**: Vectorizing and aggregating run on blocking
//     workers as well, so an async caller never waits on CPU-bound work inline.

use crate::core_modules::codebook::Codebook;
use crate::core_modules::metric_decoder::{DecodedPixel, DecodedPixels, Decoder};
use crate::core_modules::pixel_vectorizer::PixelIntensities;
use crate::core_modules::tensor::ImageVolume;
use crate::error::{Result, SpotDecodeError};
use crate::pipeline::{PipelineConfig, PixelSpotDetector, SpotCalls};
use futures::future::try_join_all;
use log::debug;
use std::sync::Arc;
use tokio::task::JoinError;

/// Runs a decoder over pixel batches on tokio's blocking thread pool.
#[derive(Debug, Clone, Copy)]
pub struct DecodeWorkerPool {
    workers: usize,
}

impl DecodeWorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn decode(
        &self,
        decoder: &dyn Decoder,
        pixels: Arc<PixelIntensities>,
        codebook: &Codebook,
    ) -> Result<DecodedPixels> {
        let classifier = decoder.prepare(codebook, pixels.code_length())?;
        let batch_size = pixels.len().div_ceil(self.workers).max(1);

        let batches = (0..pixels.len()).step_by(batch_size).map(|start| {
            let classifier = Arc::clone(&classifier);
            let pixels = Arc::clone(&pixels);
            tokio::task::spawn_blocking(move || {
                let end = (start + batch_size).min(pixels.len());
                pixels.pixels[start..end]
                    .iter()
                    .map(|pixel| classifier.classify(pixel))
                    .collect::<Vec<DecodedPixel>>()
            })
        });

        let decoded: Vec<DecodedPixel> = try_join_all(batches)
            .await
            .map_err(worker_failed)?
            .into_iter()
            .flatten()
            .collect();

        debug!(
            "{} decoded {} pixels on {} workers in batches of {}",
            decoder.name(),
            decoded.len(),
            self.workers,
            batch_size
        );
        Ok(DecodedPixels::from_parts(&pixels, codebook, decoded))
    }
}

impl Default for DecodeWorkerPool {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

fn worker_failed(error: JoinError) -> SpotDecodeError {
    SpotDecodeError::WorkerFailed(error.to_string())
}

/// The pixel spot detector with its decode stage spread over a worker pool.
pub struct ParallelSpotDetector {
    detector: Arc<PixelSpotDetector>,
    pool: DecodeWorkerPool,
}

impl ParallelSpotDetector {
    pub fn new(detector: PixelSpotDetector, pool: DecodeWorkerPool) -> Self {
        Self {
            detector: Arc::new(detector),
            pool,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Ok(Self::new(PixelSpotDetector::from_config(config)?, DecodeWorkerPool::default()))
    }

    pub fn pool(&self) -> &DecodeWorkerPool {
        &self.pool
    }

    /// Runs the whole pipeline. Every stage runs on a blocking worker.
    pub async fn run(&self, volume: Arc<ImageVolume>, codebook: Arc<Codebook>) -> Result<SpotCalls> {
        // Stage 1: Crop + Vectorize
        let detector = Arc::clone(&self.detector);
        let prepared = Arc::clone(&codebook);
        let intensities = tokio::task::spawn_blocking(move || detector.prepare(&volume, &prepared))
            .await
            .map_err(worker_failed)??;
        let intensities = Arc::new(intensities);

        // Stage 2: Decode
        let decoded = self
            .pool
            .decode(self.detector.decoder().as_ref(), Arc::clone(&intensities), &codebook)
            .await?;

        // Stage 3 + 4: Aggregate + Tabulate
        let detector = Arc::clone(&self.detector);
        tokio::task::spawn_blocking(move || detector.finish(&intensities, &decoded))
            .await
            .map_err(worker_failed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::metric_decoder::{DecodeParams, MetricDecoder};
    use crate::core_modules::metric::Metric;
    use crate::core_modules::pixel_vectorizer::PixelVectorizer;
    use crate::core_modules::tensor::VolumeShape;

    fn noisy_volume() -> ImageVolume {
        let shape = VolumeShape {
            rounds: 2,
            channels: 2,
            z: 2,
            y: 5,
            x: 7,
        };
        let len = shape.code_length() * shape.spatial().volume();
        // deterministic pseudo-random values
        let data = (0..len).map(|i| ((i * 37 + 11) % 17) as f32 / 4.0).collect();
        ImageVolume::new(shape, data).unwrap()
    }

    #[tokio::test]
    async fn pool_matches_sequential_decode() {
        let volume = noisy_volume();
        let codebook = Codebook::synthetic_one_hot(2, 2, 4, None).unwrap();
        let intensities = PixelVectorizer::default().vectorize(&volume).unwrap();
        let params = DecodeParams::new(0.8, 0.5, 2.0, Metric::Euclidean).unwrap();
        let decoder = MetricDecoder::new(params);

        let sequential = decoder.decode(&intensities, &codebook).unwrap();
        for workers in [1, 3, 8, 200] {
            let parallel = DecodeWorkerPool::new(workers)
                .decode(&decoder, Arc::new(intensities.clone()), &codebook)
                .await
                .unwrap();
            assert_eq!(parallel, sequential);
        }
    }

    #[tokio::test]
    async fn parallel_detector_matches_sequential_detector() {
        let volume = noisy_volume();
        let codebook = Codebook::synthetic_one_hot(2, 2, 4, None).unwrap();
        let mut config = PipelineConfig::default();
        config.decode.distance_threshold = 0.8;
        config.aggregate.min_area = 1;

        let sequential = PixelSpotDetector::from_config(&config)
            .unwrap()
            .run(&volume, &codebook)
            .unwrap();
        let parallel = ParallelSpotDetector::new(PixelSpotDetector::from_config(&config).unwrap(), DecodeWorkerPool::new(4))
            .run(Arc::new(volume), Arc::new(codebook))
            .await
            .unwrap();
        assert_eq!(parallel, sequential);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn run_completes_on_a_single_threaded_runtime() {
        let volume = Arc::new(noisy_volume());
        let codebook = Arc::new(Codebook::synthetic_one_hot(2, 2, 4, None).unwrap());
        let mut config = PipelineConfig::default();
        config.decode.distance_threshold = 0.8;
        config.aggregate.min_area = 1;
        let expected = PixelSpotDetector::from_config(&config)
            .unwrap()
            .run(&volume, &codebook)
            .unwrap();

        let detector = ParallelSpotDetector::new(PixelSpotDetector::from_config(&config).unwrap(), DecodeWorkerPool::new(2));
        // a second task on the same thread makes progress while the pipeline works
        let (calls, ticks) = tokio::join!(detector.run(Arc::clone(&volume), Arc::clone(&codebook)), async {
            let mut ticks = 0;
            for _ in 0..3 {
                tokio::task::yield_now().await;
                ticks += 1;
            }
            ticks
        });
        assert_eq!(calls.unwrap(), expected);
        assert_eq!(ticks, 3);
    }

    #[tokio::test]
    async fn empty_codebook_fails_before_workers_start() {
        let volume = noisy_volume();
        let codebook = Codebook::new(2, 2, Vec::new()).unwrap();
        let detector = ParallelSpotDetector::from_config(&PipelineConfig::default()).unwrap();
        assert!(detector.pool().workers() >= 1);
        let error = detector.run(Arc::new(volume), Arc::new(codebook)).await.unwrap_err();
        assert!(matches!(error, SpotDecodeError::EmptyCodebook));
    }
}
