// This file is an example of how to use the `spot_decoder` library.
// The main library entry point is `src/lib.rs`.
//
// Usage: spot_decoder [config.json] [features.json]
// Without arguments the default configuration is used and the table is only logged.

use flexi_logger::Logger;
use log::info;
use spot_decoder::{Codebook, ImageVolume, ParallelSpotDetector, PipelineConfig, VolumeShape};
use std::error::Error;
use std::sync::Arc;

const SPOT_SIZE: usize = 3;
const SPOT_BRIGHTNESS: f32 = 5.0;

/// A blank volume with one square spot per codebook entry, placed along the diagonal.
fn synthetic_volume(codebook: &Codebook) -> spot_decoder::Result<ImageVolume> {
    let side = (SPOT_SIZE + 1) * codebook.len() + 1;
    let shape = VolumeShape {
        rounds: codebook.n_rounds(),
        channels: codebook.n_channels(),
        z: 1,
        y: side,
        x: side,
    };
    let plane = side * side;
    let mut data = vec![0.0f32; shape.code_length() * plane];
    for (k, entry) in codebook.entries().iter().enumerate() {
        let corner = 1 + k * (SPOT_SIZE + 1);
        for (slot, weight) in entry.code.iter().enumerate() {
            for y in corner..corner + SPOT_SIZE {
                for x in corner..corner + SPOT_SIZE {
                    data[slot * plane + y * side + x] = weight * SPOT_BRIGHTNESS;
                }
            }
        }
    }
    ImageVolume::new(shape, data)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _logger = Logger::try_with_str("info")?.log_to_stderr().start()?;
    info!("Spot Decoder - Example Runner");

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    config.validate()?;

    let codebook = Arc::new(Codebook::synthetic_one_hot(3, 4, 6, None)?);
    let volume = Arc::new(synthetic_volume(&codebook)?);

    let detector = ParallelSpotDetector::from_config(&config)?;
    info!("decoding on {} workers", detector.pool().workers());
    let (table, result) = detector.run(volume, codebook).await?;

    for (target, count) in table.counts_by_target() {
        info!("{target}: {count} spots");
    }
    info!(
        "{} features kept, {} removed by the area filter",
        result.features.len(),
        result.filtered_feature_ids.len()
    );

    if let Some(path) = args.next() {
        table.save_json(&path)?;
        info!("feature table written to {path}");
    }
    Ok(())
}
