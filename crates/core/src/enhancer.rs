//! End-to-end enhancement: packed RGB in, 4x upscaled packed RGB out.

use anyhow::{Context, Result};
use tracing::debug;

use crate::generator::Generator;
use crate::pipeline::{postprocess, preprocess, PixelBuffer};
use crate::weights::WeightSet;

/// Owns a constructed generator and runs the full image pipeline around
/// it. Enhancement takes `&self`, so one instance can be shared across
/// callers; admission control lives at the service layer.
pub struct Enhancer {
    generator: Generator,
}

impl Enhancer {
    pub fn from_weights(weights: &WeightSet) -> Result<Self> {
        let generator =
            Generator::from_weights(weights).context("failed to construct generator")?;
        Ok(Self { generator })
    }

    /// Runs preprocess, the generator forward pass, and postprocess.
    /// The output is exactly 4x the input in both dimensions.
    pub fn enhance(&self, image: &PixelBuffer) -> Result<PixelBuffer> {
        let started = std::time::Instant::now();

        let tensor = preprocess(image);
        let upscaled = self.generator.forward(&tensor)?;
        let output = postprocess(&upscaled)?;

        debug!(
            input_width = image.width,
            input_height = image.height,
            output_width = output.width,
            output_height = output.height,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Enhanced image"
        );
        Ok(output)
    }
}
