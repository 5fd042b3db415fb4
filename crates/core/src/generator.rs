//! The full super-resolution generator: stem convolution, a trunk of
//! 16 RRDBs, a refinement convolution with a long skip back to the
//! stem, two sub-pixel upsample stages, and a final convolution back
//! to RGB.
//!
//! Construction is all-or-nothing: [`Generator::from_weights`] fetches
//! every layer by its checkpoint name with an exact shape check and
//! fails if anything is missing or mismatched, so a generator can never
//! run on a partially populated parameter set.

use std::collections::HashMap;

use anyhow::{bail, Result};
use ndarray::{Array4, ArrayD, IxDyn};

use crate::blocks::{DenseBlock, Rrdb};
use crate::ops::{leaky_relu, pixel_shuffle, Conv2d, KERNEL_SIZE, SHUFFLE_FACTOR};
use crate::weights::WeightSet;

/// Input and output color channels.
pub const COLOR_CHANNELS: usize = 3;

/// Width of the feature maps flowing through the trunk.
pub const FEATURE_CHANNELS: usize = 64;

/// Number of RRDBs in the trunk.
pub const TRUNK_BLOCKS: usize = 16;

/// Net spatial upscale factor: two pixel-shuffle-by-2 stages.
pub const UPSCALE: usize = SHUFFLE_FACTOR * SHUFFLE_FACTOR;

/// Channels fed into each pixel-shuffle stage.
const UPSAMPLE_CHANNELS: usize = FEATURE_CHANNELS * SHUFFLE_FACTOR * SHUFFLE_FACTOR;

#[derive(Debug)]
pub struct Generator {
    stem: Conv2d,
    trunk: Vec<Rrdb>,
    refine: Conv2d,
    up1: Conv2d,
    up2: Conv2d,
    end: Conv2d,
}

impl Generator {
    /// Builds the full network from a parameter set. Layer names follow
    /// the checkpoint's state-dict layout: `start`, `body.{i}.d{j}.c{k}`,
    /// `refine`, `up.0`, `up.3`, `end`.
    pub fn from_weights(weights: &WeightSet) -> Result<Self> {
        let stem = weights.conv("start", FEATURE_CHANNELS, COLOR_CHANNELS)?;

        let mut trunk = Vec::with_capacity(TRUNK_BLOCKS);
        for block in 0..TRUNK_BLOCKS {
            trunk.push(load_rrdb(weights, block)?);
        }

        let refine = weights.conv("refine", FEATURE_CHANNELS, FEATURE_CHANNELS)?;
        let up1 = weights.conv("up.0", UPSAMPLE_CHANNELS, FEATURE_CHANNELS)?;
        let up2 = weights.conv("up.3", UPSAMPLE_CHANNELS, FEATURE_CHANNELS)?;
        let end = weights.conv("end", COLOR_CHANNELS, FEATURE_CHANNELS)?;

        Ok(Self {
            stem,
            trunk,
            refine,
            up1,
            up2,
            end,
        })
    }

    /// Single forward pass: `(1, 3, H, W)` in, `(1, 3, 4H, 4W)` out.
    ///
    /// Pure and stateless; the same input through the same generator
    /// yields bit-identical output.
    pub fn forward(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (_, channels, _, _) = input.dim();
        if channels != COLOR_CHANNELS {
            bail!("generator input must have {COLOR_CHANNELS} channels, got {channels}");
        }

        let stem_features = self.stem.forward(input)?;

        let mut features = stem_features.clone();
        for block in &self.trunk {
            features = block.forward(&features)?;
        }
        let refined = self.refine.forward(&features)?;

        // Long skip from the stem over the whole trunk.
        let features = &stem_features + &refined;

        let features = upsample_stage(&self.up1, &features)?;
        let features = upsample_stage(&self.up2, &features)?;

        self.end.forward(&features)
    }
}

/// One upsample stage: conv to 4x the feature channels, pixel-shuffle
/// back down to the feature width at doubled resolution, then leaky
/// rectification.
fn upsample_stage(conv: &Conv2d, input: &Array4<f32>) -> Result<Array4<f32>> {
    Ok(leaky_relu(pixel_shuffle(&conv.forward(input)?)?))
}

fn load_rrdb(weights: &WeightSet, block: usize) -> Result<Rrdb> {
    Rrdb::new(
        load_dense(weights, block, 1)?,
        load_dense(weights, block, 2)?,
        load_dense(weights, block, 3)?,
    )
}

fn load_dense(weights: &WeightSet, block: usize, dense: usize) -> Result<DenseBlock> {
    let conv = |stage: usize| {
        weights.conv(
            &format!("body.{block}.d{dense}.c{stage}"),
            FEATURE_CHANNELS,
            stage * FEATURE_CHANNELS,
        )
    };
    DenseBlock::new(conv(1)?, conv(2)?, conv(3)?, conv(4)?, conv(5)?)
}

/// An all-zero parameter set covering every layer the generator
/// references. With it, the forward pass is deterministic and reduces
/// to the end-layer bias, which makes it a useful smoke input when no
/// trained checkpoint is at hand.
pub fn zeroed_weights() -> WeightSet {
    WeightSet::from_tensors(zeroed_tensor_map())
}

fn zeroed_tensor_map() -> HashMap<String, ArrayD<f32>> {
    let mut tensors = HashMap::new();
    let mut conv = |name: String, out_ch: usize, in_ch: usize| {
        tensors.insert(
            format!("{name}.weight"),
            ArrayD::zeros(IxDyn(&[out_ch, in_ch, KERNEL_SIZE, KERNEL_SIZE])),
        );
        tensors.insert(format!("{name}.bias"), ArrayD::zeros(IxDyn(&[out_ch])));
    };

    conv("start".to_string(), FEATURE_CHANNELS, COLOR_CHANNELS);
    for block in 0..TRUNK_BLOCKS {
        for dense in 1..=3 {
            for stage in 1..=5 {
                conv(
                    format!("body.{block}.d{dense}.c{stage}"),
                    FEATURE_CHANNELS,
                    stage * FEATURE_CHANNELS,
                );
            }
        }
    }
    conv("refine".to_string(), FEATURE_CHANNELS, FEATURE_CHANNELS);
    conv("up.0".to_string(), UPSAMPLE_CHANNELS, FEATURE_CHANNELS);
    conv("up.3".to_string(), UPSAMPLE_CHANNELS, FEATURE_CHANNELS);
    conv("end".to_string(), COLOR_CHANNELS, FEATURE_CHANNELS);

    tensors
}
