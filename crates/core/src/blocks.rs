//! Dense blocks and residual-in-residual dense blocks (RRDB), the
//! repeating units of the generator trunk.

use anyhow::{bail, Result};
use ndarray::Array4;

use crate::ops::{concat_channels, leaky_relu, Conv2d};

/// Scale applied to a residual branch before adding it back to its
/// input. Keeps deep residual stacks stable.
pub const RESIDUAL_SCALE: f32 = 0.2;

/// Five chained convolutions with channel-concatenation growth.
///
/// Each of c1..c5 produces C output channels; their inputs grow as
/// C, 2C, 3C, 4C, 5C because every stage is fed the concatenation of the
/// block's original input with all previously computed activations, in
/// computation order. That ordering matches the weight layout the
/// parameters were trained against and must never be permuted.
#[derive(Debug)]
pub struct DenseBlock {
    c1: Conv2d,
    c2: Conv2d,
    c3: Conv2d,
    c4: Conv2d,
    c5: Conv2d,
}

impl DenseBlock {
    pub fn new(c1: Conv2d, c2: Conv2d, c3: Conv2d, c4: Conv2d, c5: Conv2d) -> Result<Self> {
        let channels = c1.out_channels();
        let stages = [&c1, &c2, &c3, &c4, &c5];
        for (index, conv) in stages.iter().enumerate() {
            let want_in = (index + 1) * channels;
            if conv.in_channels() != want_in || conv.out_channels() != channels {
                bail!(
                    "DenseBlock: c{} must map {want_in} -> {channels} channels, got {} -> {}",
                    index + 1,
                    conv.in_channels(),
                    conv.out_channels()
                );
            }
        }
        Ok(Self { c1, c2, c3, c4, c5 })
    }

    pub fn channels(&self) -> usize {
        self.c1.out_channels()
    }

    /// Channel-preserving forward pass: output shape equals input shape.
    /// The final convolution carries no activation; its result is scaled
    /// by [`RESIDUAL_SCALE`] and added to the block input.
    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let x1 = leaky_relu(self.c1.forward(x)?);
        let x2 = leaky_relu(self.c2.forward(&concat_channels(&[x, &x1])?)?);
        let x3 = leaky_relu(self.c3.forward(&concat_channels(&[x, &x1, &x2])?)?);
        let x4 = leaky_relu(self.c4.forward(&concat_channels(&[x, &x1, &x2, &x3])?)?);
        let x5 = self.c5.forward(&concat_channels(&[x, &x1, &x2, &x3, &x4])?)?;
        Ok(x + &(x5 * RESIDUAL_SCALE))
    }
}

/// Residual-in-residual dense block: three dense blocks chained, with an
/// outer residual connection scaled by [`RESIDUAL_SCALE`].
#[derive(Debug)]
pub struct Rrdb {
    d1: DenseBlock,
    d2: DenseBlock,
    d3: DenseBlock,
}

impl Rrdb {
    pub fn new(d1: DenseBlock, d2: DenseBlock, d3: DenseBlock) -> Result<Self> {
        let channels = d1.channels();
        if d2.channels() != channels || d3.channels() != channels {
            bail!(
                "Rrdb: dense blocks disagree on channel count ({}, {}, {})",
                channels,
                d2.channels(),
                d3.channels()
            );
        }
        Ok(Self { d1, d2, d3 })
    }

    pub fn forward(&self, x: &Array4<f32>) -> Result<Array4<f32>> {
        let y = self.d3.forward(&self.d2.forward(&self.d1.forward(x)?)?)?;
        Ok(x + &(y * RESIDUAL_SCALE))
    }
}
