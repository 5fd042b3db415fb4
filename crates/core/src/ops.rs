//! Tensor primitives for the generator: 3x3 convolution, leaky
//! rectification, channel concatenation, and pixel-shuffle rearrangement.
//!
//! All tensors are NCHW `Array4<f32>` with batch fixed at 1. Hot loops
//! index flat slices with `channel * hw + y * w + x` offsets instead of
//! going through `ndarray` element access.

use std::borrow::Cow;

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array4, ArrayView4, Axis};

/// Negative-input slope for leaky rectification.
pub const LEAKY_SLOPE: f32 = 0.2;

/// Spatial kernel size of every convolution in the network.
pub const KERNEL_SIZE: usize = 3;

/// Pixel-shuffle factor: each upsample stage doubles H and W.
pub const SHUFFLE_FACTOR: usize = 2;

/// A learned 3x3 filter bank with padding 1 and stride 1, so spatial
/// dimensions are preserved.
#[derive(Debug)]
pub struct Conv2d {
    weight: Array4<f32>,
    bias: Array1<f32>,
}

impl Conv2d {
    pub fn new(weight: Array4<f32>, bias: Array1<f32>) -> Result<Self> {
        let (out_ch, _in_ch, kh, kw) = weight.dim();
        if kh != KERNEL_SIZE || kw != KERNEL_SIZE {
            bail!("Conv2d: expected a {KERNEL_SIZE}x{KERNEL_SIZE} kernel, got {kh}x{kw}");
        }
        if bias.len() != out_ch {
            bail!(
                "Conv2d: bias length {} does not match {} output channels",
                bias.len(),
                out_ch
            );
        }
        Ok(Self { weight, bias })
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    /// Applies the filter bank to a `(1, Cin, H, W)` tensor, producing
    /// `(1, Cout, H, W)`. Zero-padding of 1 on each spatial edge keeps H
    /// and W unchanged. Fails if the input channel count does not match
    /// the filter's declared input channels.
    pub fn forward(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (batch, in_ch, h, w) = input.dim();
        if batch != 1 {
            bail!("Conv2d: expected batch dimension 1, got {batch}");
        }
        let want_in = self.in_channels();
        if in_ch != want_in {
            bail!("Conv2d: input has {in_ch} channels, filter expects {want_in}");
        }
        if h == 0 || w == 0 {
            bail!("Conv2d: input has a zero-sized spatial dimension ({h}x{w})");
        }

        let out_ch = self.out_channels();
        let hw = h * w;

        let src = flat_slice(input);
        let taps = flat_slice(&self.weight);

        let mut out = vec![0.0f32; out_ch * hw];
        for co in 0..out_ch {
            let out_plane = &mut out[co * hw..(co + 1) * hw];
            out_plane.fill(self.bias[co]);

            for ci in 0..in_ch {
                let in_plane = &src[ci * hw..(ci + 1) * hw];
                let kernel = &taps[(co * in_ch + ci) * 9..(co * in_ch + ci) * 9 + 9];

                for ky in 0..KERNEL_SIZE {
                    for kx in 0..KERNEL_SIZE {
                        let tap = kernel[ky * KERNEL_SIZE + kx];
                        if tap == 0.0 {
                            continue;
                        }

                        // Output (y, x) reads input (y + ky - 1, x + kx - 1);
                        // rows and columns falling outside the input are the
                        // zero-padded border and contribute nothing.
                        let y_range = offset_range(ky, h);
                        let x_range = offset_range(kx, w);
                        for y in y_range {
                            let sy = y + ky - 1;
                            let out_row = &mut out_plane[y * w..y * w + w];
                            let in_row = &in_plane[sy * w..sy * w + w];
                            for x in x_range.clone() {
                                out_row[x] += tap * in_row[x + kx - 1];
                            }
                        }
                    }
                }
            }
        }

        Array4::from_shape_vec((1, out_ch, h, w), out)
            .context("Conv2d: failed to assemble output tensor")
    }
}

/// Output index range for which `index + kernel_offset - 1` stays inside
/// a dimension of length `len`.
fn offset_range(kernel_offset: usize, len: usize) -> std::ops::Range<usize> {
    let lo = 1usize.saturating_sub(kernel_offset);
    let hi = (len + 1).saturating_sub(kernel_offset).min(len);
    lo..hi
}

/// Borrows the tensor's backing storage when it is already contiguous,
/// otherwise copies it into row-major order.
fn flat_slice(tensor: &Array4<f32>) -> Cow<'_, [f32]> {
    match tensor.as_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(tensor.iter().copied().collect()),
    }
}

/// Leaky rectified linear unit: positive values pass unchanged, negative
/// values are scaled by [`LEAKY_SLOPE`].
pub fn leaky_relu(mut tensor: Array4<f32>) -> Array4<f32> {
    tensor.mapv_inplace(|v| if v >= 0.0 { v } else { LEAKY_SLOPE * v });
    tensor
}

/// Concatenates tensors along the channel axis, in argument order.
///
/// The order is load-bearing: dense blocks feed `(input, x1, x2, ...)`
/// into weights trained against exactly that layout, and a permutation
/// produces shape-valid but wrong results.
pub fn concat_channels(parts: &[&Array4<f32>]) -> Result<Array4<f32>> {
    let views: Vec<ArrayView4<f32>> = parts.iter().map(|p| p.view()).collect();
    ndarray::concatenate(Axis(1), &views).context("channel concatenation failed")
}

/// Sub-pixel rearrangement by 2: `(1, 4K, H, W)` becomes `(1, K, 2H, 2W)`
/// by distributing each group of 4 channels into a 2x2 spatial block.
/// Deterministic and lossless in element count.
pub fn pixel_shuffle(input: &Array4<f32>) -> Result<Array4<f32>> {
    let r = SHUFFLE_FACTOR;
    let (batch, c, h, w) = input.dim();
    if batch != 1 {
        bail!("pixel_shuffle: expected batch dimension 1, got {batch}");
    }
    if c % (r * r) != 0 {
        bail!("pixel_shuffle: channel count {c} is not divisible by {}", r * r);
    }

    let out_c = c / (r * r);
    let (out_h, out_w) = (h * r, w * r);
    let hw = h * w;
    let out_hw = out_h * out_w;

    let src = flat_slice(input);

    let mut out = vec![0.0f32; out_c * out_hw];
    for k in 0..out_c {
        for dy in 0..r {
            for dx in 0..r {
                let in_plane = &src[(k * r * r + dy * r + dx) * hw..][..hw];
                for y in 0..h {
                    let out_row = &mut out[k * out_hw + (y * r + dy) * out_w..][..out_w];
                    let in_row = &in_plane[y * w..y * w + w];
                    for x in 0..w {
                        out_row[x * r + dx] = in_row[x];
                    }
                }
            }
        }
    }

    Array4::from_shape_vec((1, out_c, out_h, out_w), out)
        .context("pixel_shuffle: failed to assemble output tensor")
}

/// Inverse of [`pixel_shuffle`]: `(1, K, 2H, 2W)` back to `(1, 4K, H, W)`.
pub fn space_to_depth(input: &Array4<f32>) -> Result<Array4<f32>> {
    let r = SHUFFLE_FACTOR;
    let (batch, c, h, w) = input.dim();
    if batch != 1 {
        bail!("space_to_depth: expected batch dimension 1, got {batch}");
    }
    if h % r != 0 || w % r != 0 {
        bail!("space_to_depth: spatial dimensions {h}x{w} are not divisible by {r}");
    }

    let out_c = c * r * r;
    let (out_h, out_w) = (h / r, w / r);
    let hw = h * w;
    let out_hw = out_h * out_w;

    let src = flat_slice(input);

    let mut out = vec![0.0f32; out_c * out_hw];
    for k in 0..c {
        let in_plane = &src[k * hw..(k + 1) * hw];
        for dy in 0..r {
            for dx in 0..r {
                let out_plane = &mut out[(k * r * r + dy * r + dx) * out_hw..][..out_hw];
                for y in 0..out_h {
                    let in_row = &in_plane[(y * r + dy) * w..(y * r + dy) * w + w];
                    let out_row = &mut out_plane[y * out_w..y * out_w + out_w];
                    for x in 0..out_w {
                        out_row[x] = in_row[x * r + dx];
                    }
                }
            }
        }
    }

    Array4::from_shape_vec((1, out_c, out_h, out_w), out)
        .context("space_to_depth: failed to assemble output tensor")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn identity_conv(channels: usize) -> Conv2d {
        let mut weight = Array4::<f32>::zeros((channels, channels, 3, 3));
        for c in 0..channels {
            weight[[c, c, 1, 1]] = 1.0;
        }
        Conv2d::new(weight, Array1::zeros(channels)).expect("identity conv")
    }

    fn ramp(c: usize, h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, c, h, w), |(_, ci, y, x)| {
            (ci * h * w + y * w + x) as f32
        })
    }

    #[test]
    fn identity_kernel_preserves_input() {
        let input = ramp(2, 4, 5);
        let output = identity_conv(2).forward(&input).expect("forward");
        assert_eq!(output, input);
    }

    #[test]
    fn conv_preserves_spatial_dimensions() {
        let weight = Array4::<f32>::from_elem((8, 3, 3, 3), 0.5);
        let conv = Conv2d::new(weight, Array1::zeros(8)).expect("conv");
        let output = conv.forward(&ramp(3, 6, 9)).expect("forward");
        assert_eq!(output.dim(), (1, 8, 6, 9));
    }

    #[test]
    fn zero_padding_shrinks_border_sums() {
        // All-ones kernel over an all-ones input counts in-bounds taps:
        // 9 in the interior, 6 on edges, 4 in corners.
        let weight = Array4::<f32>::ones((1, 1, 3, 3));
        let conv = Conv2d::new(weight, Array1::zeros(1)).expect("conv");
        let input = Array4::<f32>::ones((1, 1, 3, 3));
        let output = conv.forward(&input).expect("forward");

        assert_eq!(output[[0, 0, 1, 1]], 9.0);
        assert_eq!(output[[0, 0, 0, 1]], 6.0);
        assert_eq!(output[[0, 0, 0, 0]], 4.0);
        assert_eq!(output[[0, 0, 2, 2]], 4.0);
    }

    #[test]
    fn bias_fills_output_when_weights_are_zero() {
        let weight = Array4::<f32>::zeros((2, 1, 3, 3));
        let bias = Array1::from_vec(vec![1.5, -3.0]);
        let conv = Conv2d::new(weight, bias).expect("conv");
        let output = conv.forward(&ramp(1, 2, 2)).expect("forward");

        assert!(output.slice(ndarray::s![0, 0, .., ..]).iter().all(|&v| v == 1.5));
        assert!(output.slice(ndarray::s![0, 1, .., ..]).iter().all(|&v| v == -3.0));
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let conv = identity_conv(4);
        let err = conv.forward(&ramp(3, 2, 2)).unwrap_err();
        assert!(err.to_string().contains("filter expects 4"));
    }

    #[test]
    fn non_square_kernel_is_rejected() {
        let weight = Array4::<f32>::zeros((1, 1, 3, 5));
        assert!(Conv2d::new(weight, Array1::zeros(1)).is_err());
    }

    #[test]
    fn leaky_relu_scales_only_negatives() {
        let input = Array4::from_shape_vec(
            (1, 1, 1, 4),
            vec![-1.0, 0.0, 0.5, -10.0],
        )
        .expect("shape");
        let output = leaky_relu(input);
        let expected = [-0.2, 0.0, 0.5, -2.0];
        for (got, want) in output.iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn concat_stacks_channels_in_argument_order() {
        let a = Array4::from_elem((1, 1, 2, 2), 1.0);
        let b = Array4::from_elem((1, 2, 2, 2), 2.0);
        let out = concat_channels(&[&a, &b]).expect("concat");
        assert_eq!(out.dim(), (1, 3, 2, 2));
        assert_eq!(out[[0, 0, 0, 0]], 1.0);
        assert_eq!(out[[0, 1, 0, 0]], 2.0);
        assert_eq!(out[[0, 2, 1, 1]], 2.0);
    }

    #[test]
    fn pixel_shuffle_places_channel_groups_into_spatial_blocks() {
        // One output channel from 4 input channels of constant value:
        // channel i lands at spatial offset (i / 2, i % 2) of each block.
        let mut input = Array4::<f32>::zeros((1, 4, 1, 2));
        for c in 0..4 {
            input
                .slice_mut(ndarray::s![0, c, .., ..])
                .fill(c as f32);
        }
        let out = pixel_shuffle(&input).expect("shuffle");
        assert_eq!(out.dim(), (1, 1, 2, 4));
        assert_eq!(out[[0, 0, 0, 0]], 0.0);
        assert_eq!(out[[0, 0, 0, 1]], 1.0);
        assert_eq!(out[[0, 0, 1, 0]], 2.0);
        assert_eq!(out[[0, 0, 1, 1]], 3.0);
        assert_eq!(out[[0, 0, 0, 2]], 0.0);
        assert_eq!(out[[0, 0, 1, 3]], 3.0);
    }

    #[test]
    fn pixel_shuffle_round_trips_through_space_to_depth() {
        for &(k, h, w) in &[(1usize, 1usize, 1usize), (3, 2, 5), (16, 4, 3)] {
            let input = ramp(4 * k, h, w);
            let shuffled = pixel_shuffle(&input).expect("shuffle");
            assert_eq!(shuffled.dim(), (1, k, 2 * h, 2 * w));
            let restored = space_to_depth(&shuffled).expect("inverse");
            assert_eq!(restored, input);
        }
    }

    #[test]
    fn pixel_shuffle_rejects_indivisible_channel_count() {
        let input = ramp(6, 2, 2);
        assert!(pixel_shuffle(&input).is_err());
    }
}
