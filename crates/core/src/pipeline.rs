//! Conversions between packed 8-bit RGB images and the float tensors
//! the generator consumes.
//!
//! Preprocessing and postprocessing are exact inverses up to 8-bit
//! quantization: a round trip through both changes no pixel component
//! by more than one count.

use anyhow::{bail, Result};
use ndarray::Array4;

use crate::generator::COLOR_CHANNELS;

/// A packed interleaved RGB image, 8 bits per component, row-major.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl PixelBuffer {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("image dimensions must be nonzero, got {width}x{height}");
        }
        let expected = width as usize * height as usize * COLOR_CHANNELS;
        if data.len() != expected {
            bail!(
                "pixel data length {} does not match {width}x{height} RGB ({expected} bytes)",
                data.len()
            );
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }
}

/// HWC u8 -> NCHW f32 in `[0, 1]`, with a leading batch axis of 1.
pub fn preprocess(image: &PixelBuffer) -> Array4<f32> {
    let width = image.width as usize;
    let height = image.height as usize;
    let plane = width * height;

    let mut planes = vec![0.0f32; plane * COLOR_CHANNELS];
    for (pixel, rgb) in image.data.chunks_exact(COLOR_CHANNELS).enumerate() {
        for (channel, &component) in rgb.iter().enumerate() {
            planes[channel * plane + pixel] = f32::from(component) / 255.0;
        }
    }

    let mut tensor = Array4::<f32>::zeros((1, COLOR_CHANNELS, height, width));
    for (slot, value) in tensor.iter_mut().zip(planes) {
        *slot = value;
    }
    tensor
}

/// NCHW f32 -> HWC u8: scale by 255, clamp to `[0, 255]`, truncate.
///
/// Non-finite activations mean the parameter set or arithmetic has gone
/// wrong; the conversion refuses to emit an image rather than mask the
/// corruption.
pub fn postprocess(tensor: &Array4<f32>) -> Result<PixelBuffer> {
    let (batch, channels, height, width) = tensor.dim();
    if batch != 1 {
        bail!("output tensor must have batch size 1, got {batch}");
    }
    if channels != COLOR_CHANNELS {
        bail!("output tensor must have {COLOR_CHANNELS} channels, got {channels}");
    }

    let plane = width * height;
    let flat = match tensor.as_slice() {
        Some(flat) => flat,
        None => bail!("output tensor is not contiguous"),
    };
    for &v in flat {
        if !v.is_finite() {
            bail!("output tensor contains a non-finite value ({v})");
        }
    }

    let mut data = vec![0u8; plane * COLOR_CHANNELS];
    for pixel in 0..plane {
        for channel in 0..COLOR_CHANNELS {
            let scaled = (flat[channel * plane + pixel] * 255.0).clamp(0.0, 255.0);
            data[pixel * COLOR_CHANNELS + channel] = scaled as u8;
        }
    }

    PixelBuffer::new(data, width as u32, height as u32)
}
