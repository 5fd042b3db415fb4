//! Parameter set loading and validation.
//!
//! A [`WeightSet`] is an immutable mapping from layer identifier to its
//! learned tensors, loaded once at startup and shared read-only across
//! all inference calls. Every accessor fails hard on a missing entry or
//! a shape mismatch: a generator is either constructed from a complete,
//! shape-correct parameter set or not at all. There is deliberately no
//! default-initialized fallback.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::{Array1, ArrayD, IxDyn};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use tracing::info;

use crate::ops::{Conv2d, KERNEL_SIZE};

/// Immutable name -> tensor map backing generator construction.
#[derive(Debug)]
pub struct WeightSet {
    tensors: HashMap<String, ArrayD<f32>>,
}

impl WeightSet {
    /// Reads a safetensors file into memory. Only f32 tensors are
    /// accepted; the file is the converted form of the original torch
    /// checkpoint and keeps its state-dict names.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read weight file: {}", path.display()))?;
        let parsed = SafeTensors::deserialize(&bytes)
            .with_context(|| format!("failed to parse weight file: {}", path.display()))?;

        let mut tensors = HashMap::new();
        for (name, view) in parsed.tensors() {
            if view.dtype() != Dtype::F32 {
                bail!(
                    "weight tensor '{name}' has dtype {:?}, expected F32",
                    view.dtype()
                );
            }

            let data: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            let array = ArrayD::from_shape_vec(IxDyn(view.shape()), data)
                .with_context(|| format!("weight tensor '{name}' has an inconsistent shape"))?;
            tensors.insert(name.to_string(), array);
        }

        info!(
            tensor_count = tensors.len(),
            path = %path.display(),
            "Loaded parameter set"
        );
        Ok(Self { tensors })
    }

    /// Builds a parameter set from in-memory tensors. Used by tools and
    /// tests; validation still happens at accessor time.
    pub fn from_tensors(tensors: HashMap<String, ArrayD<f32>>) -> Self {
        Self { tensors }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Fetches `{name}.weight` / `{name}.bias` and builds the convolution,
    /// checking the exact expected shape. Any deviation is a configuration
    /// error: the caller must refuse to run rather than substitute
    /// defaults.
    pub fn conv(&self, name: &str, out_channels: usize, in_channels: usize) -> Result<Conv2d> {
        let weight_key = format!("{name}.weight");
        let weight = self.entry(&weight_key)?;
        let want = [out_channels, in_channels, KERNEL_SIZE, KERNEL_SIZE];
        if weight.shape() != want {
            bail!(
                "parameter '{weight_key}' has shape {:?}, expected {:?}",
                weight.shape(),
                want
            );
        }

        let bias_key = format!("{name}.bias");
        let bias = self.entry(&bias_key)?;
        if bias.shape() != [out_channels] {
            bail!(
                "parameter '{bias_key}' has shape {:?}, expected [{out_channels}]",
                bias.shape()
            );
        }

        let weight = weight
            .clone()
            .into_dimensionality()
            .with_context(|| format!("parameter '{weight_key}' is not 4-dimensional"))?;
        let bias: Array1<f32> = bias
            .clone()
            .into_dimensionality()
            .with_context(|| format!("parameter '{bias_key}' is not 1-dimensional"))?;
        Conv2d::new(weight, bias)
    }

    fn entry(&self, key: &str) -> Result<&ArrayD<f32>> {
        self.tensors
            .get(key)
            .with_context(|| format!("parameter set is missing entry '{key}'"))
    }
}
