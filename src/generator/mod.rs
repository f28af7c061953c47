//! Face generators and the operations built on top of them.

pub mod grid;
pub mod stylegan2;

use anyhow::{Result, ensure};
use image::RgbImage;
use serde::Serialize;

use crate::latent::latent_from_seed;

pub use grid::{DEFAULT_COL_STYLES, style_mix_grid};
pub use stylegan2::StyleGan2Generator;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkInfo {
    pub resolution: usize,
    pub mapping_layers: usize,
    pub synthesis_layers: usize,
    pub latent_dim: usize,
    pub conditioning_dim: usize,
    pub device: String,
}

/// Intermediate latent: one `w_dim` style vector per synthesis input.
#[derive(Debug, Clone, PartialEq)]
pub struct WLatent {
    layers: Vec<Vec<f32>>,
}

impl WLatent {
    pub fn new(layers: Vec<Vec<f32>>) -> Self {
        Self { layers }
    }

    /// Repeats a single style vector across `num_ws` layers.
    pub fn broadcast(w: Vec<f32>, num_ws: usize) -> Self {
        Self {
            layers: vec![w; num_ws],
        }
    }

    pub fn num_ws(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, idx: usize) -> &[f32] {
        &self.layers[idx]
    }

    pub fn layers(&self) -> &[Vec<f32>] {
        &self.layers
    }

    /// Copies the listed layers from `other` into a clone of `self`.
    pub fn mix_layers(&self, other: &WLatent, layers: &[usize]) -> Result<WLatent> {
        ensure!(
            self.num_ws() == other.num_ws(),
            "latents have different depths ({} vs {})",
            self.num_ws(),
            other.num_ws()
        );
        let mut mixed = self.clone();
        for &idx in layers {
            ensure!(
                idx < self.num_ws(),
                "style layer {idx} out of range (num_ws = {})",
                self.num_ws()
            );
            mixed.layers[idx] = other.layers[idx].clone();
        }
        Ok(mixed)
    }
}

/// A pretrained generator split into its mapping and synthesis halves.
///
/// Implementations run synchronously; callers on an async runtime are
/// expected to move calls onto a blocking thread.
pub trait FaceGenerator: Send + Sync {
    fn info(&self) -> NetworkInfo;

    /// Maps `z` to an intermediate latent, pulled towards the average
    /// latent by `truncation_psi`.
    fn map(&self, z: &[f32], truncation_psi: f32) -> Result<WLatent>;

    fn synthesize(&self, w: &WLatent) -> Result<RgbImage>;
}

pub fn generate_from_seed(
    generator: &dyn FaceGenerator,
    seed: u32,
    truncation_psi: f32,
) -> Result<RgbImage> {
    let z = latent_from_seed(seed, generator.info().latent_dim);
    let w = generator.map(&z, truncation_psi)?;
    generator.synthesize(&w)
}
