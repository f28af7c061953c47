#![allow(dead_code)]

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use facegen::{
    FaceGenerator, GenerationService, GenerationServiceBuilder, NetworkInfo, WLatent,
    enhancer::Enhancer,
};
use image::{Rgb, RgbImage};

pub const TILE: u32 = 8;
pub const NUM_WS: usize = 8;

/// Paints each face a flat color derived from its latent.
#[derive(Default)]
pub struct FakeGenerator {
    synth_calls: AtomicUsize,
}

impl FakeGenerator {
    pub fn synth_calls(&self) -> usize {
        self.synth_calls.load(Ordering::SeqCst)
    }
}

impl FaceGenerator for FakeGenerator {
    fn info(&self) -> NetworkInfo {
        NetworkInfo {
            resolution: TILE as usize,
            mapping_layers: 2,
            synthesis_layers: NUM_WS,
            latent_dim: 4,
            conditioning_dim: 0,
            device: "cpu".to_string(),
        }
    }

    fn map(&self, z: &[f32], truncation_psi: f32) -> Result<WLatent> {
        let w: Vec<f32> = z.iter().map(|v| v * truncation_psi).collect();
        Ok(WLatent::broadcast(w, NUM_WS))
    }

    fn synthesize(&self, w: &WLatent) -> Result<RgbImage> {
        self.synth_calls.fetch_add(1, Ordering::SeqCst);
        // Widen the window for concurrent requests to overlap.
        std::thread::sleep(Duration::from_millis(20));
        let shade = |v: f32| ((v.abs() * 97.0) as u32 % 256) as u8;
        let first = w.layer(0);
        Ok(RgbImage::from_pixel(
            TILE,
            TILE,
            Rgb([shade(first[0]), shade(first[1]), shade(w.layer(NUM_WS - 1)[2])]),
        ))
    }
}

pub fn service(output_dir: &Path, generator: Arc<FakeGenerator>) -> GenerationService {
    GenerationServiceBuilder::new(generator)
        .with_output_dir(output_dir.to_path_buf())
        .build()
        .unwrap()
}

pub fn service_with_enhancer(
    output_dir: &Path,
    generator: Arc<FakeGenerator>,
    enhancer: Arc<dyn Enhancer>,
) -> GenerationService {
    GenerationServiceBuilder::new(generator)
        .with_output_dir(output_dir.to_path_buf())
        .with_enhancer(enhancer)
        .build()
        .unwrap()
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
