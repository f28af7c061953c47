//! facegen - StyleGAN2 face synthesis behind a small web API
//!
//! This library provides the generation pipeline (seeds, caching, style-mix
//! grids, Real-ESRGAN enhancement) and the HTTP layer serving it.

pub mod api;
pub mod cache;
pub mod config;
pub mod device;
pub mod enhancer;
pub mod generator;
pub mod latent;
pub mod models;
pub mod service;

use std::sync::OnceLock;

use directories::ProjectDirs;

pub use cache::ImageCache;
pub use config::Settings;
pub use enhancer::Enhancer;
pub use generator::{FaceGenerator, NetworkInfo, WLatent};
pub use models::{WeightFile, WeightSource, WeightStore, WeightStoreBuilder};
pub use service::{Enhancement, GenerationService, GenerationServiceBuilder, GridImage, SingleImage};

static PROJECT_DIR: OnceLock<Option<ProjectDirs>> = OnceLock::new();

pub(crate) fn get_project_dir() -> Option<&'static ProjectDirs> {
    let dir = PROJECT_DIR.get_or_init(|| ProjectDirs::from("", "", "facegen"));
    dir.as_ref()
}
