use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::{ColorType, ImageEncoder, ImageFormat, RgbImage, codecs::png::PngEncoder};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::{
    cache::ImageCache,
    enhancer::Enhancer,
    generator::{DEFAULT_COL_STYLES, FaceGenerator, NetworkInfo, generate_from_seed, style_mix_grid},
    latent::random_seed,
};

/// Public path of the output directory.
const URL_PREFIX: &str = "/static/generated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enhancement {
    Cached,
    FaceEnhanced,
    GridEnhanced,
    None,
}

#[derive(Debug, Clone)]
pub struct SingleImage {
    pub seed: u32,
    pub filename: String,
    /// Public URL, only set when the image is stored on disk.
    pub url: Option<String>,
    pub enhancement: Enhancement,
    pub truncation_psi: f32,
    pub timestamp: DateTime<Utc>,
    pub image: RgbImage,
}

#[derive(Debug, Clone)]
pub struct GridImage {
    pub row_seeds: Vec<u32>,
    pub col_seeds: Vec<u32>,
    pub filename: String,
    pub url: Option<String>,
    pub enhancement: Enhancement,
    pub truncation_psi: f32,
    pub grid_size: String,
    pub timestamp: DateTime<Utc>,
    pub image: RgbImage,
}

pub struct GenerationServiceBuilder {
    generator: Arc<dyn FaceGenerator>,
    enhancer: Option<Arc<dyn Enhancer>>,
    output_dir: Option<PathBuf>,
    default_truncation: f32,
    inference_permits: usize,
}

impl GenerationServiceBuilder {
    pub fn new(generator: Arc<dyn FaceGenerator>) -> Self {
        Self {
            generator,
            enhancer: None,
            output_dir: None,
            default_truncation: 0.5,
            inference_permits: 1,
        }
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn Enhancer>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }

    pub fn with_output_dir(mut self, output_dir: PathBuf) -> Self {
        self.output_dir = Some(output_dir);
        self
    }

    pub fn with_default_truncation(mut self, truncation_psi: f32) -> Self {
        self.default_truncation = truncation_psi;
        self
    }

    pub fn with_inference_permits(mut self, permits: usize) -> Self {
        self.inference_permits = permits.max(1);
        self
    }

    pub fn build(self) -> Result<GenerationService> {
        let output_dir = self.output_dir.context("Output directory is not set")?;
        Ok(GenerationService {
            generator: self.generator,
            enhancer: self.enhancer,
            cache: ImageCache::new(output_dir)?,
            default_truncation: self.default_truncation,
            permits: Arc::new(Semaphore::new(self.inference_permits)),
        })
    }
}

/// Sequences generator and enhancer calls around the seed cache.
pub struct GenerationService {
    generator: Arc<dyn FaceGenerator>,
    enhancer: Option<Arc<dyn Enhancer>>,
    cache: ImageCache,
    default_truncation: f32,
    permits: Arc<Semaphore>,
}

impl GenerationService {
    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn default_truncation(&self) -> f32 {
        self.default_truncation
    }

    pub fn model_info(&self) -> NetworkInfo {
        self.generator.info()
    }

    fn url_for(&self, filename: &str) -> String {
        format!("{URL_PREFIX}/{filename}")
    }

    fn enhancer_for(&self, enhance: bool) -> Option<Arc<dyn Enhancer>> {
        if !enhance {
            return None;
        }
        if self.enhancer.is_none() {
            warn!("Enhancement requested but no enhancer is loaded");
        }
        self.enhancer.clone()
    }

    /// Runs a model call on the blocking pool once an inference permit is
    /// available.
    async fn run_model<T, F>(&self, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .context("Inference pool closed")?;
        tokio::task::spawn_blocking(task)
            .await
            .context("Model task panicked")?
    }

    async fn load_cached(&self, seed: u32) -> Result<Option<RgbImage>> {
        let Some(path) = self.cache.lookup(seed) else {
            return Ok(None);
        };
        debug!("Cache hit for seed {seed}");
        let image = tokio::task::spawn_blocking(move || decode_png(&path))
            .await
            .context("Decode task panicked")??;
        Ok(Some(image))
    }

    fn cached_result(&self, seed: u32, truncation_psi: f32, image: RgbImage) -> SingleImage {
        let filename = ImageCache::filename(seed);
        SingleImage {
            seed,
            url: Some(self.url_for(&filename)),
            filename,
            enhancement: Enhancement::Cached,
            truncation_psi,
            timestamp: Utc::now(),
            image,
        }
    }

    /// Renders through the file-based pipeline: the raw render is written
    /// to a temp file, enhanced file-to-file, and the result committed under
    /// `key`. Temp files are removed whatever the outcome.
    async fn render_to_disk<F>(
        &self,
        key: &str,
        render: F,
        enhancer: Option<Arc<dyn Enhancer>>,
    ) -> Result<RgbImage>
    where
        F: FnOnce() -> Result<RgbImage> + Send + 'static,
    {
        let base = self.cache.temp_png(&format!("{key}_base"))?;
        let enhanced = self.cache.temp_png(&format!("{key}_enhanced"))?;
        let base_path = base.path().to_path_buf();
        let enhanced_path = enhanced.path().to_path_buf();
        let enhancing = enhancer.is_some();

        let image = self
            .run_model(move || {
                let image = render()?;
                image
                    .save_with_format(&base_path, ImageFormat::Png)
                    .with_context(|| format!("Failed to save {}", base_path.display()))?;
                match enhancer {
                    Some(enhancer) => {
                        enhancer.enhance_file(&base_path, &enhanced_path)?;
                        decode_png(&enhanced_path)
                    }
                    None => Ok(image),
                }
            })
            .await?;

        if enhancing {
            self.cache.commit(enhanced, key)?;
        } else {
            self.cache.commit(base, key)?;
        }
        Ok(image)
    }

    async fn render_in_memory<F>(&self, render: F, enhancer: Option<Arc<dyn Enhancer>>) -> Result<RgbImage>
    where
        F: FnOnce() -> Result<RgbImage> + Send + 'static,
    {
        self.run_model(move || {
            let image = render()?;
            match enhancer {
                Some(enhancer) => enhancer
                    .enhance(&image)
                    .with_context(|| format!("{} enhancement failed", enhancer.name())),
                None => Ok(image),
            }
        })
        .await
    }

    /// Generates (or loads from the cache) the face for `seed`; a random
    /// seed is drawn when none is given.
    pub async fn generate_single_image(
        &self,
        seed: Option<u32>,
        truncation_psi: f32,
        enhance_face: bool,
        save_to_disk: bool,
    ) -> Result<SingleImage> {
        let seed = seed.unwrap_or_else(random_seed);
        if let Some(image) = self.load_cached(seed).await? {
            return Ok(self.cached_result(seed, truncation_psi, image));
        }

        let enhancer = self.enhancer_for(enhance_face);
        let enhancement = if enhancer.is_some() {
            Enhancement::FaceEnhanced
        } else {
            Enhancement::None
        };
        let generator = self.generator.clone();
        let render = move || generate_from_seed(generator.as_ref(), seed, truncation_psi);

        info!("Generating single face for seed {seed}");
        let (image, url) = if save_to_disk {
            let _guard = self.cache.lock(seed).await;
            // Another request may have produced it while we waited.
            if let Some(image) = self.load_cached(seed).await? {
                return Ok(self.cached_result(seed, truncation_psi, image));
            }
            let image = self.render_to_disk(&seed.to_string(), render, enhancer).await?;
            (image, Some(self.url_for(&ImageCache::filename(seed))))
        } else {
            (self.render_in_memory(render, enhancer).await?, None)
        };

        Ok(SingleImage {
            seed,
            filename: ImageCache::filename(seed),
            url,
            enhancement,
            truncation_psi,
            timestamp: Utc::now(),
            image,
        })
    }

    /// Renders a style-mixing grid and enhances it as a whole.
    pub async fn generate_grid_image(
        &self,
        row_seeds: Vec<u32>,
        col_seeds: Vec<u32>,
        col_styles: Option<Vec<usize>>,
        truncation_psi: f32,
        enhance_face: bool,
        save_to_disk: bool,
    ) -> Result<GridImage> {
        let enhancer = self.enhancer_for(enhance_face);
        let enhancement = if enhancer.is_some() {
            Enhancement::GridEnhanced
        } else {
            Enhancement::None
        };
        let job_id = ImageCache::new_job_id();
        let grid_size = format!("{}x{}", row_seeds.len(), col_seeds.len());
        info!("Generating {grid_size} style mix grid ({job_id})");

        let generator = self.generator.clone();
        let (rows, cols) = (row_seeds.clone(), col_seeds.clone());
        let styles = col_styles.unwrap_or_else(|| DEFAULT_COL_STYLES.to_vec());
        let render = move || style_mix_grid(generator.as_ref(), &rows, &cols, &styles, truncation_psi);

        let filename = ImageCache::filename(&job_id);
        let (image, url) = if save_to_disk {
            let image = self.render_to_disk(&job_id, render, enhancer).await?;
            (image, Some(self.url_for(&filename)))
        } else {
            (self.render_in_memory(render, enhancer).await?, None)
        };

        Ok(GridImage {
            row_seeds,
            col_seeds,
            filename,
            url,
            enhancement,
            truncation_psi,
            grid_size,
            timestamp: Utc::now(),
            image,
        })
    }

    /// PNG bytes for `seed`: the cached file when present, otherwise a fresh
    /// render that is cached when `persist` is set.
    pub async fn generate_direct_image(
        &self,
        seed: u32,
        truncation_psi: f32,
        enhance_face: bool,
        persist: bool,
    ) -> Result<Vec<u8>> {
        if let Some(bytes) = self.cache.read(seed).await? {
            return Ok(bytes);
        }
        let result = self
            .generate_single_image(Some(seed), truncation_psi, enhance_face, persist)
            .await?;
        if persist {
            if let Some(bytes) = self.cache.read(seed).await? {
                return Ok(bytes);
            }
        }
        encode_png(&result.image)
    }

    /// Path of the cached image for `seed`, generating it first if needed.
    pub async fn cached_or_generate(&self, seed: u32) -> Result<PathBuf> {
        if let Some(path) = self.cache.lookup(seed) {
            return Ok(path);
        }
        self.generate_single_image(Some(seed), self.default_truncation, true, true)
            .await?;
        self.cache
            .lookup(seed)
            .with_context(|| format!("Image for seed {seed} missing after generation"))
    }
}

fn decode_png(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("Failed to load image from {}", path.display()))?
        .to_rgb8())
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes)
        .write_image(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)
        .context("Failed to encode PNG")?;
    Ok(bytes)
}
