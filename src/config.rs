use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail, ensure};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::get_project_dir;

const CONFIG_FILENAME: &str = "config.json";
const GENERATED_DIR: &str = "generated";

/// Which candle device to run the networks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Auto,
    Cpu,
    Cuda,
    Metal,
}

/// Architecture hyper-parameters of the StyleGAN2 generator checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleGan2Config {
    pub z_dim: usize,
    pub w_dim: usize,
    pub c_dim: usize,
    pub img_resolution: usize,
    pub mapping_layers: usize,
    pub channel_base: usize,
    pub channel_max: usize,
    pub conv_clamp: Option<f64>,
    pub mapping_lr_multiplier: f64,
}

impl Default for StyleGan2Config {
    fn default() -> Self {
        // FFHQ 256x256 ("paper256") checkpoint
        Self {
            z_dim: 512,
            w_dim: 512,
            c_dim: 0,
            img_resolution: 256,
            mapping_layers: 8,
            channel_base: 16384,
            channel_max: 512,
            conv_clamp: Some(256.0),
            mapping_lr_multiplier: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancerConfig {
    pub enabled: bool,
    /// Weight source of the RRDBNet x4 upsampler.
    pub weights: String,
    /// Tile size in input pixels, 0 disables tiling.
    pub tile: u32,
    pub tile_pad: u32,
    pub outscale: f32,
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weights: "https://github.com/xinntao/Real-ESRGAN/releases/download/v0.1.0/RealESRGAN_x4plus.pth"
                .to_string(),
            tile: 0,
            tile_pad: 10,
            outscale: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    /// Served under `/static`; generated images live in `generated/` below it.
    pub static_dir: PathBuf,
    /// Where downloaded weights are stored. Defaults to the project data dir.
    pub weights_dir: Option<PathBuf>,
    /// Weight source of the StyleGAN2 `G_ema` state dict (safetensors).
    pub generator_weights: String,
    pub stylegan2: StyleGan2Config,
    pub enhancer: EnhancerConfig,
    pub default_truncation: f32,
    /// Upper bound on `rows * cols` of a style-mix request.
    pub max_grid_tiles: usize,
    pub allowed_origins: Vec<String>,
    /// Number of model calls allowed to run at once.
    pub inference_permits: usize,
    pub device: DevicePreference,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "StyleGAN2 Face Generator API".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            static_dir: PathBuf::from("static"),
            weights_dir: None,
            generator_weights: "checkpoints/stylegan2-256.safetensors".to_string(),
            stylegan2: StyleGan2Config::default(),
            enhancer: EnhancerConfig::default(),
            default_truncation: 0.5,
            max_grid_tiles: 64,
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            inference_permits: 1,
            device: DevicePreference::Auto,
        }
    }
}

impl TryFrom<&Path> for Settings {
    type Error = anyhow::Error;

    fn try_from(path: &Path) -> Result<Self> {
        debug!("Settings path: {path:?}");
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let settings: Settings = serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse settings from {}", path.display()))?;

        Ok(settings)
    }
}

impl Settings {
    /// Loads settings from `path`, or from the default config file when it
    /// exists, falling back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = match path {
            Some(path) => Settings::try_from(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Settings::try_from(path.as_path())?,
                _ => Settings::default(),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn default_path() -> Option<PathBuf> {
        get_project_dir().map(|d| d.config_dir().join(CONFIG_FILENAME))
    }

    /// Writes the settings as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Couldn't serialize settings")?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.default_truncation),
            "default_truncation must be within [0, 1], got {}",
            self.default_truncation
        );
        ensure!(self.max_grid_tiles > 0, "max_grid_tiles must be positive");
        ensure!(
            self.inference_permits > 0,
            "inference_permits must be positive"
        );
        ensure!(
            self.enhancer.outscale > 0.0,
            "enhancer.outscale must be positive"
        );

        let res = self.stylegan2.img_resolution;
        if res < 4 || !res.is_power_of_two() {
            bail!("stylegan2.img_resolution must be a power of two >= 4, got {res}");
        }
        if self.stylegan2.c_dim != 0 {
            bail!("class-conditional generators are not supported (c_dim = {})", self.stylegan2.c_dim);
        }
        Ok(())
    }

    /// Directory holding cached and generated images.
    pub fn output_dir(&self) -> PathBuf {
        self.static_dir.join(GENERATED_DIR)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
