use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::{
    generator::DEFAULT_COL_STYLES,
    service::{Enhancement, GridImage, SingleImage},
};

pub const DEFAULT_TRUNCATION: f32 = 0.5;

fn default_truncation() -> f32 {
    DEFAULT_TRUNCATION
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateFaceRequest {
    #[serde(default)]
    pub seed: Option<u32>,
    #[serde(default = "default_truncation")]
    pub truncation: f32,
    #[serde(default = "default_true")]
    pub enhance_face: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateGridRequest {
    pub row_seeds: Vec<u32>,
    pub col_seeds: Vec<u32>,
    #[serde(default = "default_truncation")]
    pub truncation: f32,
    /// Style layers taken from the column seeds.
    #[serde(default)]
    pub col_styles: Option<Vec<usize>>,
    #[serde(default = "default_true")]
    pub enhance_face: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectQuery {
    pub seed: u32,
    #[serde(default = "default_truncation")]
    pub truncation: f32,
    /// Store the result in the seed cache.
    #[serde(default = "default_true")]
    pub persist: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadQuery {
    pub seed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateFaceResponse {
    pub seed: u32,
    pub filename: String,
    pub url: Option<String>,
    pub enhancement: Enhancement,
    pub truncation_psi: f32,
    pub timestamp: DateTime<Utc>,
}

impl From<SingleImage> for GenerateFaceResponse {
    fn from(result: SingleImage) -> Self {
        Self {
            seed: result.seed,
            filename: result.filename,
            url: result.url,
            enhancement: result.enhancement,
            truncation_psi: result.truncation_psi,
            timestamp: result.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateGridResponse {
    pub row_seeds: Vec<u32>,
    pub col_seeds: Vec<u32>,
    pub filename: String,
    pub url: Option<String>,
    pub enhancement: Enhancement,
    pub truncation_psi: f32,
    pub grid_size: String,
    pub timestamp: DateTime<Utc>,
}

impl From<GridImage> for GenerateGridResponse {
    fn from(result: GridImage) -> Self {
        Self {
            row_seeds: result.row_seeds,
            col_seeds: result.col_seeds,
            filename: result.filename,
            url: result.url,
            enhancement: result.enhancement,
            truncation_psi: result.truncation_psi,
            grid_size: result.grid_size,
            timestamp: result.timestamp,
        }
    }
}

pub fn validate_truncation(truncation: f32) -> Result<(), ApiError> {
    if !(0.0..=1.0).contains(&truncation) {
        return Err(ApiError::Validation(format!(
            "truncation must be between 0 and 1, got {truncation}"
        )));
    }
    Ok(())
}

impl GenerateGridRequest {
    pub fn validate(&self, max_tiles: usize, num_ws: usize) -> Result<(), ApiError> {
        validate_truncation(self.truncation)?;
        if self.row_seeds.is_empty() || self.col_seeds.is_empty() {
            return Err(ApiError::Validation(
                "row_seeds and col_seeds must not be empty".to_string(),
            ));
        }
        let tiles = self.row_seeds.len() * self.col_seeds.len();
        if tiles > max_tiles {
            return Err(ApiError::Validation(format!(
                "grid of {tiles} tiles exceeds the limit of {max_tiles}"
            )));
        }
        let styles = self.col_styles.as_deref().unwrap_or(&DEFAULT_COL_STYLES[..]);
        if let Some(idx) = styles.iter().find(|&&idx| idx >= num_ws) {
            return Err(ApiError::Validation(format!(
                "style layer {idx} out of range (num_ws = {num_ws})"
            )));
        }
        Ok(())
    }
}
