use std::{
    fmt,
    fs::{self, File},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use futures_util::StreamExt;
use hf_hub::api::tokio::Api;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::get_project_dir;

const WEIGHTS_DIR: &str = "weights";
const WEIGHT_INDEX_FILENAME: &str = "weights_index.json";

/// Where a set of model weights comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightSource {
    Local(PathBuf),
    Url(String),
    HuggingFace { repo: String, file: String },
}

impl FromStr for WeightSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            bail!("Empty weight source");
        }
        if let Some(rest) = s.strip_prefix("hf://") {
            // hf://owner/repo/path/to/file
            let mut parts = rest.splitn(3, '/');
            let (Some(owner), Some(name), Some(file)) = (parts.next(), parts.next(), parts.next())
            else {
                bail!("Hugging Face source must look like hf://owner/repo/file, got `{s}`");
            };
            if owner.is_empty() || name.is_empty() || file.is_empty() {
                bail!("Hugging Face source must look like hf://owner/repo/file, got `{s}`");
            }
            return Ok(WeightSource::HuggingFace {
                repo: format!("{owner}/{name}"),
                file: file.to_string(),
            });
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(WeightSource::Url(s.to_string()));
        }
        Ok(WeightSource::Local(PathBuf::from(s)))
    }
}

impl fmt::Display for WeightSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightSource::Local(path) => write!(f, "{}", path.display()),
            WeightSource::Url(url) => f.write_str(url),
            WeightSource::HuggingFace { repo, file } => write!(f, "hf://{repo}/{file}"),
        }
    }
}

impl WeightSource {
    /// File name the weights are stored under once fetched.
    pub fn file_name(&self) -> Result<String> {
        let name = match self {
            WeightSource::Local(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            WeightSource::Url(url) => url
                .split(['?', '#'])
                .next()
                .and_then(|u| u.rsplit('/').next())
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            WeightSource::HuggingFace { file, .. } => {
                file.rsplit('/').next().map(str::to_string)
            }
        };
        name.ok_or_else(|| anyhow!("Couldn't derive a file name from `{self}`"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightFile {
    pub name: String,
    pub source: String,
    pub size: u64,
    pub path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WeightIndex {
    pub weights: Vec<WeightFile>,
}

impl TryFrom<&Path> for WeightIndex {
    type Error = anyhow::Error;

    fn try_from(path: &Path) -> Result<Self> {
        debug!("WeightIndex path: {path:?}");
        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let index: WeightIndex = serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse weight index from {}", path.display()))?;

        Ok(index)
    }
}

pub struct WeightStoreBuilder {
    weights_dir: Option<PathBuf>,
    show_progress: bool,
}

impl Default for WeightStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightStoreBuilder {
    pub fn new() -> Self {
        Self {
            weights_dir: None,
            show_progress: true,
        }
    }

    pub fn with_weights_dir(mut self, weights_dir: PathBuf) -> Self {
        self.weights_dir = Some(weights_dir);
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn build(self) -> Result<WeightStore> {
        let weights_dir = self
            .weights_dir
            .or_else(|| get_project_dir().map(|d| d.data_dir().join(WEIGHTS_DIR)))
            .context("Weights directory is not set")?;
        fs::create_dir_all(&weights_dir).with_context(|| {
            format!("Failed to create weights dir {}", weights_dir.display())
        })?;
        Ok(WeightStore {
            weights_dir,
            http: reqwest::Client::new(),
            show_progress: self.show_progress,
        })
    }
}

/// Turns weight sources into local files, downloading them when needed.
#[derive(Debug)]
pub struct WeightStore {
    weights_dir: PathBuf,
    http: reqwest::Client,
    show_progress: bool,
}

impl WeightStore {
    pub fn new(weights_dir: Option<PathBuf>) -> Result<Self> {
        let builder = WeightStoreBuilder::new();
        match weights_dir {
            Some(dir) => builder.with_weights_dir(dir),
            None => builder,
        }
        .build()
    }

    pub fn weights_dir(&self) -> &Path {
        &self.weights_dir
    }

    fn index_path(&self) -> PathBuf {
        self.weights_dir.join(WEIGHT_INDEX_FILENAME)
    }

    /// Lists fetched weights. A store that never fetched anything is empty.
    pub fn list_weights(&self) -> Result<Vec<WeightFile>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(vec![]);
        }
        Ok(WeightIndex::try_from(path.as_path())?.weights)
    }

    fn record(&self, entry: WeightFile) -> Result<()> {
        let mut index = if self.index_path().exists() {
            WeightIndex::try_from(self.index_path().as_path())?
        } else {
            WeightIndex::default()
        };
        index.weights.retain(|w| w.source != entry.source);
        index.weights.push(entry);
        let json =
            serde_json::to_string_pretty(&index).context("Couldn't serialize weight index")?;
        fs::write(self.index_path(), json).context("Couldn't write weight index")
    }

    /// Returns a local path for `source`, fetching it on first use.
    pub async fn resolve(&self, source: &WeightSource) -> Result<PathBuf> {
        debug!("resolve: {source}");
        let path = match source {
            WeightSource::Local(path) => {
                if !path.is_file() {
                    bail!("Weight file not found: {}", path.display());
                }
                return Ok(path.clone());
            }
            WeightSource::Url(url) => {
                let local_path = self.weights_dir.join(source.file_name()?);
                if local_path.is_file() {
                    debug!("  already downloaded: {}", local_path.display());
                    return Ok(local_path);
                }
                self.download_url(url, &local_path).await?;
                local_path
            }
            WeightSource::HuggingFace { repo, file } => {
                let api = Api::new().context("Failed to create HuggingFace API client")?;
                api.model(repo.clone())
                    .get(file)
                    .await
                    .with_context(|| format!("{file} download failed from `{repo}`"))?
            }
        };

        let size = fs::metadata(&path)
            .with_context(|| format!("Couldn't get file size for `{}`", path.display()))?
            .len();
        info!(
            "Fetched {} ({})",
            path.display(),
            humansize::format_size(size, humansize::DECIMAL)
        );
        self.record(WeightFile {
            name: source.file_name()?,
            source: source.to_string(),
            size,
            path: path.clone(),
        })?;
        Ok(path)
    }

    async fn download_url(&self, url: &str, destination: &Path) -> Result<()> {
        info!("Downloading {url}");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("Download of {url} failed"))?;

        let progress = if self.show_progress {
            let bar = match response.content_length() {
                Some(total) => ProgressBar::new(total),
                None => ProgressBar::new_spinner(),
            };
            bar.set_style(
                ProgressStyle::with_template(
                    "{msg} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec})",
                )?
                .progress_chars("=> "),
            );
            bar.set_message(destination.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
            bar.enable_steady_tick(Duration::from_millis(200));
            Some(bar)
        } else {
            None
        };

        // Written next to the destination and renamed once complete.
        let partial = destination.with_extension("partial");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("Failed to create {}", partial.display()))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Download of {url} interrupted"))?;
            file.write_all(&chunk).await?;
            if let Some(bar) = &progress {
                bar.inc(chunk.len() as u64);
            }
        }
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&partial, destination)
            .await
            .with_context(|| format!("Failed to move download to {}", destination.display()))?;
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_sources() -> Result<()> {
        assert_eq!(
            "checkpoints/G.safetensors".parse::<WeightSource>()?,
            WeightSource::Local(PathBuf::from("checkpoints/G.safetensors"))
        );
        assert_eq!(
            "https://example.com/w/RealESRGAN_x4plus.pth".parse::<WeightSource>()?,
            WeightSource::Url("https://example.com/w/RealESRGAN_x4plus.pth".to_string())
        );
        assert_eq!(
            "hf://someone/stylegan2/ffhq/G.safetensors".parse::<WeightSource>()?,
            WeightSource::HuggingFace {
                repo: "someone/stylegan2".to_string(),
                file: "ffhq/G.safetensors".to_string(),
            }
        );
        assert!("hf://only-owner".parse::<WeightSource>().is_err());
        assert!("".parse::<WeightSource>().is_err());
        Ok(())
    }

    #[test]
    fn test_file_names() -> Result<()> {
        let url: WeightSource = "https://example.com/a/RealESRGAN_x4plus.pth?download=1".parse()?;
        assert_eq!(url.file_name()?, "RealESRGAN_x4plus.pth");
        let hf: WeightSource = "hf://a/b/dir/G.safetensors".parse()?;
        assert_eq!(hf.file_name()?, "G.safetensors");
        assert_eq!(hf.to_string(), "hf://a/b/dir/G.safetensors");
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_local_file() -> Result<()> {
        let temp_dir = tempdir()?;
        let weights = temp_dir.path().join("G.safetensors");
        fs::write(&weights, b"weights")?;
        let store = WeightStoreBuilder::new()
            .with_weights_dir(temp_dir.path().join("store"))
            .build()?;

        let resolved = store.resolve(&WeightSource::Local(weights.clone())).await?;
        assert_eq!(resolved, weights);
        // Local files are used in place and not indexed.
        assert!(store.list_weights()?.is_empty());

        let missing = WeightSource::Local(temp_dir.path().join("missing.pth"));
        assert!(store.resolve(&missing).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_url_reuses_existing_download() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = WeightStoreBuilder::new()
            .with_weights_dir(temp_dir.path().to_path_buf())
            .with_progress(false)
            .build()?;
        fs::write(temp_dir.path().join("RealESRGAN_x4plus.pth"), b"cached")?;

        // Never reaches the network because the file is already there.
        let source: WeightSource = "https://invalid.invalid/RealESRGAN_x4plus.pth".parse()?;
        let resolved = store.resolve(&source).await?;
        assert_eq!(resolved, temp_dir.path().join("RealESRGAN_x4plus.pth"));
        Ok(())
    }

    #[test]
    fn test_index_round_trip() -> Result<()> {
        let temp_dir = tempdir()?;
        let store = WeightStoreBuilder::new()
            .with_weights_dir(temp_dir.path().to_path_buf())
            .build()?;
        assert!(store.list_weights()?.is_empty());

        let entry = WeightFile {
            name: "G.safetensors".to_string(),
            source: "hf://a/b/G.safetensors".to_string(),
            size: 1024,
            path: temp_dir.path().join("G.safetensors"),
        };
        store.record(entry.clone())?;
        // Re-recording the same source replaces the entry.
        store.record(WeightFile { size: 2048, ..entry })?;

        let listed = store.list_weights()?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 2048);
        Ok(())
    }

    #[test]
    fn test_malformed_index() -> Result<()> {
        let temp_dir = tempdir()?;
        fs::write(temp_dir.path().join(WEIGHT_INDEX_FILENAME), "{ invalid json }")?;
        let store = WeightStoreBuilder::new()
            .with_weights_dir(temp_dir.path().to_path_buf())
            .build()?;
        assert!(store.list_weights().is_err());
        Ok(())
    }
}
