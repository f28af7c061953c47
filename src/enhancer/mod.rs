pub mod realesrgan;

use std::path::Path;

use anyhow::{Context, Result};
use image::{ImageFormat, RgbImage};
use log::debug;

pub use realesrgan::{RealEsrganUpsampler, RrdbConfig};

/// Post-processing applied to generated faces.
pub trait Enhancer: Send + Sync {
    fn name(&self) -> &'static str;

    fn enhance(&self, image: &RgbImage) -> Result<RgbImage>;

    /// File-to-file variant; the output is always written as PNG.
    fn enhance_file(&self, input: &Path, output: &Path) -> Result<()> {
        debug!("Enhancing {} -> {}", input.display(), output.display());
        let image = image::open(input)
            .with_context(|| format!("Could not read image from {}", input.display()))?
            .to_rgb8();
        let enhanced = self
            .enhance(&image)
            .with_context(|| format!("{} enhancement failed", self.name()))?;
        enhanced
            .save_with_format(output, ImageFormat::Png)
            .with_context(|| format!("Failed to save image to {}", output.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, imageops};
    use tempfile::tempdir;

    struct Doubler;

    impl Enhancer for Doubler {
        fn name(&self) -> &'static str {
            "doubler"
        }

        fn enhance(&self, image: &RgbImage) -> Result<RgbImage> {
            let (w, h) = image.dimensions();
            Ok(imageops::resize(image, w * 2, h * 2, imageops::FilterType::Nearest))
        }
    }

    #[test]
    fn test_enhance_file_writes_png() -> Result<()> {
        let temp_dir = tempdir()?;
        let input = temp_dir.path().join("in.png");
        // No extension: the format must not be inferred from the name.
        let output = temp_dir.path().join("out");
        RgbImage::from_pixel(3, 2, Rgb([10, 20, 30])).save(&input)?;

        Doubler.enhance_file(&input, &output)?;

        let written = image::io::Reader::open(&output)?
            .with_guessed_format()?
            .decode()?
            .to_rgb8();
        assert_eq!(written.dimensions(), (6, 4));
        assert_eq!(written.get_pixel(5, 3), &Rgb([10, 20, 30]));
        Ok(())
    }

    #[test]
    fn test_enhance_file_missing_input() {
        let temp_dir = tempdir().unwrap();
        let result = Doubler.enhance_file(
            &temp_dir.path().join("missing.png"),
            &temp_dir.path().join("out.png"),
        );
        assert!(result.is_err());
    }
}
