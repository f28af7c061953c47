mod common;

use std::{fs, path::Path, sync::Arc};

use anyhow::Result;
use common::{FakeGenerator, TILE, file_names, service, service_with_enhancer};
use facegen::{Enhancement, enhancer::Enhancer};
use image::{RgbImage, imageops};
use mockall::mock;
use tempfile::tempdir;

mock! {
    pub Upscaler {}

    impl Enhancer for Upscaler {
        fn name(&self) -> &'static str;
        fn enhance(&self, image: &RgbImage) -> anyhow::Result<RgbImage>;
        fn enhance_file(&self, input: &Path, output: &Path) -> anyhow::Result<()>;
    }
}

#[tokio::test]
async fn test_cached_repeat_is_byte_identical() -> Result<()> {
    let temp_dir = tempdir()?;
    let generator = Arc::new(FakeGenerator::default());
    let service = service(temp_dir.path(), generator.clone());

    let first = service.generate_single_image(Some(7), 0.5, false, true).await?;
    assert_eq!(first.enhancement, Enhancement::None);
    assert_eq!(first.url.as_deref(), Some("/static/generated/7.png"));
    let bytes = fs::read(temp_dir.path().join("7.png"))?;

    let second = service.generate_single_image(Some(7), 0.9, true, true).await?;
    assert_eq!(second.enhancement, Enhancement::Cached);
    assert_eq!(second.truncation_psi, 0.9);
    assert_eq!(second.image, first.image);
    assert_eq!(fs::read(temp_dir.path().join("7.png"))?, bytes);
    assert_eq!(generator.synth_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_miss_writes_exactly_one_file() -> Result<()> {
    let temp_dir = tempdir()?;
    let service = service(temp_dir.path(), Arc::new(FakeGenerator::default()));

    service.generate_single_image(Some(12), 0.5, false, true).await?;
    assert_eq!(file_names(temp_dir.path()), vec!["12.png"]);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_cached_file_is_readable_by_other_users() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let temp_dir = tempdir()?;
    let service = service(temp_dir.path(), Arc::new(FakeGenerator::default()));

    service.generate_single_image(Some(7), 0.5, false, true).await?;
    let mode = fs::metadata(temp_dir.path().join("7.png"))?.permissions().mode();
    assert_eq!(mode & 0o044, 0o044, "mode {:o}", mode & 0o777);
    Ok(())
}

#[tokio::test]
async fn test_enhancer_runs_once_and_leaves_no_temp_files() -> Result<()> {
    let temp_dir = tempdir()?;
    let mut upscaler = MockUpscaler::new();
    upscaler.expect_name().return_const("mock");
    upscaler
        .expect_enhance_file()
        .times(1)
        .returning(|input, output| {
            fs::copy(input, output)?;
            Ok(())
        });
    let service = service_with_enhancer(
        temp_dir.path(),
        Arc::new(FakeGenerator::default()),
        Arc::new(upscaler),
    );

    let result = service.generate_single_image(Some(3), 0.5, true, true).await?;
    assert_eq!(result.enhancement, Enhancement::FaceEnhanced);
    assert_eq!(file_names(temp_dir.path()), vec!["3.png"]);

    let cached = service.generate_single_image(Some(3), 0.5, true, true).await?;
    assert_eq!(cached.enhancement, Enhancement::Cached);
    Ok(())
}

#[tokio::test]
async fn test_in_memory_enhancement() -> Result<()> {
    let temp_dir = tempdir()?;
    let mut upscaler = MockUpscaler::new();
    upscaler.expect_name().return_const("mock");
    upscaler.expect_enhance_file().never();
    upscaler.expect_enhance().times(1).returning(|image| {
        let (w, h) = image.dimensions();
        Ok(imageops::resize(image, w * 4, h * 4, imageops::FilterType::Nearest))
    });
    let service = service_with_enhancer(
        temp_dir.path(),
        Arc::new(FakeGenerator::default()),
        Arc::new(upscaler),
    );

    let result = service.generate_single_image(Some(8), 0.5, true, false).await?;
    assert_eq!(result.enhancement, Enhancement::FaceEnhanced);
    assert!(result.url.is_none());
    assert_eq!(result.image.dimensions(), (TILE * 4, TILE * 4));
    assert!(file_names(temp_dir.path()).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_grid_enhancement() -> Result<()> {
    let temp_dir = tempdir()?;
    let mut upscaler = MockUpscaler::new();
    upscaler.expect_name().return_const("mock");
    upscaler
        .expect_enhance_file()
        .times(1)
        .returning(|input, output| {
            fs::copy(input, output)?;
            Ok(())
        });
    let service = service_with_enhancer(
        temp_dir.path(),
        Arc::new(FakeGenerator::default()),
        Arc::new(upscaler),
    );

    let result = service
        .generate_grid_image(vec![1, 2], vec![3, 4], None, 0.5, true, true)
        .await?;
    assert_eq!(result.enhancement, Enhancement::GridEnhanced);
    assert_eq!(result.image.dimensions(), (TILE * 3, TILE * 3));
    assert_eq!(file_names(temp_dir.path()), vec![result.filename.clone()]);
    Ok(())
}

#[tokio::test]
async fn test_enhancer_failure_keeps_cache_clean() -> Result<()> {
    let temp_dir = tempdir()?;
    let mut upscaler = MockUpscaler::new();
    upscaler.expect_name().return_const("mock");
    upscaler
        .expect_enhance_file()
        .returning(|_, _| Err(anyhow::anyhow!("out of memory")));
    let service = service_with_enhancer(
        temp_dir.path(),
        Arc::new(FakeGenerator::default()),
        Arc::new(upscaler),
    );

    assert!(service.generate_single_image(Some(4), 0.5, true, true).await.is_err());
    assert!(file_names(temp_dir.path()).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_enhancer_reports_none() -> Result<()> {
    let temp_dir = tempdir()?;
    let service = service(temp_dir.path(), Arc::new(FakeGenerator::default()));

    let result = service.generate_single_image(Some(5), 0.5, true, true).await?;
    assert_eq!(result.enhancement, Enhancement::None);
    Ok(())
}

#[tokio::test]
async fn test_in_memory_mode_writes_nothing() -> Result<()> {
    let temp_dir = tempdir()?;
    let service = service(temp_dir.path(), Arc::new(FakeGenerator::default()));

    let result = service.generate_single_image(Some(21), 0.5, false, false).await?;
    assert!(result.url.is_none());
    assert_eq!(result.image.dimensions(), (TILE, TILE));

    let bytes = service.generate_direct_image(22, 0.5, false, false).await?;
    assert!(bytes.starts_with(b"\x89PNG"));
    assert!(file_names(temp_dir.path()).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_direct_image_persists_when_asked() -> Result<()> {
    let temp_dir = tempdir()?;
    let service = service(temp_dir.path(), Arc::new(FakeGenerator::default()));

    let bytes = service.generate_direct_image(30, 0.5, false, true).await?;
    assert_eq!(fs::read(temp_dir.path().join("30.png"))?, bytes);
    Ok(())
}

#[tokio::test]
async fn test_random_seed_is_reported() -> Result<()> {
    let temp_dir = tempdir()?;
    let service = service(temp_dir.path(), Arc::new(FakeGenerator::default()));

    let result = service.generate_single_image(None, 0.5, false, true).await?;
    assert!(result.seed <= i32::MAX as u32);
    assert_eq!(result.filename, format!("{}.png", result.seed));
    assert!(temp_dir.path().join(&result.filename).exists());
    Ok(())
}

#[tokio::test]
async fn test_grid_has_header_row_and_column() -> Result<()> {
    let temp_dir = tempdir()?;
    let service = service(temp_dir.path(), Arc::new(FakeGenerator::default()));

    let result = service
        .generate_grid_image(vec![1, 2, 3], vec![10, 11], None, 0.5, false, true)
        .await?;
    assert_eq!(result.grid_size, "3x2");
    assert_eq!(result.image.dimensions(), (TILE * 3, TILE * 4));
    assert_eq!(result.enhancement, Enhancement::None);
    assert_eq!(file_names(temp_dir.path()), vec![result.filename.clone()]);
    assert_eq!(
        result.url,
        Some(format!("/static/generated/{}", result.filename))
    );
    Ok(())
}

#[tokio::test]
async fn test_grid_rejects_bad_style_layer() -> Result<()> {
    let temp_dir = tempdir()?;
    let service = service(temp_dir.path(), Arc::new(FakeGenerator::default()));

    let result = service
        .generate_grid_image(vec![1], vec![2], Some(vec![99]), 0.5, false, true)
        .await;
    assert!(result.is_err());
    assert!(file_names(temp_dir.path()).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_download_generates_on_miss() -> Result<()> {
    let temp_dir = tempdir()?;
    let generator = Arc::new(FakeGenerator::default());
    let service = service(temp_dir.path(), generator.clone());

    let path = service.cached_or_generate(44).await?;
    assert_eq!(path, temp_dir.path().join("44.png"));
    assert_eq!(service.cached_or_generate(44).await?, path);
    assert_eq!(generator.synth_calls(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_for_one_seed_generate_once() -> Result<()> {
    let temp_dir = tempdir()?;
    let generator = Arc::new(FakeGenerator::default());
    let service = Arc::new(service(temp_dir.path(), generator.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.generate_single_image(Some(99), 0.5, false, true).await })
        })
        .collect();
    let mut images = Vec::new();
    for handle in handles {
        images.push(handle.await??.image);
    }

    assert_eq!(generator.synth_calls(), 1);
    assert!(images.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(file_names(temp_dir.path()), vec!["99.png"]);
    Ok(())
}
