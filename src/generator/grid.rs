use std::collections::HashMap;

use anyhow::{Result, ensure};
use image::{GenericImage, RgbImage};
use log::{debug, info};

use super::{FaceGenerator, WLatent};
use crate::latent::latent_from_seed;

/// Coarse layers swapped in from the column seed by default.
pub const DEFAULT_COL_STYLES: [usize; 7] = [0, 1, 2, 3, 4, 5, 6];

/// Renders a style-mixing grid.
///
/// The canvas has one tile per row seed plus a header row, and one tile per
/// column seed plus a header column. The header row shows the column seeds,
/// the header column the row seeds, and each inner tile the row seed's
/// latent with `col_styles` layers taken from the column seed. The top-left
/// tile stays black.
pub fn style_mix_grid(
    generator: &dyn FaceGenerator,
    row_seeds: &[u32],
    col_seeds: &[u32],
    col_styles: &[usize],
    truncation_psi: f32,
) -> Result<RgbImage> {
    ensure!(!row_seeds.is_empty(), "row_seeds must not be empty");
    ensure!(!col_seeds.is_empty(), "col_seeds must not be empty");

    let info = generator.info();
    for &idx in col_styles {
        ensure!(
            idx < info.synthesis_layers,
            "style layer {idx} out of range (num_ws = {})",
            info.synthesis_layers
        );
    }

    let mut ws: HashMap<u32, WLatent> = HashMap::new();
    let mut images: HashMap<(u32, u32), RgbImage> = HashMap::new();
    for &seed in row_seeds.iter().chain(col_seeds) {
        if ws.contains_key(&seed) {
            continue;
        }
        let z = latent_from_seed(seed, info.latent_dim);
        let w = generator.map(&z, truncation_psi)?;
        images.insert((seed, seed), generator.synthesize(&w)?);
        ws.insert(seed, w);
    }
    debug!("Mapped {} distinct seeds", ws.len());

    info!("Generating style-mixed images...");
    for &row_seed in row_seeds {
        for &col_seed in col_seeds {
            if images.contains_key(&(row_seed, col_seed)) {
                continue;
            }
            let w = ws[&row_seed].mix_layers(&ws[&col_seed], col_styles)?;
            images.insert((row_seed, col_seed), generator.synthesize(&w)?);
        }
    }

    info!("Creating style mix grid...");
    let (tile_w, tile_h) = images[&(row_seeds[0], row_seeds[0])].dimensions();
    let mut canvas = RgbImage::new(
        tile_w * (col_seeds.len() as u32 + 1),
        tile_h * (row_seeds.len() as u32 + 1),
    );

    for (col_idx, &col_seed) in col_seeds.iter().enumerate() {
        canvas.copy_from(&images[&(col_seed, col_seed)], tile_w * (col_idx as u32 + 1), 0)?;
    }
    for (row_idx, &row_seed) in row_seeds.iter().enumerate() {
        let y = tile_h * (row_idx as u32 + 1);
        canvas.copy_from(&images[&(row_seed, row_seed)], 0, y)?;
        for (col_idx, &col_seed) in col_seeds.iter().enumerate() {
            canvas.copy_from(&images[&(row_seed, col_seed)], tile_w * (col_idx as u32 + 1), y)?;
        }
    }

    Ok(canvas)
}
