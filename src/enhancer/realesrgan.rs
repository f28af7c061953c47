//! Real-ESRGAN x4 super-resolution (RRDBNet) on candle.

use std::path::Path;

use anyhow::{Context, bail, ensure};
use candle_core::{DType, Device, Module, Result, Tensor, pickle::PthTensors};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, conv2d, ops::leaky_relu};
use image::{GenericImage, RgbImage, imageops};
use log::{debug, info};

use super::Enhancer;

#[derive(Debug, Clone, PartialEq)]
pub struct RrdbConfig {
    pub num_in_ch: usize,
    pub num_out_ch: usize,
    pub num_feat: usize,
    pub num_block: usize,
    pub num_grow_ch: usize,
}

impl Default for RrdbConfig {
    /// RealESRGAN_x4plus
    fn default() -> Self {
        Self {
            num_in_ch: 3,
            num_out_ch: 3,
            num_feat: 64,
            num_block: 23,
            num_grow_ch: 32,
        }
    }
}

/// The network upscales by this factor.
const NET_SCALE: u32 = 4;

fn lrelu(x: &Tensor) -> Result<Tensor> {
    leaky_relu(x, 0.2)
}

fn conv3x3(vb: VarBuilder, in_channels: usize, out_channels: usize) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    conv2d(in_channels, out_channels, 3, cfg, vb)
}

struct ResidualDenseBlock {
    convs: Vec<Conv2d>,
}

impl ResidualDenseBlock {
    fn load(vb: VarBuilder, num_feat: usize, num_grow_ch: usize) -> Result<Self> {
        let mut convs = Vec::with_capacity(5);
        for idx in 0..5 {
            let in_channels = num_feat + idx * num_grow_ch;
            let out_channels = if idx == 4 { num_feat } else { num_grow_ch };
            convs.push(conv3x3(vb.pp(format!("conv{}", idx + 1)), in_channels, out_channels)?);
        }
        Ok(Self { convs })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut features = vec![x.clone()];
        for conv in &self.convs[..4] {
            let y = lrelu(&conv.forward(&Tensor::cat(&features, 1)?)?)?;
            features.push(y);
        }
        let x5 = self.convs[4].forward(&Tensor::cat(&features, 1)?)?;
        x5.affine(0.2, 0.0)?.add(x)
    }
}

struct Rrdb {
    blocks: [ResidualDenseBlock; 3],
}

impl Rrdb {
    fn load(vb: VarBuilder, num_feat: usize, num_grow_ch: usize) -> Result<Self> {
        Ok(Self {
            blocks: [
                ResidualDenseBlock::load(vb.pp("rdb1"), num_feat, num_grow_ch)?,
                ResidualDenseBlock::load(vb.pp("rdb2"), num_feat, num_grow_ch)?,
                ResidualDenseBlock::load(vb.pp("rdb3"), num_feat, num_grow_ch)?,
            ],
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut out = x.clone();
        for block in &self.blocks {
            out = block.forward(&out)?;
        }
        out.affine(0.2, 0.0)?.add(x)
    }
}

struct RrdbNet {
    conv_first: Conv2d,
    body: Vec<Rrdb>,
    conv_body: Conv2d,
    conv_up1: Conv2d,
    conv_up2: Conv2d,
    conv_hr: Conv2d,
    conv_last: Conv2d,
}

impl RrdbNet {
    fn load(vb: VarBuilder, config: &RrdbConfig) -> Result<Self> {
        let nf = config.num_feat;
        let body = (0..config.num_block)
            .map(|idx| Rrdb::load(vb.pp("body").pp(idx), nf, config.num_grow_ch))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            conv_first: conv3x3(vb.pp("conv_first"), config.num_in_ch, nf)?,
            body,
            conv_body: conv3x3(vb.pp("conv_body"), nf, nf)?,
            conv_up1: conv3x3(vb.pp("conv_up1"), nf, nf)?,
            conv_up2: conv3x3(vb.pp("conv_up2"), nf, nf)?,
            conv_hr: conv3x3(vb.pp("conv_hr"), nf, nf)?,
            conv_last: conv3x3(vb.pp("conv_last"), nf, config.num_out_ch)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let feat = self.conv_first.forward(x)?;
        let mut body_feat = feat.clone();
        for block in &self.body {
            body_feat = block.forward(&body_feat)?;
        }
        let feat = feat.add(&self.conv_body.forward(&body_feat)?)?;

        let (_, _, h, w) = feat.dims4()?;
        let feat = lrelu(&self.conv_up1.forward(&feat.upsample_nearest2d(h * 2, w * 2)?)?)?;
        let feat = lrelu(&self.conv_up2.forward(&feat.upsample_nearest2d(h * 4, w * 4)?)?)?;
        self.conv_last.forward(&lrelu(&self.conv_hr.forward(&feat)?)?)
    }
}

/// A tile of the input: the region it is responsible for and the padded
/// region actually fed to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub pad_width: u32,
    pub pad_height: u32,
}

/// Splits a `width` x `height` image into `tile`-sized regions, each
/// extended by `tile_pad` pixels of context clamped to the image bounds.
pub fn tile_regions(width: u32, height: u32, tile: u32, tile_pad: u32) -> Vec<TileRegion> {
    let mut regions = Vec::new();
    if tile == 0 {
        return regions;
    }
    for y in (0..height).step_by(tile as usize) {
        for x in (0..width).step_by(tile as usize) {
            let region_w = tile.min(width - x);
            let region_h = tile.min(height - y);
            let pad_x = x.saturating_sub(tile_pad);
            let pad_y = y.saturating_sub(tile_pad);
            let pad_x_end = (x + region_w + tile_pad).min(width);
            let pad_y_end = (y + region_h + tile_pad).min(height);
            regions.push(TileRegion {
                x,
                y,
                width: region_w,
                height: region_h,
                pad_x,
                pad_y,
                pad_width: pad_x_end - pad_x,
                pad_height: pad_y_end - pad_y,
            });
        }
    }
    regions
}

pub struct RealEsrganUpsampler {
    net: RrdbNet,
    device: Device,
    tile: u32,
    tile_pad: u32,
    outscale: f32,
}

impl RealEsrganUpsampler {
    /// Loads `.safetensors` or PyTorch `.pth` weights. For `.pth` files the
    /// `params_ema` entry is preferred over `params`.
    pub fn load(weights: &Path, device: &Device) -> anyhow::Result<Self> {
        info!("Loading Real-ESRGAN weights from \"{}\"...", weights.display());
        let is_safetensors = weights
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));
        let vb = if is_safetensors {
            // Safety: the file is memory mapped and must not change while loaded.
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? }
        } else {
            pth_var_builder(weights, device)?
        };
        Self::new(vb, &RrdbConfig::default())
            .with_context(|| format!("Failed to load Real-ESRGAN weights from {}", weights.display()))
    }

    pub fn new(vb: VarBuilder, config: &RrdbConfig) -> anyhow::Result<Self> {
        let device = vb.device().clone();
        Ok(Self {
            net: RrdbNet::load(vb, config)?,
            device,
            tile: 0,
            tile_pad: 10,
            outscale: NET_SCALE as f32,
        })
    }

    pub fn with_tiling(mut self, tile: u32, tile_pad: u32) -> Self {
        self.tile = tile;
        self.tile_pad = tile_pad;
        self
    }

    pub fn with_outscale(mut self, outscale: f32) -> anyhow::Result<Self> {
        ensure!(outscale > 0.0, "outscale must be positive, got {outscale}");
        self.outscale = outscale;
        Ok(self)
    }

    fn run(&self, image: &RgbImage) -> Result<RgbImage> {
        let (w, h) = image.dimensions();
        let input = Tensor::from_vec(image.as_raw().clone(), (h as usize, w as usize, 3), &self.device)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .unsqueeze(0)?;
        let output = self.net.forward(&input)?;
        let (_, _, oh, ow) = output.dims4()?;
        let pixels = output
            .squeeze(0)?
            .clamp(0f32, 1f32)?
            .affine(255.0, 0.0)?
            .round()?
            .to_dtype(DType::U8)?
            .permute((1, 2, 0))?
            .contiguous()?
            .flatten_all()?
            .to_vec1::<u8>()?;
        RgbImage::from_raw(ow as u32, oh as u32, pixels)
            .ok_or_else(|| candle_core::Error::Msg("image buffer size mismatch".to_string()))
    }

    fn run_tiled(&self, image: &RgbImage) -> anyhow::Result<RgbImage> {
        let (w, h) = image.dimensions();
        let mut output = RgbImage::new(w * NET_SCALE, h * NET_SCALE);
        let regions = tile_regions(w, h, self.tile, self.tile_pad);
        for (idx, region) in regions.iter().enumerate() {
            debug!("Tile {}/{}", idx + 1, regions.len());
            let input = imageops::crop_imm(
                image,
                region.pad_x,
                region.pad_y,
                region.pad_width,
                region.pad_height,
            )
            .to_image();
            let upscaled = self.run(&input)?;
            let valid = imageops::crop_imm(
                &upscaled,
                (region.x - region.pad_x) * NET_SCALE,
                (region.y - region.pad_y) * NET_SCALE,
                region.width * NET_SCALE,
                region.height * NET_SCALE,
            )
            .to_image();
            output.copy_from(&valid, region.x * NET_SCALE, region.y * NET_SCALE)?;
        }
        Ok(output)
    }
}

fn pth_var_builder(path: &Path, device: &Device) -> anyhow::Result<VarBuilder<'static>> {
    for key in [Some("params_ema"), Some("params"), None] {
        let Ok(tensors) = PthTensors::new(path, key) else {
            continue;
        };
        let vb = VarBuilder::from_backend(Box::new(tensors), DType::F32, device.clone());
        if vb.contains_tensor("conv_first.weight") {
            debug!("Using state dict entry {key:?}");
            return Ok(vb);
        }
    }
    bail!("No RRDBNet state dict found in {}", path.display())
}

impl Enhancer for RealEsrganUpsampler {
    fn name(&self) -> &'static str {
        "realesrgan"
    }

    fn enhance(&self, image: &RgbImage) -> anyhow::Result<RgbImage> {
        let upscaled = if self.tile > 0 {
            self.run_tiled(image)?
        } else {
            self.run(image)?
        };
        if self.outscale == NET_SCALE as f32 {
            return Ok(upscaled);
        }
        let (w, h) = image.dimensions();
        let target_w = ((w as f32) * self.outscale).round().max(1.0) as u32;
        let target_h = ((h as f32) * self.outscale).round().max(1.0) as u32;
        Ok(imageops::resize(
            &upscaled,
            target_w,
            target_h,
            imageops::FilterType::Lanczos3,
        ))
    }
}
