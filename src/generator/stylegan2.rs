//! StyleGAN2 generator (mapping + synthesis networks) on candle.
//!
//! Weights are the `G_ema` state dict of a StyleGAN2-ADA checkpoint exported
//! to safetensors, e.g. `safetensors.torch.save_file(G.state_dict(), path)`.
//! Only the "skip" output architecture and constant noise are supported.

use std::{f64::consts::SQRT_2, path::Path};

use anyhow::{Context, bail};
use candle_core::{D, DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, ops::leaky_relu};
use image::RgbImage;
use log::info;

use super::{FaceGenerator, NetworkInfo, WLatent};
use crate::{config::StyleGan2Config, device};

fn lrelu(x: &Tensor) -> Result<Tensor> {
    leaky_relu(x, 0.2)?.affine(SQRT_2, 0.0)
}

/// Dense layer with equalized learning rate.
struct FullyConnected {
    weight: Tensor,
    bias: Tensor,
}

impl FullyConnected {
    fn load(vb: VarBuilder, in_features: usize, out_features: usize, lr_multiplier: f64) -> Result<Self> {
        let weight_gain = lr_multiplier / (in_features as f64).sqrt();
        let weight = vb.get((out_features, in_features), "weight")?.affine(weight_gain, 0.0)?;
        let bias = vb.get(out_features, "bias")?.affine(lr_multiplier, 0.0)?;
        Ok(Self { weight, bias })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.matmul(&self.weight.t()?)?.broadcast_add(&self.bias)
    }
}

struct MappingNetwork {
    layers: Vec<FullyConnected>,
    w_avg: Tensor,
}

impl MappingNetwork {
    fn load(vb: VarBuilder, config: &StyleGan2Config) -> Result<Self> {
        let mut layers = Vec::with_capacity(config.mapping_layers);
        for idx in 0..config.mapping_layers {
            let in_features = if idx == 0 { config.z_dim } else { config.w_dim };
            layers.push(FullyConnected::load(
                vb.pp(format!("fc{idx}")),
                in_features,
                config.w_dim,
                config.mapping_lr_multiplier,
            )?);
        }
        let w_avg = vb.get(config.w_dim, "w_avg")?;
        Ok(Self { layers, w_avg })
    }

    /// `z`: `[1, z_dim]` → `w`: `[1, w_dim]`.
    fn forward(&self, z: &Tensor, truncation_psi: f64) -> Result<Tensor> {
        // normalize 2nd moment
        let norm = z.sqr()?.mean_keepdim(D::Minus1)?.affine(1.0, 1e-8)?.sqrt()?;
        let mut x = z.broadcast_div(&norm)?;
        for layer in &self.layers {
            x = lrelu(&layer.forward(&x)?)?;
        }
        if truncation_psi != 1.0 {
            x = x
                .broadcast_sub(&self.w_avg)?
                .affine(truncation_psi, 0.0)?
                .broadcast_add(&self.w_avg)?;
        }
        Ok(x)
    }
}

/// The normalized [1, 3, 3, 1] low-pass filter used around every resampling.
struct Fir {
    kernel: Tensor,
}

impl Fir {
    fn new(device: &Device) -> Result<Self> {
        let taps = [1f32, 3., 3., 1.];
        let mut values = Vec::with_capacity(16);
        for a in taps {
            for b in taps {
                values.push(a * b / 64.0);
            }
        }
        let kernel = Tensor::from_vec(values, (1, 1, 4, 4), device)?;
        Ok(Self { kernel })
    }

    /// Depthwise filtering with asymmetric zero padding `(before, after)`.
    fn filter(&self, x: &Tensor, pad: (usize, usize), gain: f64) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let x = x
            .reshape((b * c, 1, h, w))?
            .pad_with_zeros(2, pad.0, pad.1)?
            .pad_with_zeros(3, pad.0, pad.1)?;
        let y = x.conv2d(&self.kernel.affine(gain, 0.0)?, 0, 1, 1, 1)?;
        let (_, _, oh, ow) = y.dims4()?;
        y.reshape((b, c, oh, ow))
    }

    /// 2x upsampling: zero insertion followed by filtering.
    fn upsample2d(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let zeros = x.zeros_like()?;
        let x = Tensor::stack(&[x, &zeros], 4)?.reshape((b, c, h, w * 2))?;
        let zeros = x.zeros_like()?;
        let x = Tensor::stack(&[&x, &zeros], 3)?.reshape((b, c, h * 2, w * 2))?;
        self.filter(&x, (2, 1), 4.0)
    }
}

/// Scales the input channels of `weight` by `styles`, optionally
/// normalizing each output filter to unit norm.
fn modulate(weight: &Tensor, styles: &Tensor, demodulate: bool) -> Result<Tensor> {
    let in_channels = weight.dim(1)?;
    let w = weight.broadcast_mul(&styles.reshape((1, in_channels, 1, 1))?)?;
    if !demodulate {
        return Ok(w);
    }
    let dcoefs = w
        .sqr()?
        .sum_keepdim((1, 2, 3))?
        .affine(1.0, 1e-8)?
        .sqrt()?
        .recip()?;
    w.broadcast_mul(&dcoefs)
}

struct SynthesisLayer {
    affine: FullyConnected,
    weight: Tensor,
    bias: Tensor,
    noise: Tensor,
    up: bool,
    conv_clamp: Option<f64>,
}

impl SynthesisLayer {
    fn load(
        vb: VarBuilder,
        config: &StyleGan2Config,
        in_channels: usize,
        out_channels: usize,
        resolution: usize,
        up: bool,
    ) -> Result<Self> {
        let affine = FullyConnected::load(vb.pp("affine"), config.w_dim, in_channels, 1.0)?;
        let weight = vb.get((out_channels, in_channels, 3, 3), "weight")?;
        let bias = vb
            .get(out_channels, "bias")?
            .reshape((1, out_channels, 1, 1))?;
        let strength = vb.get((), "noise_strength")?.to_scalar::<f32>()?;
        let noise = vb
            .get((resolution, resolution), "noise_const")?
            .affine(f64::from(strength), 0.0)?
            .reshape((1, 1, resolution, resolution))?;
        Ok(Self {
            affine,
            weight,
            bias,
            noise,
            up,
            conv_clamp: config.conv_clamp,
        })
    }

    fn forward(&self, x: &Tensor, w: &Tensor, fir: &Fir) -> Result<Tensor> {
        let styles = self.affine.forward(w)?;
        let weight = modulate(&self.weight, &styles, true)?;
        let x = if self.up {
            let kernel = weight.transpose(0, 1)?.contiguous()?;
            let x = x.conv_transpose2d(&kernel, 0, 0, 2, 1)?;
            fir.filter(&x, (1, 1), 4.0)?
        } else {
            x.conv2d(&weight, 1, 1, 1, 1)?
        };
        let x = lrelu(&x.broadcast_add(&self.noise)?.broadcast_add(&self.bias)?)?;
        match self.conv_clamp {
            Some(clamp) => x.clamp(-clamp, clamp),
            None => Ok(x),
        }
    }
}

struct ToRgbLayer {
    affine: FullyConnected,
    weight: Tensor,
    bias: Tensor,
    weight_gain: f64,
    conv_clamp: Option<f64>,
}

impl ToRgbLayer {
    fn load(vb: VarBuilder, config: &StyleGan2Config, in_channels: usize) -> Result<Self> {
        Ok(Self {
            affine: FullyConnected::load(vb.pp("affine"), config.w_dim, in_channels, 1.0)?,
            weight: vb.get((3, in_channels, 1, 1), "weight")?,
            bias: vb.get(3, "bias")?.reshape((1, 3, 1, 1))?,
            weight_gain: 1.0 / (in_channels as f64).sqrt(),
            conv_clamp: config.conv_clamp,
        })
    }

    fn forward(&self, x: &Tensor, w: &Tensor) -> Result<Tensor> {
        let styles = self.affine.forward(w)?.affine(self.weight_gain, 0.0)?;
        let weight = modulate(&self.weight, &styles, false)?;
        let x = x.conv2d(&weight, 0, 1, 1, 1)?.broadcast_add(&self.bias)?;
        match self.conv_clamp {
            Some(clamp) => x.clamp(-clamp, clamp),
            None => Ok(x),
        }
    }
}

struct SynthesisBlock {
    constant: Option<Tensor>,
    conv0: Option<SynthesisLayer>,
    conv1: SynthesisLayer,
    torgb: ToRgbLayer,
}

impl SynthesisBlock {
    fn num_conv(&self) -> usize {
        if self.conv0.is_some() { 2 } else { 1 }
    }

    fn forward(
        &self,
        x: Option<Tensor>,
        img: Option<Tensor>,
        ws: &[Tensor],
        fir: &Fir,
    ) -> Result<(Tensor, Tensor)> {
        let x = match (&self.constant, &self.conv0, x) {
            (Some(constant), _, _) => self.conv1.forward(&constant.unsqueeze(0)?, &ws[0], fir)?,
            (None, Some(conv0), Some(x)) => {
                let x = conv0.forward(&x, &ws[0], fir)?;
                self.conv1.forward(&x, &ws[1], fir)?
            }
            _ => candle_core::bail!("synthesis block is missing its input"),
        };
        let y = self.torgb.forward(&x, &ws[self.num_conv()])?;
        let img = match img {
            Some(img) => fir.upsample2d(&img)?.add(&y)?,
            None => y,
        };
        Ok((x, img))
    }
}

pub struct StyleGan2Generator {
    config: StyleGan2Config,
    mapping: MappingNetwork,
    blocks: Vec<SynthesisBlock>,
    fir: Fir,
    num_ws: usize,
    device: Device,
}

/// Feature maps per block, halving with resolution up to `channel_max`.
pub fn channels_at(config: &StyleGan2Config, resolution: usize) -> usize {
    (config.channel_base / resolution).min(config.channel_max)
}

/// Number of style inputs consumed by a synthesis network of `resolution`.
pub fn num_ws_for(resolution: usize) -> usize {
    let log2 = resolution.trailing_zeros() as usize;
    2 * log2 - 2
}

impl StyleGan2Generator {
    pub fn load(weights: &Path, config: &StyleGan2Config, device: &Device) -> anyhow::Result<Self> {
        info!("Loading networks from \"{}\"...", weights.display());
        // Safety: the file is memory mapped and must not change while loaded.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        Self::new(vb, config.clone())
            .with_context(|| format!("Failed to load StyleGAN2 weights from {}", weights.display()))
    }

    pub fn new(vb: VarBuilder, config: StyleGan2Config) -> anyhow::Result<Self> {
        if config.c_dim != 0 {
            bail!("class-conditional generators are not supported");
        }
        let res = config.img_resolution;
        if res < 4 || !res.is_power_of_two() {
            bail!("img_resolution must be a power of two >= 4, got {res}");
        }

        let device = vb.device().clone();
        let mapping = MappingNetwork::load(vb.pp("mapping"), &config)?;
        let synthesis = vb.pp("synthesis");

        let mut blocks = Vec::new();
        let mut block_res = 4;
        while block_res <= res {
            let vb = synthesis.pp(format!("b{block_res}"));
            let out_channels = channels_at(&config, block_res);
            let block = if block_res == 4 {
                SynthesisBlock {
                    constant: Some(vb.get((out_channels, 4, 4), "const")?),
                    conv0: None,
                    conv1: SynthesisLayer::load(vb.pp("conv1"), &config, out_channels, out_channels, 4, false)?,
                    torgb: ToRgbLayer::load(vb.pp("torgb"), &config, out_channels)?,
                }
            } else {
                let in_channels = channels_at(&config, block_res / 2);
                SynthesisBlock {
                    constant: None,
                    conv0: Some(SynthesisLayer::load(
                        vb.pp("conv0"),
                        &config,
                        in_channels,
                        out_channels,
                        block_res,
                        true,
                    )?),
                    conv1: SynthesisLayer::load(
                        vb.pp("conv1"),
                        &config,
                        out_channels,
                        out_channels,
                        block_res,
                        false,
                    )?,
                    torgb: ToRgbLayer::load(vb.pp("torgb"), &config, out_channels)?,
                }
            };
            blocks.push(block);
            block_res *= 2;
        }

        Ok(Self {
            num_ws: num_ws_for(res),
            fir: Fir::new(&device)?,
            config,
            mapping,
            blocks,
            device,
        })
    }

    fn to_image(&self, img: &Tensor) -> Result<RgbImage> {
        let (_, _, h, w) = img.dims4()?;
        let pixels = img
            .squeeze(0)?
            .affine(127.5, 128.0)?
            .clamp(0f32, 255f32)?
            .to_dtype(DType::U8)?
            .permute((1, 2, 0))?
            .contiguous()?
            .flatten_all()?
            .to_vec1::<u8>()?;
        RgbImage::from_raw(w as u32, h as u32, pixels)
            .ok_or_else(|| candle_core::Error::Msg("image buffer size mismatch".to_string()))
    }
}

impl FaceGenerator for StyleGan2Generator {
    fn info(&self) -> NetworkInfo {
        NetworkInfo {
            resolution: self.config.img_resolution,
            mapping_layers: self.config.mapping_layers,
            synthesis_layers: self.num_ws,
            latent_dim: self.config.z_dim,
            conditioning_dim: self.config.c_dim,
            device: device::describe(&self.device),
        }
    }

    fn map(&self, z: &[f32], truncation_psi: f32) -> anyhow::Result<WLatent> {
        if z.len() != self.config.z_dim {
            bail!("expected a latent of {} values, got {}", self.config.z_dim, z.len());
        }
        let z = Tensor::from_slice(z, (1, self.config.z_dim), &self.device)?;
        let w = self
            .mapping
            .forward(&z, f64::from(truncation_psi))?
            .squeeze(0)?
            .to_vec1::<f32>()?;
        Ok(WLatent::broadcast(w, self.num_ws))
    }

    fn synthesize(&self, w: &WLatent) -> anyhow::Result<RgbImage> {
        if w.num_ws() != self.num_ws {
            bail!("expected {} style vectors, got {}", self.num_ws, w.num_ws());
        }
        let ws = w
            .layers()
            .iter()
            .map(|layer| Tensor::from_slice(layer, (1, self.config.w_dim), &self.device))
            .collect::<Result<Vec<_>>>()?;

        let mut x = None;
        let mut img = None;
        let mut w_idx = 0;
        for block in &self.blocks {
            let (next_x, next_img) = block.forward(x, img, &ws[w_idx..], &self.fir)?;
            w_idx += block.num_conv();
            x = Some(next_x);
            img = Some(next_img);
        }
        let img = img.context("synthesis network has no blocks")?;
        Ok(self.to_image(&img)?)
    }
}
