//! Timestep-conditioned 2D UNet.
//!
//! The channel schedule lists the width of every resolution level, from the
//! input resolution inwards. Each level gets a down block, mirrored by an up
//! block with one extra residual layer so that the last up layer can consume
//! the output of the input convolution.

use super::embeddings::{timestep_embedding, TimestepEmbedding, TimestepEmbeddingConfig, MAX_PERIOD};
use super::layers::{PreActConv, PreActConvConfig};
use super::resnet::{EmbResBlock, EmbResBlockConfig};
use super::unet_2d_blocks::{DownBlock, DownBlockConfig, SkipStack, UpBlock, UpBlockConfig};
use crate::error::{Error, Result};
use alloc::vec;
use alloc::vec::Vec;
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNormConfig, PaddingConfig2d};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use core::iter;

#[derive(Config, Debug)]
pub struct EmbUNetConfig {
    #[config(default = 3)]
    pub in_channels: usize,
    #[config(default = 3)]
    pub out_channels: usize,
    /// Width of every resolution level, outermost first.
    #[config(default = "vec![224, 448, 672, 896]")]
    pub block_out_channels: Vec<usize>,
    /// Residual layers per down block. Up blocks get one more.
    #[config(default = 1)]
    pub num_layers: usize,
    /// Channels per attention head.
    #[config(default = 8)]
    pub attn_chans: usize,
    /// First level, counted from the outside, that uses attention.
    #[config(default = 1)]
    pub attn_start: usize,
}

impl EmbUNetConfig {
    /// Width of the sinusoidal timestep embedding.
    pub fn n_temb(&self) -> usize {
        self.block_out_channels.first().copied().unwrap_or_default()
    }

    /// Width of the embedding fed to every residual block.
    pub fn n_emb(&self) -> usize {
        4 * self.n_temb()
    }

    fn levels(&self) -> usize {
        self.block_out_channels.len()
    }

    fn validate(&self) -> Result<()> {
        let levels = self.levels();
        if levels == 0 {
            return Err(Error::EmptySchedule);
        }
        if self.in_channels == 0 || self.out_channels == 0 || self.block_out_channels.contains(&0)
        {
            return Err(Error::ZeroChannels { block: "unet" });
        }
        if self.num_layers == 0 {
            return Err(Error::NoLayers { block: "unet" });
        }
        if self.attn_start > levels {
            return Err(Error::AttentionStart {
                attn_start: self.attn_start,
                levels,
            });
        }
        Ok(())
    }

    /// Down blocks, outermost first. Assumes a validated schedule.
    pub fn down_blocks(&self) -> Vec<DownBlockConfig> {
        let levels = self.levels();
        let mut out_channels = self.n_temb();
        self.block_out_channels
            .iter()
            .enumerate()
            .map(|(i, &channels)| {
                let in_channels = out_channels;
                out_channels = channels;
                let attn_chans = if i < self.attn_start {
                    0
                } else {
                    self.attn_chans
                };
                DownBlockConfig::new(self.n_emb(), in_channels, out_channels)
                    .with_add_down(i + 1 != levels)
                    .with_num_layers(self.num_layers)
                    .with_attn_chans(attn_chans)
            })
            .collect()
    }

    /// Up blocks, innermost first. Assumes a validated schedule.
    pub fn up_blocks(&self) -> Vec<UpBlockConfig> {
        let levels = self.levels();
        let reversed: Vec<usize> = self.block_out_channels.iter().rev().copied().collect();
        let Some(&innermost) = reversed.first() else {
            return Vec::new();
        };
        let mut out_channels = innermost;
        (0..levels)
            .map(|i| {
                let prev_out_channels = out_channels;
                out_channels = reversed[i];
                let in_channels = reversed[(i + 1).min(levels - 1)];
                let attn_chans = if i + self.attn_start >= levels {
                    0
                } else {
                    self.attn_chans
                };
                UpBlockConfig::new(self.n_emb(), in_channels, prev_out_channels, out_channels)
                    .with_add_up(i + 1 != levels)
                    .with_num_layers(self.num_layers + 1)
                    .with_attn_chans(attn_chans)
            })
            .collect()
    }

    #[tracing::instrument(skip_all, name = "EmbUNetConfig::init")]
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<EmbUNetModel<B>> {
        self.validate()?;
        let n_temb = self.n_temb();
        let n_emb = self.n_emb();
        let down_configs = self.down_blocks();
        let up_configs = self.up_blocks();
        let num_skips = skip_plan(n_temb, &down_configs, &up_configs)?;

        let conv_in = Conv2dConfig::new([self.in_channels, n_temb], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let emb_mlp = TimestepEmbeddingConfig::new(n_temb, n_emb).init(device);

        let downs = down_configs
            .iter()
            .map(|config| config.init::<B>(device))
            .collect::<Result<Vec<_>>>()?;
        let mid_channels = self.block_out_channels[self.levels() - 1];
        let mid = EmbResBlockConfig::new(n_emb, mid_channels).init(device)?;
        let ups = up_configs
            .iter()
            .map(|config| config.init::<B>(device))
            .collect::<Result<Vec<_>>>()?;

        let conv_out = PreActConvConfig::new([n_temb, self.out_channels])
            .with_norm(Some(BatchNormConfig::new(n_temb).into()))
            .with_bias(false)
            .init(device);

        let downsample_factor = 1 << down_configs.iter().filter(|down| down.add_down).count();

        tracing::debug!(
            levels = self.levels(),
            n_emb,
            num_skips,
            downsample_factor,
            "assembled unet"
        );

        Ok(EmbUNetModel {
            conv_in,
            emb_mlp,
            downs,
            mid,
            ups,
            conv_out,
            downsample_factor,
        })
    }
}

/// Replays the skip pushes and pops of one forward pass on channel widths alone.
///
/// Returns the number of skips exchanged between the encoder and the decoder.
pub(crate) fn skip_plan(
    first_channels: usize,
    downs: &[DownBlockConfig],
    ups: &[UpBlockConfig],
) -> Result<usize> {
    let mut widths: Vec<usize> = iter::once(first_channels)
        .chain(
            downs
                .iter()
                .flat_map(|down| iter::repeat(down.out_channels).take(down.num_saved())),
        )
        .collect();
    let pushes = widths.len();
    let pops = ups.iter().map(|up| up.num_layers).sum();
    if pushes != pops {
        return Err(Error::UnbalancedSkips { pushes, pops });
    }

    for up in ups {
        for i in 0..up.num_layers {
            let width = widths
                .pop()
                .ok_or(Error::SkipStackExhausted { pops: pushes - widths.len() })?;
            if width != up.skip_channels(i) {
                return Err(Error::SkipChannels {
                    expected: up.res_channels(i) + up.skip_channels(i),
                    actual: up.res_channels(i) + width,
                });
            }
        }
    }
    Ok(pushes)
}

#[derive(Module, Debug)]
pub struct EmbUNetModel<B: Backend> {
    conv_in: Conv2d<B>,
    emb_mlp: TimestepEmbedding<B>,
    downs: Vec<DownBlock<B>>,
    mid: EmbResBlock<B>,
    ups: Vec<UpBlock<B>>,
    conv_out: PreActConv<B>,
    downsample_factor: usize,
}

impl<B: Backend> EmbUNetModel<B> {
    /// Predicts a tensor shaped like `xs` from the images and their timesteps.
    pub fn forward(&self, xs: Tensor<B, 4>, timesteps: Tensor<B, 1>) -> Result<Tensor<B, 4>> {
        self.check_input(&xs, &timesteps)?;

        let temb = timestep_embedding(timesteps, self.emb_mlp.channel(), MAX_PERIOD);
        let emb = self.emb_mlp.forward(temb);

        let xs = self.conv_in.forward(xs);
        let mut skips = SkipStack::new();
        skips.push(xs.clone());

        let mut xs = xs;
        for down in self.downs.iter() {
            let (down_xs, saved) = down.forward(xs, emb.clone())?;
            skips.extend(saved);
            xs = down_xs;
        }

        let mut xs = self.mid.forward(xs, emb.clone())?;

        for up in self.ups.iter() {
            xs = up.forward(xs, emb.clone(), &mut skips)?;
        }
        skips.finish()?;

        Ok(self.conv_out.forward(xs))
    }

    fn check_input(&self, xs: &Tensor<B, 4>, timesteps: &Tensor<B, 1>) -> Result<()> {
        let [batch_size, channels, height, width] = xs.dims();
        let [timesteps_len] = timesteps.dims();
        if timesteps_len != batch_size {
            return Err(Error::TimestepBatch {
                timesteps: timesteps_len,
                images: batch_size,
            });
        }
        let [_, in_channels, _, _] = self.conv_in.weight.dims();
        if channels != in_channels {
            return Err(Error::InputChannels {
                expected: in_channels,
                actual: channels,
            });
        }
        if height % self.downsample_factor != 0 || width % self.downsample_factor != 0 {
            return Err(Error::SpatialSize {
                height,
                width,
                factor: self.downsample_factor,
            });
        }
        Ok(())
    }
}
