//! 2D UNet Building Blocks
//!
//! Down blocks record the output of every residual layer and of the
//! down-sampling conv. The U-Net gathers those outputs on a [`SkipStack`],
//! and up blocks pop them back in reverse order to concatenate with the
//! decoder activations.

use super::resnet::{EmbResBlock, EmbResBlockConfig};
use crate::error::{Error, Result};
use alloc::vec;
use alloc::vec::Vec;
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::interpolate::{Interpolate2d, Interpolate2dConfig, InterpolateMode};
use burn::nn::PaddingConfig2d;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Last-in first-out stack of skip activations, local to one forward pass.
#[derive(Debug)]
pub struct SkipStack<B: Backend> {
    skips: Vec<Tensor<B, 4>>,
    pushes: usize,
    pops: usize,
}

impl<B: Backend> Default for SkipStack<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> SkipStack<B> {
    pub fn new() -> Self {
        Self {
            skips: Vec::new(),
            pushes: 0,
            pops: 0,
        }
    }

    pub fn push(&mut self, skip: Tensor<B, 4>) {
        tracing::trace!(index = self.skips.len(), shape = ?skip.dims(), "push skip");
        self.pushes += 1;
        self.skips.push(skip);
    }

    /// Pops the most recent skip that has not been consumed yet.
    pub fn pop(&mut self) -> Result<Tensor<B, 4>> {
        let skip = self
            .skips
            .pop()
            .ok_or(Error::SkipStackExhausted { pops: self.pops })?;
        self.pops += 1;
        tracing::trace!(remaining = self.skips.len(), shape = ?skip.dims(), "pop skip");
        Ok(skip)
    }

    pub fn len(&self) -> usize {
        self.skips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skips.is_empty()
    }

    /// Total pushes over the lifetime of the stack.
    pub fn pushes(&self) -> usize {
        self.pushes
    }

    /// Total successful pops over the lifetime of the stack.
    pub fn pops(&self) -> usize {
        self.pops
    }

    /// Consumes the stack, failing if any skip was left behind.
    pub fn finish(self) -> Result<()> {
        if self.skips.is_empty() {
            Ok(())
        } else {
            Err(Error::UnconsumedSkips {
                remaining: self.skips.len(),
            })
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor<B, 4>> {
        self.skips.iter()
    }
}

impl<B: Backend> Extend<Tensor<B, 4>> for SkipStack<B> {
    fn extend<I: IntoIterator<Item = Tensor<B, 4>>>(&mut self, iter: I) {
        for skip in iter {
            self.push(skip);
        }
    }
}

impl<B: Backend> IntoIterator for SkipStack<B> {
    type Item = Tensor<B, 4>;
    type IntoIter = vec::IntoIter<Tensor<B, 4>>;

    fn into_iter(self) -> Self::IntoIter {
        self.skips.into_iter()
    }
}

/// A U-Net stage conditioned on the timestep embedding.
pub trait UNetBlock<B: Backend> {
    fn forward(&self, xs: Tensor<B, 4>, emb: Tensor<B, 2>) -> Result<Tensor<B, 4>>;

    /// Runs the block and records its output on `saved`.
    fn forward_saved(
        &self,
        xs: Tensor<B, 4>,
        emb: Tensor<B, 2>,
        saved: &mut SkipStack<B>,
    ) -> Result<Tensor<B, 4>> {
        let xs = self.forward(xs, emb)?;
        saved.push(xs.clone());
        Ok(xs)
    }
}

impl<B: Backend> UNetBlock<B> for EmbResBlock<B> {
    fn forward(&self, xs: Tensor<B, 4>, emb: Tensor<B, 2>) -> Result<Tensor<B, 4>> {
        EmbResBlock::forward(self, xs, emb)
    }
}

/// Strided 3x3 convolution halving the spatial size.
#[derive(Module, Debug)]
pub struct Downsample2d<B: Backend> {
    conv: Conv2d<B>,
}

impl<B: Backend> Downsample2d<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([channels, channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        Self { conv }
    }
}

impl<B: Backend> UNetBlock<B> for Downsample2d<B> {
    fn forward(&self, xs: Tensor<B, 4>, _emb: Tensor<B, 2>) -> Result<Tensor<B, 4>> {
        Ok(self.conv.forward(xs))
    }
}

/// Nearest-neighbour doubling of the spatial size followed by a 3x3 convolution.
// This does not support the conv-transpose mode.
#[derive(Module, Debug)]
pub struct Upsample2d<B: Backend> {
    interpolate: Interpolate2d,
    conv: Conv2d<B>,
}

impl<B: Backend> Upsample2d<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let interpolate = Interpolate2dConfig::new()
            .with_mode(InterpolateMode::Nearest)
            .with_scale_factor(Some([2.0, 2.0]))
            .init();
        let conv = Conv2dConfig::new([channels, channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        Self { interpolate, conv }
    }
}

impl<B: Backend> UNetBlock<B> for Upsample2d<B> {
    fn forward(&self, xs: Tensor<B, 4>, _emb: Tensor<B, 2>) -> Result<Tensor<B, 4>> {
        Ok(self.conv.forward(self.interpolate.forward(xs)))
    }
}

#[derive(Config, Debug)]
pub struct DownBlockConfig {
    pub n_emb: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    #[config(default = true)]
    pub add_down: bool,
    #[config(default = 1)]
    pub num_layers: usize,
    /// Channels per attention head, zero for no attention.
    #[config(default = 0)]
    pub attn_chans: usize,
}

impl DownBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DownBlock<B>> {
        if self.num_layers == 0 {
            return Err(Error::NoLayers { block: "down block" });
        }
        let resnets = (0..self.num_layers)
            .map(|i| {
                let in_channels = if i == 0 {
                    self.in_channels
                } else {
                    self.out_channels
                };
                EmbResBlockConfig::new(self.n_emb, in_channels)
                    .with_out_channels(Some(self.out_channels))
                    .with_attn_chans(self.attn_chans)
                    .init::<B>(device)
            })
            .collect::<Result<Vec<_>>>()?;
        let downsampler = self
            .add_down
            .then(|| Downsample2d::new(self.out_channels, device));

        Ok(DownBlock {
            resnets,
            downsampler,
        })
    }

    /// Number of skips one forward pass records.
    pub fn num_saved(&self) -> usize {
        self.num_layers + usize::from(self.add_down)
    }
}

#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    resnets: Vec<EmbResBlock<B>>,
    downsampler: Option<Downsample2d<B>>,
}

impl<B: Backend> DownBlock<B> {
    /// Returns the block output with the outputs recorded along the way,
    /// oldest first. Every call starts from an empty record.
    pub fn forward(
        &self,
        xs: Tensor<B, 4>,
        emb: Tensor<B, 2>,
    ) -> Result<(Tensor<B, 4>, SkipStack<B>)> {
        let mut saved = SkipStack::new();
        let mut xs = xs;
        for resnet in self.resnets.iter() {
            xs = resnet.forward_saved(xs, emb.clone(), &mut saved)?;
        }
        if let Some(downsampler) = &self.downsampler {
            xs = downsampler.forward_saved(xs, emb, &mut saved)?;
        }
        Ok((xs, saved))
    }
}

#[derive(Config, Debug)]
pub struct UpBlockConfig {
    pub n_emb: usize,
    /// Input channels of the mirrored down block, consumed by the last layer.
    pub in_channels: usize,
    /// Output channels of the previous up block (or the middle block).
    pub prev_out_channels: usize,
    pub out_channels: usize,
    #[config(default = true)]
    pub add_up: bool,
    #[config(default = 2)]
    pub num_layers: usize,
    #[config(default = 0)]
    pub attn_chans: usize,
}

impl UpBlockConfig {
    /// Width of the skip popped by layer `i`.
    pub fn skip_channels(&self, i: usize) -> usize {
        if i + 1 == self.num_layers {
            self.in_channels
        } else {
            self.out_channels
        }
    }

    /// Width of the activation entering layer `i`, before concatenation.
    pub fn res_channels(&self, i: usize) -> usize {
        if i == 0 {
            self.prev_out_channels
        } else {
            self.out_channels
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<UpBlock<B>> {
        if self.num_layers == 0 {
            return Err(Error::NoLayers { block: "up block" });
        }
        let resnets = (0..self.num_layers)
            .map(|i| {
                EmbResBlockConfig::new(self.n_emb, self.res_channels(i) + self.skip_channels(i))
                    .with_out_channels(Some(self.out_channels))
                    .with_attn_chans(self.attn_chans)
                    .init::<B>(device)
            })
            .collect::<Result<Vec<_>>>()?;
        let upsampler = self
            .add_up
            .then(|| Upsample2d::new(self.out_channels, device));

        Ok(UpBlock { resnets, upsampler })
    }
}

#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    resnets: Vec<EmbResBlock<B>>,
    upsampler: Option<Upsample2d<B>>,
}

impl<B: Backend> UpBlock<B> {
    /// Pops one skip per layer from `skips`.
    pub fn forward(
        &self,
        xs: Tensor<B, 4>,
        emb: Tensor<B, 2>,
        skips: &mut SkipStack<B>,
    ) -> Result<Tensor<B, 4>> {
        let mut xs = xs;
        for resnet in self.resnets.iter() {
            let skip = skips.pop()?;
            let [batch_size, _, height, width] = xs.dims();
            let [skip_batch_size, _, skip_height, skip_width] = skip.dims();
            if (batch_size, height, width) != (skip_batch_size, skip_height, skip_width) {
                return Err(Error::SkipShape {
                    x: xs.dims(),
                    skip: skip.dims(),
                });
            }
            xs = resnet.forward(Tensor::cat(vec![xs, skip], 1), emb.clone())?;
        }
        match &self.upsampler {
            Some(upsampler) => upsampler.forward(xs, emb),
            None => Ok(xs),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.resnets.len()
    }
}
