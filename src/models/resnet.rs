//! ResNet Building Blocks
//!
//! Residual blocks used in UNet models.
//!
//! Deep Residual Learning for Image Recognition, K. He and al, 2015.
//! https://arxiv.org/abs/1512.03385
//!
//! [`ResBlock`] is the classic post-activation block. [`EmbResBlock`] is a
//! pre-activation block whose features are scaled and shifted per channel by a
//! projection of the timestep embedding (FiLM conditioning).

use super::activation::{Activation, ActivationConfig, GeneralReluConfig};
use super::attention::{SelfAttention2d, SelfAttention2dConfig};
use super::layers::{ConvBlock, ConvBlockConfig, PreActConv, PreActConvConfig};
use crate::error::{Error, Result};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::norm::NormalizationConfig;
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::{BatchNormConfig, Linear, LinearConfig};
use burn::tensor::activation::silu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Configuration for a classic [`ResBlock`].
#[derive(Config, Debug)]
pub struct ResBlockConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = "ActivationConfig::GeneralRelu(GeneralReluConfig::leaky_shifted())")]
    pub activation: ActivationConfig,
    pub norm: Option<NormalizationConfig>,
}

impl ResBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResBlock<B> {
        let conv1 = ConvBlockConfig::new([self.in_channels, self.out_channels])
            .with_kernel_size(self.kernel_size)
            .with_stride(1)
            .with_activation(Some(self.activation.clone()))
            .with_norm(self.norm.clone())
            .init(device);
        let conv2 = ConvBlockConfig::new([self.out_channels, self.out_channels])
            .with_kernel_size(self.kernel_size)
            .with_stride(self.stride)
            .with_activation(None)
            .with_norm(self.norm.clone())
            .init(device);

        let conv_shortcut = (self.in_channels != self.out_channels).then(|| {
            ConvBlockConfig::new([self.in_channels, self.out_channels])
                .with_kernel_size(1)
                .with_stride(1)
                .with_activation(None)
                .init(device)
        });
        let pool = (self.stride != 1).then(|| {
            AvgPool2dConfig::new([2, 2])
                .with_strides([2, 2])
                .with_ceil_mode(true)
                .with_count_include_pad(false)
                .init()
        });

        ResBlock {
            conv1,
            conv2,
            conv_shortcut,
            pool,
            activation: self.activation.init(),
        }
    }
}

#[derive(Module, Debug)]
pub struct ResBlock<B: Backend> {
    conv1: ConvBlock<B>,
    conv2: ConvBlock<B>,
    conv_shortcut: Option<ConvBlock<B>>,
    pool: Option<AvgPool2d>,
    activation: Activation,
}

impl<B: Backend> ResBlock<B> {
    pub fn forward(&self, xs: Tensor<B, 4>) -> Tensor<B, 4> {
        let shortcut_xs = match &self.pool {
            Some(pool) => pool.forward(xs.clone()),
            None => xs.clone(),
        };
        let shortcut_xs = match &self.conv_shortcut {
            Some(conv_shortcut) => conv_shortcut.forward(shortcut_xs),
            None => shortcut_xs,
        };

        let xs = self.conv2.forward(self.conv1.forward(xs));

        self.activation.forward(xs + shortcut_xs)
    }
}

/// Configuration for an embedding-conditioned [`EmbResBlock`].
#[derive(Config, Debug)]
pub struct EmbResBlockConfig {
    /// Width of the conditioning embedding.
    pub n_emb: usize,
    pub in_channels: usize,
    /// The number of output channels, defaults to the number of input channels.
    pub out_channels: Option<usize>,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = "ActivationConfig::Silu")]
    pub activation: ActivationConfig,
    #[config(default = "Some(BatchNormConfig::new(0).into())")]
    pub norm: Option<NormalizationConfig>,
    /// Channels per attention head. Zero disables the attention stage.
    #[config(default = 0)]
    pub attn_chans: usize,
}

impl EmbResBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<EmbResBlock<B>> {
        let out_channels = self.out_channels.unwrap_or(self.in_channels);
        if self.n_emb == 0 || self.in_channels == 0 || out_channels == 0 {
            return Err(Error::ZeroChannels { block: "res block" });
        }

        let pre_conv = |channels| {
            PreActConvConfig::new(channels)
                .with_kernel_size(self.kernel_size)
                .with_activation(Some(self.activation.clone()))
                .with_norm(self.norm.clone())
                .init::<B>(device)
        };
        let conv1 = pre_conv([self.in_channels, out_channels]);
        let conv2 = pre_conv([out_channels, out_channels]);

        let emb_proj = LinearConfig::new(self.n_emb, 2 * out_channels).init(device);
        let conv_shortcut = (self.in_channels != out_channels)
            .then(|| Conv2dConfig::new([self.in_channels, out_channels], [1, 1]).init(device));
        let attention = if self.attn_chans > 0 {
            Some(SelfAttention2dConfig::new(out_channels, self.attn_chans).init(device)?)
        } else {
            None
        };

        Ok(EmbResBlock {
            emb_proj,
            conv1,
            conv2,
            conv_shortcut,
            attention,
            n_emb: self.n_emb,
            in_channels: self.in_channels,
            out_channels,
        })
    }
}

#[derive(Module, Debug)]
pub struct EmbResBlock<B: Backend> {
    emb_proj: Linear<B>,
    conv1: PreActConv<B>,
    conv2: PreActConv<B>,
    conv_shortcut: Option<Conv2d<B>>,
    attention: Option<SelfAttention2d<B>>,
    n_emb: usize,
    in_channels: usize,
    out_channels: usize,
}

impl<B: Backend> EmbResBlock<B> {
    pub fn forward(&self, xs: Tensor<B, 4>, emb: Tensor<B, 2>) -> Result<Tensor<B, 4>> {
        let [_, n_emb] = emb.dims();
        if n_emb != self.n_emb {
            return Err(Error::EmbeddingWidth {
                expected: self.n_emb,
                actual: n_emb,
            });
        }
        let [_, channels, _, _] = xs.dims();
        if channels != self.in_channels {
            return Err(Error::InputChannels {
                expected: self.in_channels,
                actual: channels,
            });
        }

        let shortcut_xs = match &self.conv_shortcut {
            Some(conv_shortcut) => conv_shortcut.forward(xs.clone()),
            None => xs.clone(),
        };

        let hs = self.conv1.forward(xs);
        let emb = self.emb_proj.forward(silu(emb));
        let [batch_size, width] = emb.dims();
        let emb = emb.reshape([batch_size, width, 1, 1]);
        let scale = emb.clone().narrow(1, 0, self.out_channels);
        let shift = emb.narrow(1, self.out_channels, self.out_channels);
        let hs = hs * scale.add_scalar(1.) + shift;
        let hs = self.conv2.forward(hs);

        let xs = hs + shortcut_xs;
        Ok(match &self.attention {
            Some(attention) => xs.clone() + attention.forward(xs),
            None => xs,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}
