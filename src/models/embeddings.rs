//! Timestep embeddings.

use super::layers::{PreActLinear, PreActLinearConfig};
use crate::utils::pad_with_zeros;
use alloc::vec;
use burn::config::Config;
use burn::module::Module;
use burn::nn::BatchNormConfig;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// Longest period of the sinusoidal timestep embedding.
pub const MAX_PERIOD: f64 = 10000.;

/// Sinusoidal embedding of a batch of (possibly fractional) timesteps.
///
/// The frequencies are spaced geometrically from 1 down to `1 / max_period`.
/// The output holds the sines followed by the cosines, with a zero column
/// appended when `dim` is odd.
pub fn timestep_embedding<B: Backend>(
    timesteps: Tensor<B, 1>,
    dim: usize,
    max_period: f64,
) -> Tensor<B, 2> {
    let half_dim = dim / 2;
    let device = timesteps.device();
    let step = if half_dim > 1 {
        -num_traits::Float::ln(max_period) / (half_dim - 1) as f64
    } else {
        0.
    };

    let exponent = Tensor::<B, 1, Int>::arange(0..half_dim as i64, &device)
        .float()
        .mul_scalar(step);
    let emb = timesteps.unsqueeze_dim::<2>(1) * exponent.exp().unsqueeze_dim::<2>(0);
    let emb = Tensor::cat(vec![emb.clone().sin(), emb.cos()], 1);

    if dim % 2 == 1 {
        pad_with_zeros(emb, 1, 0, 1)
    } else {
        emb
    }
}

/// Configuration for the [`TimestepEmbedding`] MLP.
#[derive(Config, Debug)]
pub struct TimestepEmbeddingConfig {
    /// Width of the sinusoidal embedding.
    pub channel: usize,
    pub time_embed_dim: usize,
}

impl TimestepEmbeddingConfig {
    /// Initialize a new [embedding](TimestepEmbedding) module.
    /// The first stage is batch normalized, both use "silu".
    pub fn init<B: Backend>(&self, device: &B::Device) -> TimestepEmbedding<B> {
        let linear_1 = PreActLinearConfig::new(self.channel, self.time_embed_dim)
            .with_norm(Some(BatchNormConfig::new(self.channel).into()))
            .init(device);
        let linear_2 = PreActLinearConfig::new(self.time_embed_dim, self.time_embed_dim).init(device);
        TimestepEmbedding { linear_1, linear_2 }
    }
}

#[derive(Module, Debug)]
pub struct TimestepEmbedding<B: Backend> {
    linear_1: PreActLinear<B>,
    linear_2: PreActLinear<B>,
}

impl<B: Backend> TimestepEmbedding<B> {
    pub fn forward(&self, xs: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear_2.forward(self.linear_1.forward(xs))
    }

    pub fn channel(&self) -> usize {
        let [d_input, _] = self.linear_1.linear.weight.dims();
        d_input
    }

    pub fn time_embed_dim(&self) -> usize {
        let [_, d_output] = self.linear_2.linear.weight.dims();
        d_output
    }
}
