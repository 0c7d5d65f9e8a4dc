//! Attention Based Building Blocks

use crate::error::{Error, Result};
use burn::config::Config;
use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Configuration for multi-head [`SelfAttention`] over a sequence.
#[derive(Config, Debug)]
pub struct SelfAttentionConfig {
    /// Channels of every sequence element.
    pub channels: usize,
    /// Channels handled by each head.
    pub head_channels: usize,
    /// Inputs are laid out as `[batch, channels, seq]` rather than `[batch, seq, channels]`.
    #[config(default = true)]
    pub transpose: bool,
}

impl SelfAttentionConfig {
    /// Fails when the channels cannot be split evenly into heads.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SelfAttention<B>> {
        if self.channels == 0 {
            return Err(Error::ZeroChannels { block: "attention" });
        }
        if self.head_channels == 0 || self.channels % self.head_channels != 0 {
            return Err(Error::HeadChannels {
                channels: self.channels,
                head_channels: self.head_channels,
            });
        }
        let n_heads = self.channels / self.head_channels;

        Ok(SelfAttention {
            norm: LayerNormConfig::new(self.channels).init(device),
            qkv: LinearConfig::new(self.channels, 3 * self.channels).init(device),
            proj: LinearConfig::new(self.channels, self.channels).init(device),
            n_heads,
            scale: num_traits::Float::sqrt((self.channels / n_heads) as f64),
            transpose: self.transpose,
        })
    }
}

#[derive(Module, Debug)]
pub struct SelfAttention<B: Backend> {
    norm: LayerNorm<B>,
    qkv: Linear<B>,
    proj: Linear<B>,
    n_heads: usize,
    scale: f64,
    transpose: bool,
}

impl<B: Backend> SelfAttention<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = if self.transpose { x.swap_dims(1, 2) } else { x };
        let x = self.norm.forward(x);

        // Every head takes its query, key and value from its own slice of the projection.
        let qkv = self.reshape_heads_to_batch_dim(self.qkv.forward(x));
        let [_, _, width] = qkv.dims();
        let d_head = width / 3;
        let q = qkv.clone().narrow(2, 0, d_head);
        let k = qkv.clone().narrow(2, d_head, d_head);
        let v = qkv.narrow(2, 2 * d_head, d_head);

        let scores = q.matmul(k.swap_dims(1, 2)).div_scalar(self.scale);
        let x = softmax(scores, 2).matmul(v);

        let x = self.proj.forward(self.reshape_batch_dim_to_heads(x));
        if self.transpose {
            x.swap_dims(1, 2)
        } else {
            x
        }
    }

    fn reshape_heads_to_batch_dim(&self, xs: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch_size, seq_len, dim] = xs.dims();
        xs.reshape([batch_size, seq_len, self.n_heads, dim / self.n_heads])
            .swap_dims(1, 2)
            .reshape([batch_size * self.n_heads, seq_len, dim / self.n_heads])
    }

    fn reshape_batch_dim_to_heads(&self, xs: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch_size, seq_len, dim] = xs.dims();
        xs.reshape([batch_size / self.n_heads, self.n_heads, seq_len, dim])
            .swap_dims(1, 2)
            .reshape([batch_size / self.n_heads, seq_len, dim * self.n_heads])
    }
}

/// Configuration for [`SelfAttention2d`], attention across the pixels of a feature map.
#[derive(Config, Debug)]
pub struct SelfAttention2dConfig {
    pub channels: usize,
    pub head_channels: usize,
}

impl SelfAttention2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SelfAttention2d<B>> {
        let attention = SelfAttentionConfig::new(self.channels, self.head_channels).init(device)?;
        Ok(SelfAttention2d { attention })
    }
}

#[derive(Module, Debug)]
pub struct SelfAttention2d<B: Backend> {
    attention: SelfAttention<B>,
}

impl<B: Backend> SelfAttention2d<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch_size, channels, height, width] = x.dims();
        let x = x.reshape([batch_size, channels, height * width]);
        self.attention
            .forward(x)
            .reshape([batch_size, channels, height, width])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::module::{ModuleMapper, Param};
    use burn::tensor::ops::FloatElem;
    use burn::tensor::{Distribution, Tolerance};
    use proptest::prelude::*;

    type FT = FloatElem<TestBackend>;

    struct Zeros;

    impl<B: Backend> ModuleMapper<B> for Zeros {
        fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
            param.map(|tensor| tensor.zeros_like())
        }
    }

    #[test]
    fn heads_must_divide_channels() {
        let device = Default::default();
        let err = SelfAttentionConfig::new(12, 5)
            .init::<TestBackend>(&device)
            .unwrap_err();
        assert_eq!(
            err,
            Error::HeadChannels {
                channels: 12,
                head_channels: 5
            }
        );

        assert!(SelfAttentionConfig::new(12, 0)
            .init::<TestBackend>(&device)
            .is_err());
        assert!(SelfAttention2dConfig::new(0, 4)
            .init::<TestBackend>(&device)
            .is_err());
    }

    #[test]
    fn scale_uses_head_width() {
        let device = Default::default();
        let attention = SelfAttentionConfig::new(16, 4)
            .init::<TestBackend>(&device)
            .unwrap();

        assert_eq!(attention.n_heads, 4);
        assert!((attention.scale - 2.0).abs() < 1e-12);
    }

    #[test]
    fn untransposed_sequence_layout() {
        let device = Default::default();
        let attention = SelfAttentionConfig::new(8, 2)
            .with_transpose(false)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 3>::random([2, 5, 8], Distribution::Default, &device);

        assert_eq!(attention.forward(x).dims(), [2, 5, 8]);
    }

    #[test]
    fn zero_weights_give_zero_output() {
        let device = Default::default();
        let attention = SelfAttention2dConfig::new(8, 4)
            .init::<TestBackend>(&device)
            .unwrap()
            .map(&mut Zeros);
        let x = Tensor::<TestBackend, 4>::random([1, 8, 3, 3], Distribution::Default, &device);

        attention
            .forward(x.clone())
            .to_data()
            .assert_approx_eq::<FT>(&x.zeros_like().to_data(), Tolerance::default());
    }

    /// Attention computed one sample and one head at a time. Head `h` takes its
    /// query, key and value from consecutive slices of its own block of the
    /// fused projection.
    fn attention_per_head(
        attention: &SelfAttention<TestBackend>,
        x: Tensor<TestBackend, 3>,
    ) -> Tensor<TestBackend, 3> {
        let [batch_size, seq_len, channels] = x.dims();
        let d_head = channels / attention.n_heads;
        let qkv = attention.qkv.forward(attention.norm.forward(x));

        let samples = (0..batch_size)
            .map(|b| {
                let qkv = qkv.clone().narrow(0, b, 1).reshape([seq_len, 3 * channels]);
                let heads = (0..attention.n_heads)
                    .map(|h| {
                        let block = qkv.clone().narrow(1, 3 * d_head * h, 3 * d_head);
                        let q = block.clone().narrow(1, 0, d_head);
                        let k = block.clone().narrow(1, d_head, d_head);
                        let v = block.narrow(1, 2 * d_head, d_head);
                        let scores = q.matmul(k.transpose()) / (d_head as f64).sqrt();
                        softmax(scores, 1).matmul(v)
                    })
                    .collect();
                let merged = Tensor::cat(heads, 1);
                attention.proj.forward(merged).unsqueeze_dim::<3>(0)
            })
            .collect();

        Tensor::cat(samples, 0)
    }

    #[test]
    fn matches_per_head_reference() {
        let device = Default::default();
        let attention = SelfAttentionConfig::new(4, 2)
            .with_transpose(false)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 3>::random([2, 5, 4], Distribution::Default, &device);

        let expected = attention_per_head(&attention, x.clone());

        attention
            .forward(x)
            .to_data()
            .assert_approx_eq::<FT>(&expected.to_data(), Tolerance::absolute(1e-5));
    }

    #[test]
    fn transpose_moves_channels_to_the_middle() {
        let device = Default::default();
        let attention = SelfAttentionConfig::new(4, 2)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 3>::random([1, 4, 3], Distribution::Default, &device);

        let expected = attention_per_head(&attention, x.clone().swap_dims(1, 2)).swap_dims(1, 2);

        attention
            .forward(x)
            .to_data()
            .assert_approx_eq::<FT>(&expected.to_data(), Tolerance::absolute(1e-5));
    }

    #[test]
    fn single_key_returns_projected_value() {
        let device = Default::default();
        let attention = SelfAttentionConfig::new(4, 2)
            .with_transpose(false)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 3>::random([1, 1, 4], Distribution::Default, &device);

        // With one position the softmax weight is exactly 1, leaving the value slices.
        let qkv = attention
            .qkv
            .forward(attention.norm.forward(x.clone()))
            .reshape([1, 12]);
        let values = Tensor::cat(
            vec![qkv.clone().narrow(1, 4, 2), qkv.narrow(1, 10, 2)],
            1,
        );
        let expected = attention.proj.forward(values).reshape([1, 1, 4]);

        attention
            .forward(x)
            .to_data()
            .assert_approx_eq::<FT>(&expected.to_data(), Tolerance::absolute(1e-5));
    }

    #[test]
    fn heads_are_independent_of_batch_order() {
        let device = Default::default();
        let attention = SelfAttention2dConfig::new(8, 2)
            .init::<TestBackend>(&device)
            .unwrap();
        let a = Tensor::<TestBackend, 4>::random([1, 8, 2, 3], Distribution::Default, &device);
        let b = Tensor::<TestBackend, 4>::random([1, 8, 2, 3], Distribution::Default, &device);

        let joint = attention.forward(Tensor::cat(vec![a.clone(), b], 0));
        let alone = attention.forward(a);

        joint
            .narrow(0, 0, 1)
            .to_data()
            .assert_approx_eq::<FT>(&alone.to_data(), Tolerance::absolute(1e-5));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn attention_2d_preserves_shape(
            n_heads in 1usize..4,
            head_channels in 1usize..5,
            height in 1usize..5,
            width in 1usize..5,
            batch_size in 1usize..3,
        ) {
            let device = Default::default();
            let channels = n_heads * head_channels;
            let attention = SelfAttention2dConfig::new(channels, head_channels)
                .init::<TestBackend>(&device)
                .unwrap();
            let x = Tensor::<TestBackend, 4>::random(
                [batch_size, channels, height, width],
                Distribution::Default,
                &device,
            );

            prop_assert_eq!(attention.forward(x).dims(), [batch_size, channels, height, width]);
        }
    }
}
