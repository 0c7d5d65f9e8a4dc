//! Convolution and linear pipelines.
//!
//! Each pipeline is a fixed sequence of optional stages. A stage that is not
//! configured is absent from the module, so it owns no parameters.
//!
//! - [`ConvBlock`]: convolution, normalization, activation.
//! - [`PreActConv`]: normalization, activation, convolution.
//! - [`PreActLinear`]: normalization, activation, linear map.

use super::activation::{Activation, ActivationConfig};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::norm::{Normalization, NormalizationConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Whether `norm` belongs to the batch normalization family.
///
/// Batch normalization re-centres every channel, which makes a bias on the
/// preceding affine stage redundant.
pub fn is_batch_norm(norm: Option<&NormalizationConfig>) -> bool {
    matches!(norm, Some(NormalizationConfig::Batch(_)))
}

fn init_norm<B: Backend>(
    norm: Option<&NormalizationConfig>,
    num_features: usize,
    device: &B::Device,
) -> Option<Normalization<B>> {
    norm.map(|norm| norm.clone().with_num_features(num_features).init(device))
}

/// Configuration for a post-activation [`ConvBlock`].
#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    /// Input and output channels.
    pub channels: [usize; 2],
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 2)]
    pub stride: usize,
    /// Defaults to `kernel_size / 2`.
    pub padding: Option<usize>,
    #[config(default = "Some(ActivationConfig::Relu)")]
    pub activation: Option<ActivationConfig>,
    /// Normalization over the output channels. The number of features is filled in on init.
    pub norm: Option<NormalizationConfig>,
    /// Defaults to `true` unless `norm` is a batch normalization.
    pub bias: Option<bool>,
}

impl ConvBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBlock<B> {
        let [_, d_output] = self.channels;
        let padding = self.padding.unwrap_or(self.kernel_size / 2);
        let bias = self
            .bias
            .unwrap_or_else(|| !is_batch_norm(self.norm.as_ref()));

        let conv = Conv2dConfig::new(self.channels, [self.kernel_size, self.kernel_size])
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(bias)
            .init(device);

        ConvBlock {
            conv,
            norm: init_norm(self.norm.as_ref(), d_output, device),
            activation: self.activation.as_ref().map(ActivationConfig::init),
        }
    }
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Option<Normalization<B>>,
    pub activation: Option<Activation>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        match &self.activation {
            Some(activation) => activation.forward(x),
            None => x,
        }
    }
}

/// Configuration for a pre-activation [`PreActConv`].
#[derive(Config, Debug)]
pub struct PreActConvConfig {
    /// Input and output channels.
    pub channels: [usize; 2],
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
    #[config(default = "Some(ActivationConfig::Silu)")]
    pub activation: Option<ActivationConfig>,
    /// Normalization over the input channels.
    pub norm: Option<NormalizationConfig>,
    #[config(default = true)]
    pub bias: bool,
}

impl PreActConvConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PreActConv<B> {
        let [d_input, _] = self.channels;
        let padding = self.kernel_size / 2;

        let conv = Conv2dConfig::new(self.channels, [self.kernel_size, self.kernel_size])
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(self.bias)
            .init(device);

        PreActConv {
            norm: init_norm(self.norm.as_ref(), d_input, device),
            activation: self.activation.as_ref().map(ActivationConfig::init),
            conv,
        }
    }
}

#[derive(Module, Debug)]
pub struct PreActConv<B: Backend> {
    pub norm: Option<Normalization<B>>,
    pub activation: Option<Activation>,
    pub conv: Conv2d<B>,
}

impl<B: Backend> PreActConv<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let x = match &self.activation {
            Some(activation) => activation.forward(x),
            None => x,
        };
        self.conv.forward(x)
    }
}

/// Configuration for a pre-activation [`PreActLinear`].
#[derive(Config, Debug)]
pub struct PreActLinearConfig {
    pub d_input: usize,
    pub d_output: usize,
    #[config(default = "Some(ActivationConfig::Silu)")]
    pub activation: Option<ActivationConfig>,
    /// Normalization over the input features.
    pub norm: Option<NormalizationConfig>,
    #[config(default = true)]
    pub bias: bool,
}

impl PreActLinearConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PreActLinear<B> {
        PreActLinear {
            norm: init_norm(self.norm.as_ref(), self.d_input, device),
            activation: self.activation.as_ref().map(ActivationConfig::init),
            linear: LinearConfig::new(self.d_input, self.d_output)
                .with_bias(self.bias)
                .init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct PreActLinear<B: Backend> {
    pub norm: Option<Normalization<B>>,
    pub activation: Option<Activation>,
    pub linear: Linear<B>,
}

impl<B: Backend> PreActLinear<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let x = match &self.activation {
            Some(activation) => activation.forward(x),
            None => x,
        };
        self.linear.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;
    use burn::module::Module;
    use burn::nn::{BatchNormConfig, GroupNormConfig, LayerNormConfig};

    #[test]
    fn bias_is_dropped_only_for_batch_norm() {
        let device = Default::default();
        let base = ConvBlockConfig::new([4, 8]);

        let batch: ConvBlock<TestBackend> = base
            .clone()
            .with_norm(Some(BatchNormConfig::new(0).into()))
            .init(&device);
        let group: ConvBlock<TestBackend> = base
            .clone()
            .with_norm(Some(GroupNormConfig::new(2, 0).into()))
            .init(&device);
        let layer: ConvBlock<TestBackend> = base
            .clone()
            .with_norm(Some(LayerNormConfig::new(0).into()))
            .init(&device);
        let plain: ConvBlock<TestBackend> = base.init(&device);

        assert!(batch.conv.bias.is_none());
        assert!(group.conv.bias.is_some());
        assert!(layer.conv.bias.is_some());
        assert!(plain.conv.bias.is_some());
    }

    #[test]
    fn explicit_bias_overrides_the_rule() {
        let device = Default::default();
        let block: ConvBlock<TestBackend> = ConvBlockConfig::new([4, 8])
            .with_norm(Some(BatchNormConfig::new(0).into()))
            .with_bias(Some(true))
            .init(&device);

        assert!(block.conv.bias.is_some());
    }

    #[test]
    fn absent_stages_own_no_parameters() {
        let device = Default::default();
        let bare: ConvBlock<TestBackend> = ConvBlockConfig::new([4, 8])
            .with_activation(None)
            .init(&device);
        let normed: ConvBlock<TestBackend> = ConvBlockConfig::new([4, 8])
            .with_norm(Some(BatchNormConfig::new(0).into()))
            .init(&device);

        assert!(bare.norm.is_none());
        assert!(bare.activation.is_none());
        // 3x3 kernel plus bias.
        assert_eq!(bare.num_params(), 4 * 8 * 9 + 8);
        // No bias. Batch norm keeps gamma, beta and both running statistics.
        assert_eq!(normed.num_params(), 4 * 8 * 9 + 4 * 8);
    }

    #[test]
    fn post_activation_conv_shapes() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([2, 4, 9, 9], &device);

        let strided: ConvBlock<TestBackend> = ConvBlockConfig::new([4, 8]).init(&device);
        let same: ConvBlock<TestBackend> = ConvBlockConfig::new([4, 8])
            .with_stride(1)
            .with_kernel_size(5)
            .init(&device);

        assert_eq!(strided.forward(x.clone()).dims(), [2, 8, 5, 5]);
        assert_eq!(same.forward(x).dims(), [2, 8, 9, 9]);
    }

    #[test]
    fn pre_activation_norm_covers_input_channels() {
        let device = Default::default();
        let block: PreActConv<TestBackend> = PreActConvConfig::new([4, 8])
            .with_norm(Some(BatchNormConfig::new(0).into()))
            .init(&device);
        let x = Tensor::<TestBackend, 4>::ones([2, 4, 6, 6], &device);

        assert_eq!(block.forward(x).dims(), [2, 8, 6, 6]);
        // Batch norm state over the 4 input channels, kernel and bias.
        assert_eq!(block.num_params(), 4 * 4 + 4 * 8 * 9 + 8);
    }

    #[test]
    fn pre_activation_padding_ignores_stride() {
        let device = Default::default();
        let block: PreActConv<TestBackend> = PreActConvConfig::new([3, 3])
            .with_stride(2)
            .init(&device);
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);

        assert_eq!(block.forward(x).dims(), [1, 3, 4, 4]);
    }

    #[test]
    fn pre_activation_linear() {
        let device = Default::default();
        let block: PreActLinear<TestBackend> = PreActLinearConfig::new(6, 10)
            .with_norm(Some(BatchNormConfig::new(0).into()))
            .init(&device);
        let x = Tensor::<TestBackend, 2>::ones([3, 6], &device);

        assert_eq!(block.forward(x).dims(), [3, 10]);
    }
}
