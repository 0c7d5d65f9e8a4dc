//! Activation layers.
//!
//! [`GeneralRelu`] is a rectifier with an optional leak, a constant shift and
//! an optional ceiling, used as the default non-linearity of the classic residual
//! block. [`ActivationConfig`] selects the activation of a conv/linear pipeline.

use burn::config::Config;
use burn::module::Module;
use burn::tensor::activation::{leaky_relu, relu, silu};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Configuration for a [`GeneralRelu`].
#[derive(Config, Debug)]
pub struct GeneralReluConfig {
    /// Negative slope. A plain ReLU is used when unset.
    pub leak: Option<f64>,
    /// Constant subtracted after rectification.
    pub sub: Option<f64>,
    /// Upper clamp applied last.
    pub maxv: Option<f64>,
}

impl GeneralReluConfig {
    /// Leak of 0.1 and a shift of 0.4, which keeps the mean of the output near zero.
    pub fn leaky_shifted() -> Self {
        Self::new().with_leak(Some(0.1)).with_sub(Some(0.4))
    }

    pub fn init(&self) -> GeneralRelu {
        GeneralRelu {
            leak: self.leak,
            sub: self.sub,
            maxv: self.maxv,
        }
    }
}

#[derive(Module, Clone, Debug)]
pub struct GeneralRelu {
    leak: Option<f64>,
    sub: Option<f64>,
    maxv: Option<f64>,
}

impl GeneralRelu {
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let x = match self.leak {
            Some(leak) => leaky_relu(x, leak),
            None => relu(x),
        };
        let x = match self.sub {
            Some(sub) => x.sub_scalar(sub),
            None => x,
        };
        match self.maxv {
            Some(maxv) => x.clamp_max(maxv),
            None => x,
        }
    }
}

/// Non-linearity stage of a pipeline.
#[derive(Config, Debug)]
pub enum ActivationConfig {
    Relu,
    Silu,
    GeneralRelu(GeneralReluConfig),
}

impl ActivationConfig {
    pub fn init(&self) -> Activation {
        match self {
            Self::Relu => Activation::GeneralRelu(GeneralReluConfig::new().init()),
            Self::Silu => Activation::Silu,
            Self::GeneralRelu(config) => Activation::GeneralRelu(config.init()),
        }
    }
}

#[derive(Module, Clone, Debug)]
pub enum Activation {
    GeneralRelu(GeneralRelu),
    Silu,
}

impl Activation {
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Self::GeneralRelu(act) => act.forward(x),
            Self::Silu => silu(x),
        }
    }
}
