//! # Diffusion U-Net building blocks
//!
//! Convolution and linear factories, residual blocks, self-attention and a
//! timestep-conditioned U-Net for diffusion models, built on [Burn](https://github.com/tracel-ai/burn).
//!
//! Encoder activations are carried to the decoder on an explicit
//! [`SkipStack`](models::unet_2d_blocks::SkipStack), so every forward pass owns its own skips.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod error;
pub mod models;
mod utils;

pub use error::{Error, Result};

extern crate alloc;

#[cfg(all(test, not(feature = "torch"), not(feature = "wgpu")))]
pub type TestBackend = burn::backend::NdArray<f32>;

#[cfg(all(test, feature = "torch"))]
pub type TestBackend = burn::backend::LibTorch<f32>;

#[cfg(all(test, feature = "wgpu", not(feature = "torch")))]
pub type TestBackend = burn::backend::Wgpu<f32, i32>;

#[cfg(test)]
pub type TestAutodiffBackend = burn::backend::Autodiff<TestBackend>;
