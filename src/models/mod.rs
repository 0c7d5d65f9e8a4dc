//! # Models
//!
//! Building blocks of a timestep-conditioned diffusion UNet.

pub mod activation;
pub mod attention;
pub mod embeddings;
pub mod layers;
pub mod resnet;
pub mod unet_2d;
pub mod unet_2d_blocks;
