//! Errors raised while assembling or running the blocks.

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{block}: channel count must be non-zero")]
    ZeroChannels { block: &'static str },

    #[error("attention: {channels} channels cannot be split into heads of {head_channels}")]
    HeadChannels {
        channels: usize,
        head_channels: usize,
    },

    #[error("unet: the channel schedule is empty")]
    EmptySchedule,

    #[error("unet: attention start {attn_start} is past the last of {levels} levels")]
    AttentionStart { attn_start: usize, levels: usize },

    #[error("{block}: at least one residual layer is required")]
    NoLayers { block: &'static str },

    #[error("unet: skip plan pushes {pushes} tensors but pops {pops}")]
    UnbalancedSkips { pushes: usize, pops: usize },

    #[error("up block: expected {expected} input channels after concatenation, skip plan gives {actual}")]
    SkipChannels { expected: usize, actual: usize },

    #[error("skip stack exhausted after {pops} pops")]
    SkipStackExhausted { pops: usize },

    #[error("{remaining} skip tensors were never consumed")]
    UnconsumedSkips { remaining: usize },

    #[error("skip tensor {skip:?} cannot be concatenated with activation {x:?}")]
    SkipShape { x: [usize; 4], skip: [usize; 4] },

    #[error("embedding has width {actual}, block was built for {expected}")]
    EmbeddingWidth { expected: usize, actual: usize },

    #[error("input has {actual} channels, block was built for {expected}")]
    InputChannels { expected: usize, actual: usize },

    #[error("input of {height}x{width} is not divisible by the down-sampling factor {factor}")]
    SpatialSize {
        height: usize,
        width: usize,
        factor: usize,
    },

    #[error("timestep batch {timesteps} does not match image batch {images}")]
    TimestepBatch { timesteps: usize, images: usize },
}
