//! defectseg — pure-Rust defect segmentation with a fixed encoder–decoder network.
//!
//! The pipeline stages are:
//!
//! 1. **Decode** – any format the `image` crate reads, to planar RGB in `[0, 255]`.
//! 2. **Letterbox** – aspect-preserving bilinear resize into the 224×224 input
//!    canvas, padding the remainder.
//! 3. **Plan** – the residual encoder, skip-connected decoder and head, wired
//!    from a static layer table into a validated operation DAG.
//! 4. **Engine** – a [`ComputeEngine`] executes the plan; [`CpuEngine`] is bundled.
//! 5. **Threshold** – probabilities to a binary mask, then JPEG encode.
//!
//! # Public API
//! - [`Segmenter`] and [`SegmentConfig`] as primary entry points
//! - [`pipeline::run_batch`] for sequential multi-image runs
//! - [`topology`] and [`weights`] for inspecting the network and model files

mod api;
mod config;
pub mod engine;
pub mod image;
pub mod pipeline;
pub mod threshold;
pub mod topology;
pub mod weights;

#[cfg(test)]
pub(crate) mod test_utils;

pub use api::{SegmentError, Segmenter};
pub use config::{
    FailurePolicy, InputNormalization, SegmentConfig, DEFAULT_JPEG_QUALITY, DEFAULT_THRESHOLD,
};
pub use crate::image::{PixelBuffer, Shape};
pub use engine::{ComputeEngine, CpuEngine, EngineConfig, EngineError};
pub use threshold::{Mask, MaskValues};
pub use topology::Topology;
pub use weights::{GgufFile, WeightSource};
