//! Core crate for tilefuse: patch-based inference over arbitrarily sized images.
//!
//! The deterministic tiling core lives in [`pad`], [`extract`], [`weight`] and
//! [`merge`]; [`pipeline`] threads them around an [`engine::InferenceEngine`].

pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod image_io;
pub mod logging;
pub mod merge;
pub mod normalize;
pub mod pad;
pub mod pipeline;
pub mod runtime;
pub mod types;
pub mod weight;

pub use error::TileError;
pub use pipeline::{PipelineOutput, PipelineReport, TilePipeline};
pub use types::{Image, PaddingSpec, Position, TileGrid, TileParams};
