//! Orchestration: pad → extract → normalize → infer → denormalize → merge → unpad.
//!
//! The pipeline owns no per-image state. Positions produced by extraction are
//! threaded unchanged through inference to the merger, and engine output is
//! checked against the batch it was given before anything is merged.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use ndarray::{Array3, Array4};
use serde::Serialize;
use tracing::{debug, info, info_span};

use crate::config::{ModelConfig, TilingConfig};
use crate::engine::InferenceEngine;
use crate::extract::{extract, plan_grid};
use crate::merge::merge_banded;
use crate::normalize::{denormalize, normalize_patches, split_batch, ValueRange};
use crate::pad::{pad, plan_padding, unpad};
use crate::types::{Image, PaddingSpec, TileGrid, TileParams};
use crate::weight::WeightMapCache;

pub struct TilePipeline {
    params: TileParams,
    batch_size: usize,
    merge_threads: usize,
    input_range: ValueRange,
    output_range: ValueRange,
    weights: Arc<WeightMapCache>,
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub image: Image,
    pub report: PipelineReport,
}

/// Summary of one pipeline run, serializable as JSON for `--report`.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub engine: String,
    pub original_height: usize,
    pub original_width: usize,
    pub channels: usize,
    pub canvas_side: usize,
    pub padding: PaddingSpec,
    pub params: TileParams,
    pub patch_count: usize,
    pub batch_count: usize,
    pub timings: StageTimings,
}

/// Wall-clock milliseconds per stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimings {
    pub pad_ms: f64,
    pub extract_ms: f64,
    pub normalize_ms: f64,
    pub inference_ms: f64,
    pub merge_ms: f64,
    pub unpad_ms: f64,
    pub total_ms: f64,
}

/// Padding and patch layout for an image, computed without touching pixels.
#[derive(Debug, Clone, Serialize)]
pub struct TilePlan {
    pub canvas_side: usize,
    pub padding: PaddingSpec,
    pub params: TileParams,
    pub patch_count: usize,
    pub grid: TileGrid,
}

impl TilePipeline {
    pub fn new(
        params: TileParams,
        batch_size: usize,
        merge_threads: usize,
        input_range: ValueRange,
        output_range: ValueRange,
        weights: Arc<WeightMapCache>,
    ) -> Result<Self> {
        params.validate()?;
        ensure!(batch_size >= 1, "batch size must be at least 1");
        ensure!(
            input_range.is_valid(),
            "invalid model input range {:?}",
            input_range
        );
        ensure!(
            output_range.is_valid(),
            "invalid model output range {:?}",
            output_range
        );

        Ok(Self {
            params,
            batch_size,
            merge_threads: merge_threads.max(1),
            input_range,
            output_range,
            weights,
        })
    }

    pub fn from_config(
        tiling: &TilingConfig,
        model: &ModelConfig,
        weights: Arc<WeightMapCache>,
    ) -> Result<Self> {
        Self::new(
            tiling.params(),
            tiling.batch_size,
            tiling.merge_threads,
            model.input_range,
            model.output_range,
            weights,
        )
        .context("invalid tiling configuration")
    }

    pub fn params(&self) -> TileParams {
        self.params
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn plan(&self, height: usize, width: usize) -> Result<TilePlan> {
        let (canvas_side, padding) = plan_padding(height, width, self.params.patch_size)?;
        let grid = plan_grid(
            canvas_side,
            canvas_side,
            self.params.patch_size,
            self.params.stride,
        )?;
        Ok(TilePlan {
            canvas_side,
            padding,
            params: self.params,
            patch_count: grid.len(),
            grid,
        })
    }

    pub fn run(&self, image: &Image, engine: &mut dyn InferenceEngine) -> Result<PipelineOutput> {
        let span = info_span!(
            "tile_pipeline",
            engine = engine.name(),
            height = image.height(),
            width = image.width()
        );
        let _enter = span.enter();

        let started = Instant::now();
        let mut timings = StageTimings::default();
        let TileParams {
            patch_size,
            stride,
            epsilon,
        } = self.params;

        let t_pad = Instant::now();
        let (canvas, padding) = pad(image, patch_size).context("failed to pad image")?;
        timings.pad_ms = elapsed_ms(t_pad);

        let t_extract = Instant::now();
        let (patches, positions) =
            extract(&canvas, patch_size, stride).context("failed to extract patches")?;
        timings.extract_ms = elapsed_ms(t_extract);
        debug!(
            canvas = canvas.height(),
            patches = patches.len(),
            patch_size,
            stride,
            "Extracted patches"
        );

        let weights = self.weights.get(patch_size, epsilon)?;

        let mut outputs: Vec<Array3<f32>> = Vec::with_capacity(patches.len());
        let mut output_channels = None;
        let mut batch_count = 0;
        for chunk in patches.chunks(self.batch_size) {
            let t_norm = Instant::now();
            let batch = normalize_patches(chunk, self.input_range)?;
            timings.normalize_ms += elapsed_ms(t_norm);

            let t_infer = Instant::now();
            let result = engine.infer(batch.view()).with_context(|| {
                format!(
                    "inference engine '{}' failed on batch {batch_count}",
                    engine.name()
                )
            })?;
            timings.inference_ms += elapsed_ms(t_infer);

            let channels = check_engine_output(&result, chunk.len(), patch_size, batch_count)?;
            match output_channels {
                None => output_channels = Some(channels),
                Some(expected) if expected != channels => bail!(
                    "engine returned {channels} channels for batch {batch_count}, \
                     earlier batches had {expected}"
                ),
                Some(_) => {}
            }

            let t_norm = Instant::now();
            outputs.extend(split_batch(denormalize(result.view(), self.output_range)));
            timings.normalize_ms += elapsed_ms(t_norm);
            batch_count += 1;
        }
        ensure!(
            outputs.len() == positions.len(),
            "engine produced {} patches for {} positions",
            outputs.len(),
            positions.len()
        );

        let t_merge = Instant::now();
        let merged = merge_banded(
            &outputs,
            &positions,
            canvas.height(),
            canvas.width(),
            &weights,
            self.merge_threads,
        )
        .context("failed to merge patches")?;
        timings.merge_ms = elapsed_ms(t_merge);

        let t_unpad = Instant::now();
        let result = unpad(&merged, &padding).context("failed to crop merged canvas")?;
        timings.unpad_ms = elapsed_ms(t_unpad);
        timings.total_ms = elapsed_ms(started);

        info!(
            patches = positions.len(),
            batches = batch_count,
            total_ms = timings.total_ms,
            "Tiled inference complete"
        );

        let report = PipelineReport {
            engine: engine.name().to_string(),
            original_height: image.height(),
            original_width: image.width(),
            channels: image.channels(),
            canvas_side: canvas.height(),
            padding,
            params: self.params,
            patch_count: positions.len(),
            batch_count,
            timings,
        };
        Ok(PipelineOutput {
            image: result,
            report,
        })
    }
}

/// Enforce the engine contract: one output per input, same spatial size.
/// Returns the output channel count.
fn check_engine_output(
    output: &Array4<f32>,
    expected_len: usize,
    patch_size: usize,
    batch_index: usize,
) -> Result<usize> {
    let (n, h, w, c) = output.dim();
    if n != expected_len {
        bail!("engine returned {n} patches for a batch of {expected_len} (batch {batch_index})");
    }
    if h != patch_size || w != patch_size {
        bail!(
            "engine returned {h}x{w} patches, expected {patch_size}x{patch_size} (batch {batch_index})"
        );
    }
    if c == 0 {
        bail!("engine returned patches with no channels (batch {batch_index})");
    }
    Ok(c)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::IdentityEngine;
    use ndarray::{s, ArrayView4, Axis};

    fn pipeline(patch_size: usize, stride: usize, batch_size: usize) -> TilePipeline {
        TilePipeline::new(
            TileParams::new(patch_size).with_stride(stride),
            batch_size,
            1,
            ValueRange::SIGNED_UNIT,
            ValueRange::SIGNED_UNIT,
            Arc::new(WeightMapCache::new()),
        )
        .unwrap()
    }

    fn checkerboard(height: usize, width: usize) -> Image {
        let data = (0..height * width * 3)
            .map(|i| {
                let pixel = i / 3;
                let (y, x) = (pixel / width, pixel % width);
                (((y / 3 + x / 3) % 2) * 200 + (i % 3) * 20) as u8
            })
            .collect();
        Image::from_raw(height, width, 3, data).unwrap()
    }

    /// Inverts every sample in the signed unit range.
    struct NegateEngine {
        calls: usize,
    }

    impl InferenceEngine for NegateEngine {
        fn name(&self) -> &str {
            "negate"
        }

        fn infer(&mut self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
            self.calls += 1;
            Ok(batch.mapv(|v| -v))
        }
    }

    struct DropLastEngine;

    impl InferenceEngine for DropLastEngine {
        fn name(&self) -> &str {
            "drop-last"
        }

        fn infer(&mut self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
            let n = batch.len_of(Axis(0));
            Ok(batch.slice(s![..n - 1, .., .., ..]).to_owned())
        }
    }

    struct ShrinkEngine;

    impl InferenceEngine for ShrinkEngine {
        fn name(&self) -> &str {
            "shrink"
        }

        fn infer(&mut self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
            Ok(batch.slice(s![.., 1.., 1.., ..]).to_owned())
        }
    }

    struct FailingEngine;

    impl InferenceEngine for FailingEngine {
        fn name(&self) -> &str {
            "failing"
        }

        fn infer(&mut self, _batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
            bail!("device lost")
        }
    }

    #[test]
    fn test_identity_run_reproduces_image() {
        let image = checkerboard(30, 47);
        let output = pipeline(16, 8, 4).run(&image, &mut IdentityEngine).unwrap();
        assert_eq!(output.image, image);

        let report = output.report;
        assert_eq!(report.engine, "identity");
        assert_eq!(report.canvas_side, 48);
        assert_eq!(report.padding.top, 9);
        assert_eq!(report.padding.left, 0);
        // 5 origins per axis over a 48 canvas.
        assert_eq!(report.patch_count, 25);
        assert_eq!(report.batch_count, 7);
    }

    #[test]
    fn test_run_applies_engine_per_patch() {
        let image = checkerboard(20, 20);
        let mut engine = NegateEngine { calls: 0 };
        let output = pipeline(8, 4, 100).run(&image, &mut engine).unwrap();
        assert_eq!(engine.calls, 1);
        for (&src, &dst) in image.view().iter().zip(output.image.view().iter()) {
            assert_eq!(dst, 255 - src);
        }
    }

    #[test]
    fn test_run_batches_respect_batch_size() {
        let image = checkerboard(24, 24);
        let mut engine = NegateEngine { calls: 0 };
        let output = pipeline(8, 8, 2).run(&image, &mut engine).unwrap();
        assert_eq!(output.report.patch_count, 9);
        assert_eq!(output.report.batch_count, 5);
        assert_eq!(engine.calls, 5);
    }

    #[test]
    fn test_banded_merge_matches_sequential_run() {
        let image = checkerboard(50, 33);
        let sequential = pipeline(16, 6, 8).run(&image, &mut IdentityEngine).unwrap();
        let banded = TilePipeline::new(
            TileParams::new(16).with_stride(6),
            8,
            4,
            ValueRange::SIGNED_UNIT,
            ValueRange::SIGNED_UNIT,
            Arc::new(WeightMapCache::new()),
        )
        .unwrap()
        .run(&image, &mut IdentityEngine)
        .unwrap();
        assert_eq!(banded.image, sequential.image);
    }

    #[test]
    fn test_run_rejects_count_mismatch() {
        let image = checkerboard(16, 16);
        let err = pipeline(8, 4, 4)
            .run(&image, &mut DropLastEngine)
            .unwrap_err();
        assert!(format!("{err:#}").contains("returned 3 patches for a batch of 4"));
    }

    #[test]
    fn test_run_rejects_spatial_mismatch() {
        let image = checkerboard(16, 16);
        let err = pipeline(8, 4, 4).run(&image, &mut ShrinkEngine).unwrap_err();
        assert!(format!("{err:#}").contains("7x7"));
    }

    #[test]
    fn test_run_propagates_engine_failure() {
        let image = checkerboard(8, 8);
        let err = pipeline(8, 4, 4).run(&image, &mut FailingEngine).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("'failing' failed on batch 0"));
        assert!(message.contains("device lost"));
    }

    #[test]
    fn test_pipeline_shares_weight_cache() {
        let cache = Arc::new(WeightMapCache::new());
        let make = || {
            TilePipeline::new(
                TileParams::new(8),
                4,
                1,
                ValueRange::SIGNED_UNIT,
                ValueRange::SIGNED_UNIT,
                Arc::clone(&cache),
            )
            .unwrap()
        };
        let image = checkerboard(10, 10);
        make().run(&image, &mut IdentityEngine).unwrap();
        make().run(&image, &mut IdentityEngine).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_new_rejects_invalid_configuration() {
        let cache = Arc::new(WeightMapCache::new());
        let build = |params: TileParams, batch_size: usize, range: ValueRange| {
            TilePipeline::new(params, batch_size, 1, range, range, Arc::clone(&cache))
        };
        assert!(build(TileParams::new(0), 1, ValueRange::SIGNED_UNIT).is_err());
        assert!(build(TileParams::new(8).with_stride(9), 1, ValueRange::SIGNED_UNIT).is_err());
        assert!(build(TileParams::new(8), 0, ValueRange::SIGNED_UNIT).is_err());
        assert!(build(TileParams::new(8), 1, ValueRange::new(1.0, 1.0)).is_err());
    }

    #[test]
    fn test_plan_matches_reference_scenario() {
        let plan = pipeline(224, 112, 16).plan(300, 500).unwrap();
        assert_eq!(plan.canvas_side, 672);
        assert_eq!((plan.padding.top, plan.padding.left), (186, 86));
        assert_eq!(plan.grid.y_origins, vec![0, 112, 224, 336, 448]);
        assert_eq!(plan.grid.x_origins, vec![0, 112, 224, 336, 448]);
        assert_eq!(plan.patch_count, 25);
    }

    #[test]
    fn test_report_serializes_to_json() {
        let image = checkerboard(8, 8);
        let output = pipeline(8, 4, 4).run(&image, &mut IdentityEngine).unwrap();
        let json = serde_json::to_value(&output.report).unwrap();
        assert_eq!(json["engine"], "identity");
        assert_eq!(json["params"]["patch_size"], 8);
        assert_eq!(json["padding"]["original_width"], 8);
        assert!(json["timings"]["total_ms"].as_f64().unwrap() >= 0.0);
    }
}
