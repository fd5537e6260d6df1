use std::sync::Arc;
use std::thread;

use anyhow::Result;
use ndarray::{Array4, ArrayView4};
use tempfile::tempdir;
use tilefuse_core::config::{AppConfig, ModelConfig, TilingConfig};
use tilefuse_core::engine::{IdentityEngine, InferenceEngine};
use tilefuse_core::extract::extract;
use tilefuse_core::image_io::{load_image, save_image};
use tilefuse_core::merge::{merge, MergeAccumulator};
use tilefuse_core::normalize::ValueRange;
use tilefuse_core::pad::{pad, unpad};
use tilefuse_core::weight::{weight_map, WeightMapCache};
use tilefuse_core::{Image, TileParams, TilePipeline};

fn textured(height: usize, width: usize) -> Image {
    let data = (0..height * width * 3)
        .map(|i| {
            let pixel = i / 3;
            let (y, x) = (pixel / width, pixel % width);
            ((y * 3 + x * 5 + (i % 3) * 60) % 256) as u8
        })
        .collect();
    Image::from_raw(height, width, 3, data).expect("valid image")
}

/// Adds a constant offset in a unit-range model space.
struct OffsetEngine {
    offset: f32,
}

impl InferenceEngine for OffsetEngine {
    fn name(&self) -> &str {
        "offset"
    }

    fn infer(&mut self, batch: ArrayView4<'_, f32>) -> Result<Array4<f32>> {
        Ok(batch.mapv(|v| v + self.offset))
    }
}

#[test]
fn reference_scenario_300x500_round_trips() {
    let image = textured(300, 500);
    let (canvas, padding) = pad(&image, 224).expect("pad");
    assert_eq!((canvas.height(), canvas.width(), canvas.channels()), (672, 672, 3));
    assert_eq!((padding.top, padding.left), (186, 86));

    let (patches, positions) = extract(&canvas, 224, 112).expect("extract");
    assert_eq!(patches.len(), 25);
    assert_eq!(positions.last().map(|p| (p.y, p.x)), Some((448, 448)));

    let weights = weight_map(224, 0.05).expect("weights");
    let mut acc = MergeAccumulator::new(672, 672, 3);
    for (patch, &position) in patches.iter().zip(&positions) {
        acc.accumulate(patch.view(), position, &weights)
            .expect("accumulate");
    }
    assert!(acc.min_weight() >= 0.05);

    let merged = merge(&patches, &positions, 672, 672, &weights).expect("merge");
    assert_eq!(merged, canvas);
    assert_eq!(unpad(&merged, &padding).expect("unpad"), image);
}

#[test]
fn config_driven_pipeline_through_files() {
    let temp = tempdir().expect("tempdir");
    let input = temp.path().join("input.png");
    let output = temp.path().join("output.png");

    let image = textured(57, 91);
    save_image(&image, &input, 95).expect("save input");

    let config: AppConfig = toml::from_str(
        r#"
        [tiling]
        patch_size = 32
        stride = 20
        batch_size = 3
        merge_threads = 2

        [model]
        input_range = [0.0, 1.0]
        output_range = [0.0, 1.0]
        "#,
    )
    .expect("parse config");

    let pipeline = TilePipeline::from_config(
        &config.tiling,
        &config.model,
        Arc::new(WeightMapCache::new()),
    )
    .expect("pipeline");

    let loaded = load_image(&input).expect("load input");
    let mut engine = OffsetEngine { offset: 0.1 };
    let result = pipeline.run(&loaded, &mut engine).expect("run");
    save_image(&result.image, &output, 95).expect("save output");

    let written = load_image(&output).expect("load output");
    assert_eq!((written.height(), written.width()), (57, 91));
    for (&src, &dst) in image.view().iter().zip(written.view().iter()) {
        let expected = (f32::from(src) + 25.5).round().min(255.0) as u8;
        assert!(
            dst.abs_diff(expected) <= 1,
            "pixel {src} became {dst}, expected about {expected}"
        );
    }

    assert_eq!(result.report.canvas_side, 96);
    assert_eq!(result.report.params.stride, 20);
    assert_eq!(result.report.batch_count, result.report.patch_count.div_ceil(3));
}

#[test]
fn pipelines_share_a_cache_across_threads() {
    let cache = Arc::new(WeightMapCache::new());
    let images: Vec<Image> = (0..4).map(|i| textured(20 + i * 7, 33)).collect();

    thread::scope(|scope| {
        for image in &images {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                let pipeline = TilePipeline::new(
                    TileParams::new(16),
                    8,
                    1,
                    ValueRange::SIGNED_UNIT,
                    ValueRange::SIGNED_UNIT,
                    cache,
                )
                .expect("pipeline");
                let output = pipeline.run(image, &mut IdentityEngine).expect("run");
                assert_eq!(&output.image, image);
            });
        }
    });

    assert_eq!(cache.len(), 1);
    cache.clear();
    assert!(cache.is_empty());
}

#[test]
fn from_config_rejects_invalid_tiling() {
    let tiling = TilingConfig {
        patch_size: 16,
        stride: Some(17),
        ..TilingConfig::default()
    };
    let err = TilePipeline::from_config(
        &tiling,
        &ModelConfig::default(),
        Arc::new(WeightMapCache::new()),
    )
    .err()
    .expect("stride larger than patch must fail");
    assert!(format!("{err:#}").contains("stride"));
}
