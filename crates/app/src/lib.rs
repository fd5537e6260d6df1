use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use tilefuse_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use tilefuse_core::engine::{
    IdentityEngine, InferenceBackend, InferenceEngine, OnnxEngine, OnnxEngineConfig, TensorLayout,
};
use tilefuse_core::image_io::{self, DEFAULT_JPEG_QUALITY};
use tilefuse_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, LoggingInitPlan, DEFAULT_LOG_FILTER,
};
use tilefuse_core::weight::WeightMapCache;
use tilefuse_core::TilePipeline;

#[derive(Parser, Debug)]
#[command(
    name = "tilefuse",
    about = "Run fixed-size image models over images of any size by overlapping patches"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory (default: $TILEFUSE_DATA_DIR or ./data)")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a model over an image patch by patch and write the blended result.
    Enhance(EnhanceArgs),
    /// Print the padding and patch layout for an image as JSON.
    Plan(PlanArgs),
    /// Create the data directory and a default config.toml.
    Init,
}

#[derive(Args, Debug, Default)]
struct TilingArgs {
    #[arg(long, value_name = "PIXELS", help = "Square patch side fed to the model")]
    patch_size: Option<usize>,
    #[arg(long, value_name = "PIXELS", help = "Distance between patch origins (default: half the patch)")]
    stride: Option<usize>,
}

#[derive(Args, Debug)]
struct EnhanceArgs {
    #[arg(help = "Input image")]
    input: PathBuf,
    #[arg(help = "Output image; format follows the extension")]
    output: PathBuf,
    #[arg(short = 'm', long, help = "ONNX model (overrides [model].path)")]
    model: Option<PathBuf>,
    #[arg(long, conflicts_with = "model", help = "Skip the model and echo patches back")]
    identity: bool,
    #[command(flatten)]
    tiling: TilingArgs,
    #[arg(long, help = "Minimum blending weight at patch borders, in (0, 1]")]
    epsilon: Option<f32>,
    #[arg(long, help = "Patches per inference call")]
    batch_size: Option<usize>,
    #[arg(long, help = "Threads used to merge patches")]
    merge_threads: Option<usize>,
    #[arg(long, help = "cpu, cuda or tensorrt")]
    backend: Option<String>,
    #[arg(long, help = "Model tensor layout: nhwc or nchw")]
    layout: Option<String>,
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,
    #[arg(long, value_name = "PATH", help = "Write a JSON run report")]
    report: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[arg(help = "Input image")]
    input: PathBuf,
    #[command(flatten)]
    tiling: TilingArgs,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    tilefuse_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    tilefuse_core::runtime::log_runtime_lib_status();
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Enhance(args) => run_enhance(args, &resolved_data_dir),
        Commands::Plan(args) => run_plan(args, &resolved_data_dir),
        Commands::Init => {
            initialize_data_dir(&resolved_data_dir)?;
            info!(data_dir = %resolved_data_dir.display(), "Data directory initialized");
            Ok(())
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let LoggingInitPlan { filters, file_sink } = logging::compose_logging_init_plan(&init_options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(
            &filters.effective_filter,
            "console",
        ));

    let (installed, fallback) = match file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(
                    &filters.effective_filter,
                    "file",
                ));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            (tracing::subscriber::set_global_default(subscriber), None)
        }
        FileSinkPlan::Fallback { log_dir, reason } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            (
                tracing::subscriber::set_global_default(subscriber),
                Some((log_dir, reason)),
            )
        }
    };

    if let Err(error) = installed {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    info!(
        filter = %filters.effective_filter,
        source = filters.source.as_str(),
        "Logging initialized"
    );
    if let Some((log_dir, reason)) = fallback {
        let attempted_log_dir = log_dir
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        warn!(
            attempted_log_dir = %attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_config(data_dir: &Path) -> Result<AppConfig> {
    let mut config = AppConfig::load_from_path(&config_path(data_dir))?;
    config.resolve_paths(data_dir);
    Ok(config)
}

impl TilingArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(patch_size) = self.patch_size {
            config.tiling.patch_size = patch_size;
            // A configured stride was chosen for the configured patch size.
            config.tiling.stride = None;
        }
        if let Some(stride) = self.stride {
            config.tiling.stride = Some(stride);
        }
    }
}

impl EnhanceArgs {
    fn apply(&self, config: &mut AppConfig) {
        self.tiling.apply(config);
        if let Some(epsilon) = self.epsilon {
            config.tiling.epsilon = epsilon;
        }
        if let Some(batch_size) = self.batch_size {
            config.tiling.batch_size = batch_size;
        }
        if let Some(merge_threads) = self.merge_threads {
            config.tiling.merge_threads = merge_threads;
        }
        if let Some(backend) = self.backend.as_deref() {
            config.model.backend = InferenceBackend::from_str_lossy(backend);
        }
        if let Some(layout) = self.layout.as_deref() {
            config.model.layout = TensorLayout::from_str_lossy(layout);
        }
    }

    /// CLI model paths are taken as given; config paths are relative to the models dir.
    fn model_path(&self, config: &AppConfig) -> Option<PathBuf> {
        self.model
            .clone()
            .or_else(|| config.model.resolve_path(&config.paths.models_dir))
    }
}

fn build_engine(args: &EnhanceArgs, config: &AppConfig) -> Result<Box<dyn InferenceEngine>> {
    if args.identity {
        return Ok(Box::new(IdentityEngine));
    }

    let Some(model_path) = args.model_path(config) else {
        bail!("no model configured: pass --model, set [model].path in config.toml, or use --identity");
    };
    let engine = OnnxEngine::load(&OnnxEngineConfig {
        model_path: &model_path,
        backend: config.model.backend,
        layout: config.model.layout,
        trt_cache_dir: Some(config.paths.trt_cache_dir.as_path()),
        intra_threads: config.model.intra_threads,
        input_name: config.model.input_name.as_deref(),
        output_name: config.model.output_name.as_deref(),
    })?;
    Ok(Box::new(engine))
}

fn run_enhance(args: EnhanceArgs, data_dir: &Path) -> Result<()> {
    let mut config = load_config(data_dir)?;
    args.apply(&mut config);

    let pipeline = TilePipeline::from_config(
        &config.tiling,
        &config.model,
        Arc::new(WeightMapCache::new()),
    )?;
    let mut engine = build_engine(&args, &config)?;

    let image = image_io::load_image(&args.input)?;
    let output = pipeline.run(&image, engine.as_mut())?;
    image_io::save_image(&output.image, &args.output, args.quality)?;

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        engine = %output.report.engine,
        patches = output.report.patch_count,
        total_ms = output.report.timings.total_ms,
        "Enhanced image written"
    );

    if let Some(report_path) = args.report.as_deref() {
        let encoded = serde_json::to_string_pretty(&output.report)
            .context("failed to serialize run report")?;
        fs::write(report_path, encoded)
            .with_context(|| format!("failed to write run report: {}", report_path.display()))?;
    }
    Ok(())
}

fn run_plan(args: PlanArgs, data_dir: &Path) -> Result<()> {
    let mut config = load_config(data_dir)?;
    args.tiling.apply(&mut config);

    let pipeline = TilePipeline::from_config(
        &config.tiling,
        &config.model,
        Arc::new(WeightMapCache::new()),
    )?;
    let (height, width) = image_io::image_dimensions(&args.input)?;
    let plan = pipeline.plan(height, width)?;

    let encoded = serde_json::to_string_pretty(&plan).context("failed to serialize tile plan")?;
    println!("{encoded}");
    Ok(())
}




#[cfg(test)]
mod log_filter_tests {
    use super::*;

    fn effective_filter(rust_log_env: Option<&str>, verbose: u8, cli: Option<&str>) -> String {
        let options = LoggingInitOptions {
            verbose,
            cli_log_filter: cli.map(ToString::to_string),
            rust_log_env: rust_log_env.map(ToString::to_string),
            ..Default::default()
        };
        logging::compose_logging_filters(&options).effective_filter
    }

    #[test]
    fn uses_noise_and_default_info_without_overrides() {
        assert_eq!(effective_filter(None, 0, None), "ort=error,info");
    }

    #[test]
    fn verbose_flag_overrides_rust_log() {
        assert_eq!(effective_filter(Some("warn"), 1, None), "debug");
    }

    #[test]
    fn explicit_log_filter_has_highest_precedence() {
        assert_eq!(
            effective_filter(Some("warn"), 2, Some("tilefuse_core=trace")),
            "tilefuse_core=trace"
        );
    }
}
