//! Execution provider selection for ONNX sessions.
//!
//! [`build_session`] registers the requested provider chain (TensorRT → CUDA,
//! CUDA, or plain CPU) and commits the model file.

use std::fmt;
use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, builder::SessionBuilder, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

const TRT_PROGRESS_TICK: Duration = Duration::from_secs(15);

/// Which execution provider runs the model.
///
/// `Tensorrt` needs the TensorRT runtime libraries; when they are missing the
/// session falls back to CUDA, and CUDA in turn falls back to CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Self::Cuda,
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cpu,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
    pub intra_threads: Option<usize>,
}

/// Build an `ort::Session` for `config.model_path` on the requested backend.
pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let mut builder =
        Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    if let Some(threads) = config.intra_threads {
        builder = builder.with_intra_threads(threads)?;
    }

    match config.backend {
        InferenceBackend::Tensorrt => build_tensorrt_session(builder, config),
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(|| model_load_error(config.model_path))
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with default CPU EP");
            builder
                .commit_from_file(config.model_path)
                .with_context(|| model_load_error(config.model_path))
        }
    }
}

fn build_tensorrt_session(builder: SessionBuilder, config: &SessionConfig<'_>) -> Result<Session> {
    let cache_dir = config
        .trt_cache_dir
        .unwrap_or_else(|| Path::new("trt_cache"));
    if let Err(e) = std::fs::create_dir_all(cache_dir) {
        warn!(
            dir = %cache_dir.display(),
            error = %e,
            "Failed to create TRT cache directory"
        );
    }

    info!(
        cache_dir = %cache_dir.display(),
        "Initializing TensorRT session (first run may take several minutes)"
    );
    let started = Instant::now();

    // Engine builds can take minutes; keep the user informed while we wait.
    let (stop_tx, stop_rx) = channel::<()>();
    let progress = thread::spawn(move || {
        let mut elapsed = TRT_PROGRESS_TICK.as_secs();
        loop {
            match stop_rx.recv_timeout(TRT_PROGRESS_TICK) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    info!(
                        elapsed_secs = elapsed,
                        "TensorRT session initialization still in progress"
                    );
                    elapsed += TRT_PROGRESS_TICK.as_secs();
                }
            }
        }
    });

    let cache_path = cache_dir.to_string_lossy().to_string();
    // TRT EP fails at runtime when libnvinfer is missing; the CUDA EP behind it keeps the session usable.
    let result = (|| -> Result<Session> {
        Ok(builder
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .with_engine_cache_path(&cache_path)
                    .with_fp16(true)
                    .with_device_id(0)
                    .build(),
                CUDAExecutionProvider::default().build(),
            ])?
            .commit_from_file(config.model_path)
            .with_context(|| model_load_error(config.model_path))?)
    })();

    let _ = stop_tx.send(());
    let _ = progress.join();

    let elapsed_secs = started.elapsed().as_secs_f64();
    match &result {
        Ok(_) => info!(elapsed_secs, "TensorRT session ready"),
        Err(err) => error!(elapsed_secs, error = %err, "TensorRT session initialization failed"),
    }
    result
}

fn model_load_error(path: &Path) -> String {
    format!("Failed to load ONNX model: {}", path.display())
}
