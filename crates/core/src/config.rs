use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::engine::{InferenceBackend, TensorLayout};
use crate::normalize::ValueRange;
use crate::types::{default_stride, TileParams, DEFAULT_PATCH_SIZE, DEFAULT_WEIGHT_EPSILON};

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "TILEFUSE_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub tiling: TilingConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TilingConfig {
    pub patch_size: usize,
    /// Half the patch size when unset.
    pub stride: Option<usize>,
    pub epsilon: f32,
    pub batch_size: usize,
    pub merge_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    /// Relative paths resolve against `paths.models_dir`.
    pub path: Option<PathBuf>,
    pub backend: InferenceBackend,
    pub layout: TensorLayout,
    pub input_range: ValueRange,
    pub output_range: ValueRange,
    pub input_name: Option<String>,
    pub output_name: Option<String>,
    pub intra_threads: Option<usize>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            patch_size: DEFAULT_PATCH_SIZE,
            stride: None,
            epsilon: DEFAULT_WEIGHT_EPSILON,
            batch_size: 16,
            merge_threads: 1,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            backend: InferenceBackend::Cpu,
            layout: TensorLayout::Nhwc,
            input_range: ValueRange::SIGNED_UNIT,
            output_range: ValueRange::SIGNED_UNIT,
            input_name: None,
            output_name: None,
            intra_threads: None,
        }
    }
}

impl TilingConfig {
    pub fn params(&self) -> TileParams {
        TileParams {
            patch_size: self.patch_size,
            stride: self
                .stride
                .unwrap_or_else(|| default_stride(self.patch_size)),
            epsilon: self.epsilon,
        }
    }
}

impl ModelConfig {
    pub fn resolve_path(&self, models_dir: &Path) -> Option<PathBuf> {
        self.path
            .as_deref()
            .map(|path| resolve_relative_to(models_dir, path))
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Make `paths` absolute against the data directory.
    pub fn resolve_paths(&mut self, data_dir: &Path) {
        self.paths.models_dir = resolve_relative_to(data_dir, &self.paths.models_dir);
        self.paths.trt_cache_dir = resolve_relative_to(data_dir, &self.paths.trt_cache_dir);
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TILEFUSE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and the models directory, and write a default
/// config.toml unless one already exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let cfg_path = config_path(data_dir);
    let mut config = if cfg_path.exists() {
        AppConfig::load_from_path(&cfg_path)?
    } else {
        let default_cfg = AppConfig::default();
        default_cfg.save_to_path(&cfg_path)?;
        default_cfg
    };

    config.resolve_paths(data_dir);
    fs::create_dir_all(&config.paths.models_dir).with_context(|| {
        format!(
            "failed to create models directory: {}",
            config.paths.models_dir.display()
        )
    })?;

    Ok(())
}

/// Returns `path` as-is if absolute, otherwise joined onto `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
