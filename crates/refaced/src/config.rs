use reface_models::locator::DEFAULT_MIN_MODEL_BYTES;
use reface_models::manager::{DEFAULT_INFERENCE_PERMITS, DEFAULT_TOKEN_TIMEOUT};
use reface_models::{ManagerConfig, ModelLocator, OnnxSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Names a TOML file whose values seed the configuration.
pub const CONFIG_FILE_ENV: &str = "REFACE_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Which D-Bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration: defaults, overridden by the TOML file named in
/// `REFACE_CONFIG`, overridden by `REFACE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Model directory searched before the built-in roots.
    pub models_dir: Option<PathBuf>,
    /// Worker threads running jobs.
    pub workers: usize,
    /// Jobs queued beyond those running before callers wait.
    pub queue_depth: usize,
    /// Concurrent inference calls across all models.
    pub inference_permits: usize,
    /// Inference slot wait; `None` waits forever.
    pub token_timeout: Option<Duration>,
    /// Smaller model files are ignored as truncated.
    pub min_model_bytes: u64,
    /// Load models at startup instead of on first use.
    pub preload: bool,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Super-resolution tile edge in pixels.
    pub upscale_tile: u32,
    pub bus: BusKind,
    /// Directory every job path must resolve inside. Jobs name files the
    /// daemon reads and writes with its own permissions, so without a root
    /// any bus peer can reach any path the daemon can.
    pub path_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = OnnxSettings::default();
        Self {
            models_dir: None,
            workers: 2,
            queue_depth: 8,
            inference_permits: DEFAULT_INFERENCE_PERMITS,
            token_timeout: Some(DEFAULT_TOKEN_TIMEOUT),
            min_model_bytes: DEFAULT_MIN_MODEL_BYTES,
            preload: true,
            intra_threads: defaults.intra_threads,
            upscale_tile: defaults.upscale_tile,
            bus: BusKind::Session,
            path_root: None,
        }
    }
}

/// Config file contents. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    models_dir: Option<PathBuf>,
    workers: Option<usize>,
    queue_depth: Option<usize>,
    inference_permits: Option<usize>,
    /// Seconds; 0 waits forever.
    token_timeout_secs: Option<u64>,
    min_model_bytes: Option<u64>,
    preload: Option<bool>,
    intra_threads: Option<usize>,
    upscale_tile: Option<u32>,
    bus: Option<BusKind>,
    path_root: Option<PathBuf>,
}

impl Config {
    /// Load from the process environment and the optional config file.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var_os(CONFIG_FILE_ENV) {
            Some(path) if !path.is_empty() => Some(read_file(Path::new(&path))?),
            _ => None,
        };
        let mut config = Self::default();
        if let Some(file) = file {
            config.apply_file(file);
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_file(&mut self, f: FileConfig) {
        if f.models_dir.is_some() {
            self.models_dir = f.models_dir;
        }
        self.workers = f.workers.unwrap_or(self.workers);
        self.queue_depth = f.queue_depth.unwrap_or(self.queue_depth);
        self.inference_permits = f.inference_permits.unwrap_or(self.inference_permits);
        if let Some(secs) = f.token_timeout_secs {
            self.token_timeout = timeout_from_secs(secs);
        }
        self.min_model_bytes = f.min_model_bytes.unwrap_or(self.min_model_bytes);
        self.preload = f.preload.unwrap_or(self.preload);
        self.intra_threads = f.intra_threads.unwrap_or(self.intra_threads);
        self.upscale_tile = f.upscale_tile.unwrap_or(self.upscale_tile);
        self.bus = f.bus.unwrap_or(self.bus);
        if f.path_root.is_some() {
            self.path_root = f.path_root;
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = var("REFACE_MODELS_DIR").filter(|v| !v.is_empty()) {
            self.models_dir = Some(PathBuf::from(dir));
        }
        self.workers = parsed(&var, "REFACE_WORKERS").unwrap_or(self.workers);
        self.queue_depth = parsed(&var, "REFACE_QUEUE_DEPTH").unwrap_or(self.queue_depth);
        self.inference_permits = parsed(&var, "REFACE_INFERENCE_PERMITS").unwrap_or(self.inference_permits);
        if let Some(secs) = parsed::<u64>(&var, "REFACE_TOKEN_TIMEOUT_SECS") {
            self.token_timeout = timeout_from_secs(secs);
        }
        self.min_model_bytes = parsed(&var, "REFACE_MIN_MODEL_BYTES").unwrap_or(self.min_model_bytes);
        if let Some(v) = var("REFACE_PRELOAD") {
            self.preload = v != "0";
        }
        self.intra_threads = parsed(&var, "REFACE_INTRA_THREADS").unwrap_or(self.intra_threads);
        self.upscale_tile = parsed(&var, "REFACE_UPSCALE_TILE").unwrap_or(self.upscale_tile);
        if let Some(root) = var("REFACE_PATH_ROOT").filter(|v| !v.is_empty()) {
            self.path_root = Some(PathBuf::from(root));
        }
        match var("REFACE_BUS").as_deref() {
            Some("system") => self.bus = BusKind::System,
            Some("session") => self.bus = BusKind::Session,
            _ => {}
        }
        self.workers = self.workers.max(1);
        self.queue_depth = self.queue_depth.max(1);
    }

    /// Model search order; the legacy `MODELS_DIR` applies only when no
    /// directory was configured.
    pub fn locator(&self) -> ModelLocator {
        match &self.models_dir {
            Some(dir) => ModelLocator::with_override(Some(dir.clone())),
            None => ModelLocator::from_env(),
        }
        .with_min_bytes(self.min_model_bytes)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            permits: self.inference_permits,
            token_timeout: self.token_timeout,
        }
    }

    pub fn onnx_settings(&self) -> OnnxSettings {
        OnnxSettings {
            intra_threads: self.intra_threads,
            upscale_tile: self.upscale_tile,
        }
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}
