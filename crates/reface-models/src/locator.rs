//! Model file resolution across deployment layouts.
//!
//! Candidate roots are searched in order: the environment override, the
//! container mount points, then `./models`.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable naming the model directory.
pub const MODELS_DIR_ENV: &str = "REFACE_MODELS_DIR";
/// Older deployments set this instead.
pub const LEGACY_MODELS_DIR_ENV: &str = "MODELS_DIR";

/// Platform mount points, in priority order.
const MOUNT_ROOTS: &[&str] = &[
    "/runpod-volume/faceswap",
    "/runpod-volume/faceswap/models",
    "/runpod-volume/models",
    "/workspace/faceswap",
    "/workspace/faceswap/models",
    "/workspace/models",
    "/app/models",
];

const LOCAL_ROOT: &str = "models";

/// Files smaller than this are treated as truncated downloads.
pub const DEFAULT_MIN_MODEL_BYTES: u64 = 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocatorError {
    #[error("model {name} not found; searched: {}", display_roots(.searched))]
    NotFound { name: String, searched: Vec<PathBuf> },
}

fn display_roots(roots: &[PathBuf]) -> String {
    roots
        .iter()
        .map(|r| r.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone)]
pub struct ModelLocator {
    roots: Vec<PathBuf>,
    min_bytes: u64,
}

impl ModelLocator {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            min_bytes: DEFAULT_MIN_MODEL_BYTES,
        }
    }

    /// Default search order, with `override_dir` (if any) searched first.
    pub fn with_override(override_dir: Option<PathBuf>) -> Self {
        let mut roots: Vec<PathBuf> = override_dir.into_iter().collect();
        roots.extend(MOUNT_ROOTS.iter().map(PathBuf::from));
        roots.push(PathBuf::from(LOCAL_ROOT));
        Self::new(roots)
    }

    /// Default search order with the override read from the environment.
    pub fn from_env() -> Self {
        let override_dir = std::env::var_os(MODELS_DIR_ENV)
            .or_else(|| std::env::var_os(LEGACY_MODELS_DIR_ENV))
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::with_override(override_dir)
    }

    pub fn with_min_bytes(mut self, min_bytes: u64) -> Self {
        self.min_bytes = min_bytes;
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// First usable root, for diagnostics.
    pub fn primary_root(&self) -> Option<&Path> {
        self.roots.iter().find(|r| r.is_dir()).map(PathBuf::as_path)
    }

    /// Resolve `name` to the first file of acceptable size under any root.
    pub fn locate(&self, name: &str) -> Result<PathBuf, LocatorError> {
        for root in &self.roots {
            let candidate = root.join(name);
            let Ok(meta) = std::fs::metadata(&candidate) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            if meta.len() < self.min_bytes {
                tracing::warn!(
                    path = %candidate.display(),
                    bytes = meta.len(),
                    min_bytes = self.min_bytes,
                    "ignoring model file: too small, likely a truncated download"
                );
                continue;
            }
            tracing::debug!(model = name, path = %candidate.display(), "model located");
            return Ok(candidate);
        }

        Err(LocatorError::NotFound {
            name: name.to_string(),
            searched: self.roots.clone(),
        })
    }

    /// Whether `name` resolves, without logging a failure.
    pub fn exists(&self, name: &str) -> bool {
        self.locate(name).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, len: usize) {
        std::fs::write(path, vec![0u8; len]).unwrap();
    }

    #[test]
    fn test_first_root_wins() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write(&a.path().join("m.onnx"), 16);
        write(&b.path().join("m.onnx"), 16);

        let locator = ModelLocator::new(vec![a.path().into(), b.path().into()]).with_min_bytes(1);
        assert_eq!(locator.locate("m.onnx").unwrap(), a.path().join("m.onnx"));
    }

    #[test]
    fn test_falls_through_missing_roots() {
        let b = tempfile::tempdir().unwrap();
        write(&b.path().join("m.onnx"), 16);

        let locator = ModelLocator::new(vec![PathBuf::from("/nonexistent/reface"), b.path().into()])
            .with_min_bytes(1);
        assert_eq!(locator.locate("m.onnx").unwrap(), b.path().join("m.onnx"));
    }

    #[test]
    fn test_too_small_file_is_skipped() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write(&a.path().join("sr.onnx"), 10);
        write(&b.path().join("sr.onnx"), 100);

        let locator = ModelLocator::new(vec![a.path().into(), b.path().into()]).with_min_bytes(50);
        assert_eq!(locator.locate("sr.onnx").unwrap(), b.path().join("sr.onnx"));
    }

    #[test]
    fn test_not_found_lists_roots() {
        let a = tempfile::tempdir().unwrap();
        let locator = ModelLocator::new(vec![a.path().into()]);
        let err = locator.locate("missing.onnx").unwrap_err();
        let LocatorError::NotFound { name, searched } = &err;
        assert_eq!(name, "missing.onnx");
        assert_eq!(searched, &vec![a.path().to_path_buf()]);
        assert!(err.to_string().contains(&a.path().display().to_string()));
    }

    #[test]
    fn test_directory_is_not_a_model() {
        let a = tempfile::tempdir().unwrap();
        std::fs::create_dir(a.path().join("m.onnx")).unwrap();
        let locator = ModelLocator::new(vec![a.path().into()]).with_min_bytes(0);
        assert!(!locator.exists("m.onnx"));
    }

    #[test]
    fn test_default_order() {
        let locator = ModelLocator::with_override(Some(PathBuf::from("/custom")));
        let roots = locator.roots();
        assert_eq!(roots[0], PathBuf::from("/custom"));
        assert_eq!(roots[1], PathBuf::from("/runpod-volume/faceswap"));
        assert_eq!(roots.last().unwrap(), &PathBuf::from("models"));
        assert_eq!(roots.len(), MOUNT_ROOTS.len() + 2);

        let no_override = ModelLocator::with_override(None);
        assert_eq!(no_override.roots().len(), MOUNT_ROOTS.len() + 1);
    }
}
