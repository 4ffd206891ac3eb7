use crate::engine::EngineHandle;
use reface_core::JobRequest;
use reface_models::{ModelLocator, OPTIONAL_MODELS, REQUIRED_MODELS};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use zbus::interface;

pub const BUS_NAME: &str = "org.reface.Engine1";
pub const OBJECT_PATH: &str = "/org/reface/Engine1";

#[derive(Error, Debug, PartialEq)]
pub enum PathError {
    #[error("job path {0} must be absolute without '..'")]
    NotAbsolute(PathBuf),
    #[error("job path {path} is outside {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },
}

/// Resolve symlinks in the longest existing prefix of `path`; the missing
/// tail is appended as given.
fn resolve(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        if let Ok(real) = existing.canonicalize() {
            return Some(tail.iter().rev().fold(real, |acc, part| acc.join(part)));
        }
        tail.push(existing.file_name()?);
        existing = existing.parent()?;
    }
}

/// Reject a job that reads or writes outside `root`. `root` must already be
/// canonical.
pub fn confine(request: &JobRequest, root: &Path) -> Result<(), PathError> {
    for path in request.local_paths() {
        let plain = path.is_absolute()
            && !path.components().any(|c| matches!(c, Component::ParentDir));
        if !plain {
            return Err(PathError::NotAbsolute(path));
        }
        let inside = resolve(&path).is_some_and(|real| real.starts_with(root));
        if !inside {
            return Err(PathError::OutsideRoot {
                path,
                root: root.to_path_buf(),
            });
        }
    }
    Ok(())
}

/// D-Bus interface for the reface worker daemon.
///
/// Bus name: org.reface.Engine1
/// Object path: /org/reface/Engine1
///
/// Jobs run with the daemon's filesystem permissions. With `path_root`
/// set, every path a job names must resolve inside it; without it any bus
/// peer can read and write anything the daemon can.
pub struct RefaceService {
    pub engine: EngineHandle,
    pub locator: ModelLocator,
    pub path_root: Option<PathBuf>,
}

#[interface(name = "org.reface.Engine1")]
impl RefaceService {
    /// Run a job described as JSON and return its JSON output. A job that
    /// fails still returns an output with `success: false`.
    async fn process(&self, job_json: &str) -> zbus::fdo::Result<String> {
        let request = JobRequest::from_json(job_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid job: {e}")))?;
        if let Some(root) = &self.path_root {
            confine(&request, root).map_err(|e| {
                tracing::warn!(error = %e, "job rejected");
                zbus::fdo::Error::AccessDenied(e.to_string())
            })?;
        }
        tracing::info!(
            kind = %request.process_type,
            job_id = request.job_id.as_deref().unwrap_or("-"),
            "process requested"
        );

        let output = self
            .engine
            .process(request)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        serde_json::to_string(&output).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Ask a queued or running job to stop at its next checkpoint.
    async fn cancel(&self, job_id: &str) -> bool {
        self.engine.cancel(job_id)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let available = |names: &[&str]| -> serde_json::Map<String, serde_json::Value> {
            names
                .iter()
                .map(|n| (n.to_string(), self.locator.exists(n).into()))
                .collect()
        };
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workers": self.engine.workers(),
            "in_flight": self.engine.in_flight(),
            "models": self.engine.model_states(),
            "required_models": available(REQUIRED_MODELS),
            "optional_models": available(OPTIONAL_MODELS),
            "model_root": self.locator.primary_root().map(|p| p.display().to_string()),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reface_core::{ImageRef, ProcessType};

    fn request(target: &Path, output_dir: Option<PathBuf>) -> JobRequest {
        let mut req = JobRequest::new(ProcessType::Video);
        req.source = Some(ImageRef("data:image/png;base64,AAAA".into()));
        req.target = Some(ImageRef::path(target));
        req.output_dir = output_dir;
        req
    }

    #[test]
    fn test_paths_inside_root_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("frames")).unwrap();
        let req = request(&root.join("frames"), Some(root.join("out/new")));
        assert_eq!(confine(&req, &root), Ok(()));
    }

    #[test]
    fn test_paths_outside_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let req = request(Path::new("/etc/passwd"), None);
        assert!(matches!(confine(&req, &root), Err(PathError::OutsideRoot { .. })));

        let req = request(&root.join("frames"), Some(root.join("../escape")));
        assert!(matches!(confine(&req, &root), Err(PathError::NotAbsolute(_))));

        let req = request(Path::new("frames"), None);
        assert!(matches!(confine(&req, &root), Err(PathError::NotAbsolute(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_root_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        let req = request(&root.join("link/frames"), None);
        assert!(matches!(confine(&req, &root), Err(PathError::OutsideRoot { .. })));
    }
}
