//! ONNX Runtime session plumbing shared by the model implementations.

use crate::manager::ModelLoader;
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use reface_core::CapabilityError;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_INTRA_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("unexpected model output: {0}")]
    Output(String),
    #[error("face has no landmarks; the detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("source face has no identity embedding")]
    NoEmbedding,
}

impl From<OnnxError> for CapabilityError {
    fn from(e: OnnxError) -> Self {
        CapabilityError::Failed(e.to_string())
    }
}

/// Build a CPU session for the model at `path`.
pub fn build_session(path: &Path, intra_threads: usize) -> Result<Session, OnnxError> {
    let session = Session::builder()?
        .with_intra_threads(intra_threads)?
        .commit_from_file(path)?;

    tracing::info!(
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

/// Loads a bare session.
#[derive(Debug, Clone, Copy)]
pub struct SessionLoader {
    pub intra_threads: usize,
}

impl Default for SessionLoader {
    fn default() -> Self {
        Self {
            intra_threads: DEFAULT_INTRA_THREADS,
        }
    }
}

impl ModelLoader for SessionLoader {
    type Model = Session;

    fn load(&self, path: &Path) -> Result<Session, String> {
        build_session(path, self.intra_threads).map_err(|e| e.to_string())
    }
}

/// RGB image to a `(1, 3, H, W)` tensor with `(p - mean) / std` per channel.
pub fn to_nchw(image: &RgbImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, p) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (p[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// Flat NCHW planes back to an RGB image, mapping each value through
/// `to_pixel` before clamping to `[0, 255]`.
pub fn from_nchw(
    data: &[f32],
    width: u32,
    height: u32,
    to_pixel: impl Fn(f32) -> f32,
) -> Result<RgbImage, OnnxError> {
    let plane = width as usize * height as usize;
    if data.len() < plane * 3 {
        return Err(OnnxError::Output(format!(
            "expected {} values for a {width}×{height} RGB image, got {}",
            plane * 3,
            data.len()
        )));
    }
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let i = y as usize * width as usize + x as usize;
        Rgb(std::array::from_fn(|c| {
            to_pixel(data[c * plane + i]).round().clamp(0.0, 255.0) as u8
        }))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_nchw_layout_and_normalization() {
        let mut image = RgbImage::new(3, 2);
        image.put_pixel(2, 1, Rgb([255, 0, 127]));
        let t = to_nchw(&image, 127.5, 127.5);
        assert_eq!(t.shape(), &[1, 3, 2, 3]);
        assert!((t[[0, 0, 1, 2]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 1, 2]] + 1.0).abs() < 1e-6);
        assert!((t[[0, 0, 0, 0]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_from_nchw_inverts_to_nchw() {
        let image = RgbImage::from_fn(4, 3, |x, y| Rgb([(x * 40) as u8, (y * 70) as u8, 9]));
        let t = to_nchw(&image, 0.0, 255.0);
        let flat: Vec<f32> = t.iter().copied().collect();
        let back = from_nchw(&flat, 4, 3, |v| v * 255.0).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn test_from_nchw_rejects_short_output() {
        assert!(from_nchw(&[0.0; 5], 2, 2, |v| v).is_err());
    }

    #[test]
    fn test_onnx_error_is_inference_failure() {
        let e = CapabilityError::from(OnnxError::NoEmbedding);
        assert!(matches!(e, CapabilityError::Failed(_)));
    }
}
