//! inswapper identity transfer via ONNX Runtime.
//!
//! The target face is aligned to a 128×128 crop, the source identity is
//! projected through the model's embedding map, and the generated crop is
//! pasted back through the inverse alignment with a feathered mask.

use crate::alignment::{self, arcface_template};
use crate::manager::{ModelLoader, ModelResourceManager};
use crate::onnx::{build_session, from_nchw, to_nchw, OnnxError, DEFAULT_INTRA_THREADS};
use crate::recognizer::ARCFACE_EMBEDDING_DIM;
use image::RgbImage;
use ndarray::Array2;
use ort::session::Session;
use ort::value::TensorRef;
use reface_core::{CapabilityError, DetectedFace, IdentityTransfer};
use std::path::Path;
use std::sync::Arc;

pub const SWAPPER_MODEL: &str = "inswapper_128_fp16.onnx";
/// Embedding map exported from the model's last initializer, raw
/// little-endian f32, 512×512 row-major.
pub const SWAPPER_EMAP: &str = "inswapper_128_emap.bin";

const INSWAPPER_INPUT_SIZE: u32 = 128;
/// Mask falloff, as a fraction of the crop size.
const PASTE_FEATHER_RATIO: f32 = 0.1;

pub struct InswapperModel {
    session: Session,
    emap: Array2<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct InswapperLoader {
    pub intra_threads: usize,
}

/// Parse a raw embedding map.
fn parse_emap(bytes: &[u8]) -> Result<Array2<f32>, String> {
    let dim = ARCFACE_EMBEDDING_DIM;
    if bytes.len() != dim * dim * 4 {
        return Err(format!(
            "embedding map must be {} bytes ({dim}×{dim} f32), got {}",
            dim * dim * 4,
            bytes.len()
        ));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Array2::from_shape_vec((dim, dim), values).map_err(|e| e.to_string())
}

impl ModelLoader for InswapperLoader {
    type Model = InswapperModel;

    fn load(&self, path: &Path) -> Result<InswapperModel, String> {
        let emap_path = path.with_file_name(SWAPPER_EMAP);
        let bytes = std::fs::read(&emap_path)
            .map_err(|e| format!("reading {}: {e}", emap_path.display()))?;
        let emap = parse_emap(&bytes)?;
        let session = build_session(path, self.intra_threads).map_err(|e| e.to_string())?;
        Ok(InswapperModel { session, emap })
    }
}

/// Project an identity embedding through the embedding map and L2-normalize.
fn latent(embedding: &[f32], emap: &Array2<f32>) -> Array2<f32> {
    let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
    let row = Array2::from_shape_fn((1, embedding.len()), |(_, i)| embedding[i] / norm);
    let projected = row.dot(emap);
    let pnorm = projected.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
    projected / pnorm
}

impl InswapperModel {
    fn swap(&mut self, embedding: &[f32], crop: &RgbImage) -> Result<RgbImage, OnnxError> {
        if embedding.len() != self.emap.nrows() {
            return Err(OnnxError::Output(format!(
                "source embedding has {} values, embedding map expects {}",
                embedding.len(),
                self.emap.nrows()
            )));
        }
        let target = to_nchw(crop, 0.0, 255.0);
        let source = latent(embedding, &self.emap);

        let outputs = self.session.run(ort::inputs![
            "target" => TensorRef::from_array_view(target.view())?,
            "source" => TensorRef::from_array_view(source.view())?,
        ])?;
        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::Output(format!("swapped face: {e}")))?;
        from_nchw(data, INSWAPPER_INPUT_SIZE, INSWAPPER_INPUT_SIZE, |v| v * 255.0)
    }
}

/// [`IdentityTransfer`] backed by a lazily loaded inswapper model.
pub struct InswapperTransfer {
    manager: Arc<ModelResourceManager>,
    loader: InswapperLoader,
}

impl InswapperTransfer {
    pub fn new(manager: Arc<ModelResourceManager>) -> Self {
        Self {
            manager,
            loader: InswapperLoader {
                intra_threads: DEFAULT_INTRA_THREADS,
            },
        }
    }

    pub fn with_intra_threads(mut self, n: usize) -> Self {
        self.loader.intra_threads = n;
        self
    }

    pub fn preload(&self) -> Result<(), CapabilityError> {
        self.manager.acquire(SWAPPER_MODEL, &self.loader)?;
        Ok(())
    }
}

impl IdentityTransfer for InswapperTransfer {
    fn transfer(
        &self,
        source: &DetectedFace,
        target: &DetectedFace,
        image: &RgbImage,
    ) -> Result<RgbImage, CapabilityError> {
        let embedding = source.embedding.as_ref().ok_or(OnnxError::NoEmbedding)?;
        let landmarks = target.landmarks.as_ref().ok_or(OnnxError::NoLandmarks)?;

        let template = arcface_template(INSWAPPER_INPUT_SIZE);
        let (crop, m) = alignment::align(image, landmarks, &template, INSWAPPER_INPUT_SIZE);

        let handle = self.manager.acquire(SWAPPER_MODEL, &self.loader)?;
        let swapped = handle.run(|model| model.swap(&embedding.values, &crop))??;

        let feather = INSWAPPER_INPUT_SIZE as f32 * PASTE_FEATHER_RATIO;
        Ok(alignment::paste_back(image, &swapped, &m, feather))
    }
}
