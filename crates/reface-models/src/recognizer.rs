//! ArcFace identity embeddings via ONNX Runtime.
//!
//! Extracts 512-dimensional embeddings from faces aligned to the canonical
//! 112×112 ArcFace crop, using the w600k_r50 model.

use crate::alignment::{self, REFERENCE_LANDMARKS_112};
use crate::manager::ModelResourceManager;
use crate::onnx::{to_nchw, OnnxError, SessionLoader};
use image::RgbImage;
use ort::value::TensorRef;
use reface_core::{CapabilityError, DetectedFace, Embedding};
use std::sync::Arc;

pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";

// --- Named constants (different from SCRFD!) ---
const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

pub struct ArcFaceEmbedder {
    manager: Arc<ModelResourceManager>,
    loader: SessionLoader,
}

impl ArcFaceEmbedder {
    pub fn new(manager: Arc<ModelResourceManager>, loader: SessionLoader) -> Self {
        Self { manager, loader }
    }

    pub fn preload(&self) -> Result<(), CapabilityError> {
        self.manager.acquire(RECOGNIZER_MODEL, &self.loader)?;
        Ok(())
    }

    /// Embedding for `face` in `image`. The face must carry landmarks.
    pub fn embed(&self, image: &RgbImage, face: &DetectedFace) -> Result<Embedding, CapabilityError> {
        let landmarks = face.landmarks.as_ref().ok_or(OnnxError::NoLandmarks)?;
        let (aligned, _) = alignment::align(image, landmarks, &REFERENCE_LANDMARKS_112, ARCFACE_INPUT_SIZE);
        let input = to_nchw(&aligned, ARCFACE_MEAN, ARCFACE_STD);

        let handle = self.manager.acquire(RECOGNIZER_MODEL, &self.loader)?;
        let raw = handle.run(|session| -> Result<Vec<f32>, OnnxError> {
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Output(format!("embedding extraction: {e}")))?;
            Ok(data.to_vec())
        })??;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(OnnxError::Output(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            ))
            .into());
        }

        Ok(Embedding {
            values: raw,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        }
        .l2_normalized())
    }
}
