//! GFPGAN face restoration via ONNX Runtime.
//!
//! Each detected face is aligned to the 512×512 FFHQ crop, restored, and
//! pasted back. Faces are found with the shared SCRFD detector.

use crate::alignment::{self, REFERENCE_LANDMARKS_FFHQ_512};
use crate::detector::ScrfdDetector;
use crate::manager::ModelResourceManager;
use crate::onnx::{from_nchw, to_nchw, OnnxError, SessionLoader};
use image::RgbImage;
use ort::value::TensorRef;
use reface_core::{CapabilityError, FaceDetector, FaceRestorer};
use std::sync::Arc;

pub const RESTORER_MODEL: &str = "GFPGANv1.4.onnx";

// --- Named constants ---
const GFPGAN_INPUT_SIZE: u32 = 512;
/// Input is scaled to [-1, 1].
const GFPGAN_MEAN: f32 = 127.5;
const GFPGAN_STD: f32 = 127.5;
const PASTE_FEATHER: f32 = 32.0;

pub struct GfpganRestorer {
    manager: Arc<ModelResourceManager>,
    loader: SessionLoader,
    detector: ScrfdDetector,
}

impl GfpganRestorer {
    pub fn new(manager: Arc<ModelResourceManager>, loader: SessionLoader) -> Self {
        let detector = ScrfdDetector::new(manager.clone()).with_intra_threads(loader.intra_threads);
        Self {
            manager,
            loader,
            detector,
        }
    }

    pub fn preload(&self) -> Result<(), CapabilityError> {
        self.manager.acquire(RESTORER_MODEL, &self.loader)?;
        Ok(())
    }

    fn restore_crop(&self, crop: &RgbImage) -> Result<RgbImage, CapabilityError> {
        let input = to_nchw(crop, GFPGAN_MEAN, GFPGAN_STD);
        let handle = self.manager.acquire(RESTORER_MODEL, &self.loader)?;
        let restored = handle.run(|session| -> Result<RgbImage, OnnxError> {
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Output(format!("restored face: {e}")))?;
            from_nchw(data, GFPGAN_INPUT_SIZE, GFPGAN_INPUT_SIZE, |v| (v + 1.0) / 2.0 * 255.0)
        })??;
        Ok(restored)
    }
}

impl FaceRestorer for GfpganRestorer {
    fn restore(&self, image: &RgbImage) -> Result<RgbImage, CapabilityError> {
        let faces = self.detector.detect(image)?;
        let mut out = image.clone();
        let mut restored = 0usize;

        for face in &faces {
            let Some(landmarks) = face.landmarks.as_ref() else {
                continue;
            };
            let (crop, m) =
                alignment::align(&out, landmarks, &REFERENCE_LANDMARKS_FFHQ_512, GFPGAN_INPUT_SIZE);
            let fixed = self.restore_crop(&crop)?;
            out = alignment::paste_back(&out, &fixed, &m, PASTE_FEATHER);
            restored += 1;
        }

        tracing::debug!(faces = faces.len(), restored, "GFPGAN pass");
        Ok(out)
    }
}
