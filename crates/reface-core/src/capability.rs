//! Inference capabilities consumed by the pipeline.
//!
//! The neural networks behind these traits are opaque. Implementations must
//! be shareable across worker threads; they serialize access to their own
//! model instances.

use crate::types::DetectedFace;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    /// A required model file could not be located or loaded.
    #[error("model missing: {0}")]
    ModelMissing(String),
    /// The capability is not installed or not configured in this process.
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    /// Timed out waiting for an inference slot.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("inference failed: {0}")]
    Failed(String),
}

/// Face detection. Ordering of the returned faces is unspecified; it may be
/// empty.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, CapabilityError>;

    /// Detection plus identity embeddings, for faces used as a transfer
    /// source. Detectors without a recognizer return plain detections.
    fn identify(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, CapabilityError> {
        self.detect(image)
    }
}

impl CapabilityError {
    /// Errors that no other face or frame of the same job can avoid.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CapabilityError::ModelMissing(_) | CapabilityError::ResourceExhausted(_)
        )
    }
}

/// Identity transfer: paint `source`'s identity onto `target` within `image`,
/// returning a new image of the same dimensions.
pub trait IdentityTransfer: Send + Sync {
    fn transfer(
        &self,
        source: &DetectedFace,
        target: &DetectedFace,
        image: &RgbImage,
    ) -> Result<RgbImage, CapabilityError>;
}

/// Face restoration (sharpening/denoising of face regions).
pub trait FaceRestorer: Send + Sync {
    fn restore(&self, image: &RgbImage) -> Result<RgbImage, CapabilityError>;
}

/// AI super-resolution. `factor` is 2 or 4; the result should not exceed
/// `max_size` on its longest side.
pub trait Upscaler: Send + Sync {
    fn upscale(&self, image: &RgbImage, factor: u32, max_size: u32)
        -> Result<RgbImage, CapabilityError>;
}

/// The set of capabilities one job runs against.
#[derive(Clone, Copy)]
pub struct Capabilities<'a> {
    pub detector: &'a dyn FaceDetector,
    pub transfer: &'a dyn IdentityTransfer,
    pub restorer: Option<&'a dyn FaceRestorer>,
    pub upscaler: Option<&'a dyn Upscaler>,
}
