//! reface-models — Model files, their lifecycle, and the ONNX-backed
//! implementations of the reface-core capabilities.

pub mod alignment;
pub mod detector;
pub mod locator;
pub mod manager;
pub mod onnx;
pub mod recognizer;
pub mod restorer;
pub mod swapper;
pub mod upscaler;

pub use locator::ModelLocator;
pub use manager::{LoadState, ManagerConfig, ModelError, ModelResourceManager};

use detector::ScrfdDetector;
use onnx::SessionLoader;
use recognizer::ArcFaceEmbedder;
use reface_core::{Capabilities, CapabilityError};
use restorer::GfpganRestorer;
use std::sync::Arc;
use swapper::InswapperTransfer;
use upscaler::EsrganUpscaler;

/// Models a job cannot run without.
pub const REQUIRED_MODELS: &[&str] = &[
    detector::DETECTOR_MODEL,
    recognizer::RECOGNIZER_MODEL,
    swapper::SWAPPER_MODEL,
];

/// Models whose absence only degrades output.
pub const OPTIONAL_MODELS: &[&str] = &[
    restorer::RESTORER_MODEL,
    upscaler::UPSCALER_X2_MODEL,
    upscaler::UPSCALER_X4_MODEL,
];

#[derive(Debug, Clone, Copy)]
pub struct OnnxSettings {
    pub intra_threads: usize,
    pub upscale_tile: u32,
}

impl Default for OnnxSettings {
    fn default() -> Self {
        Self {
            intra_threads: onnx::DEFAULT_INTRA_THREADS,
            upscale_tile: upscaler::DEFAULT_TILE_SIZE,
        }
    }
}

/// The full ONNX capability set, sharing one model manager.
pub struct OnnxCapabilities {
    manager: Arc<ModelResourceManager>,
    detector: ScrfdDetector,
    transfer: InswapperTransfer,
    restorer: GfpganRestorer,
    upscaler: EsrganUpscaler,
}

impl OnnxCapabilities {
    pub fn new(manager: Arc<ModelResourceManager>, settings: OnnxSettings) -> Self {
        let loader = SessionLoader {
            intra_threads: settings.intra_threads,
        };
        let embedder = ArcFaceEmbedder::new(manager.clone(), loader);
        Self {
            detector: ScrfdDetector::new(manager.clone())
                .with_intra_threads(settings.intra_threads)
                .with_embedder(embedder),
            transfer: InswapperTransfer::new(manager.clone()).with_intra_threads(settings.intra_threads),
            restorer: GfpganRestorer::new(manager.clone(), loader),
            upscaler: EsrganUpscaler::new(manager.clone(), loader).with_tile_size(settings.upscale_tile),
            manager,
        }
    }

    pub fn manager(&self) -> &Arc<ModelResourceManager> {
        &self.manager
    }

    /// Borrow as a capability set. Optional capabilities whose models are not
    /// on disk are left out so the pipeline reports them as degraded.
    pub fn capabilities(&self) -> Capabilities<'_> {
        let locator = self.manager.locator();
        let has_upscaler = locator.exists(upscaler::UPSCALER_X4_MODEL) || locator.exists(upscaler::UPSCALER_X2_MODEL);
        Capabilities {
            detector: &self.detector,
            transfer: &self.transfer,
            restorer: locator
                .exists(restorer::RESTORER_MODEL)
                .then_some(&self.restorer as &dyn reface_core::FaceRestorer),
            upscaler: has_upscaler.then_some(&self.upscaler as &dyn reface_core::Upscaler),
        }
    }

    /// Load the required models now; any failure is returned.
    pub fn preload_required(&self) -> Result<(), CapabilityError> {
        self.detector.preload()?;
        self.transfer.preload()
    }

    /// Load the optional models now; failures are logged and tolerated.
    pub fn preload_optional(&self) {
        if let Err(e) = self.restorer.preload() {
            tracing::warn!(error = %e, "face restoration unavailable");
        }
        if let Err(e) = self.upscaler.preload() {
            tracing::warn!(error = %e, "AI upscaling unavailable");
        }
    }
}
