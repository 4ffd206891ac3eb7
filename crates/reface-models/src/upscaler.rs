//! Real-ESRGAN super-resolution via ONNX Runtime.
//!
//! Large images are processed in overlapping tiles so memory stays bounded;
//! only the core of each tile is kept when stitching.

use crate::manager::ModelResourceManager;
use crate::onnx::{from_nchw, to_nchw, OnnxError, SessionLoader};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ort::value::TensorRef;
use reface_core::{CapabilityError, Upscaler};
use std::sync::Arc;

pub const UPSCALER_X2_MODEL: &str = "RealESRGAN_x2plus.onnx";
pub const UPSCALER_X4_MODEL: &str = "RealESRGAN_x4plus.onnx";

// --- Named constants ---
pub const DEFAULT_TILE_SIZE: u32 = 256;
const TILE_OVERLAP: u32 = 16;

/// One tile: the core region it contributes, and the padded region fed to
/// the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tile {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    px: u32,
    py: u32,
    pw: u32,
    ph: u32,
}

/// Cover a `width`×`height` image with cores of at most `tile` pixels,
/// each padded by `overlap` on every side (clipped to the image).
fn tile_grid(width: u32, height: u32, tile: u32, overlap: u32) -> Vec<Tile> {
    let tile = tile.max(1);
    let mut tiles = Vec::new();
    let mut y = 0;
    while y < height {
        let h = tile.min(height - y);
        let mut x = 0;
        while x < width {
            let w = tile.min(width - x);
            let px = x.saturating_sub(overlap);
            let py = y.saturating_sub(overlap);
            let pw = (x + w + overlap).min(width) - px;
            let ph = (y + h + overlap).min(height) - py;
            tiles.push(Tile { x, y, w, h, px, py, pw, ph });
            x += w;
        }
        y += h;
    }
    tiles
}

/// Model and native scale for `factor`. Falls back to the other model when
/// the preferred weights are absent; the caller resizes to the asked factor.
fn model_for(factor: u32, installed: impl Fn(&str) -> bool) -> (&'static str, u32) {
    let x2 = (UPSCALER_X2_MODEL, 2);
    let x4 = (UPSCALER_X4_MODEL, 4);
    let (preferred, other) = if factor <= 2 { (x2, x4) } else { (x4, x2) };
    if !installed(preferred.0) && installed(other.0) {
        tracing::debug!(factor, preferred = preferred.0, using = other.0, "upscaler fallback");
        return other;
    }
    preferred
}

pub struct EsrganUpscaler {
    manager: Arc<ModelResourceManager>,
    loader: SessionLoader,
    tile: u32,
}

impl EsrganUpscaler {
    pub fn new(manager: Arc<ModelResourceManager>, loader: SessionLoader) -> Self {
        Self {
            manager,
            loader,
            tile: DEFAULT_TILE_SIZE,
        }
    }

    pub fn with_tile_size(mut self, tile: u32) -> Self {
        self.tile = tile.max(TILE_OVERLAP * 2);
        self
    }

    /// Load whichever of the 2× and 4× models are installed.
    pub fn preload(&self) -> Result<(), CapabilityError> {
        let locator = self.manager.locator();
        let installed: Vec<&str> = [UPSCALER_X4_MODEL, UPSCALER_X2_MODEL]
            .into_iter()
            .filter(|m| locator.exists(m))
            .collect();
        if installed.is_empty() {
            self.manager.acquire(UPSCALER_X4_MODEL, &self.loader)?;
        }
        for model in installed {
            self.manager.acquire(model, &self.loader)?;
        }
        Ok(())
    }
}

impl Upscaler for EsrganUpscaler {
    fn upscale(&self, image: &RgbImage, factor: u32, max_size: u32) -> Result<RgbImage, CapabilityError> {
        let locator = self.manager.locator();
        let (model, scale) = model_for(factor, |m| locator.exists(m));
        let handle = self.manager.acquire(model, &self.loader)?;
        let (w, h) = image.dimensions();
        let tiles = tile_grid(w, h, self.tile, TILE_OVERLAP);
        tracing::debug!(model, tiles = tiles.len(), width = w, height = h, "super-resolution");

        let mut out = RgbImage::new(w * scale, h * scale);
        for t in &tiles {
            let patch = imageops::crop_imm(image, t.px, t.py, t.pw, t.ph).to_image();
            let input = to_nchw(&patch, 0.0, 255.0);
            let (ow, oh) = (t.pw * scale, t.ph * scale);

            let upscaled = handle.run(|session| -> Result<RgbImage, OnnxError> {
                let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
                let (_, data) = outputs[0]
                    .try_extract_tensor::<f32>()
                    .map_err(|e| OnnxError::Output(format!("upscaled tile: {e}")))?;
                if data.len() != (ow * oh * 3) as usize {
                    return Err(OnnxError::Output(format!(
                        "{model}: expected {ow}×{oh} tile, got {} values",
                        data.len()
                    )));
                }
                from_nchw(data, ow, oh, |v| v * 255.0)
            })??;

            let core = imageops::crop_imm(
                &upscaled,
                (t.x - t.px) * scale,
                (t.y - t.py) * scale,
                t.w * scale,
                t.h * scale,
            )
            .to_image();
            imageops::replace(&mut out, &core, (t.x * scale) as i64, (t.y * scale) as i64);
        }

        // The native scale can differ from the asked factor; resize to it.
        let mut target = (w * factor.max(1), h * factor.max(1));
        let longest = target.0.max(target.1);
        if max_size > 0 && longest > max_size {
            let s = max_size as f32 / longest as f32;
            target = (
                ((target.0 as f32 * s).round() as u32).max(1),
                ((target.1 as f32 * s).round() as u32).max(1),
            );
        }
        if out.dimensions() != target {
            out = imageops::resize(&out, target.0, target.1, FilterType::Lanczos3);
        }
        Ok(out)
    }
}
