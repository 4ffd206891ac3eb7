//! Adaptive output scaling.
//!
//! Chooses an upscale factor and output bound from the image size and the
//! processing mode, and applies it with AI upscaling or a deterministic
//! Lanczos3 fallback.

use crate::capability::Upscaler;
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};

// --- Single-subject decision table ---
const SINGLE_X4_BELOW: u32 = 768;
const SINGLE_X2_BELOW: u32 = 1536;
const SINGLE_X4_BOUND: u32 = 4096;
const SINGLE_X2_BOUND: u32 = 3072;
const SINGLE_SKIP_BOUND: u32 = 3072;
const SINGLE_FALLBACK_TARGET: u32 = 1536;

// --- Multi-subject decision table ---
const MULTI_X4_BELOW: u32 = 640;
const MULTI_X2_BELOW: u32 = 1280;
const MULTI_X4_BOUND: u32 = 5120;
const MULTI_X2_BOUND: u32 = 4096;
const MULTI_SKIP_BOUND: u32 = 4096;
const MULTI_FALLBACK_TARGET: u32 = 2048;

const FALLBACK_MAX_SCALE: f32 = 2.0;
const RESAMPLE_FILTER: FilterType = FilterType::Lanczos3;

/// Processing mode of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Single,
    Multi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMethod {
    AiUpscale,
    DeterministicResize,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScalingDecision {
    /// 1, 2 or 4.
    pub factor: u32,
    /// Upper bound on the longest output side, in pixels.
    pub max_output: u32,
    pub method: ScalingMethod,
}

impl ScalingDecision {
    pub fn is_skip(&self) -> bool {
        self.method == ScalingMethod::Skip
    }

    /// A skip decision bounded by the current size.
    pub fn keep(width: u32, height: u32) -> Self {
        Self {
            factor: 1,
            max_output: width.max(height),
            method: ScalingMethod::Skip,
        }
    }
}

/// Decide the scaling for an image of `width` × `height`.
///
/// The table is keyed on the shorter side, the dimension that limits
/// perceived detail; a 600×800 portrait therefore gets 4×.
pub fn decide(width: u32, height: u32, mode: Mode) -> ScalingDecision {
    let side = width.min(height);

    let (factor, max_output) = match mode {
        Mode::Single => {
            if side < SINGLE_X4_BELOW {
                (4, SINGLE_X4_BOUND)
            } else if side < SINGLE_X2_BELOW {
                (2, SINGLE_X2_BOUND)
            } else {
                (1, SINGLE_SKIP_BOUND)
            }
        }
        Mode::Multi => {
            if side < MULTI_X4_BELOW {
                (4, MULTI_X4_BOUND)
            } else if side < MULTI_X2_BELOW {
                (2, MULTI_X2_BOUND)
            } else {
                (1, MULTI_SKIP_BOUND)
            }
        }
    };

    let method = if factor > 1 {
        ScalingMethod::AiUpscale
    } else {
        ScalingMethod::Skip
    };

    ScalingDecision {
        factor,
        max_output,
        method,
    }
}

/// Output dimensions for the deterministic fallback resize.
///
/// Scales so the longest side reaches the mode's target (1536 single, 2048
/// multi), capped at 2×. An image whose longest side already meets the
/// target still gets the 2× cap so a decided upscale is never dropped.
/// The result never exceeds `max_output` and never shrinks the image.
pub fn fallback_dimensions(width: u32, height: u32, mode: Mode, max_output: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest == 0 {
        return (width, height);
    }

    let target = match mode {
        Mode::Single => SINGLE_FALLBACK_TARGET,
        Mode::Multi => MULTI_FALLBACK_TARGET,
    };

    let desired = target as f32 / longest as f32;
    let mut scale = if desired > 1.0 {
        desired.min(FALLBACK_MAX_SCALE)
    } else {
        FALLBACK_MAX_SCALE
    };
    scale = scale.min(max_output as f32 / longest as f32);

    if scale <= 1.0 {
        return (width, height);
    }

    (
        ((width as f32 * scale).round() as u32).max(1),
        ((height as f32 * scale).round() as u32).max(1),
    )
}

/// Deterministic resize of `image` with the fixed fallback filter.
pub fn resize_deterministic(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    image::imageops::resize(image, width, height, RESAMPLE_FILTER)
}

/// Shrink `image` so its longest side is at most `max_output`.
fn bound_output(image: RgbImage, max_output: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if longest <= max_output || longest == 0 {
        return image;
    }
    let scale = max_output as f32 / longest as f32;
    let nw = ((w as f32 * scale).round() as u32).max(1);
    let nh = ((h as f32 * scale).round() as u32).max(1);
    tracing::debug!(from = ?(w, h), to = ?(nw, nh), "bounding upscaled output");
    image::imageops::resize(&image, nw, nh, RESAMPLE_FILTER)
}

/// Apply `decision` to `image`.
///
/// Returns the scaled image and the decision as executed: when AI upscaling
/// is unavailable or fails, the deterministic fallback runs and the returned
/// method is [`ScalingMethod::DeterministicResize`].
pub fn apply_scaling(
    image: &RgbImage,
    decision: ScalingDecision,
    mode: Mode,
    upscaler: Option<&dyn Upscaler>,
) -> (RgbImage, ScalingDecision) {
    if decision.is_skip() {
        return (image.clone(), decision);
    }

    if let Some(upscaler) = upscaler {
        match upscaler.upscale(image, decision.factor, decision.max_output) {
            Ok(upscaled) if upscaled.width() > 0 && upscaled.height() > 0 => {
                tracing::info!(
                    factor = decision.factor,
                    width = upscaled.width(),
                    height = upscaled.height(),
                    "AI upscaling applied"
                );
                return (bound_output(upscaled, decision.max_output), decision);
            }
            Ok(_) => {
                tracing::warn!("upscaler returned an empty image; using deterministic resize");
            }
            Err(e) => {
                tracing::warn!(error = %e, "AI upscaling failed; using deterministic resize");
            }
        }
    } else {
        tracing::warn!("no AI upscaler configured; using deterministic resize");
    }

    let (w, h) = image.dimensions();
    let (nw, nh) = fallback_dimensions(w, h, mode, decision.max_output);
    let resized = resize_deterministic(image, nw, nh);
    tracing::info!(from = ?(w, h), to = ?(nw, nh), "deterministic resize applied");

    (
        resized,
        ScalingDecision {
            method: ScalingMethod::DeterministicResize,
            ..decision
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityError;

    struct FailingUpscaler;

    impl Upscaler for FailingUpscaler {
        fn upscale(&self, _: &RgbImage, _: u32, _: u32) -> Result<RgbImage, CapabilityError> {
            Err(CapabilityError::Unavailable("no weights".into()))
        }
    }

    /// Nearest-neighbour "AI" upscaler that ignores the bound.
    struct NaiveUpscaler;

    impl Upscaler for NaiveUpscaler {
        fn upscale(&self, img: &RgbImage, factor: u32, _: u32) -> Result<RgbImage, CapabilityError> {
            Ok(image::imageops::resize(
                img,
                img.width() * factor,
                img.height() * factor,
                FilterType::Nearest,
            ))
        }
    }

    #[test]
    fn test_single_table() {
        assert_eq!(decide(500, 700, Mode::Single).factor, 4);
        assert_eq!(decide(500, 700, Mode::Single).max_output, 4096);
        assert_eq!(decide(767, 767, Mode::Single).factor, 4);
        assert_eq!(decide(768, 768, Mode::Single).factor, 2);
        assert_eq!(decide(1535, 1535, Mode::Single).max_output, 3072);
        let skip = decide(1536, 1536, Mode::Single);
        assert_eq!(skip.factor, 1);
        assert_eq!(skip.max_output, 3072);
        assert_eq!(skip.method, ScalingMethod::Skip);
    }

    #[test]
    fn test_multi_table() {
        assert_eq!(decide(639, 639, Mode::Multi), ScalingDecision {
            factor: 4, max_output: 5120, method: ScalingMethod::AiUpscale,
        });
        assert_eq!(decide(640, 640, Mode::Multi).factor, 2);
        assert_eq!(decide(1279, 1279, Mode::Multi).max_output, 4096);
        assert_eq!(decide(1280, 1280, Mode::Multi).factor, 1);
        assert_eq!(decide(1280, 1280, Mode::Multi).max_output, 4096);
    }

    #[test]
    fn test_portrait_600x800_gets_4x() {
        let d = decide(600, 800, Mode::Single);
        assert_eq!(d.factor, 4);
        assert_eq!(d.max_output, 4096);
        assert_eq!(d.method, ScalingMethod::AiUpscale);
    }

    #[test]
    fn test_large_square_skips() {
        let d = decide(2000, 2000, Mode::Single);
        assert_eq!(d.factor, 1);
        assert!(d.is_skip());
    }

    #[test]
    fn test_decide_is_pure() {
        for (w, h) in [(1, 1), (640, 480), (1920, 1080), (4000, 3000)] {
            for mode in [Mode::Single, Mode::Multi] {
                assert_eq!(decide(w, h, mode), decide(w, h, mode));
            }
        }
    }

    #[test]
    fn test_fallback_reaches_target() {
        // 900 → 1536 is 1.71×, under the 2× cap.
        assert_eq!(fallback_dimensions(900, 600, Mode::Single, 3072), (1536, 1024));
    }

    #[test]
    fn test_fallback_capped_at_2x() {
        assert_eq!(fallback_dimensions(400, 300, Mode::Single, 4096), (800, 600));
        assert_eq!(fallback_dimensions(500, 500, Mode::Multi, 5120), (1000, 1000));
    }

    #[test]
    fn test_fallback_respects_bound() {
        assert_eq!(fallback_dimensions(700, 3000, Mode::Single, 4096), (956, 4096));
    }

    #[test]
    fn test_fallback_never_shrinks() {
        assert_eq!(fallback_dimensions(700, 5000, Mode::Single, 4096), (700, 5000));
    }

    #[test]
    fn test_apply_skip_leaves_image_untouched() {
        let img = RgbImage::from_pixel(2000, 2000, image::Rgb([10, 20, 30]));
        let decision = decide(2000, 2000, Mode::Single);
        let (out, executed) = apply_scaling(&img, decision, Mode::Single, Some(&NaiveUpscaler));
        assert_eq!(out, img);
        assert_eq!(executed.method, ScalingMethod::Skip);
    }

    #[test]
    fn test_apply_falls_back_on_failure() {
        let img = RgbImage::from_pixel(400, 300, image::Rgb([10, 20, 30]));
        let decision = decide(400, 300, Mode::Single);
        let (out, executed) = apply_scaling(&img, decision, Mode::Single, Some(&FailingUpscaler));
        assert_eq!(out.dimensions(), (800, 600));
        assert_eq!(executed.method, ScalingMethod::DeterministicResize);
        assert_eq!(executed.factor, 4);
    }

    #[test]
    fn test_apply_falls_back_without_upscaler() {
        let img = RgbImage::from_pixel(900, 900, image::Rgb([0, 0, 0]));
        let decision = decide(900, 900, Mode::Single);
        let (out, executed) = apply_scaling(&img, decision, Mode::Single, None);
        assert_eq!(out.dimensions(), (1536, 1536));
        assert_eq!(executed.method, ScalingMethod::DeterministicResize);
    }

    #[test]
    fn test_apply_uses_ai_upscaler() {
        let img = RgbImage::from_pixel(100, 200, image::Rgb([0, 0, 0]));
        let decision = decide(100, 200, Mode::Single);
        assert_eq!(decision.factor, 4);
        let (out, executed) = apply_scaling(&img, decision, Mode::Single, Some(&NaiveUpscaler));
        assert_eq!(out.dimensions(), (400, 800));
        assert_eq!(executed.method, ScalingMethod::AiUpscale);
    }

    #[test]
    fn test_bound_output_shrinks_oversized() {
        let img = RgbImage::from_pixel(100, 50, image::Rgb([0, 0, 0]));
        assert_eq!(bound_output(img.clone(), 40).dimensions(), (40, 20));
        assert_eq!(bound_output(img, 100).dimensions(), (100, 50));
    }
}
