//! Pixel compositing helpers used around identity transfer and restoration.
//!
//! Every function returns a new buffer; inputs are never modified.

use crate::types::{BoundingBox, DetectedFace};
use image::{Rgb, RgbImage};

/// Mouth ellipse half-width as a multiple of the mouth-corner distance.
const MOUTH_RX_SCALE: f32 = 0.75;
/// Mouth ellipse half-height as a multiple of the mouth-corner distance.
const MOUTH_RY_SCALE: f32 = 0.45;
/// Fraction of the ellipse radius used as a soft falloff band.
const MOUTH_FEATHER: f32 = 0.35;

/// Weighted blend `original * w_original + other * (1 - w_original)`.
///
/// Returns `None` when the buffers differ in size.
pub fn blend(original: &RgbImage, other: &RgbImage, w_original: f32) -> Option<RgbImage> {
    if original.dimensions() != other.dimensions() {
        return None;
    }
    let w_o = w_original.clamp(0.0, 1.0);
    let w_r = 1.0 - w_o;

    let mut out = RgbImage::new(original.width(), original.height());
    for ((dst, a), b) in out.pixels_mut().zip(original.pixels()).zip(other.pixels()) {
        for c in 0..3 {
            let v = a[c] as f32 * w_o + b[c] as f32 * w_r;
            dst[c] = v.round().clamp(0.0, 255.0) as u8;
        }
    }
    Some(out)
}

/// Per-channel (mean, std) over a rectangle.
fn region_stats(image: &RgbImage, x: u32, y: u32, w: u32, h: u32) -> [(f32, f32); 3] {
    let n = (w * h) as f32;
    let mut sum = [0.0f32; 3];
    let mut sq = [0.0f32; 3];

    for yy in y..y + h {
        for xx in x..x + w {
            let p = image.get_pixel(xx, yy);
            for c in 0..3 {
                let v = p[c] as f32;
                sum[c] += v;
                sq[c] += v * v;
            }
        }
    }

    std::array::from_fn(|c| {
        let mean = sum[c] / n;
        let var = (sq[c] / n - mean * mean).max(0.0);
        (mean, var.sqrt())
    })
}

/// Match the colour statistics of the face region in `transferred` to the
/// same region in `reference`.
///
/// Reinhard-style per-channel mean/std transfer restricted to the face box.
/// Pixels outside the box are copied through unchanged.
pub fn color_correct(reference: &RgbImage, transferred: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    let mut out = transferred.clone();
    if reference.dimensions() != transferred.dimensions() {
        return out;
    }
    let Some((x, y, w, h)) = bbox.clamp_to(out.width(), out.height()) else {
        return out;
    };

    let want = region_stats(reference, x, y, w, h);
    let have = region_stats(transferred, x, y, w, h);

    for yy in y..y + h {
        for xx in x..x + w {
            let p = transferred.get_pixel(xx, yy);
            let mut q = [0u8; 3];
            for c in 0..3 {
                let (m_have, s_have) = have[c];
                let (m_want, s_want) = want[c];
                let gain = if s_have > 1e-3 { s_want / s_have } else { 1.0 };
                let v = (p[c] as f32 - m_have) * gain + m_want;
                q[c] = v.round().clamp(0.0, 255.0) as u8;
            }
            out.put_pixel(xx, yy, Rgb(q));
        }
    }
    out
}

/// Paste the mouth region of `original` back over `transferred`.
///
/// The region is an ellipse centred between the two mouth-corner landmarks
/// of `face`, with a feathered edge. Faces without landmarks are returned
/// unchanged.
pub fn mouth_region_blend(original: &RgbImage, transferred: &RgbImage, face: &DetectedFace) -> RgbImage {
    let mut out = transferred.clone();
    if original.dimensions() != transferred.dimensions() {
        return out;
    }
    let Some(lm) = face.landmarks else {
        return out;
    };

    let (lx, ly) = lm[3];
    let (rx, ry) = lm[4];
    let cx = (lx + rx) / 2.0;
    let cy = (ly + ry) / 2.0;
    let span = ((rx - lx).powi(2) + (ry - ly).powi(2)).sqrt();
    if span < 1.0 {
        return out;
    }
    let ax = span * MOUTH_RX_SCALE;
    let ay = span * MOUTH_RY_SCALE;

    let bounds = BoundingBox::new(cx - ax, cy - ay, cx + ax, cy + ay);
    let Some((x, y, w, h)) = bounds.clamp_to(out.width(), out.height()) else {
        return out;
    };

    for yy in y..y + h {
        for xx in x..x + w {
            let dx = (xx as f32 + 0.5 - cx) / ax;
            let dy = (yy as f32 + 0.5 - cy) / ay;
            let r = (dx * dx + dy * dy).sqrt();
            if r >= 1.0 {
                continue;
            }
            // 1.0 in the core, linear falloff to 0.0 at the rim.
            let alpha = ((1.0 - r) / MOUTH_FEATHER).clamp(0.0, 1.0);

            let o = original.get_pixel(xx, yy);
            let t = transferred.get_pixel(xx, yy);
            let q: [u8; 3] = std::array::from_fn(|c| {
                (o[c] as f32 * alpha + t[c] as f32 * (1.0 - alpha))
                    .round()
                    .clamp(0.0, 255.0) as u8
            });
            out.put_pixel(xx, yy, Rgb(q));
        }
    }
    out
}
