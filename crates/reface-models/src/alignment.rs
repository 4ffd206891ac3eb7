//! Landmark-driven face alignment: similarity fit, warp, and paste-back.
//!
//! Warps a face to a canonical crop using its five landmarks, and pastes a
//! processed crop back into the full image through the inverse transform.

use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 crop.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

/// FFHQ template used by GFPGAN for a 512×512 crop.
pub const REFERENCE_LANDMARKS_FFHQ_512: [(f32, f32); 5] = [
    (192.98138, 239.94708),
    (318.90277, 240.1936),
    (256.63416, 314.01935),
    (201.26117, 371.41043),
    (313.08905, 371.15118),
];

/// ArcFace template rescaled for a square crop of `size`.
///
/// Multiples of 112 scale directly; other sizes scale by `size / 128` with
/// the 8-pixel horizontal margin the 128 layout adds.
pub fn arcface_template(size: u32) -> [(f32, f32); 5] {
    let (ratio, diff_x) = if size % 112 == 0 {
        (size as f32 / 112.0, 0.0)
    } else {
        let r = size as f32 / 128.0;
        (r, 8.0 * r)
    };
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * ratio + diff_x, y * ratio))
}

/// 2×3 affine matrix `[a, -b, tx, b, a, ty]`.
pub type Affine = [f32; 6];

/// Least-squares similarity transform taking `src` landmarks onto `dst`.
/// Four degrees of freedom: uniform scale, rotation, and translation.
pub fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Affine {
    // For each pair (sx, sy) -> (dx, dy):
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(&ata, &atb);
    [a, -b, tx, b, a, ty]
}

/// Gaussian elimination with partial pivoting on the 4×4 normal equations.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i * 4..i * 4 + 4]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        for row in (col + 1)..4 {
            if m[row][col].abs() > m[max_row][col].abs() {
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0];
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    x
}

/// Invert a similarity transform. Returns `None` for a degenerate matrix.
pub fn invert(m: &Affine) -> Option<Affine> {
    let (a, b, tx, ty) = (m[0], m[3], m[2], m[5]);
    let det = a * a + b * b;
    if det < 1e-12 {
        return None;
    }
    let ia = a / det;
    let ib = -b / det;
    // Inverse of [[a, -b], [b, a]] is [[ia, -ib], [ib, ia]].
    let itx = -(ia * tx - ib * ty);
    let ity = -(ib * tx + ia * ty);
    Some([ia, -ib, itx, ib, ia, ity])
}

fn apply(m: &Affine, x: f32, y: f32) -> (f32, f32) {
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
}

/// Bilinear sample of `image` at `(x, y)`; out-of-bounds reads as black.
fn sample(image: &RgbImage, x: f32, y: f32) -> [f32; 3] {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let px = |xx: i32, yy: i32| -> [f32; 3] {
        if xx >= 0 && xx < w && yy >= 0 && yy < h {
            let p = image.get_pixel(xx as u32, yy as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr, bl, br) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));
    std::array::from_fn(|c| {
        tl[c] * (1.0 - fx) * (1.0 - fy) + tr[c] * fx * (1.0 - fy) + bl[c] * (1.0 - fx) * fy + br[c] * fx * fy
    })
}

/// Warp `image` by `m` (image → crop) into a `size`×`size` crop.
pub fn warp_affine(image: &RgbImage, m: &Affine, size: u32) -> RgbImage {
    let Some(inv) = invert(m) else {
        return RgbImage::new(size, size);
    };
    RgbImage::from_fn(size, size, |ox, oy| {
        let (sx, sy) = apply(&inv, ox as f32, oy as f32);
        let v = sample(image, sx, sy);
        Rgb(v.map(|c| c.round().clamp(0.0, 255.0) as u8))
    })
}

/// Align a face to a `size`×`size` crop matching `template`.
///
/// Returns the crop and the image → crop transform.
pub fn align(
    image: &RgbImage,
    landmarks: &[(f32, f32); 5],
    template: &[(f32, f32); 5],
    size: u32,
) -> (RgbImage, Affine) {
    let m = estimate_similarity_transform(landmarks, template);
    (warp_affine(image, &m, size), m)
}

/// Mask weight at crop coordinate `(x, y)`: 1 in the interior, falling off
/// linearly to 0 over `feather` pixels at the crop border.
fn border_weight(x: f32, y: f32, size: f32, feather: f32) -> f32 {
    let d = x.min(y).min(size - 1.0 - x).min(size - 1.0 - y);
    if d < 0.0 {
        0.0
    } else if feather <= 0.0 {
        1.0
    } else {
        (d / feather).min(1.0)
    }
}

/// Paste `crop` back into a copy of `image` through the inverse of `m`
/// (image → crop), blending with a feathered border mask.
pub fn paste_back(image: &RgbImage, crop: &RgbImage, m: &Affine, feather: f32) -> RgbImage {
    let mut out = image.clone();
    let Some(inv) = invert(m) else {
        return out;
    };
    let size = crop.width() as f32;

    // Bounding box of the crop's corners in image space.
    let corners = [(0.0, 0.0), (size, 0.0), (0.0, size), (size, size)].map(|(x, y)| apply(&inv, x, y));
    let min_x = corners.iter().map(|c| c.0).fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let min_y = corners.iter().map(|c| c.1).fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let max_x = (corners.iter().map(|c| c.0).fold(f32::MIN, f32::max).ceil().max(0.0) as u32).min(image.width());
    let max_y = (corners.iter().map(|c| c.1).fold(f32::MIN, f32::max).ceil().max(0.0) as u32).min(image.height());

    for y in min_y..max_y {
        for x in min_x..max_x {
            let (cx, cy) = apply(m, x as f32, y as f32);
            let alpha = border_weight(cx, cy, size, feather);
            if alpha <= 0.0 {
                continue;
            }
            let src = sample(crop, cx, cy);
            let dst = image.get_pixel(x, y);
            let q: [u8; 3] = std::array::from_fn(|c| {
                (src[c] * alpha + dst[c] as f32 * (1.0 - alpha)).round().clamp(0.0, 255.0) as u8
            });
            out.put_pixel(x, y, Rgb(q));
        }
    }
    out
}
