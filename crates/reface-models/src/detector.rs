//! SCRFD (det_10g) face detection on ONNX Runtime.
//!
//! 3-stride anchor-free decoding with NMS post-processing. When an
//! [`ArcFaceEmbedder`] is attached, `identify` also gives every detected face
//! its identity embedding; plain `detect` never runs the recognizer.

use crate::manager::{ModelLoader, ModelResourceManager};
use crate::onnx::{build_session, to_nchw, OnnxError, DEFAULT_INTRA_THREADS};
use crate::recognizer::ArcFaceEmbedder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use reface_core::{BoundingBox, CapabilityError, DetectedFace, Embedding, FaceDetector};
use std::path::Path;
use std::sync::Arc;

pub const DETECTOR_MODEL: &str = "det_10g.onnx";

// --- Named constants ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_OUTPUTS: usize = 9;

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

pub struct ScrfdModel {
    session: Session,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

#[derive(Debug, Clone, Copy)]
pub struct ScrfdLoader {
    pub intra_threads: usize,
}

impl ModelLoader for ScrfdLoader {
    type Model = ScrfdModel;

    fn load(&self, path: &Path) -> Result<ScrfdModel, String> {
        let session = build_session(path, self.intra_threads).map_err(|e| e.to_string())?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < SCRFD_OUTPUTS {
            return Err(format!(
                "SCRFD model requires {SCRFD_OUTPUTS} outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            ));
        }
        let stride_indices = discover_output_indices(&names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");
        Ok(ScrfdModel {
            session,
            stride_indices,
        })
    }
}

impl ScrfdModel {
    fn detect(&mut self, image: &RgbImage, threshold: f32) -> Result<Vec<DetectedFace>, OnnxError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Output(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Output(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Output(format!("kps stride {stride}: {e}")))?;

            all.extend(decode_stride(scores, bboxes, kps, stride, &letterbox, threshold));
        }

        Ok(nms(all, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox `image` into the square SCRFD input, centred, padded with the
/// mean so the padding normalizes to zero.
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (image.width() as f32, image.height() as f32);
    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / width).min(size / height);

    let new_w = ((width * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let new_h = ((height * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE as u32);
    let pad_x = (SCRFD_INPUT_SIZE as u32 - new_w) / 2;
    let pad_y = (SCRFD_INPUT_SIZE as u32 - new_h) / 2;

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let pad = SCRFD_MEAN as u8;
    let mut canvas = RgbImage::from_pixel(SCRFD_INPUT_SIZE as u32, SCRFD_INPUT_SIZE as u32, Rgb([pad, pad, pad]));
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let letterbox = LetterboxInfo {
        scale,
        pad_x: pad_x as f32,
        pad_y: pad_y as f32,
    };
    (to_nchw(&canvas, SCRFD_MEAN, SCRFD_STD), letterbox)
}

/// Map each stride to its score/bbox/kps outputs, by name where possible.
///
/// Named exports ("score_8", "bbox_16", ...) map by name; anything else
/// falls back to the standard positional ordering:
///   [0-2] = scores, [3-5] = bboxes, [6-8] = kps (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) if v.len() == 3 => [v[0], v[1], v[2]],
        _ => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<DetectedFace> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unmap = |x: f32, y: f32| ((x - letterbox.pad_x) / letterbox.scale, (y - letterbox.pad_y) / letterbox.scale);

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let (x1, y1) = unmap(ax - bboxes[bbox_off] * s, ay - bboxes[bbox_off + 1] * s);
        let (x2, y2) = unmap(ax + bboxes[bbox_off + 2] * s, ay + bboxes[bbox_off + 3] * s);

        let kps_off = idx * 10;
        let landmarks = (kps_off + 9 < kps.len()).then(|| {
            std::array::from_fn(|i| unmap(ax + kps[kps_off + i * 2] * s, ay + kps[kps_off + i * 2 + 1] * s))
        });

        let mut face = DetectedFace::new(BoundingBox::new(x1, y1, x2, y2), score.clamp(0.0, 1.0));
        face.landmarks = landmarks;
        detections.push(face);
    }
    detections
}

/// Non-Maximum Suppression: drop detections overlapping a stronger one.
fn nms(mut detections: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<DetectedFace> = Vec::new();
    for d in detections {
        if keep.iter().all(|k| k.bbox.iou(&d.bbox) <= iou_threshold) {
            keep.push(d);
        }
    }
    keep
}

/// [`FaceDetector`] backed by a lazily loaded SCRFD model.
pub struct ScrfdDetector {
    manager: Arc<ModelResourceManager>,
    loader: ScrfdLoader,
    embedder: Option<ArcFaceEmbedder>,
    threshold: f32,
}

impl ScrfdDetector {
    pub fn new(manager: Arc<ModelResourceManager>) -> Self {
        Self {
            manager,
            loader: ScrfdLoader {
                intra_threads: DEFAULT_INTRA_THREADS,
            },
            embedder: None,
            threshold: SCRFD_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_intra_threads(mut self, n: usize) -> Self {
        self.loader.intra_threads = n;
        self
    }

    pub fn with_embedder(mut self, embedder: ArcFaceEmbedder) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Load the model now instead of on first use.
    pub fn preload(&self) -> Result<(), CapabilityError> {
        self.manager.acquire(DETECTOR_MODEL, &self.loader)?;
        if let Some(e) = &self.embedder {
            e.preload()?;
        }
        Ok(())
    }
}

/// Attach an embedding to each face. A per-face failure leaves that face
/// without one; a missing or exhausted model fails the whole call.
fn attach_embeddings(
    faces: &mut [DetectedFace],
    mut embed: impl FnMut(&DetectedFace) -> Result<Embedding, CapabilityError>,
) -> Result<(), CapabilityError> {
    for face in faces.iter_mut() {
        match embed(face) {
            Ok(e) => face.embedding = Some(e),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "embedding extraction failed"),
        }
    }
    Ok(())
}

impl FaceDetector for ScrfdDetector {
    fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, CapabilityError> {
        let handle = self.manager.acquire(DETECTOR_MODEL, &self.loader)?;
        let faces = handle.run(|m| m.detect(image, self.threshold))??;
        tracing::debug!(count = faces.len(), "SCRFD detections");
        Ok(faces)
    }

    fn identify(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, CapabilityError> {
        let mut faces = self.detect(image)?;
        if let Some(embedder) = &self.embedder {
            attach_embeddings(&mut faces, |face| embedder.embed(image, face))?;
        }
        Ok(faces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, conf: f32) -> DetectedFace {
        DetectedFace::new(BoundingBox::new(x1, y1, x2, y2), conf)
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            face(5.0, 5.0, 105.0, 105.0, 0.8),
            face(0.0, 0.0, 100.0, 100.0, 0.9),
            face(200.0, 200.0, 250.0, 250.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let indices = discover_output_indices(&names);
        assert_eq!(indices, [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_preprocess_letterbox() {
        let image = RgbImage::from_pixel(320, 160, Rgb([255, 255, 255]));
        let (tensor, lb) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 160.0);
        // Padding normalizes to ~0, content to ~1.
        assert!(tensor[[0, 0, 10, 10]].abs() < 0.01);
        assert!((tensor[[0, 0, 320, 320]] - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_maps_to_image_space() {
        let lb = LetterboxInfo {
            scale: 2.0,
            pad_x: 0.0,
            pad_y: 160.0,
        };
        let grid = SCRFD_INPUT_SIZE / 32;
        let n = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0; n];
        let mut bboxes = vec![0.0; n * 4];
        let kps = vec![0.0; n * 10];
        // Cell (x=2, y=6), first anchor.
        let idx = (6 * grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.95;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let dets = decode_stride(&scores, &bboxes, &kps, 32, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let b = dets[0].bbox;
        // Anchor (64, 192) ± 32 in letterbox space.
        assert!((b.x1 - 16.0).abs() < 1e-4, "x1 = {}", b.x1);
        assert!((b.y1 - 0.0).abs() < 1e-4, "y1 = {}", b.y1);
        assert!((b.x2 - 48.0).abs() < 1e-4, "x2 = {}", b.x2);
        assert!((b.y2 - 32.0).abs() < 1e-4, "y2 = {}", b.y2);
        let lm = dets[0].landmarks.unwrap();
        assert!((lm[0].0 - 32.0).abs() < 1e-4 && (lm[0].1 - 16.0).abs() < 1e-4);
    }

    #[test]
    fn test_missing_model_surfaces_as_model_missing() {
        let dir = tempfile::tempdir().unwrap();
        let locator = crate::locator::ModelLocator::new(vec![dir.path().to_path_buf()]);
        let manager = Arc::new(ModelResourceManager::new(locator, Default::default()));
        let detector = ScrfdDetector::new(manager);
        let err = detector.detect(&RgbImage::new(8, 8)).unwrap_err();
        assert!(matches!(err, CapabilityError::ModelMissing(_)));
    }

    fn landmarked(x: f32) -> DetectedFace {
        let mut f = face(x, 0.0, x + 112.0, 112.0, 0.9);
        f.landmarks = Some(crate::alignment::REFERENCE_LANDMARKS_112);
        f
    }

    #[test]
    fn test_identify_without_recognizer_is_model_missing() {
        let dir = tempfile::tempdir().unwrap();
        let locator = crate::locator::ModelLocator::new(vec![dir.path().to_path_buf()]);
        let manager = Arc::new(ModelResourceManager::new(locator, Default::default()));
        let embedder = ArcFaceEmbedder::new(manager, Default::default());
        let image = RgbImage::new(224, 112);

        let mut faces = vec![landmarked(0.0), landmarked(112.0)];
        let err = attach_embeddings(&mut faces, |f| embedder.embed(&image, f)).unwrap_err();
        assert!(matches!(err, CapabilityError::ModelMissing(_)));
        assert!(faces.iter().all(|f| f.embedding.is_none()));
    }

    #[test]
    fn test_identify_keeps_faces_after_per_face_failure() {
        let mut faces = vec![landmarked(0.0), landmarked(112.0)];
        let mut calls = 0;
        attach_embeddings(&mut faces, |_| {
            calls += 1;
            if calls == 1 {
                Err(CapabilityError::Failed("degenerate crop".into()))
            } else {
                Ok(Embedding {
                    values: vec![1.0; 4],
                    model_version: None,
                })
            }
        })
        .unwrap();
        assert!(faces[0].embedding.is_none());
        assert!(faces[1].embedding.is_some());
    }

    #[test]
    fn test_identify_propagates_exhaustion() {
        let mut faces = vec![landmarked(0.0)];
        let err = attach_embeddings(&mut faces, |_| {
            Err(CapabilityError::ResourceExhausted("busy".into()))
        })
        .unwrap_err();
        assert!(matches!(err, CapabilityError::ResourceExhausted(_)));
    }
}
