//! Resolution of caller face mappings into (source, target) pairs.

use crate::capability::{CapabilityError, FaceDetector};
use crate::ordering::FaceId;
use crate::types::DetectedFace;
use image::RgbImage;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("no valid mappings: none of {requested} face mapping(s) could be resolved")]
    NoValidMappings { requested: usize },
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// A resolved mapping: paint `source` onto the target face at ordered
/// position `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct FacePair {
    pub id: FaceId,
    pub source: DetectedFace,
    pub target: DetectedFace,
}

impl FacePair {
    pub fn index(&self) -> usize {
        self.id.index()
    }
}

/// Pick the detector's top-confidence face, if any.
pub fn best_face(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    faces
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Resolve `request` against `targets`, which must already be in
/// [`crate::ordering::order_faces`] order.
///
/// Entries with an unparseable identifier, an out-of-range index, a source
/// that cannot be fetched, or a source without a detectable face are skipped
/// with a warning. Pairs come back in ascending target index. Fails when
/// nothing resolves, or at once when source identification hits a missing
/// or exhausted model.
pub fn resolve_mappings<S, E, F>(
    request: &BTreeMap<String, S>,
    targets: &[DetectedFace],
    detector: &dyn FaceDetector,
    mut fetch: F,
) -> Result<Vec<FacePair>, MappingError>
where
    E: Display,
    F: FnMut(&S) -> Result<RgbImage, E>,
{
    let mut pairs = Vec::new();
    let mut claimed = BTreeSet::new();

    for (identifier, source_ref) in request {
        let id = match identifier.parse::<FaceId>() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(identifier = %identifier, error = %e, "skipping mapping");
                continue;
            }
        };

        if id.index() >= targets.len() {
            tracing::warn!(
                identifier = %identifier,
                faces = targets.len(),
                "skipping mapping: face index out of range"
            );
            continue;
        }

        if claimed.contains(&id) {
            tracing::warn!(identifier = %identifier, "skipping mapping: target face already mapped");
            continue;
        }

        let source_image = match fetch(source_ref) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(identifier = %identifier, error = %e, "skipping mapping: source unavailable");
                continue;
            }
        };

        let source = match detector.identify(&source_image) {
            Ok(faces) => best_face(faces),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::warn!(identifier = %identifier, error = %e, "skipping mapping: source detection failed");
                continue;
            }
        };
        let Some(source) = source else {
            tracing::warn!(identifier = %identifier, "skipping mapping: no face in source image");
            continue;
        };

        tracing::debug!(identifier = %identifier, confidence = source.confidence, "mapping resolved");
        claimed.insert(id);
        pairs.push(FacePair {
            id,
            source,
            target: targets[id.index()].clone(),
        });
    }

    if pairs.is_empty() {
        return Err(MappingError::NoValidMappings {
            requested: request.len(),
        });
    }

    pairs.sort_by_key(|p| p.id);
    Ok(pairs)
}

/// Pair one source face with every target face, in order.
pub fn map_all_faces(source: &DetectedFace, targets: &[DetectedFace]) -> Vec<FacePair> {
    targets
        .iter()
        .enumerate()
        .map(|(i, t)| FacePair {
            id: FaceId(i),
            source: source.clone(),
            target: t.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Detector keyed on the red channel of pixel (0, 0): 0 means "no face".
    struct PixelDetector {
        calls: AtomicUsize,
    }

    impl FaceDetector for PixelDetector {
        fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let tag = image.get_pixel(0, 0)[0];
            if tag == 0 {
                return Ok(vec![]);
            }
            Ok(vec![
                DetectedFace::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.6),
                DetectedFace::new(BoundingBox::new(5.0, 5.0, 15.0, 15.0), tag as f32 / 255.0),
            ])
        }
    }

    fn detector() -> PixelDetector {
        PixelDetector { calls: AtomicUsize::new(0) }
    }

    fn targets(n: usize) -> Vec<DetectedFace> {
        (0..n)
            .map(|i| {
                let x = i as f32 * 100.0;
                DetectedFace::new(BoundingBox::new(x, 0.0, x + 50.0, 50.0), 0.9)
            })
            .collect()
    }

    fn tagged(tag: u8) -> RgbImage {
        RgbImage::from_pixel(4, 4, image::Rgb([tag, 0, 0]))
    }

    fn fetch(tag: &u8) -> Result<RgbImage, String> {
        Ok(tagged(*tag))
    }

    #[test]
    fn test_out_of_range_only_entry_fails() {
        let req = BTreeMap::from([("face_5".to_string(), 200u8)]);
        let det = detector();
        let err = resolve_mappings(&req, &targets(3), &det, fetch).unwrap_err();
        assert_eq!(err, MappingError::NoValidMappings { requested: 1 });
        // Out-of-range entries never reach detection.
        assert_eq!(det.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_out_of_range_entry_skipped_others_kept() {
        let req = BTreeMap::from([
            ("face_5".to_string(), 200u8),
            ("face_1".to_string(), 230u8),
        ]);
        let pairs = resolve_mappings(&req, &targets(3), &detector(), fetch).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].index(), 1);
        assert_eq!(pairs[0].target.bbox.x1, 100.0);
    }

    #[test]
    fn test_source_uses_top_confidence_face() {
        let req = BTreeMap::from([("face_0".to_string(), 255u8)]);
        let pairs = resolve_mappings(&req, &targets(1), &detector(), fetch).unwrap();
        assert!((pairs[0].source.confidence - 1.0).abs() < 1e-6);
        assert_eq!(pairs[0].source.bbox.x1, 5.0);
    }

    #[test]
    fn test_source_without_face_is_skipped() {
        let req = BTreeMap::from([
            ("face_0".to_string(), 0u8),
            ("face_2".to_string(), 200u8),
        ]);
        let pairs = resolve_mappings(&req, &targets(3), &detector(), fetch).unwrap();
        assert_eq!(pairs.iter().map(|p| p.index()).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_fetch_failure_is_skipped() {
        let req = BTreeMap::from([
            ("face_0".to_string(), 1u8),
            ("face_1".to_string(), 200u8),
        ]);
        let fetch = |tag: &u8| -> Result<RgbImage, String> {
            if *tag == 1 {
                Err("unreachable".into())
            } else {
                Ok(tagged(*tag))
            }
        };
        let pairs = resolve_mappings(&req, &targets(2), &detector(), fetch).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].index(), 1);
    }

    #[test]
    fn test_bad_identifier_is_skipped() {
        let req = BTreeMap::from([
            ("mouth".to_string(), 200u8),
            ("face_0".to_string(), 200u8),
        ]);
        let pairs = resolve_mappings(&req, &targets(1), &detector(), fetch).unwrap();
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn test_pairs_in_face_order() {
        let req = BTreeMap::from([
            ("face_10".to_string(), 200u8),
            ("face_2".to_string(), 200u8),
            ("face_0".to_string(), 200u8),
        ]);
        let pairs = resolve_mappings(&req, &targets(11), &detector(), fetch).unwrap();
        let order: Vec<usize> = pairs.iter().map(|p| p.index()).collect();
        assert_eq!(order, vec![0, 2, 10]);
    }

    #[test]
    fn test_map_all_faces() {
        let source = DetectedFace::new(BoundingBox::new(0.0, 0.0, 1.0, 1.0), 0.9);
        let pairs = map_all_faces(&source, &targets(3));
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[2].id, FaceId(2));
        assert_eq!(pairs[2].target.bbox.x1, 200.0);
    }

    #[test]
    fn test_best_face_empty() {
        assert!(best_face(vec![]).is_none());
    }

    struct NoRecognizer;

    impl FaceDetector for NoRecognizer {
        fn detect(&self, _: &RgbImage) -> Result<Vec<DetectedFace>, CapabilityError> {
            Ok(vec![DetectedFace::new(BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.9)])
        }

        fn identify(&self, _: &RgbImage) -> Result<Vec<DetectedFace>, CapabilityError> {
            Err(CapabilityError::ModelMissing("w600k_r50.onnx".into()))
        }
    }

    #[test]
    fn test_missing_recognizer_fails_resolution() {
        let req = BTreeMap::from([
            ("face_0".to_string(), 200u8),
            ("face_1".to_string(), 230u8),
        ]);
        let err = resolve_mappings(&req, &targets(2), &NoRecognizer, fetch).unwrap_err();
        assert_eq!(
            err,
            MappingError::Capability(CapabilityError::ModelMissing("w600k_r50.onnx".into()))
        );
    }
}
