//! Deterministic face ordering.
//!
//! Detectors return faces in no stable order, but callers address faces by
//! index (`face_0`, `face_1`, ...). Every index exposed to a caller, and every
//! re-identification after a transform round, goes through [`order_faces`].

use crate::types::{BoundingBox, DetectedFace};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

const FACE_ID_PREFIX: &str = "face_";

/// Order faces top-to-bottom by vertical center, then left-to-right by
/// horizontal center. The sort is stable: exact ties keep detector order.
pub fn order_faces(mut faces: Vec<DetectedFace>) -> Vec<DetectedFace> {
    faces.sort_by(compare_position);
    faces
}

fn compare_position(a: &DetectedFace, b: &DetectedFace) -> Ordering {
    let (ax, ay) = a.bbox.center();
    let (bx, by) = b.bbox.center();
    ay.total_cmp(&by).then_with(|| ax.total_cmp(&bx))
}

/// Caller-visible symbolic face identifier, `face_<index>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FaceId(pub usize);

impl FaceId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{FACE_ID_PREFIX}{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid face identifier {0:?}: expected face_<index>")]
pub struct FaceIdParseError(pub String);

impl FromStr for FaceId {
    type Err = FaceIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Only the canonical spelling: digits, no sign, no leading zero.
        s.trim()
            .strip_prefix(FACE_ID_PREFIX)
            .filter(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
            .filter(|n| *n == "0" || !n.starts_with('0'))
            .and_then(|n| n.parse::<usize>().ok())
            .map(FaceId)
            .ok_or_else(|| FaceIdParseError(s.to_string()))
    }
}

/// Face record returned by face-detection jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceRecord {
    pub id: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<Vec<(f32, f32)>>,
}

/// Order `faces` and label each with its `face_<n>` identifier.
pub fn face_records(faces: Vec<DetectedFace>) -> Vec<FaceRecord> {
    order_faces(faces)
        .into_iter()
        .enumerate()
        .map(|(i, f)| FaceRecord {
            id: FaceId(i).to_string(),
            bbox: f.bbox,
            confidence: f.confidence,
            landmarks: f.landmarks.map(|l| l.to_vec()),
        })
        .collect()
}

/// Re-identify a subject in a fresh detection result.
///
/// `anchor` is the subject as last seen at ordered position `index` in a
/// detection of `expected_count` faces. When the fresh detection has the
/// same count the face at the same ordered index is taken; otherwise the
/// fresh face overlapping the anchor most. Returns `None` when nothing
/// overlaps the anchor.
///
/// Position-based identity assumes faces do not move between detection
/// calls within one job; a transform that shifts a face box enough to
/// reorder centers can still swap identities.
pub fn match_anchor(
    fresh: Vec<DetectedFace>,
    anchor: &DetectedFace,
    index: usize,
    expected_count: usize,
) -> Option<DetectedFace> {
    let mut ordered = order_faces(fresh);

    if ordered.len() == expected_count && index < ordered.len() {
        let candidate = &ordered[index];
        if candidate.bbox.iou(&anchor.bbox) > 0.0 {
            return Some(ordered.swap_remove(index));
        }
    }

    ordered
        .into_iter()
        .map(|f| (f.bbox.iou(&anchor.bbox), f))
        .filter(|(iou, _)| *iou > 0.0)
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, f)| f)
}
