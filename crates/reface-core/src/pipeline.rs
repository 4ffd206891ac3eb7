//! Quality-gated identity transfer pipeline.
//!
//! For each (source, target) pair, in face order, against one shared
//! working buffer:
//!
//! ```text
//! ROUND_1 → ROUND_2 → ROUND_3 → RESTORE_1 → RESTORE_2 → RESTORE_3
//! ```
//!
//! then `SCALE` once for the whole image. Round 1 always applies and is the
//! only fatal stage. Rounds 2 and 3 re-detect the subject and may be
//! skipped; round 3 is tentative and is rolled back unless a verification
//! detection on its output clears the gate. Restoration stops at the first
//! failure. The working buffer is replaced only by accepted results.

use crate::capability::{Capabilities, CapabilityError};
use crate::composite;
use crate::mapping::FacePair;
use crate::ordering::match_anchor;
use crate::scaling::{self, Mode, ScalingDecision, ScalingMethod};
use crate::types::DetectedFace;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Round 2 re-applies only above this re-detected confidence.
pub const ROUND2_MIN_CONFIDENCE: f32 = 0.5;
/// Round 3 is attempted only above this re-detected confidence.
pub const ROUND3_MIN_CONFIDENCE: f32 = 0.6;
/// Round 3 output is accepted only above this verification confidence.
pub const ROUND3_VERIFY_MIN_CONFIDENCE: f32 = 0.5;
/// Weight of the pre-pass buffer for each restoration pass; the restored
/// output gets the remainder.
pub const RESTORE_SCHEDULE: [f32; 3] = [0.3, 0.4, 0.0];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("no face detected in source image")]
    NoSourceFace,
    #[error("no face detected in target image")]
    NoTargetFace,
    #[error("no face pairs to process")]
    NoPairs,
    #[error("model missing: {0}")]
    ModelMissing(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("identity transfer failed: {0}")]
    TransferFailed(String),
    #[error("job cancelled before {0}")]
    Cancelled(Stage),
}

impl PipelineError {
    /// Classify a capability failure that makes a job unrecoverable.
    pub fn from_fatal(err: CapabilityError) -> Self {
        match err {
            CapabilityError::ModelMissing(m) => PipelineError::ModelMissing(m),
            CapabilityError::ResourceExhausted(m) => PipelineError::ResourceExhausted(m),
            CapabilityError::Unavailable(m) | CapabilityError::Failed(m) => {
                PipelineError::TransferFailed(m)
            }
        }
    }
}

/// Pipeline states, used for cancellation checkpoints and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Round(u8),
    Restore(u8),
    Scale,
    /// Frame boundary in a frame-sequence job.
    Frame(usize),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Round(n) => write!(f, "ROUND_{n}"),
            Stage::Restore(n) => write!(f, "RESTORE_{n}"),
            Stage::Scale => write!(f, "SCALE"),
            Stage::Frame(n) => write!(f, "FRAME_{n}"),
        }
    }
}

/// Immutable per-job options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub mode: Mode,
    pub use_restoration: bool,
    pub mouth_region_blend: bool,
    pub color_correction: bool,
    /// When false the SCALE stage keeps the input size; frame sequences
    /// must not change resolution mid-stream.
    pub upscale: bool,
}

impl JobConfig {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            use_restoration: true,
            mouth_region_blend: false,
            color_correction: false,
            upscale: true,
        }
    }
}

/// Cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Record of one refinement round for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRound {
    /// Subject identifier, `face_<n>`.
    pub subject: String,
    pub round: u8,
    /// Subject confidence going into the round.
    pub confidence_before: Option<f32>,
    /// Confidence of the subject re-detected in the round's output.
    pub confidence_after: Option<f32>,
    pub accepted: bool,
}

/// Recoverable degradations observed while running a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub degraded: bool,
    pub reasons: Vec<String>,
}

impl QualityReport {
    pub fn note(&mut self, reason: impl Into<String>) {
        self.degraded = true;
        self.reasons.push(reason.into());
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub image: RgbImage,
    pub rounds: Vec<TransformRound>,
    pub restoration_passes: usize,
    pub scaling: ScalingDecision,
    pub quality: QualityReport,
}

pub struct TransformPipeline<'a> {
    caps: Capabilities<'a>,
    config: JobConfig,
    cancel: Option<CancelFlag>,
}

impl<'a> TransformPipeline<'a> {
    pub fn new(caps: Capabilities<'a>, config: JobConfig) -> Self {
        Self {
            caps,
            config,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Run every pair against `target`, then scale.
    ///
    /// `face_count` is the number of faces detected in `target` when the
    /// pairs were resolved; it anchors re-identification between rounds.
    pub fn run(
        &self,
        target: &RgbImage,
        pairs: &[FacePair],
        face_count: usize,
    ) -> Result<PipelineOutput, PipelineError> {
        if pairs.is_empty() {
            return Err(PipelineError::NoPairs);
        }

        let mut ordered: Vec<&FacePair> = pairs.iter().collect();
        ordered.sort_by_key(|p| p.id);

        let mut working = target.clone();
        let mut rounds = Vec::new();
        let mut quality = QualityReport::default();
        let mut restoration_passes = 0;

        for pair in ordered {
            let subject = pair.id.to_string();
            let _span = tracing::info_span!("subject", id = %subject).entered();

            working = self.refine(working, pair, face_count, &mut rounds, &mut quality)?;
            let (restored, passes) = self.restore(working, &subject, &mut quality)?;
            working = restored;
            restoration_passes += passes;
        }

        self.checkpoint(Stage::Scale)?;
        let (w, h) = working.dimensions();
        let (image, executed) = if self.config.upscale {
            let decision = scaling::decide(w, h, self.config.mode);
            tracing::debug!(?decision, width = w, height = h, "scaling decision");
            scaling::apply_scaling(&working, decision, self.config.mode, self.caps.upscaler)
        } else {
            (working, ScalingDecision::keep(w, h))
        };
        if executed.method == ScalingMethod::DeterministicResize {
            quality.note("AI upscaling unavailable; deterministic resize applied");
        }

        Ok(PipelineOutput {
            image,
            rounds,
            restoration_passes,
            scaling: executed,
            quality,
        })
    }

    fn checkpoint(&self, stage: Stage) -> Result<(), PipelineError> {
        if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            tracing::info!(%stage, "job cancelled");
            return Err(PipelineError::Cancelled(stage));
        }
        tracing::trace!(%stage, "entering stage");
        Ok(())
    }

    /// Identity transfer plus the configured compositing steps.
    fn transfer(
        &self,
        source: &DetectedFace,
        target: &DetectedFace,
        base: &RgbImage,
    ) -> Result<RgbImage, CapabilityError> {
        let mut out = self.caps.transfer.transfer(source, target, base)?;
        if out.dimensions() != base.dimensions() {
            return Err(CapabilityError::Failed(format!(
                "transfer changed image size from {:?} to {:?}",
                base.dimensions(),
                out.dimensions()
            )));
        }
        if self.config.mouth_region_blend {
            out = composite::mouth_region_blend(base, &out, target);
        }
        if self.config.color_correction {
            out = composite::color_correct(base, &out, &target.bbox);
        }
        Ok(out)
    }

    /// Re-detect the subject in `image`.
    fn redetect(
        &self,
        image: &RgbImage,
        anchor: &DetectedFace,
        index: usize,
        face_count: usize,
    ) -> Result<Option<DetectedFace>, CapabilityError> {
        let faces = self.caps.detector.detect(image)?;
        Ok(match_anchor(faces, anchor, index, face_count))
    }

    /// Rounds 1–3 for one pair.
    fn refine(
        &self,
        working: RgbImage,
        pair: &FacePair,
        face_count: usize,
        rounds: &mut Vec<TransformRound>,
        quality: &mut QualityReport,
    ) -> Result<RgbImage, PipelineError> {
        let subject = pair.id.to_string();
        let index = pair.index();
        let record = |round: u8, before: Option<f32>, after: Option<f32>, accepted: bool| {
            TransformRound {
                subject: subject.clone(),
                round,
                confidence_before: before,
                confidence_after: after,
                accepted,
            }
        };

        // Round 1: no baseline to protect, never rejected.
        self.checkpoint(Stage::Round(1))?;
        let mut working = self
            .transfer(&pair.source, &pair.target, &working)
            .map_err(PipelineError::from_fatal)?;
        rounds.push(record(1, Some(pair.target.confidence), None, true));
        tracing::info!(round = 1, "identity transfer applied");

        let mut anchor = pair.target.clone();

        // Round 2: refresh the anchor and re-apply, no output verification.
        self.checkpoint(Stage::Round(2))?;
        match self.redetect(&working, &anchor, index, face_count) {
            Ok(Some(face)) if face.confidence > ROUND2_MIN_CONFIDENCE => {
                match self.transfer(&pair.source, &face, &working) {
                    Ok(next) => {
                        tracing::info!(round = 2, confidence = face.confidence, "refinement applied");
                        rounds.push(record(2, Some(face.confidence), None, true));
                        working = next;
                        anchor = face;
                    }
                    Err(e) => {
                        tracing::warn!(round = 2, error = %e, "refinement failed; keeping round 1 result");
                        rounds.push(record(2, Some(face.confidence), None, false));
                        quality.note(format!("{subject}: round 2 transfer failed: {e}"));
                    }
                }
            }
            Ok(Some(face)) => {
                tracing::info!(round = 2, confidence = face.confidence, "refinement skipped: low confidence");
                rounds.push(record(2, Some(face.confidence), None, false));
                quality.note(format!(
                    "{subject}: round 2 skipped, confidence {:.3}",
                    face.confidence
                ));
            }
            Ok(None) => {
                tracing::info!(round = 2, "refinement skipped: subject not re-detected");
                rounds.push(record(2, None, None, false));
                quality.note(format!("{subject}: round 2 skipped, face not found"));
            }
            Err(e) => {
                tracing::warn!(round = 2, error = %e, "refinement skipped: detection failed");
                rounds.push(record(2, None, None, false));
                quality.note(format!("{subject}: round 2 detection failed: {e}"));
            }
        }

        // Round 3: tentative apply, accepted only if verification passes.
        self.checkpoint(Stage::Round(3))?;
        let face = match self.redetect(&working, &anchor, index, face_count) {
            Ok(Some(face)) if face.confidence > ROUND3_MIN_CONFIDENCE => face,
            Ok(found) => {
                let conf = found.as_ref().map(|f| f.confidence);
                tracing::info!(round = 3, confidence = ?conf, "precision pass skipped");
                rounds.push(record(3, conf, None, false));
                quality.note(format!("{subject}: round 3 skipped, confidence {conf:?}"));
                return Ok(working);
            }
            Err(e) => {
                tracing::warn!(round = 3, error = %e, "precision pass skipped: detection failed");
                rounds.push(record(3, None, None, false));
                quality.note(format!("{subject}: round 3 detection failed: {e}"));
                return Ok(working);
            }
        };

        let candidate = match self.transfer(&pair.source, &face, &working) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(round = 3, error = %e, "precision pass failed; keeping prior result");
                rounds.push(record(3, Some(face.confidence), None, false));
                quality.note(format!("{subject}: round 3 transfer failed: {e}"));
                return Ok(working);
            }
        };

        let verified = match self.redetect(&candidate, &face, index, face_count) {
            Ok(v) => v.map(|f| f.confidence),
            Err(e) => {
                tracing::warn!(round = 3, error = %e, "verification detection failed");
                None
            }
        };

        match verified {
            Some(conf) if conf > ROUND3_VERIFY_MIN_CONFIDENCE => {
                tracing::info!(round = 3, before = face.confidence, after = conf, "precision pass accepted");
                rounds.push(record(3, Some(face.confidence), Some(conf), true));
                Ok(candidate)
            }
            other => {
                tracing::info!(round = 3, after = ?other, "precision pass rejected; rolled back");
                rounds.push(record(3, Some(face.confidence), other, false));
                quality.note(format!("{subject}: round 3 rejected, verification {other:?}"));
                Ok(working)
            }
        }
    }

    /// Restoration passes with the fixed blend schedule.
    fn restore(
        &self,
        mut working: RgbImage,
        subject: &str,
        quality: &mut QualityReport,
    ) -> Result<(RgbImage, usize), PipelineError> {
        if !self.config.use_restoration {
            return Ok((working, 0));
        }

        let mut passes = 0;
        for (i, &w_original) in RESTORE_SCHEDULE.iter().enumerate() {
            self.checkpoint(Stage::Restore(i as u8 + 1))?;

            let Some(restorer) = self.caps.restorer else {
                tracing::warn!("restoration unavailable; skipping");
                quality.note(format!("{subject}: restoration unavailable"));
                break;
            };

            let restored = match restorer.restore(&working) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(pass = i + 1, error = %e, "restoration failed; stopping");
                    quality.note(format!("{subject}: restoration pass {} failed: {e}", i + 1));
                    break;
                }
            };

            match composite::blend(&working, &restored, w_original) {
                Some(blended) => {
                    working = blended;
                    passes += 1;
                    tracing::debug!(pass = i + 1, w_original, "restoration pass applied");
                }
                None => {
                    tracing::warn!(pass = i + 1, "restoration changed image size; stopping");
                    quality.note(format!("{subject}: restoration pass {} returned wrong size", i + 1));
                    break;
                }
            }
        }
        Ok((working, passes))
    }
}
