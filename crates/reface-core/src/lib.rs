//! reface-core — Face transform orchestration.
//!
//! Stable multi-face ordering, caller face mappings, the quality-gated
//! refinement pipeline and the adaptive output-scaling policy. Neural
//! networks are reached only through the traits in [`capability`].

pub mod capability;
pub mod composite;
pub mod job;
pub mod mapping;
pub mod ordering;
pub mod pipeline;
pub mod runner;
pub mod scaling;
pub mod types;

pub use capability::{Capabilities, CapabilityError, FaceDetector, FaceRestorer, IdentityTransfer, Upscaler};
pub use job::{ImageRef, JobError, JobOptions, JobOutput, JobRequest, OutputFormat, ProcessType};
pub use mapping::{FacePair, MappingError};
pub use ordering::{order_faces, FaceId, FaceRecord};
pub use pipeline::{CancelFlag, JobConfig, PipelineError, QualityReport, TransformPipeline, TransformRound};
pub use runner::JobRunner;
pub use scaling::{Mode, ScalingDecision, ScalingMethod};
pub use types::{BoundingBox, DetectedFace, Embedding};
