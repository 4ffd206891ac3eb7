//! Job request/response schema.
//!
//! Requests arrive as JSON (over D-Bus or from the CLI). Image references are
//! inline bytes or local paths; fetching from remote storage is left to the
//! caller.

use crate::capability::CapabilityError;
use crate::mapping::MappingError;
use crate::ordering::FaceRecord;
use crate::pipeline::{PipelineError, QualityReport, TransformRound};
use crate::scaling::ScalingDecision;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_JPEG_QUALITY: u8 = 95;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("invalid job: {0}")]
    Invalid(String),
    #[error("unsupported image reference: {0}")]
    UnsupportedReference(String),
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed job JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl JobError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        JobError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    #[serde(alias = "single-image")]
    SingleImage,
    #[serde(alias = "multi-image")]
    MultiImage,
    #[serde(alias = "single-video", alias = "multi-video")]
    Video,
    #[serde(alias = "detect-faces")]
    DetectFaces,
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessType::SingleImage => "single_image",
            ProcessType::MultiImage => "multi_image",
            ProcessType::Video => "video",
            ProcessType::DetectFaces => "detect_faces",
        };
        f.write_str(s)
    }
}

/// Reference to an image: inline bytes or a local file.
///
/// Accepted forms: `data:<mime>;base64,<payload>`, `base64:<payload>`,
/// `file://<path>` and bare paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(pub String);

impl ImageRef {
    pub fn path(path: impl AsRef<Path>) -> Self {
        ImageRef(path.as_ref().display().to_string())
    }

    /// Local filesystem path, if this reference names one.
    pub fn local_path(&self) -> Option<PathBuf> {
        let s = self.0.trim();
        if s.starts_with("data:") || s.starts_with("base64:") || is_remote(s) {
            return None;
        }
        Some(PathBuf::from(s.strip_prefix("file://").unwrap_or(s)))
    }

    /// Raw encoded bytes behind this reference.
    pub fn bytes(&self) -> Result<Vec<u8>, JobError> {
        let s = self.0.trim();
        if let Some(rest) = s.strip_prefix("data:") {
            let (_, payload) = rest
                .split_once(";base64,")
                .ok_or_else(|| JobError::UnsupportedReference("data URL without ;base64,".into()))?;
            return Ok(BASE64.decode(payload)?);
        }
        if let Some(payload) = s.strip_prefix("base64:") {
            return Ok(BASE64.decode(payload)?);
        }
        if is_remote(s) {
            return Err(JobError::UnsupportedReference(format!(
                "remote fetch is not supported: {s}"
            )));
        }
        let path = self
            .local_path()
            .ok_or_else(|| JobError::UnsupportedReference(s.to_string()))?;
        std::fs::read(&path).map_err(|e| JobError::io(path, e))
    }

    /// Decode into an RGB buffer.
    pub fn load(&self) -> Result<RgbImage, JobError> {
        let bytes = self.bytes()?;
        Ok(image::load_from_memory(&bytes)?.to_rgb8())
    }
}

fn is_remote(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("s3://")
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Inline payloads can be megabytes.
        let s = self.0.trim();
        if s.starts_with("data:") || s.starts_with("base64:") {
            write!(f, "<inline {} bytes>", s.len())
        } else {
            f.write_str(s)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Png,
    #[default]
    #[serde(alias = "jpg")]
    Jpeg,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub use_restoration: bool,
    pub mouth_region_blend: bool,
    pub color_correction: bool,
    pub output_format: OutputFormat,
    pub jpeg_quality: u8,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            use_restoration: true,
            mouth_region_blend: false,
            color_correction: false,
            output_format: OutputFormat::Jpeg,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub process_type: ProcessType,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub source: Option<ImageRef>,
    /// Target image, or the frame directory for video jobs.
    #[serde(default)]
    pub target: Option<ImageRef>,
    #[serde(default)]
    pub face_mappings: BTreeMap<String, ImageRef>,
    #[serde(default)]
    pub options: JobOptions,
    /// Where video jobs write processed frames.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl JobRequest {
    pub fn new(process_type: ProcessType) -> Self {
        Self {
            process_type,
            job_id: None,
            source: None,
            target: None,
            face_mappings: BTreeMap::new(),
            options: JobOptions::default(),
            output_dir: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, JobError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Every filesystem path the job reads or writes.
    pub fn local_paths(&self) -> Vec<PathBuf> {
        let refs = self
            .source
            .iter()
            .chain(self.target.iter())
            .chain(self.face_mappings.values());
        refs.filter_map(ImageRef::local_path)
            .chain(self.output_dir.iter().cloned())
            .collect()
    }

    pub(crate) fn require_source(&self) -> Result<&ImageRef, JobError> {
        self.source
            .as_ref()
            .ok_or_else(|| JobError::Invalid(format!("{} job requires a source", self.process_type)))
    }

    pub(crate) fn require_target(&self) -> Result<&ImageRef, JobError> {
        self.target
            .as_ref()
            .ok_or_else(|| JobError::Invalid(format!("{} job requires a target", self.process_type)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub success: bool,
    pub job_id: String,
    pub process_type: ProcessType,
    /// Result image as a `data:` URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faces: Option<Vec<FaceRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames_processed: Option<usize>,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradation_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rounds: Vec<TransformRound>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingDecision>,
}

impl JobOutput {
    pub fn succeeded(job_id: String, process_type: ProcessType) -> Self {
        Self {
            success: true,
            job_id,
            process_type,
            result: None,
            result_path: None,
            error: None,
            faces: None,
            frames_processed: None,
            degraded: false,
            degradation_reasons: Vec::new(),
            rounds: Vec::new(),
            scaling: None,
        }
    }

    pub fn failed(job_id: String, process_type: ProcessType, error: &JobError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::succeeded(job_id, process_type)
        }
    }

    pub(crate) fn absorb_quality(&mut self, quality: QualityReport) {
        self.degraded |= quality.degraded;
        self.degradation_reasons.extend(quality.reasons);
    }
}

/// Encode `image` in the requested format.
pub fn encode_image(image: &RgbImage, options: &JobOptions) -> Result<Vec<u8>, JobError> {
    let mut buf = Vec::new();
    match options.output_format {
        OutputFormat::Png => {
            DynamicImage::ImageRgb8(image.clone())
                .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        }
        OutputFormat::Jpeg => {
            let quality = options.jpeg_quality.clamp(1, 100);
            JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
        }
    }
    Ok(buf)
}

/// Encode `image` as a `data:` URL.
pub fn encode_data_url(image: &RgbImage, options: &JobOptions) -> Result<String, JobError> {
    let bytes = encode_image(image, options)?;
    Ok(format!(
        "data:{};base64,{}",
        options.output_format.mime(),
        BASE64.encode(bytes)
    ))
}
