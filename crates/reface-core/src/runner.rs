//! Job dispatch: turns a [`JobRequest`] into a [`JobOutput`].

use crate::capability::Capabilities;
use crate::job::{encode_data_url, encode_image, ImageRef, JobError, JobOutput, JobRequest, ProcessType};
use crate::mapping::{best_face, map_all_faces, resolve_mappings, FacePair};
use crate::ordering::{face_records, order_faces, FaceId};
use crate::pipeline::{CancelFlag, JobConfig, PipelineError, Stage, TransformPipeline};
use crate::scaling::Mode;
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::{Path, PathBuf};

/// File extensions picked up from a frame directory.
const FRAME_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

pub struct JobRunner<'a> {
    caps: Capabilities<'a>,
}

impl<'a> JobRunner<'a> {
    pub fn new(caps: Capabilities<'a>) -> Self {
        Self { caps }
    }

    /// Run `request` to completion. Failures are reported in the output,
    /// never as an error.
    pub fn run(&self, request: &JobRequest, cancel: Option<&CancelFlag>) -> JobOutput {
        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let _span = tracing::info_span!("job", id = %job_id, kind = %request.process_type).entered();
        let started = std::time::Instant::now();

        let result = match request.process_type {
            ProcessType::DetectFaces => self.detect_faces(request, &job_id),
            ProcessType::SingleImage => self.single_image(request, &job_id, cancel),
            ProcessType::MultiImage => self.multi_image(request, &job_id, cancel),
            ProcessType::Video => self.video(request, &job_id, cancel),
        };

        match result {
            Ok(out) => {
                tracing::info!(
                    degraded = out.degraded,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job complete"
                );
                out
            }
            Err(e) => {
                tracing::error!(error = %e, "job failed");
                JobOutput::failed(job_id, request.process_type, &e)
            }
        }
    }

    fn config(&self, request: &JobRequest, mode: Mode) -> JobConfig {
        let opts = &request.options;
        JobConfig {
            use_restoration: opts.use_restoration,
            mouth_region_blend: opts.mouth_region_blend,
            color_correction: opts.color_correction,
            ..JobConfig::new(mode)
        }
    }

    fn pipeline(&self, config: JobConfig, cancel: Option<&CancelFlag>) -> TransformPipeline<'a> {
        let pipeline = TransformPipeline::new(self.caps, config);
        match cancel {
            Some(flag) => pipeline.with_cancel(flag.clone()),
            None => pipeline,
        }
    }

    fn detect_ordered(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, JobError> {
        Ok(order_faces(self.caps.detector.detect(image)?))
    }

    fn source_face(&self, source: &ImageRef) -> Result<DetectedFace, JobError> {
        let image = source.load()?;
        best_face(self.caps.detector.identify(&image)?).ok_or(JobError::Pipeline(PipelineError::NoSourceFace))
    }

    fn detect_faces(&self, request: &JobRequest, job_id: &str) -> Result<JobOutput, JobError> {
        let image = request.require_target()?.load()?;
        let faces = face_records(self.caps.detector.detect(&image)?);
        tracing::info!(count = faces.len(), "faces detected");

        let mut out = JobOutput::succeeded(job_id.to_string(), request.process_type);
        out.faces = Some(faces);
        Ok(out)
    }

    fn single_image(
        &self,
        request: &JobRequest,
        job_id: &str,
        cancel: Option<&CancelFlag>,
    ) -> Result<JobOutput, JobError> {
        let source = self.source_face(request.require_source()?)?;
        let target = request.require_target()?.load()?;
        let faces = self.detect_ordered(&target)?;

        // The dominant (largest) face is the subject.
        let (index, face) = faces
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.bbox.area().total_cmp(&b.bbox.area()))
            .ok_or(JobError::Pipeline(PipelineError::NoTargetFace))?;
        let pairs = [FacePair {
            id: FaceId(index),
            source,
            target: face.clone(),
        }];

        self.transform(request, job_id, &target, &pairs, faces.len(), Mode::Single, cancel)
    }

    fn multi_image(
        &self,
        request: &JobRequest,
        job_id: &str,
        cancel: Option<&CancelFlag>,
    ) -> Result<JobOutput, JobError> {
        let target = request.require_target()?.load()?;
        let faces = self.detect_ordered(&target)?;
        if faces.is_empty() {
            return Err(PipelineError::NoTargetFace.into());
        }

        let pairs = if request.face_mappings.is_empty() {
            let source = self.source_face(request.require_source()?)?;
            map_all_faces(&source, &faces)
        } else {
            resolve_mappings(&request.face_mappings, &faces, self.caps.detector, ImageRef::load)?
        };
        tracing::info!(faces = faces.len(), pairs = pairs.len(), "mappings resolved");

        self.transform(request, job_id, &target, &pairs, faces.len(), Mode::Multi, cancel)
    }

    #[allow(clippy::too_many_arguments)]
    fn transform(
        &self,
        request: &JobRequest,
        job_id: &str,
        target: &RgbImage,
        pairs: &[FacePair],
        face_count: usize,
        mode: Mode,
        cancel: Option<&CancelFlag>,
    ) -> Result<JobOutput, JobError> {
        let pipeline = self.pipeline(self.config(request, mode), cancel);
        let result = pipeline.run(target, pairs, face_count)?;

        let mut out = JobOutput::succeeded(job_id.to_string(), request.process_type);
        out.result = Some(encode_data_url(&result.image, &request.options)?);
        out.rounds = result.rounds;
        out.scaling = Some(result.scaling);
        out.absorb_quality(result.quality);
        Ok(out)
    }

    /// Swap every face in every frame of a frame directory with the source
    /// identity. Frames keep their size; frames without faces, or whose
    /// transfer fails, are copied through. Cancellation, missing models and
    /// permit timeouts still end the job.
    fn video(
        &self,
        request: &JobRequest,
        job_id: &str,
        cancel: Option<&CancelFlag>,
    ) -> Result<JobOutput, JobError> {
        let frames_dir = request
            .require_target()?
            .local_path()
            .ok_or_else(|| JobError::Invalid("video target must be a local frame directory".into()))?;
        let output_dir = request
            .output_dir
            .clone()
            .ok_or_else(|| JobError::Invalid("video job requires output_dir".into()))?;
        std::fs::create_dir_all(&output_dir).map_err(|e| JobError::io(&output_dir, e))?;

        let frames = list_frames(&frames_dir)?;
        if frames.is_empty() {
            return Err(JobError::Invalid(format!(
                "no frames found in {}",
                frames_dir.display()
            )));
        }
        let source = self.source_face(request.require_source()?)?;

        let config = JobConfig {
            upscale: false,
            ..self.config(request, Mode::Multi)
        };
        let pipeline = self.pipeline(config, cancel);
        let mut out = JobOutput::succeeded(job_id.to_string(), request.process_type);
        let mut without_faces = 0usize;
        let mut failed_frames = 0usize;

        for (n, frame_path) in frames.iter().enumerate() {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                return Err(PipelineError::Cancelled(Stage::Frame(n)).into());
            }

            let frame = ImageRef::path(frame_path).load()?;
            let faces = self.detect_ordered(&frame)?;
            let processed = if faces.is_empty() {
                without_faces += 1;
                frame
            } else {
                let pairs = map_all_faces(&source, &faces);
                match pipeline.run(&frame, &pairs, faces.len()) {
                    Ok(result) => {
                        out.absorb_quality(result.quality);
                        result.image
                    }
                    // Per-frame transfer failures do not end the sequence.
                    Err(PipelineError::TransferFailed(reason)) => {
                        tracing::warn!(frame = n, error = %reason, "frame transfer failed; copying frame unchanged");
                        failed_frames += 1;
                        frame
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            let name = frame_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("frame_{n:06}"));
            let dest = output_dir.join(format!("{name}.{}", request.options.output_format.extension()));
            let bytes = encode_image(&processed, &request.options)?;
            std::fs::write(&dest, bytes).map_err(|e| JobError::io(&dest, e))?;

            if (n + 1) % 30 == 0 {
                tracing::info!(frames = n + 1, total = frames.len(), "frames processed");
            }
        }

        if without_faces > 0 {
            tracing::warn!(frames = without_faces, "frames without faces copied unchanged");
            out.degraded = true;
            out.degradation_reasons
                .push(format!("{without_faces} frame(s) without faces copied unchanged"));
        }
        if failed_frames > 0 {
            tracing::warn!(frames = failed_frames, "frames with failed transfer copied unchanged");
            out.degraded = true;
            out.degradation_reasons
                .push(format!("{failed_frames} frame(s) failed transfer and were copied unchanged"));
        }
        out.frames_processed = Some(frames.len());
        out.result_path = Some(output_dir);
        Ok(out)
    }
}

/// Frame image files in `dir`, sorted by file name.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, JobError> {
    let entries = std::fs::read_dir(dir).map_err(|e| JobError::io(dir, e))?;
    let mut frames = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| JobError::io(dir, e))?.path();
        let is_frame = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if path.is_file() && is_frame {
            frames.push(path);
        }
    }
    frames.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityError, FaceDetector, IdentityTransfer};
    use crate::job::{JobOptions, OutputFormat};
    use crate::types::BoundingBox;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Finds one 40×40 face per non-black 8×8 tile along the top row, keyed
    /// on the tile's top-left pixel. Pixels are read from the image, so
    /// sources and targets can be told apart by content.
    struct TileDetector;

    impl FaceDetector for TileDetector {
        fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, CapabilityError> {
            let mut faces = Vec::new();
            let mut x = 0;
            while x + 8 <= image.width() {
                if image.get_pixel(x, 0)[0] != 0 {
                    let fx = x as f32 * 5.0;
                    faces.push(DetectedFace::new(BoundingBox::new(fx, 10.0, fx + 40.0, 50.0), 0.9));
                }
                x += 8;
            }
            // Reverse so ordering is exercised.
            faces.reverse();
            Ok(faces)
        }
    }

    /// Paints the bottom-right pixel with the target face's x1 / 5.
    struct StampTransfer {
        calls: AtomicUsize,
    }

    impl IdentityTransfer for StampTransfer {
        fn transfer(&self, _: &DetectedFace, target: &DetectedFace, image: &RgbImage) -> Result<RgbImage, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut out = image.clone();
            let (w, h) = out.dimensions();
            out.put_pixel(w - 1, h - 1, Rgb([(target.bbox.x1 / 5.0) as u8 + 1, 0, 0]));
            Ok(out)
        }
    }

    fn with_tiles(width: u32, height: u32, tiles: &[u32]) -> RgbImage {
        let mut img = RgbImage::new(width, height);
        for &t in tiles {
            img.put_pixel(t * 8, 0, Rgb([255, 255, 255]));
        }
        img
    }

    fn inline(img: &RgbImage) -> ImageRef {
        let opts = JobOptions {
            output_format: OutputFormat::Png,
            ..Default::default()
        };
        ImageRef(encode_data_url(img, &opts).unwrap())
    }

    fn run(request: &JobRequest) -> (JobOutput, usize) {
        let transfer = StampTransfer { calls: AtomicUsize::new(0) };
        let caps = Capabilities {
            detector: &TileDetector,
            transfer: &transfer,
            restorer: None,
            upscaler: None,
        };
        let out = JobRunner::new(caps).run(request, None);
        (out, transfer.calls.load(Ordering::SeqCst))
    }

    fn png_options() -> JobOptions {
        JobOptions {
            output_format: OutputFormat::Png,
            use_restoration: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_detect_faces_ordered_ids() {
        let mut req = JobRequest::new(ProcessType::DetectFaces);
        req.target = Some(inline(&with_tiles(64, 64, &[0, 3, 5])));
        let (out, _) = run(&req);

        assert!(out.success);
        let faces = out.faces.unwrap();
        let ids: Vec<&str> = faces.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["face_0", "face_1", "face_2"]);
        let xs: Vec<f32> = faces.iter().map(|f| f.bbox.x1).collect();
        assert_eq!(xs, vec![0.0, 120.0, 200.0]);
    }

    #[test]
    fn test_single_image_success() {
        let mut req = JobRequest::new(ProcessType::SingleImage);
        req.job_id = Some("job-1".into());
        req.source = Some(inline(&with_tiles(16, 16, &[0])));
        req.target = Some(inline(&with_tiles(1600, 1600, &[2])));
        req.options = png_options();
        let (out, calls) = run(&req);

        assert!(out.success, "{:?}", out.error);
        assert_eq!(out.job_id, "job-1");
        assert_eq!(calls, 3);
        assert_eq!(out.rounds.len(), 3);
        let img = ImageRef(out.result.unwrap()).load().unwrap();
        assert_eq!(img.dimensions(), (1600, 1600));
        // Transfer hit the face at tile 2 (x1 = 80).
        assert_eq!(img.get_pixel(1599, 1599)[0], 17);
    }

    #[test]
    fn test_single_image_no_source_face() {
        let mut req = JobRequest::new(ProcessType::SingleImage);
        req.source = Some(inline(&RgbImage::new(16, 16)));
        req.target = Some(inline(&with_tiles(64, 64, &[0])));
        let (out, calls) = run(&req);

        assert!(!out.success);
        assert_eq!(calls, 0);
        assert!(out.error.unwrap().contains("no face detected in source"));
        assert!(!out.job_id.is_empty());
    }

    #[test]
    fn test_single_image_requires_target() {
        let mut req = JobRequest::new(ProcessType::SingleImage);
        req.source = Some(inline(&with_tiles(16, 16, &[0])));
        let (out, _) = run(&req);
        assert!(!out.success);
        assert!(out.error.unwrap().contains("requires a target"));
    }

    #[test]
    fn test_multi_image_out_of_range_only_mapping_fails() {
        let mut req = JobRequest::new(ProcessType::MultiImage);
        req.target = Some(inline(&with_tiles(64, 64, &[0, 2, 4])));
        req.face_mappings.insert("face_5".into(), inline(&with_tiles(16, 16, &[0])));
        let (out, calls) = run(&req);

        assert!(!out.success);
        assert_eq!(calls, 0);
        assert!(out.error.unwrap().contains("no valid mappings"));
    }

    #[test]
    fn test_multi_image_mappings_skip_invalid() {
        let mut req = JobRequest::new(ProcessType::MultiImage);
        req.target = Some(inline(&with_tiles(1400, 1400, &[0, 2, 4])));
        req.face_mappings.insert("face_1".into(), inline(&with_tiles(16, 16, &[0])));
        req.face_mappings.insert("face_7".into(), inline(&with_tiles(16, 16, &[0])));
        req.options = png_options();
        let (out, calls) = run(&req);

        assert!(out.success, "{:?}", out.error);
        assert_eq!(calls, 3);
        assert!(out.rounds.iter().all(|r| r.subject == "face_1"));
    }

    #[test]
    fn test_multi_image_without_mappings_swaps_every_face() {
        let mut req = JobRequest::new(ProcessType::MultiImage);
        req.source = Some(inline(&with_tiles(16, 16, &[0])));
        req.target = Some(inline(&with_tiles(1400, 1400, &[0, 2])));
        req.options = png_options();
        let (out, calls) = run(&req);

        assert!(out.success, "{:?}", out.error);
        assert_eq!(calls, 6);
        assert_eq!(out.rounds[0].subject, "face_0");
        assert_eq!(out.rounds[5].subject, "face_1");
    }

    #[test]
    fn test_cancelled_job_reports_failure() {
        let mut req = JobRequest::new(ProcessType::SingleImage);
        req.source = Some(inline(&with_tiles(16, 16, &[0])));
        req.target = Some(inline(&with_tiles(64, 64, &[0])));

        let transfer = StampTransfer { calls: AtomicUsize::new(0) };
        let caps = Capabilities {
            detector: &TileDetector,
            transfer: &transfer,
            restorer: None,
            upscaler: None,
        };
        let cancel = CancelFlag::new();
        cancel.cancel();
        let out = JobRunner::new(caps).run(&req, Some(&cancel));
        assert!(!out.success);
        assert!(out.error.unwrap().contains("cancelled"));
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_video_frames_processed_in_order() {
        let frames = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        with_tiles(64, 48, &[1]).save(frames.path().join("0002.png")).unwrap();
        with_tiles(64, 48, &[0]).save(frames.path().join("0001.png")).unwrap();
        // No faces: copied through.
        RgbImage::new(64, 48).save(frames.path().join("0003.png")).unwrap();
        std::fs::write(frames.path().join("notes.txt"), "skip me").unwrap();

        let mut req = JobRequest::new(ProcessType::Video);
        req.source = Some(inline(&with_tiles(16, 16, &[0])));
        req.target = Some(ImageRef::path(frames.path()));
        req.output_dir = Some(output.path().to_path_buf());
        req.options = png_options();
        let (out, calls) = run(&req);

        assert!(out.success, "{:?}", out.error);
        assert_eq!(out.frames_processed, Some(3));
        assert_eq!(calls, 6);
        assert!(out.degraded);

        let first = image::open(output.path().join("0001.png")).unwrap().to_rgb8();
        assert_eq!(first.dimensions(), (64, 48));
        assert_eq!(first.get_pixel(63, 47)[0], 1);
        let second = image::open(output.path().join("0002.png")).unwrap().to_rgb8();
        assert_eq!(second.get_pixel(63, 47)[0], 9);
        let third = image::open(output.path().join("0003.png")).unwrap().to_rgb8();
        assert_eq!(third, RgbImage::new(64, 48));
    }

    #[test]
    fn test_video_requires_output_dir() {
        let frames = tempfile::tempdir().unwrap();
        let mut req = JobRequest::new(ProcessType::Video);
        req.source = Some(inline(&with_tiles(16, 16, &[0])));
        req.target = Some(ImageRef::path(frames.path()));
        let (out, _) = run(&req);
        assert!(!out.success);
        assert!(out.error.unwrap().contains("output_dir"));
    }

    #[test]
    fn test_list_frames_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.jpg", "a.PNG", "c.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let frames = list_frames(dir.path()).unwrap();
        let names: Vec<String> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.PNG", "b.jpg"]);
    }

    /// Fails every call whose 1-based number is in `fail_on`.
    struct FlakyTransfer {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
        error: CapabilityError,
    }

    impl IdentityTransfer for FlakyTransfer {
        fn transfer(&self, s: &DetectedFace, t: &DetectedFace, image: &RgbImage) -> Result<RgbImage, CapabilityError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&n) {
                return Err(self.error.clone());
            }
            StampTransfer { calls: AtomicUsize::new(0) }.transfer(s, t, image)
        }
    }

    fn video_request(frames: &Path, output: &Path) -> JobRequest {
        for (i, tile) in [0u32, 1, 2].iter().enumerate() {
            with_tiles(64, 48, &[*tile])
                .save(frames.join(format!("{:04}.png", i + 1)))
                .unwrap();
        }
        let mut req = JobRequest::new(ProcessType::Video);
        req.source = Some(inline(&with_tiles(16, 16, &[0])));
        req.target = Some(ImageRef::path(frames));
        req.output_dir = Some(output.to_path_buf());
        req.options = png_options();
        req
    }

    #[test]
    fn test_video_failed_frame_copied_and_sequence_continues() {
        let frames = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let req = video_request(frames.path(), output.path());
        // Call 4 is round 1 of the second frame.
        let transfer = FlakyTransfer {
            calls: AtomicUsize::new(0),
            fail_on: vec![4],
            error: CapabilityError::Failed("bad crop".into()),
        };
        let caps = Capabilities {
            detector: &TileDetector,
            transfer: &transfer,
            restorer: None,
            upscaler: None,
        };
        let out = JobRunner::new(caps).run(&req, None);

        assert!(out.success, "{:?}", out.error);
        assert_eq!(out.frames_processed, Some(3));
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 7);
        assert!(out.degraded);
        assert!(out.degradation_reasons.iter().any(|r| r.starts_with("1 frame(s) failed transfer")));

        let second = image::open(output.path().join("0002.png")).unwrap().to_rgb8();
        assert_eq!(second, with_tiles(64, 48, &[1]));
        let third = image::open(output.path().join("0003.png")).unwrap().to_rgb8();
        assert_eq!(third.get_pixel(63, 47)[0], 17);
    }

    #[test]
    fn test_video_missing_model_mid_sequence_fails_job() {
        let frames = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let req = video_request(frames.path(), output.path());
        let transfer = FlakyTransfer {
            calls: AtomicUsize::new(0),
            fail_on: vec![4],
            error: CapabilityError::ModelMissing("inswapper_128_fp16.onnx".into()),
        };
        let caps = Capabilities {
            detector: &TileDetector,
            transfer: &transfer,
            restorer: None,
            upscaler: None,
        };
        let out = JobRunner::new(caps).run(&req, None);

        assert!(!out.success);
        assert!(out.error.unwrap().contains("model missing"));
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 4);
    }

    /// Detects faces but has no recognizer weights for source embeddings.
    struct NoRecognizerDetector;

    impl FaceDetector for NoRecognizerDetector {
        fn detect(&self, image: &RgbImage) -> Result<Vec<DetectedFace>, CapabilityError> {
            TileDetector.detect(image)
        }

        fn identify(&self, _: &RgbImage) -> Result<Vec<DetectedFace>, CapabilityError> {
            Err(CapabilityError::ModelMissing("w600k_r50.onnx".into()))
        }
    }

    #[test]
    fn test_missing_recognizer_fails_single_image() {
        let mut req = JobRequest::new(ProcessType::SingleImage);
        req.source = Some(inline(&with_tiles(16, 16, &[0])));
        req.target = Some(inline(&with_tiles(64, 64, &[0])));
        let transfer = StampTransfer { calls: AtomicUsize::new(0) };
        let caps = Capabilities {
            detector: &NoRecognizerDetector,
            transfer: &transfer,
            restorer: None,
            upscaler: None,
        };
        let out = JobRunner::new(caps).run(&req, None);

        assert!(!out.success);
        assert!(out.error.unwrap().contains("model missing"));
        assert_eq!(transfer.calls.load(Ordering::SeqCst), 0);
    }
}
