use std::any::Any;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::archive::report::{AudioManifest, Manifest};
use crate::archive::writer::{Artifact, ArtifactWriter};
use crate::audio::segmenter::{AudioFeatures, AudioSegmenter};
use crate::audio::wav;
use crate::ingest::hasher;
use crate::ingest::scanner::Video;
use crate::media::ffmpeg::{AudioExtraction, ExtractError, MediaExtractor};
use crate::ml::engine::{FrameEncoder, ImageModel};
use crate::ml::pipeline;
use crate::ml::sampler::sample_indices;
use crate::utils::cancel::Cancellation;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("extraction failed for {video_id}: {reason}")]
    Extraction { video_id: String, reason: String },
    #[error("no frames decoded for {video_id}")]
    EmptySequence { video_id: String },
    #[error("audio decoding failed for {video_id}: {reason}")]
    AudioDecode { video_id: String, reason: String },
    #[error("encoder failed for {video_id}: {reason}")]
    Encoder { video_id: String, reason: String },
    #[error("writing artifacts failed for {video_id}: {reason}")]
    Write { video_id: String, reason: String },
    #[error("processing of {video_id} was cancelled")]
    Cancelled { video_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ExtractionFailure,
    EmptySequence,
    AudioDecodeFailure,
    EncoderFailure,
    WriteFailure,
    Cancelled,
    Panicked,
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Extraction { .. } => FailureKind::ExtractionFailure,
            JobError::EmptySequence { .. } => FailureKind::EmptySequence,
            JobError::AudioDecode { .. } => FailureKind::AudioDecodeFailure,
            JobError::Encoder { .. } => FailureKind::EncoderFailure,
            JobError::Write { .. } => FailureKind::WriteFailure,
            JobError::Cancelled { .. } => FailureKind::Cancelled,
        }
    }

    fn extraction(video_id: &str, err: ExtractError) -> Self {
        match err {
            ExtractError::Cancelled => JobError::Cancelled {
                video_id: video_id.to_string(),
            },
            other => JobError::Extraction {
                video_id: video_id.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Complete { audio_segments: usize },
    ImageOnly,
    Failed { kind: FailureKind, reason: String },
}

#[derive(Debug, Clone)]
pub struct VideoReport {
    pub id: String,
    pub outcome: Outcome,
}

impl VideoReport {
    /// Report for a video whose processing panicked, built from the unwind payload.
    pub fn panicked(video_id: &str, payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("{} panicked: {}", video_id, message);
        Self {
            id: video_id.to_string(),
            outcome: Outcome::Failed {
                kind: FailureKind::Panicked,
                reason: format!("processing of {} panicked: {}", video_id, message),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobConfig {
    pub n_frame_steps: usize,
    pub model: ImageModel,
}

/// Turns one video into its artifacts. Shared by every worker thread.
pub struct Pipeline {
    pub extractor: Arc<dyn MediaExtractor>,
    pub encoder: Arc<dyn FrameEncoder>,
    pub segmenter: Arc<AudioSegmenter>,
    pub writer: Arc<ArtifactWriter>,
    pub config: JobConfig,
}

impl Pipeline {
    /// Processes `video` to completion or failure; never panics on a bad input.
    pub fn run(&self, video: &Video, cancel: &Cancellation) -> VideoReport {
        let outcome = match self.process(video, cancel) {
            Ok(outcome) => {
                match &outcome {
                    Outcome::Complete { audio_segments } => {
                        info!("{} done: {} audio segments", video.id, audio_segments)
                    }
                    _ => info!("{} done: image features only", video.id),
                }
                outcome
            }
            Err(e) => {
                error!("{} failed ({:?}): {}", video.id, e.kind(), e);
                Outcome::Failed {
                    kind: e.kind(),
                    reason: e.to_string(),
                }
            }
        };
        VideoReport {
            id: video.id.clone(),
            outcome,
        }
    }

    fn process(&self, video: &Video, cancel: &Cancellation) -> Result<Outcome, JobError> {
        let id = video.id.as_str();
        let scope = self.writer.scope(video).map_err(|e| JobError::Write {
            video_id: id.to_string(),
            reason: format!("{:#}", e),
        })?;
        checkpoint(id, cancel)?;

        let frames = self
            .extractor
            .extract_frames(video, scope.path(), cancel)
            .map_err(|e| JobError::extraction(id, e))?;
        let indices = sample_indices(frames.len(), self.config.n_frame_steps).map_err(|_| JobError::EmptySequence {
            video_id: id.to_string(),
        })?;
        debug!("{}: sampled {} of {} frames", id, indices.len(), frames.len());
        checkpoint(id, cancel)?;

        let batch = pipeline::load_batch(&frames, &indices, self.encoder.spec()).map_err(|e| JobError::Extraction {
            video_id: id.to_string(),
            reason: format!("{:#}", e),
        })?;
        let image = pipeline::encode_frames(self.encoder.as_ref(), batch).map_err(|e| JobError::Encoder {
            video_id: id.to_string(),
            reason: format!("{:#}", e),
        })?;
        checkpoint(id, cancel)?;

        let audio = match self
            .extractor
            .extract_audio(video, scope.path(), cancel)
            .map_err(|e| JobError::extraction(id, e))?
        {
            AudioExtraction::NoAudio => {
                info!("{}: no audio stream, writing image features only", id);
                None
            }
            AudioExtraction::Track(path) => Some(self.audio_features(id, &path)?),
        };
        checkpoint(id, cancel)?;

        let source_sha256 = hasher::source_digest(&video.path).map_err(|e| JobError::Extraction {
            video_id: id.to_string(),
            reason: format!("{:#}", e),
        })?;
        let manifest = Manifest {
            video_id: id.to_string(),
            source: video.path.display().to_string(),
            source_sha256,
            model: self.config.model,
            frames_decoded: frames.len(),
            video_shape: [image.nrows(), image.ncols()],
            audio: match &audio {
                Some(features) => AudioManifest::Present {
                    shape: [features.tensor.nrows(), features.tensor.ncols()],
                    segments: features.segments,
                },
                None => AudioManifest::Absent,
            },
        };

        let outcome = match &audio {
            Some(features) => Outcome::Complete {
                audio_segments: features.segments,
            },
            None => Outcome::ImageOnly,
        };
        let artifact = Artifact {
            image,
            audio: audio.map(|features| features.tensor),
            manifest,
        };
        self.writer.write(&scope, &artifact).map_err(|e| JobError::Write {
            video_id: id.to_string(),
            reason: format!("{:#}", e),
        })?;

        Ok(outcome)
    }

    fn audio_features(&self, id: &str, path: &std::path::Path) -> Result<AudioFeatures, JobError> {
        let decode_err = |reason: String| JobError::AudioDecode {
            video_id: id.to_string(),
            reason,
        };
        let track = wav::read_track(path).map_err(|e| decode_err(format!("{:#}", e)))?;
        self.segmenter.encode(&track).map_err(|e| decode_err(e.to_string()))
    }
}

fn checkpoint(video_id: &str, cancel: &Cancellation) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled {
            video_id: video_id.to_string(),
        });
    }
    Ok(())
}
