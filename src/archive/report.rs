use serde::Serialize;
use tracing::{error, info, warn};

use crate::job::{FailureKind, Outcome, VideoReport};
use crate::ml::engine::ImageModel;

/// Per-video provenance written next to the tensors.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub video_id: String,
    pub source: String,
    pub source_sha256: String,
    pub model: ImageModel,
    pub frames_decoded: usize,
    pub video_shape: [usize; 2],
    pub audio: AudioManifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AudioManifest {
    Absent,
    Present { shape: [usize; 2], segments: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedVideo {
    pub id: String,
    pub kind: FailureKind,
    pub reason: String,
}

/// Which videos produced full, image-only, or no artifacts.
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub complete: Vec<String>,
    pub image_only: Vec<String>,
    pub failed: Vec<FailedVideo>,
}

impl RunSummary {
    pub fn record(&mut self, report: VideoReport) {
        match report.outcome {
            Outcome::Complete { .. } => self.complete.push(report.id),
            Outcome::ImageOnly => self.image_only.push(report.id),
            Outcome::Failed { kind, reason } => self.failed.push(FailedVideo {
                id: report.id,
                kind,
                reason,
            }),
        }
    }

    pub fn total(&self) -> usize {
        self.complete.len() + self.image_only.len() + self.failed.len()
    }

    /// Sorts every list by id so the summary does not depend on worker timing.
    pub fn sort(&mut self) {
        self.complete.sort();
        self.image_only.sort();
        self.failed.sort_by(|a, b| a.id.cmp(&b.id));
    }

    pub fn log(&self) {
        info!(
            "Processed {} videos: {} complete, {} image-only, {} failed",
            self.total(),
            self.complete.len(),
            self.image_only.len(),
            self.failed.len()
        );
        if !self.image_only.is_empty() {
            warn!("Videos without audio features: {}", self.image_only.join(", "));
        }
        for failed in &self.failed {
            error!("{} failed ({:?}): {}", failed.id, failed.kind, failed.reason);
        }
    }
}
