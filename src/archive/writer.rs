use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::Array2;
use ndarray_npy::write_npy;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::archive::report::{Manifest, RunSummary};
use crate::ingest::scanner::Video;

const SCRATCH_DIR: &str = ".scratch";
const STAGING_DIR: &str = "staging";
pub const VIDEO_FILE: &str = "video.npy";
pub const AUDIO_FILE: &str = "audio.npy";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const SUMMARY_FILE: &str = "summary.json";

/// Everything persisted for one video.
#[derive(Debug)]
pub struct Artifact {
    pub image: Array2<f32>,
    pub audio: Option<Array2<f32>>,
    pub manifest: Manifest,
}

/// Scratch directory for one video's transient files. Removed when dropped,
/// whichever way processing of the video ends.
pub struct WorkScope {
    dir: TempDir,
}

impl WorkScope {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Owns the output directory: one `<id>/` directory per finished video plus
/// a scratch area for work in progress.
pub struct ArtifactWriter {
    output_dir: PathBuf,
    scratch_root: PathBuf,
}

impl ArtifactWriter {
    /// Recreates `output_dir` empty. Refuses if that would delete `video_dir`.
    pub fn prepare(output_dir: &Path, video_dir: &Path) -> Result<Self> {
        if output_dir.exists() {
            let output = output_dir
                .canonicalize()
                .with_context(|| format!("Failed to resolve output directory {:?}", output_dir))?;
            let input = video_dir
                .canonicalize()
                .with_context(|| format!("Failed to resolve video directory {:?}", video_dir))?;
            if input.starts_with(&output) {
                bail!(
                    "Output directory {:?} contains the video directory {:?}; refusing to clear it",
                    output_dir,
                    video_dir
                );
            }
            info!("Cleaning up {:?}", output_dir);
            fs::remove_dir_all(output_dir).with_context(|| format!("Failed to clear {:?}", output_dir))?;
        }

        let scratch_root = output_dir.join(SCRATCH_DIR);
        fs::create_dir_all(&scratch_root).with_context(|| format!("Failed to create {:?}", scratch_root))?;

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            scratch_root,
        })
    }

    #[cfg(test)]
    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    pub fn video_dir(&self, video_id: &str) -> PathBuf {
        self.output_dir.join(video_id)
    }

    pub fn scope(&self, video: &Video) -> Result<WorkScope> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", video.id))
            .tempdir_in(&self.scratch_root)
            .with_context(|| format!("Failed to create scratch directory for {}", video.id))?;
        debug!("Opened scratch scope {:?}", dir.path());
        Ok(WorkScope { dir })
    }

    /// Stages all files inside `scope`, then moves them into place in one
    /// rename so `<id>/` never exists half-written.
    pub fn write(&self, scope: &WorkScope, artifact: &Artifact) -> Result<PathBuf> {
        let video_id = &artifact.manifest.video_id;
        let staging = scope.path().join(STAGING_DIR);
        fs::create_dir_all(&staging).with_context(|| format!("Failed to create {:?}", staging))?;

        write_npy(staging.join(VIDEO_FILE), &artifact.image)
            .with_context(|| format!("Failed to write image features for {}", video_id))?;
        if let Some(audio) = &artifact.audio {
            write_npy(staging.join(AUDIO_FILE), audio)
                .with_context(|| format!("Failed to write audio features for {}", video_id))?;
        }
        let mut manifest = BufWriter::new(File::create(staging.join(MANIFEST_FILE))?);
        serde_json::to_writer_pretty(&mut manifest, &artifact.manifest)
            .with_context(|| format!("Failed to write manifest for {}", video_id))?;
        manifest.flush()?;

        let target = self.video_dir(video_id);
        if target.exists() {
            fs::remove_dir_all(&target).with_context(|| format!("Failed to replace {:?}", target))?;
        }
        fs::rename(&staging, &target).with_context(|| format!("Failed to move artifacts into {:?}", target))?;
        Ok(target)
    }

    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self.output_dir.join(SUMMARY_FILE);
        let mut file = BufWriter::new(File::create(&path).with_context(|| format!("Failed to create {:?}", path))?);
        serde_json::to_writer_pretty(&mut file, summary).context("Failed to write run summary")?;
        file.flush()?;
        Ok(path)
    }

    /// Removes the scratch area once every job has finished.
    pub fn finish(&self) -> Result<()> {
        fs::remove_dir_all(&self.scratch_root).with_context(|| format!("Failed to remove {:?}", self.scratch_root))
    }
}
