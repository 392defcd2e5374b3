mod archive;
mod audio;
mod ingest;
mod job;
mod media;
mod ml;
mod utils;

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use crossbeam::channel::bounded;
use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, error};

use crate::archive::report::RunSummary;
use crate::archive::writer::ArtifactWriter;
use crate::audio::mfcc::Mfcc;
use crate::audio::segmenter::AudioSegmenter;
use crate::ingest::scanner::{self, Video};
use crate::job::{FailureKind, JobConfig, Outcome, Pipeline, VideoReport};
use crate::media::ffmpeg::{AudioParams, FfmpegExtractor, FrameParams};
use crate::ml::engine::{Accelerator, ImageModel, InferenceEngine};
use crate::utils::cancel::Cancellation;
use crate::utils::config::{self, RunConfig};

/// Extract fixed-shape image and audio features from a directory of videos.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the source videos
    #[arg(long)]
    video_dir: PathBuf,

    /// Where per-video features are written; recreated on every run
    #[arg(long)]
    output_dir: PathBuf,

    /// Number of audio channels to extract
    #[arg(long, default_value_t = 1)]
    output_channels: u16,

    /// Audio sample rate in Hz
    #[arg(long, default_value_t = 16000)]
    output_frequency: u32,

    /// Audio bitrate in kbps
    #[arg(long, default_value_t = 160)]
    band_width: u32,

    /// Pretrained image encoder
    #[arg(long, value_enum, default_value_t = ImageModel::Resnet152)]
    model: ImageModel,

    /// ONNX weights for the encoder (otherwise resolved via .env or a search)
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Compute device: a CUDA device index, cuda:<n>, coreml or cpu
    #[arg(long, default_value = "0")]
    gpu: Accelerator,

    /// Number of frames sampled from every video
    #[arg(long, default_value_t = 80)]
    n_frame_steps: usize,

    #[arg(long, default_value_t = 400)]
    frame_width: u32,

    #[arg(long, default_value_t = 300)]
    frame_height: u32,

    /// Pad or truncate audio features to exactly this many one-second segments
    #[arg(long)]
    audio_segments: Option<usize>,

    /// Videos processed concurrently
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Abandon a video after this many seconds
    #[arg(long)]
    video_timeout_secs: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<RunConfig> {
        let model_path = config::resolve_model_path(self.model, self.model_path.as_deref())?;
        Ok(RunConfig {
            video_dir: self.video_dir,
            output_dir: self.output_dir,
            model: self.model,
            model_path,
            accelerator: self.gpu,
            n_frame_steps: self.n_frame_steps,
            frames: FrameParams {
                width: self.frame_width,
                height: self.frame_height,
            },
            audio: AudioParams {
                channels: self.output_channels,
                frequency: self.output_frequency,
                band_width: self.band_width,
            },
            audio_segments: self.audio_segments,
            workers: self.workers,
            video_timeout: self.video_timeout_secs.map(Duration::from_secs),
        })
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = Args::parse().into_config()?;
    config.validate()?;

    info!("Feature extraction starting...");
    info!("Input: {:?}", config.video_dir);
    info!("Output: {:?}", config.output_dir);
    info!("Model: {} ({:?})", config.model, config.accelerator);

    let videos = scanner::scan_directory(&config.video_dir)?;
    info!("Found {} videos", videos.len());

    // Load the encoder before touching the output directory, so a bad model
    // path never costs the previous run's artifacts.
    let engine = InferenceEngine::new(config.model, &config.model_path, config.accelerator)?;
    let writer = Arc::new(ArtifactWriter::prepare(&config.output_dir, &config.video_dir)?);

    let pipeline = Arc::new(Pipeline {
        extractor: Arc::new(FfmpegExtractor::new(config.frames, config.audio)),
        encoder: Arc::new(engine),
        segmenter: Arc::new(AudioSegmenter::new(Arc::new(Mfcc::default()), config.audio_segments)),
        writer: writer.clone(),
        config: JobConfig {
            n_frame_steps: config.n_frame_steps,
            model: config.model,
        },
    });

    let summary = run_workers(pipeline, videos, config.workers, config.video_timeout);
    summary.log();
    let summary_path = writer.write_summary(&summary)?;
    writer.finish()?;

    info!("Summary written to {:?}", summary_path);
    info!("Pipeline completed.");
    Ok(())
}

/// Runs every video through `pipeline` on `workers` threads. Every input id
/// appears in the returned summary, including videos whose processing panicked.
fn run_workers(pipeline: Arc<Pipeline>, videos: Vec<Video>, workers: usize, timeout: Option<Duration>) -> RunSummary {
    let progress = ProgressBar::new(videos.len() as u64);
    progress.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let expected: Vec<String> = videos.iter().map(|v| v.id.clone()).collect();
    let (job_tx, job_rx) = bounded::<Video>(workers * 2);
    let (report_tx, report_rx) = bounded::<VideoReport>(workers * 2);

    let feeder = thread::spawn(move || {
        for video in videos {
            if job_tx.send(video).is_err() {
                break;
            }
        }
    });

    let mut handles = Vec::new();
    for i in 0..workers {
        let rx = job_rx.clone();
        let tx = report_tx.clone();
        let pipeline = pipeline.clone();

        handles.push(thread::spawn(move || {
            info!("Worker {} started", i);
            for video in rx {
                let cancel = Cancellation::new(timeout);
                let report = panic::catch_unwind(AssertUnwindSafe(|| pipeline.run(&video, &cancel)))
                    .unwrap_or_else(|payload| VideoReport::panicked(&video.id, payload));
                if tx.send(report).is_err() {
                    break;
                }
            }
            info!("Worker {} finished", i);
        }));
    }
    // Only workers hold receivers, so the feeder stops if they all exit.
    drop(job_rx);
    drop(report_tx);

    let mut summary = RunSummary::default();
    let mut seen = HashSet::new();
    for report in report_rx {
        progress.set_message(report.id.clone());
        progress.inc(1);
        seen.insert(report.id.clone());
        summary.record(report);
    }
    progress.finish_with_message("done");

    if feeder.join().is_err() {
        error!("Feeder thread panicked");
    }
    for (i, handle) in handles.into_iter().enumerate() {
        if handle.join().is_err() {
            error!("Worker {} panicked", i);
        }
    }

    for id in expected.into_iter().filter(|id| !seen.contains(id)) {
        summary.record(VideoReport {
            outcome: Outcome::Failed {
                kind: FailureKind::Panicked,
                reason: format!("{} was never processed: no worker left", id),
            },
            id,
        });
    }

    summary.sort();
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::tests::{extractor, fake_pipeline, FakeExtractor};
    use crate::media::ffmpeg::{AudioExtraction, ExtractError, MediaExtractor};
    use crate::media::mimetype::tests::MP4_MAGIC;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::sync::mpsc;

    enum Script {
        Run(FakeExtractor),
        Panic,
    }

    /// Picks the fake behaviour for each video by id.
    struct ScriptedExtractor {
        scripts: HashMap<String, Script>,
    }

    impl ScriptedExtractor {
        fn script(&self, video: &Video) -> &FakeExtractor {
            match self.scripts.get(&video.id) {
                Some(Script::Run(fake)) => fake,
                Some(Script::Panic) => panic!("decoder blew up on {}", video.id),
                None => panic!("no script for {}", video.id),
            }
        }
    }

    impl MediaExtractor for ScriptedExtractor {
        fn extract_frames(&self, video: &Video, workdir: &Path, cancel: &Cancellation) -> Result<Vec<PathBuf>, ExtractError> {
            self.script(video).extract_frames(video, workdir, cancel)
        }

        fn extract_audio(&self, video: &Video, workdir: &Path, cancel: &Cancellation) -> Result<AudioExtraction, ExtractError> {
            self.script(video).extract_audio(video, workdir, cancel)
        }
    }

    struct Setup {
        _root: tempfile::TempDir,
        videos: Vec<Video>,
        pipeline: Arc<Pipeline>,
    }

    fn setup(scripts: Vec<(&str, Script)>) -> anyhow::Result<Setup> {
        let root = tempfile::tempdir()?;
        let dir = root.path().join("videos");
        fs::create_dir_all(&dir)?;

        let mut videos = Vec::new();
        let mut table = HashMap::new();
        for (id, script) in scripts {
            let path = dir.join(format!("{}.mp4", id));
            fs::write(&path, MP4_MAGIC)?;
            videos.push(Video {
                id: id.to_string(),
                path,
            });
            table.insert(id.to_string(), script);
        }

        let writer = Arc::new(ArtifactWriter::prepare(&root.path().join("out"), &dir)?);
        let pipeline = fake_pipeline(writer, Arc::new(ScriptedExtractor { scripts: table }), false, 4);
        Ok(Setup {
            _root: root,
            videos,
            pipeline: Arc::new(pipeline),
        })
    }

    /// Runs the pool on its own thread so a hang fails the test instead of blocking it.
    fn run_with_deadline(setup: &Setup, workers: usize) -> RunSummary {
        let (tx, rx) = mpsc::channel();
        let pipeline = setup.pipeline.clone();
        let videos = setup.videos.clone();
        thread::spawn(move || {
            let _ = tx.send(run_workers(pipeline, videos, workers, None));
        });
        rx.recv_timeout(Duration::from_secs(60))
            .expect("worker pool did not finish")
    }

    fn failed_kind(summary: &RunSummary, id: &str) -> Option<FailureKind> {
        summary.failed.iter().find(|f| f.id == id).map(|f| f.kind)
    }

    #[test]
    fn test_mixed_outcomes_across_workers() -> anyhow::Result<()> {
        let broken = FakeExtractor {
            frames: 0,
            audio_samples: None,
            fail_frames: true,
        };
        let setup = setup(vec![
            ("a", Script::Run(extractor(6, Some(16000)))),
            ("b", Script::Run(extractor(6, None))),
            ("c", Script::Panic),
            ("d", Script::Run(broken)),
            ("e", Script::Run(extractor(3, Some(24000)))),
            ("f", Script::Run(extractor(0, None))),
            ("g", Script::Panic),
        ])?;

        let summary = run_with_deadline(&setup, 3);
        assert_eq!(summary.total(), 7);
        assert_eq!(summary.complete, vec!["a", "e"]);
        assert_eq!(summary.image_only, vec!["b"]);

        let failed: Vec<&str> = summary.failed.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(failed, vec!["c", "d", "f", "g"]);
        assert_eq!(failed_kind(&summary, "c"), Some(FailureKind::Panicked));
        assert_eq!(failed_kind(&summary, "d"), Some(FailureKind::ExtractionFailure));
        assert_eq!(failed_kind(&summary, "f"), Some(FailureKind::EmptySequence));
        assert_eq!(failed_kind(&summary, "g"), Some(FailureKind::Panicked));
        Ok(())
    }

    #[test]
    fn test_single_worker_survives_repeated_panics() -> anyhow::Result<()> {
        let ids = ["v0", "v1", "v2", "v3", "v4", "v5"];
        let setup = setup(ids.iter().map(|id| (*id, Script::Panic)).collect())?;

        let summary = run_with_deadline(&setup, 1);
        assert_eq!(summary.total(), ids.len());
        assert!(summary.complete.is_empty());
        for id in ids {
            assert_eq!(failed_kind(&summary, id), Some(FailureKind::Panicked), "{}", id);
        }
        Ok(())
    }

    #[test]
    fn test_panicked_video_leaves_no_scratch() -> anyhow::Result<()> {
        let setup = setup(vec![("p", Script::Panic), ("ok", Script::Run(extractor(4, None)))])?;
        let summary = run_with_deadline(&setup, 2);
        assert_eq!(summary.image_only, vec!["ok"]);

        let scratch = setup.pipeline.writer.scratch_root();
        assert_eq!(fs::read_dir(scratch)?.count(), 0);
        assert!(!setup.pipeline.writer.video_dir("p").exists());
        Ok(())
    }
}
