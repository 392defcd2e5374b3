use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::ingest::scanner::Video;
use crate::utils::cancel::Cancellation;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STDERR_TAIL_LINES: usize = 8;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("{0}")]
    MissingOutput(String),
    #[error("cancelled")]
    Cancelled,
}

/// Outcome of pulling the audio stream out of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioExtraction {
    Track(PathBuf),
    NoAudio,
}

/// Resolution frames are decoded at, before model preprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameParams {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub channels: u16,
    pub frequency: u32,
    /// Target bitrate in kbps.
    pub band_width: u32,
}

/// Pulls decoded frames and audio out of a video container.
///
/// Everything is written under `workdir`, which the caller owns and removes.
pub trait MediaExtractor: Send + Sync {
    /// Returns the decoded frames in temporal order.
    fn extract_frames(&self, video: &Video, workdir: &Path, cancel: &Cancellation) -> Result<Vec<PathBuf>, ExtractError>;

    fn extract_audio(&self, video: &Video, workdir: &Path, cancel: &Cancellation) -> Result<AudioExtraction, ExtractError>;
}

pub struct FfmpegExtractor {
    frames: FrameParams,
    audio: AudioParams,
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegExtractor {
    pub fn new(frames: FrameParams, audio: AudioParams) -> Self {
        Self {
            frames,
            audio,
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }

    fn frames_command(&self, input: &Path, frames_dir: &Path) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-nostdin")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-vf")
            .arg(format!("scale={}:{}", self.frames.width, self.frames.height))
            .arg("-qscale:v")
            .arg("2")
            .arg(frames_dir.join("%06d.jpg"));
        command
    }

    fn probe_command(&self, input: &Path) -> Command {
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-v")
            .arg("error")
            .arg("-select_streams")
            .arg("a")
            .arg("-show_entries")
            .arg("stream=index")
            .arg("-of")
            .arg("csv=p=0")
            .arg(input);
        command
    }

    fn audio_command(&self, input: &Path, output: &Path) -> Command {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-nostdin")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .arg("-vn")
            .arg("-acodec")
            .arg("pcm_s16le")
            .arg("-ab")
            .arg(format!("{}k", self.audio.band_width))
            .arg("-ac")
            .arg(self.audio.channels.to_string())
            .arg("-ar")
            .arg(self.audio.frequency.to_string())
            .arg(output);
        command
    }
}

impl MediaExtractor for FfmpegExtractor {
    fn extract_frames(&self, video: &Video, workdir: &Path, cancel: &Cancellation) -> Result<Vec<PathBuf>, ExtractError> {
        let frames_dir = workdir.join("frames");
        fs::create_dir_all(&frames_dir).map_err(|source| ExtractError::Spawn { tool: "ffmpeg", source })?;

        run_tool(self.frames_command(&video.path, &frames_dir), "ffmpeg", workdir, "frames", cancel)?;

        let frames = list_frames(&frames_dir).map_err(|e| ExtractError::MissingOutput(format!("cannot list frames: {}", e)))?;
        debug!("Decoded {} frames for {}", frames.len(), video.id);
        Ok(frames)
    }

    fn extract_audio(&self, video: &Video, workdir: &Path, cancel: &Cancellation) -> Result<AudioExtraction, ExtractError> {
        let streams = run_tool(self.probe_command(&video.path), "ffprobe", workdir, "probe", cancel)?;
        if streams.trim().is_empty() {
            return Ok(AudioExtraction::NoAudio);
        }

        let output = workdir.join("audio.wav");
        run_tool(self.audio_command(&video.path, &output), "ffmpeg", workdir, "audio", cancel)?;
        if !output.is_file() {
            return Err(ExtractError::MissingOutput(format!("ffmpeg produced no audio file at {:?}", output)));
        }
        Ok(AudioExtraction::Track(output))
    }
}

/// JPEG frames in `dir`, ordered by their zero-padded sequence number.
fn list_frames(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "jpg") {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Runs `command` to completion, capturing stdout and stderr into `<label>.*`
/// files under `log_dir`. Returns stdout. The child is killed if `cancel` fires.
fn run_tool(
    mut command: Command,
    tool: &'static str,
    log_dir: &Path,
    label: &str,
    cancel: &Cancellation,
) -> Result<String, ExtractError> {
    let spawn_err = |source| ExtractError::Spawn { tool, source };
    let stdout_path = log_dir.join(format!("{}.stdout.log", label));
    let stderr_path = log_dir.join(format!("{}.stderr.log", label));

    command
        .stdin(Stdio::null())
        .stdout(File::create(&stdout_path).map_err(spawn_err)?)
        .stderr(File::create(&stderr_path).map_err(spawn_err)?);

    if cancel.is_cancelled() {
        return Err(ExtractError::Cancelled);
    }
    let mut child = command.spawn().map_err(spawn_err)?;

    let status = loop {
        if let Some(status) = child.try_wait().map_err(spawn_err)? {
            break status;
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExtractError::Cancelled);
        }
        thread::sleep(POLL_INTERVAL);
    };

    if !status.success() {
        let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
        return Err(ExtractError::Failed {
            tool,
            status,
            stderr: tail(&stderr, STDERR_TAIL_LINES),
        });
    }

    fs::read_to_string(&stdout_path).map_err(spawn_err)
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join(" | ")
}
