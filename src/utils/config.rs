use std::fs::{File, OpenOptions};
use std::io::{Write, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;
use anyhow::{Result, Context, anyhow, ensure};
use tracing::info;

use crate::media::ffmpeg::{AudioParams, FrameParams};
use crate::ml::engine::{Accelerator, ImageModel};

const ENV_FILE: &str = ".env";
const SEARCH_DEPTH: usize = 5;

/// Validated settings for one extraction run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub video_dir: PathBuf,
    pub output_dir: PathBuf,
    pub model: ImageModel,
    pub model_path: PathBuf,
    pub accelerator: Accelerator,
    pub n_frame_steps: usize,
    pub frames: FrameParams,
    pub audio: AudioParams,
    pub audio_segments: Option<usize>,
    pub workers: usize,
    pub video_timeout: Option<Duration>,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.video_dir.is_dir(), "Video directory {:?} does not exist", self.video_dir);
        ensure!(self.n_frame_steps >= 1, "n_frame_steps must be at least 1");
        ensure!(self.workers >= 1, "workers must be at least 1");
        ensure!(self.audio.channels >= 1, "output_channels must be at least 1");
        ensure!(self.audio.frequency > 0, "output_frequency must be positive");
        ensure!(self.audio.band_width > 0, "band_width must be positive");
        ensure!(
            self.frames.width > 0 && self.frames.height > 0,
            "frame resolution must be positive"
        );
        ensure!(self.audio_segments != Some(0), "audio_segments must be at least 1 when set");
        Ok(())
    }
}

/// Environment key caching the weights location for `model`.
fn env_key(model: ImageModel) -> String {
    format!("{}_MODEL_PATH", model.name().to_ascii_uppercase())
}

/// Locates the ONNX weights for `model`.
/// An explicit path wins; otherwise `.env` is consulted, then the filesystem
/// is searched and the hit is cached back into `.env`.
pub fn resolve_model_path(model: ImageModel, explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        ensure!(path.is_file(), "Model file {:?} does not exist", path);
        return Ok(path.to_path_buf());
    }

    let env_path = Path::new(ENV_FILE);
    let key = env_key(model);

    if env_path.exists() {
        if let Some(path) = load_from_env(env_path, &key)? {
            if path.is_file() {
                info!("Loaded {} model path from .env", model);
                return Ok(path);
            }
        }
    }

    info!("{} not found in .env. Searching filesystem...", key);
    let root = std::env::current_dir()?;
    let path = find_file(&root, &format!("{}.onnx", model.name()), SEARCH_DEPTH)?;
    info!("Found {} model: {:?}", model, path);

    save_to_env(env_path, &key, &path)?;
    info!("Saved {} to .env", key);

    Ok(path)
}

fn find_file(root: &Path, filename: &str, max_depth: usize) -> Result<PathBuf> {
    // Search below the working directory first, then below its parent.
    for base in std::iter::once(root).chain(root.parent()) {
        let hit = WalkDir::new(base)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
            .find(|e| e.file_type().is_file() && e.file_name() == filename);

        if let Some(entry) = hit {
            return Ok(entry.path().to_path_buf());
        }
    }

    Err(anyhow!("Could not find file '{}' in nearby directories.", filename))
}

fn load_from_env(path: &Path, key: &str) -> Result<Option<PathBuf>> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let reader = BufReader::new(file);

    for line in reader.lines() {
        let line = line?;
        if let Some((k, value)) = line.split_once('=') {
            if k.trim() == key {
                return Ok(Some(PathBuf::from(value.trim())));
            }
        }
    }

    Ok(None)
}

fn save_to_env(path: &Path, key: &str, value: &Path) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open .env file")?;
    writeln!(file, "{}={}", key, value.display())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_save_and_load_env() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(".env");
        let resnet = PathBuf::from("/tmp/resnet152.onnx");
        let vgg = PathBuf::from("/tmp/vgg16.onnx");

        save_to_env(&path, &env_key(ImageModel::Resnet152), &resnet)?;
        save_to_env(&path, &env_key(ImageModel::Vgg16), &vgg)?;

        let content = fs::read_to_string(&path)?;
        assert!(content.contains("RESNET152_MODEL_PATH=/tmp/resnet152.onnx"));
        assert!(content.contains("VGG16_MODEL_PATH=/tmp/vgg16.onnx"));

        assert_eq!(load_from_env(&path, "RESNET152_MODEL_PATH")?, Some(resnet));
        assert_eq!(load_from_env(&path, "VGG16_MODEL_PATH")?, Some(vgg));
        assert_eq!(load_from_env(&path, "INCEPTION_V3_MODEL_PATH")?, None);
        Ok(())
    }

    #[test]
    fn test_find_file_searches_subdirectories() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let models = dir.path().join("models").join("imagenet");
        fs::create_dir_all(&models)?;
        fs::write(models.join("inception_v3.onnx"), b"onnx")?;

        let found = find_file(dir.path(), "inception_v3.onnx", SEARCH_DEPTH)?;
        assert_eq!(found, models.join("inception_v3.onnx"));
        assert!(find_file(&models, "vgg16.onnx", 1).is_err());
        Ok(())
    }

    #[test]
    fn test_explicit_model_path_must_exist() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("resnet152.onnx");
        assert!(resolve_model_path(ImageModel::Resnet152, Some(&path)).is_err());

        fs::write(&path, b"onnx")?;
        assert_eq!(resolve_model_path(ImageModel::Resnet152, Some(&path))?, path);
        Ok(())
    }

    fn config(dir: &Path) -> RunConfig {
        RunConfig {
            video_dir: dir.to_path_buf(),
            output_dir: dir.join("out"),
            model: ImageModel::Resnet152,
            model_path: dir.join("resnet152.onnx"),
            accelerator: Accelerator::Cpu,
            n_frame_steps: 80,
            frames: FrameParams { width: 400, height: 300 },
            audio: AudioParams {
                channels: 1,
                frequency: 16000,
                band_width: 160,
            },
            audio_segments: None,
            workers: 1,
            video_timeout: None,
        }
    }

    #[test]
    fn test_validate_rejects_degenerate_settings() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(config(dir.path()).validate().is_ok());

        assert!(RunConfig { n_frame_steps: 0, ..config(dir.path()) }.validate().is_err());
        assert!(RunConfig { workers: 0, ..config(dir.path()) }.validate().is_err());
        assert!(RunConfig { audio_segments: Some(0), ..config(dir.path()) }.validate().is_err());
        assert!(RunConfig { video_dir: dir.path().join("missing"), ..config(dir.path()) }.validate().is_err());
        Ok(())
    }
}
