use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::debug;

/// Mono waveform at its native sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioTrack {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }
}

/// Reads a WAV file into a mono track.
///
/// Integer PCM keeps its raw magnitude (an `i16` sample of 1200 becomes
/// `1200.0`); multi-channel audio is averaged per frame.
pub fn read_track(path: &Path) -> Result<AudioTrack> {
    let reader = hound::WavReader::open(path).with_context(|| format!("Failed to open WAV file: {:?}", path))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        bail!("WAV file {:?} reports a sample rate of 0", path);
    }
    let channels = spec.channels.max(1) as usize;

    let raw: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .into_samples::<i32>()
            .map(|s| s.map(|v| v as f32))
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read WAV samples")?,
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read WAV float samples")?,
    };

    let samples = if channels > 1 {
        raw.chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    } else {
        raw
    };

    debug!(
        "Read {} samples at {} Hz ({} channel(s), {} bits) from {:?}",
        samples.len(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample,
        path
    );

    Ok(AudioTrack {
        samples,
        sample_rate: spec.sample_rate,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn write_wav(path: &Path, samples: &[i16], sample_rate: u32, channels: u16) -> Result<()> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &s in samples {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
        Ok(())
    }

    #[test]
    fn test_read_mono_keeps_raw_magnitude() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mono.wav");
        write_wav(&path, &[0, 1200, -32768, 32767], 16000, 1)?;

        let track = read_track(&path)?;
        assert_eq!(track.sample_rate, 16000);
        assert_eq!(track.samples, vec![0.0, 1200.0, -32768.0, 32767.0]);
        Ok(())
    }

    #[test]
    fn test_read_stereo_is_averaged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stereo.wav");
        write_wav(&path, &[100, 300, -50, 50], 8000, 2)?;

        let track = read_track(&path)?;
        assert_eq!(track.samples, vec![200.0, 0.0]);
        assert!((track.duration_secs() - 2.0 / 8000.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_read_missing_file() {
        assert!(read_track(Path::new("/nonexistent/audio.wav")).is_err());
    }
}
