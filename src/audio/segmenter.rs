use std::borrow::Cow;
use std::sync::Arc;

use ndarray::{concatenate, Array2, ArrayView2, Axis};
use thiserror::Error;
use tracing::debug;

use crate::audio::mfcc::CoefficientTransform;
use crate::audio::wav::AudioTrack;

/// Segment length in seconds.
const SEGMENT_SECONDS: u32 = 1;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("coefficient transform returned {actual} rows for segment {segment}, expected {expected}")]
    CoefficientCount {
        segment: usize,
        expected: usize,
        actual: usize,
    },
    #[error("failed to assemble audio features: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Audio features of one track: `[frames, n_coeffs]` plus the number of real
/// (non-padding) segments that went into it.
#[derive(Debug, Clone)]
pub struct AudioFeatures {
    pub tensor: Array2<f32>,
    pub segments: usize,
}

/// Zero-pads or truncates `window` to exactly `segment_samples`.
pub fn normalize_segment(window: &[f32], segment_samples: usize) -> Cow<'_, [f32]> {
    if window.len() == segment_samples {
        Cow::Borrowed(window)
    } else if window.len() > segment_samples {
        Cow::Borrowed(&window[..segment_samples])
    } else {
        let mut padded = Vec::with_capacity(segment_samples);
        padded.extend_from_slice(window);
        padded.resize(segment_samples, 0.0);
        Cow::Owned(padded)
    }
}

/// Back-to-back windows of `segment_samples`; the final one may be short.
pub fn split_track(samples: &[f32], segment_samples: usize) -> Vec<&[f32]> {
    samples.chunks(segment_samples.max(1)).collect()
}

pub struct AudioSegmenter {
    transform: Arc<dyn CoefficientTransform>,
    /// When set, the output always covers exactly this many segments.
    fixed_segments: Option<usize>,
}

impl AudioSegmenter {
    pub fn new(transform: Arc<dyn CoefficientTransform>, fixed_segments: Option<usize>) -> Self {
        Self {
            transform,
            fixed_segments,
        }
    }

    pub fn encode(&self, track: &AudioTrack) -> Result<AudioFeatures, SegmentError> {
        let segment_samples = (track.sample_rate * SEGMENT_SECONDS) as usize;
        let n_coeffs = self.transform.n_coeffs();

        let mut windows = split_track(&track.samples, segment_samples);
        if let Some(limit) = self.fixed_segments {
            windows.truncate(limit);
        }

        let mut blocks = Vec::with_capacity(windows.len());
        for (segment, window) in windows.iter().enumerate() {
            let normalized = normalize_segment(window, segment_samples);
            let coeffs = self.transform.transform(&normalized, track.sample_rate);
            if coeffs.nrows() != n_coeffs {
                return Err(SegmentError::CoefficientCount {
                    segment,
                    expected: n_coeffs,
                    actual: coeffs.nrows(),
                });
            }
            blocks.push(coeffs.reversed_axes());
        }
        let segments = blocks.len();

        if let Some(limit) = self.fixed_segments {
            let frames = self.transform.frames_for(segment_samples);
            blocks.extend((segments..limit).map(|_| Array2::zeros((frames, n_coeffs))));
        }

        let tensor = if blocks.is_empty() {
            Array2::zeros((0, n_coeffs))
        } else {
            let views: Vec<ArrayView2<f32>> = blocks.iter().map(|b| b.view()).collect();
            concatenate(Axis(0), &views)?
        };

        debug!(
            "Encoded {:.2}s of audio into {} segment(s), features {:?}",
            track.duration_secs(),
            segments,
            tensor.shape()
        );

        Ok(AudioFeatures { tensor, segments })
    }
}
