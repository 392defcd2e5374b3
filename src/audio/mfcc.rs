use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, PoisonError};

use ndarray::{s, Array2};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Maps one audio window to a `[n_coeffs, frames]` coefficient matrix.
pub trait CoefficientTransform: Send + Sync {
    fn n_coeffs(&self) -> usize;

    /// Number of frames `transform` produces for a window of `n_samples`.
    fn frames_for(&self, n_samples: usize) -> usize;

    fn transform(&self, window: &[f32], sample_rate: u32) -> Array2<f32>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MfccConfig {
    pub n_mfcc: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    /// Dynamic range kept below the loudest mel bin, in dB.
    pub top_db: Option<f32>,
}

impl Default for MfccConfig {
    fn default() -> Self {
        Self {
            n_mfcc: 20,
            n_fft: 2048,
            hop_length: 512,
            n_mels: 128,
            top_db: Some(80.0),
        }
    }
}

/// Mel-frequency cepstral coefficients over centered, Hann-windowed frames.
pub struct Mfcc {
    config: MfccConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    dct: Array2<f32>,
    /// Mel filterbanks keyed by sample rate.
    filters: Mutex<HashMap<u32, Arc<Array2<f32>>>>,
}

impl Mfcc {
    pub fn new(config: MfccConfig) -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(config.n_fft);
        let window = hann_window(config.n_fft);
        let dct = dct_matrix(config.n_mfcc, config.n_mels);
        Self {
            config,
            fft,
            window,
            dct,
            filters: Mutex::new(HashMap::new()),
        }
    }

    fn filterbank(&self, sample_rate: u32) -> Arc<Array2<f32>> {
        let mut cache = self.filters.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .entry(sample_rate)
            .or_insert_with(|| Arc::new(mel_filterbank(self.config.n_mels, self.config.n_fft, sample_rate)))
            .clone()
    }

    fn power_spectrogram(&self, samples: &[f32]) -> Array2<f32> {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let pad = n_fft / 2;
        let n_freqs = n_fft / 2 + 1;
        let n_frames = self.frames_for(samples.len());

        let mut padded = vec![0.0f32; samples.len() + 2 * pad];
        padded[pad..pad + samples.len()].copy_from_slice(samples);

        let mut power = Array2::zeros((n_freqs, n_frames));
        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];
        for t in 0..n_frames {
            let frame = &padded[t * hop..t * hop + n_fft];
            for ((slot, &x), &w) in buffer.iter_mut().zip(frame).zip(&self.window) {
                *slot = Complex::new(x * w, 0.0);
            }
            self.fft.process(&mut buffer);
            for (f, bin) in buffer.iter().take(n_freqs).enumerate() {
                power[[f, t]] = bin.norm_sqr();
            }
        }
        power
    }
}

impl Default for Mfcc {
    fn default() -> Self {
        Self::new(MfccConfig::default())
    }
}

impl CoefficientTransform for Mfcc {
    fn n_coeffs(&self) -> usize {
        self.config.n_mfcc
    }

    fn frames_for(&self, n_samples: usize) -> usize {
        1 + n_samples / self.config.hop_length
    }

    fn transform(&self, window: &[f32], sample_rate: u32) -> Array2<f32> {
        let power = self.power_spectrogram(window);
        let filters = self.filterbank(sample_rate);
        let mut db = filters.dot(&power).mapv(|v| 10.0 * v.max(1e-10).log10());

        if let Some(top_db) = self.config.top_db {
            let peak = db.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let floor = peak - top_db;
            db.mapv_inplace(|v| v.max(floor));
        }

        self.dct.dot(&db)
    }
}

fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| (0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos()) as f32)
        .collect()
}

/// Orthonormal DCT-II basis, keeping the first `n_out` rows.
fn dct_matrix(n_out: usize, n_in: usize) -> Array2<f32> {
    let n = n_in as f64;
    Array2::from_shape_fn((n_out, n_in), |(k, m)| {
        let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        (scale * (PI * k as f64 * (2.0 * m as f64 + 1.0) / (2.0 * n)).cos()) as f32
    })
}

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Slaney-scale triangular filters over `[0, sr/2]`, area normalized.
/// Shape `[n_mels, n_fft / 2 + 1]`.
fn mel_filterbank(n_mels: usize, n_fft: usize, sample_rate: u32) -> Array2<f32> {
    let sr = sample_rate as f64;
    let n_freqs = n_fft / 2 + 1;

    let mel_max = hz_to_mel(sr / 2.0);
    let mel_hz: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = Array2::zeros((n_mels, n_freqs));
    for m in 0..n_mels {
        let (left, center, right) = (mel_hz[m], mel_hz[m + 1], mel_hz[m + 2]);
        let enorm = 2.0 / (right - left);
        let mut row = filters.slice_mut(s![m, ..]);
        for (f, weight) in row.iter_mut().enumerate() {
            let freq = f as f64 * sr / n_fft as f64;
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            *weight = (lower.min(upper).max(0.0) * enorm) as f32;
        }
    }
    filters
}
