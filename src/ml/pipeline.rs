use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ndarray::{Array2, Array3, Array4, Axis};
use rayon::prelude::*;

use crate::ml::engine::{FrameEncoder, ModelSpec};

/// Fraction of the resized frame kept by the center crop.
const CROP_SCALE: f32 = 0.875;

/// Resizes the shorter side to `input_size / 0.875`, center-crops a square of
/// `input_size`, and normalizes into a CHW array with the model's mean/std.
pub fn normalize_frame(image: &DynamicImage, spec: &ModelSpec) -> Array3<f32> {
    let size = spec.input_size;
    let target = (size as f32 / CROP_SCALE).floor() as u32;

    let (width, height) = image.dimensions();
    let (resized_w, resized_h) = if width <= height {
        (target, ((target as u64 * height as u64) / width.max(1) as u64) as u32)
    } else {
        (((target as u64 * width as u64) / height.max(1) as u64) as u32, target)
    };
    let resized = image.resize_exact(resized_w.max(size), resized_h.max(size), FilterType::Triangle);

    let left = (resized.width() - size) / 2;
    let top = (resized.height() - size) / 2;
    let cropped = resized.crop_imm(left, top, size, size).to_rgb8();

    let side = size as usize;
    let mut array = Array3::zeros((3, side, side));
    for (x, y, pixel) in cropped.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            array[[c, y as usize, x as usize]] = (value - spec.mean[c]) / spec.std[c];
        }
    }
    array
}

pub fn load_frame(path: &Path, spec: &ModelSpec) -> Result<Array3<f32>> {
    let image = image::open(path).with_context(|| format!("Failed to open frame {:?}", path))?;
    Ok(normalize_frame(&image, spec))
}

/// Loads the frames at `indices` into one `[n, 3, S, S]` batch, in index order.
pub fn load_batch(frames: &[PathBuf], indices: &[usize], spec: &ModelSpec) -> Result<Array4<f32>> {
    let side = spec.input_size as usize;
    let tensors = indices
        .par_iter()
        .map(|&i| {
            let path = frames
                .get(i)
                .with_context(|| format!("Frame index {} out of range ({} frames)", i, frames.len()))?;
            load_frame(path, spec)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut batch = Array4::zeros((tensors.len(), 3, side, side));
    for (mut slot, tensor) in batch.axis_iter_mut(Axis(0)).zip(tensors) {
        slot.assign(&tensor);
    }
    Ok(batch)
}

/// Runs one batched inference call and checks the result is `[rows, D]`.
pub fn encode_frames(encoder: &dyn FrameEncoder, batch: Array4<f32>) -> Result<Array2<f32>> {
    let rows = batch.len_of(Axis(0));
    let width = encoder.spec().embedding_width;
    let features = encoder.encode(batch)?;
    if features.dim() != (rows, width) {
        bail!(
            "Expected embeddings of shape [{}, {}], encoder returned {:?}",
            rows,
            width,
            features.shape()
        );
    }
    Ok(features)
}
