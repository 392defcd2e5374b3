use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SampleError {
    #[error("frame sequence is empty")]
    Empty,
}

/// Picks `n_steps` frame indices spread evenly over a sequence of `len` frames.
///
/// Positions are `linspace(0, len - 1, n_steps)` rounded half-to-even, so the
/// result is non-decreasing, always has `n_steps` entries, and repeats indices
/// when the sequence is shorter than `n_steps`.
pub fn sample_indices(len: usize, n_steps: usize) -> Result<Vec<usize>, SampleError> {
    if len == 0 {
        return Err(SampleError::Empty);
    }
    if n_steps == 1 {
        return Ok(vec![0]);
    }

    let last = (len - 1) as f64;
    let step = last / (n_steps - 1) as f64;

    let indices = (0..n_steps)
        .map(|i| {
            // linspace pins the endpoint instead of accumulating the step
            let position = if i == n_steps - 1 { last } else { i as f64 * step };
            (position.round_ties_even().max(0.0) as usize).min(len - 1)
        })
        .collect();

    Ok(indices)
}
