// src/context.rs
//
// Context windows are arrays of shape (n_windows, context_len, features). The
// first `lookback_len` snapshots of a window are the lookback, the rest the
// lookforward.

use log::warn;
use ndarray::{
    concatenate, s, stack, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, ArrayViewD, Axis,
};

use crate::error::{KoopmanError, Result};

/// Validates the shape of a batch of context windows.
///
/// Requires at least two axes and, when `lookback_len` is given,
/// `1 <= lookback_len < context_len`. With `enforce_len1_lookforward` the
/// lookforward must be exactly one snapshot long.
pub fn check_contexts(
    contexts: ArrayViewD<f64>,
    lookback_len: Option<usize>,
    enforce_len1_lookforward: bool,
) -> Result<()> {
    if contexts.ndim() < 2 {
        return Err(KoopmanError::InvalidContext(format!(
            "shape {:?} has fewer than two axes",
            contexts.shape()
        )));
    }
    if contexts.ndim() == 2 {
        warn!(
            "Contexts have shape {:?}; the second axis is taken as time with a single feature.",
            contexts.shape()
        );
    }
    let Some(lookback_len) = lookback_len else {
        return Ok(());
    };
    let context_len = contexts.shape()[1];
    if lookback_len < 1 || lookback_len >= context_len {
        return Err(KoopmanError::InvalidContext(format!(
            "lookback_len={} is invalid for contexts of shape {:?}",
            lookback_len,
            contexts.shape()
        )));
    }
    if enforce_len1_lookforward && lookback_len + 1 < context_len {
        return Err(KoopmanError::InvalidContext(format!(
            "the lookforward window has length {}, expected 1",
            context_len - lookback_len
        )));
    }
    Ok(())
}

/// Slices a trajectory (time, features) into overlapping context windows.
///
/// Consecutive snapshots of a window are `time_lag` steps apart, so one window
/// spans `1 + (context_window_len - 1) * time_lag` raw snapshots. Windows start
/// at every time step.
pub fn trajectory_to_contexts(
    trajectory: ArrayView2<f64>,
    context_window_len: usize,
    time_lag: usize,
) -> Result<Array3<f64>> {
    if context_window_len < 2 {
        return Err(KoopmanError::InvalidContext(format!(
            "context_window_len must be >= 2, got {}",
            context_window_len
        )));
    }
    if time_lag < 1 {
        return Err(KoopmanError::InvalidContext(format!(
            "time_lag must be >= 1, got {}",
            time_lag
        )));
    }
    let span = 1 + (context_window_len - 1) * time_lag;
    let (n_steps, n_features) = trajectory.dim();
    if span > n_steps {
        return Err(KoopmanError::InvalidContext(format!(
            "context_window_len={} with time_lag={} spans {} snapshots, trajectory has {}",
            context_window_len, time_lag, span, n_steps
        )));
    }

    let n_windows = n_steps - span + 1;
    let mut contexts = Array3::<f64>::zeros((n_windows, context_window_len, n_features));
    for (start, mut window) in contexts.axis_iter_mut(Axis(0)).enumerate() {
        window.assign(&trajectory.slice(s![start..start + span;time_lag, ..]));
    }
    Ok(contexts)
}

/// Splits each window into its input lookback and the lookback shifted one
/// step ahead: output shape (n_windows, 2, lookback_len, features).
///
/// `lookback_len` defaults to `context_len - 1`. Snapshots after
/// `lookback_len + 1` are discarded with a warning.
pub fn stack_lookback(
    contexts: ArrayView3<f64>,
    lookback_len: Option<usize>,
) -> Result<Array4<f64>> {
    let context_len = contexts.len_of(Axis(1));
    let lookback_len = lookback_len.unwrap_or(context_len.saturating_sub(1));
    check_contexts(contexts.into_dyn(), Some(lookback_len), false)?;
    if lookback_len + 1 < context_len {
        warn!(
            "The lookforward window ({}) is longer than 1: \
             {} snapshots per context window are discarded.",
            context_len - lookback_len,
            context_len - lookback_len - 1
        );
    }
    let inputs = contexts.slice(s![.., ..lookback_len, ..]);
    let outputs = contexts.slice(s![.., 1..lookback_len + 1, ..]);
    stack(Axis(1), &[inputs, outputs]).map_err(|e| KoopmanError::InvalidContext(e.to_string()))
}

/// Inverse of [`stack_lookback`] for length-1 lookforward windows.
pub fn unstack_lookback(stacked: ArrayView4<f64>) -> Result<Array3<f64>> {
    if stacked.len_of(Axis(1)) != 2 {
        return Err(KoopmanError::InvalidContext(format!(
            "shape {:?} cannot be unstacked: the second axis must have length 2",
            stacked.shape()
        )));
    }
    if stacked.len_of(Axis(2)) == 0 {
        return Err(KoopmanError::InvalidContext("empty lookback windows".to_string()));
    }
    let inputs = stacked.index_axis(Axis(1), 0);
    let last = stacked.len_of(Axis(2)) - 1;
    let final_outputs = stacked.slice(s![.., 1, last..last + 1, ..]);
    concatenate(Axis(1), &[inputs, final_outputs])
        .map_err(|e| KoopmanError::InvalidContext(e.to_string()))
}

/// The last `lookback_len` snapshots of every window.
pub(crate) fn trailing_lookback(
    contexts: ArrayView3<f64>,
    lookback_len: usize,
) -> Result<ArrayView3<f64>> {
    let context_len = contexts.len_of(Axis(1));
    if lookback_len == 0 || lookback_len > context_len {
        return Err(KoopmanError::InvalidContext(format!(
            "contexts of length {} cannot provide a lookback of {}",
            context_len, lookback_len
        )));
    }
    Ok(contexts.slice_move(s![.., context_len - lookback_len.., ..]))
}
