//! Terminal loss layers.

use ndarray::Axis;

use crate::error::{dims_mismatch, NnError, Result};
use crate::matrix::{argmax, ensure_same_shape, Matrix};
use crate::record::LayerKind;

/// Keeps `ln` away from zero in the cross-entropy.
pub const CROSS_ENTROPY_DELTA: f64 = 1e-7;

/// Last stage of a network: consumes predictions and targets, yields
/// `(loss, accuracy)`, and seeds the backward pass.
pub trait LossLayer {
    fn forward(&mut self, x: &Matrix, t: &Matrix) -> Result<(f64, f64)>;

    /// Gradient of the last `forward` loss with respect to its input.
    fn backward(&self) -> Result<Matrix>;

    fn kind(&self) -> LayerKind;

    /// Forgets the last `forward` so `backward` reports `StateNotReady`.
    fn clear_cache(&mut self);
}

/// Same shape and at least one row, so batch means are defined.
fn ensure_batch(op: &'static str, y: &Matrix, t: &Matrix) -> Result<()> {
    ensure_same_shape(op, y, t)?;
    if y.nrows() == 0 {
        return Err(dims_mismatch(op, y.dim(), (1, y.ncols())));
    }
    Ok(())
}

/// Row-wise softmax with the row maximum subtracted first.
pub fn softmax(x: &Matrix) -> Matrix {
    let mut out = x.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Mean over the batch of `-Σ t·ln(y + δ)`.
pub fn cross_entropy_error(y: &Matrix, t: &Matrix) -> Result<f64> {
    ensure_batch("cross_entropy_error", y, t)?;
    let mut total = 0.0;
    for (yv, tv) in y.iter().zip(t.iter()) {
        total -= tv * (yv + CROSS_ENTROPY_DELTA).ln();
    }
    Ok(total / y.nrows() as f64)
}

/// Fraction of rows whose predicted argmax equals the target argmax.
pub fn accuracy(y: &Matrix, t: &Matrix) -> Result<f64> {
    ensure_batch("accuracy", y, t)?;
    let correct = y
        .axis_iter(Axis(0))
        .zip(t.axis_iter(Axis(0)))
        .filter(|(yr, tr)| argmax(yr.view()).0 == argmax(tr.view()).0)
        .count();
    Ok(correct as f64 / y.nrows() as f64)
}

/// Softmax followed by cross-entropy against one-hot targets.
#[derive(Debug, Default, Clone)]
pub struct SoftmaxWithLoss {
    out: Option<Matrix>,
    t: Option<Matrix>,
    loss: f64,
}

impl SoftmaxWithLoss {
    pub fn new() -> SoftmaxWithLoss {
        SoftmaxWithLoss::default()
    }

    /// Loss of the last `forward`.
    pub fn loss(&self) -> f64 {
        self.loss
    }

    /// Probabilities of the last `forward`.
    pub fn output(&self) -> Option<&Matrix> {
        self.out.as_ref()
    }
}

impl LossLayer for SoftmaxWithLoss {
    fn forward(&mut self, x: &Matrix, t: &Matrix) -> Result<(f64, f64)> {
        ensure_batch("SoftmaxWithLoss::forward", x, t)?;
        let y = softmax(x);
        let loss = cross_entropy_error(&y, t)?;
        let acc = accuracy(&y, t)?;
        self.out = Some(y);
        self.t = Some(t.clone());
        self.loss = loss;
        Ok((loss, acc))
    }

    fn backward(&self) -> Result<Matrix> {
        match (&self.out, &self.t) {
            (Some(y), Some(t)) => Ok((y - t) / y.nrows() as f64),
            _ => Err(NnError::StateNotReady(
                "SoftmaxWithLoss::backward called before forward",
            )),
        }
    }

    fn kind(&self) -> LayerKind {
        LayerKind::SoftmaxWithLoss
    }

    fn clear_cache(&mut self) {
        self.out = None;
        self.t = None;
    }
}

/// Huber-style regression loss with threshold 1, identity output.
///
/// Accuracy is not meaningful for regression and is reported as `0.0`.
#[derive(Debug, Default, Clone)]
pub struct SmoothL1Loss {
    x: Option<Matrix>,
    t: Option<Matrix>,
}

impl SmoothL1Loss {
    pub fn new() -> SmoothL1Loss {
        SmoothL1Loss::default()
    }
}

fn smooth_l1(d: f64) -> f64 {
    if d.abs() < 1.0 {
        d * d / 2.0
    } else {
        d.abs() - 0.5
    }
}

fn smooth_l1_gradient(d: f64) -> f64 {
    if d.abs() < 1.0 {
        d
    } else {
        d.signum()
    }
}

impl LossLayer for SmoothL1Loss {
    fn forward(&mut self, x: &Matrix, t: &Matrix) -> Result<(f64, f64)> {
        ensure_batch("SmoothL1Loss::forward", x, t)?;
        let total: f64 = x
            .iter()
            .zip(t.iter())
            .map(|(xv, tv)| smooth_l1(tv - xv))
            .sum();
        self.x = Some(x.clone());
        self.t = Some(t.clone());
        Ok((total / x.nrows() as f64, 0.0))
    }

    fn backward(&self) -> Result<Matrix> {
        match (&self.x, &self.t) {
            (Some(x), Some(t)) => {
                let batch = x.nrows() as f64;
                let mut dx = x - t;
                dx.mapv_inplace(|d| smooth_l1_gradient(d) / batch);
                Ok(dx)
            }
            _ => Err(NnError::StateNotReady(
                "SmoothL1Loss::backward called before forward",
            )),
        }
    }

    fn kind(&self) -> LayerKind {
        LayerKind::SmoothL1Loss
    }

    fn clear_cache(&mut self) {
        self.x = None;
        self.t = None;
    }
}
