use ndarray::{Array2, ArrayView2, Axis, Zip};

use crate::{NetErr, Result};

pub trait LossFn {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32;
    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32>;
}

/// Cross entropy of the softmax of the class scores against one hot targets, averaged over the
/// batch.
#[derive(Default, Clone, Copy)]
pub struct CrossEntropy;

impl CrossEntropy {
    /// Returns a new `CrossEntropy`.
    pub fn new() -> Self {
        Self
    }
}

/// Row wise softmax, shifted by the row maximum.
pub fn softmax(y_pred: ArrayView2<f32>) -> Array2<f32> {
    let mut p = y_pred.to_owned();

    for mut row in p.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }

    p
}

impl LossFn for CrossEntropy {
    fn loss(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> f32 {
        let n = y_pred.nrows().max(1) as f32;
        let mut total = 0.;

        for (row, target) in y_pred.outer_iter().zip(y.outer_iter()) {
            let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            let log_sum = row.fold(0., |acc, &v| acc + (v - max).exp()).ln() + max;
            total += Zip::from(&row)
                .and(&target)
                .fold(0., |acc, &z, &t| acc + t * (log_sum - z));
        }

        total / n
    }

    fn loss_prime(&self, y_pred: ArrayView2<f32>, y: ArrayView2<f32>) -> Array2<f32> {
        let n = y_pred.nrows().max(1) as f32;
        (softmax(y_pred) - &y) / n
    }
}

/// Encodes labels as one hot rows.
///
/// # Returns
/// A `(labels, classes)` matrix or an error if a label is out of range.
pub fn one_hot(labels: &[usize], classes: usize) -> Result<Array2<f32>> {
    let mut y = Array2::zeros((labels.len(), classes));

    for (i, &label) in labels.iter().enumerate() {
        if label >= classes {
            return Err(NetErr::LabelOutOfRange { label, classes });
        }
        y[[i, label]] = 1.;
    }

    Ok(y)
}

/// The index of the highest score of every row.
pub fn predictions(y_pred: ArrayView2<f32>) -> Vec<usize> {
    y_pred
        .outer_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, max), (i, &v)| {
                    if v > max { (i, v) } else { (best, max) }
                })
                .0
        })
        .collect()
}

/// The amount of rows whose highest score matches the label.
pub fn correct(y_pred: ArrayView2<f32>, labels: &[usize]) -> usize {
    predictions(y_pred)
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count()
}
