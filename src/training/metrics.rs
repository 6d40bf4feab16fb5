/// Segmentation accuracy and intersection-over-union
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::data::VOID_LABEL;

/// Scores over a set of predictions, each in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentationScores {
    /// Overall pixel accuracy
    pub acc: f64,
    /// Mean per-class accuracy
    pub acc_cls: f64,
    /// Mean intersection over union
    pub mean_iu: f64,
    /// Frequency-weighted intersection over union
    pub fwavacc: f64,
}

/// Accumulated `[true, predicted]` pixel counts
#[derive(Debug, Clone)]
pub struct ConfusionMatrix {
    hist: Array2<u64>,
}

impl ConfusionMatrix {
    pub fn new(n_class: usize) -> Self {
        Self {
            hist: Array2::zeros((n_class, n_class)),
        }
    }

    pub fn n_class(&self) -> usize {
        self.hist.nrows()
    }

    /// Add one label mask and its prediction; void and out-of-range truths are skipped.
    pub fn update(&mut self, truth: &[u32], pred: &[u32]) {
        let n = self.n_class();
        for (&t, &p) in truth.iter().zip(pred) {
            if t == VOID_LABEL || t as usize >= n || p as usize >= n {
                continue;
            }
            self.hist[[t as usize, p as usize]] += 1;
        }
    }

    pub fn counts(&self) -> &Array2<u64> {
        &self.hist
    }

    /// Classes absent from both truth and prediction are left out of the means.
    pub fn scores(&self) -> SegmentationScores {
        let hist = self.hist.mapv(|x| x as f64);
        let diag: Array1<f64> = hist.diag().to_owned();
        let truth_per_class = hist.sum_axis(ndarray::Axis(1));
        let pred_per_class = hist.sum_axis(ndarray::Axis(0));
        let total = hist.sum();

        if total == 0.0 {
            return SegmentationScores::default();
        }

        let acc = diag.sum() / total;

        let per_class_acc: Vec<f64> = diag
            .iter()
            .zip(truth_per_class.iter())
            .map(|(&d, &t)| d / t)
            .collect();
        let acc_cls = nanmean(&per_class_acc);

        let iu: Vec<f64> = diag
            .iter()
            .zip(truth_per_class.iter().zip(pred_per_class.iter()))
            .map(|(&d, (&t, &p))| d / (t + p - d))
            .collect();
        let mean_iu = nanmean(&iu);

        let fwavacc = truth_per_class
            .iter()
            .zip(iu.iter())
            .filter(|&(&freq, &u)| freq > 0.0 && !u.is_nan())
            .map(|(&freq, &u)| freq / total * u)
            .sum();

        SegmentationScores {
            acc,
            acc_cls,
            mean_iu,
            fwavacc,
        }
    }
}

fn nanmean(values: &[f64]) -> f64 {
    let valid: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if valid.is_empty() {
        return 0.0;
    }
    valid.iter().sum::<f64>() / valid.len() as f64
}

/// Scores of `preds` against `truths`, one flat mask pair per image
pub fn label_accuracy_score(
    truths: &[Vec<u32>],
    preds: &[Vec<u32>],
    n_class: usize,
) -> SegmentationScores {
    let mut hist = ConfusionMatrix::new(n_class);
    for (truth, pred) in truths.iter().zip(preds) {
        hist.update(truth, pred);
    }
    hist.scores()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_prediction() {
        let truth = vec![vec![0, 1, 2, 2]];
        let scores = label_accuracy_score(&truth, &truth, 3);

        assert_eq!(scores.acc, 1.0);
        assert_eq!(scores.acc_cls, 1.0);
        assert_eq!(scores.mean_iu, 1.0);
        assert!((scores.fwavacc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_void_pixels_skipped() {
        let truth = vec![vec![0, VOID_LABEL, 1, VOID_LABEL]];
        let pred = vec![vec![0, 1, 1, 0]];
        let scores = label_accuracy_score(&truth, &pred, 2);
        assert_eq!(scores.acc, 1.0);
    }

    #[test]
    fn test_partial_prediction() {
        // truth: 0 0 1 1, pred: 0 1 1 1
        let truth = vec![vec![0, 0, 1, 1]];
        let pred = vec![vec![0, 1, 1, 1]];
        let scores = label_accuracy_score(&truth, &pred, 2);

        assert!((scores.acc - 0.75).abs() < 1e-12);
        assert!((scores.acc_cls - 0.75).abs() < 1e-12);
        // iu: class 0 = 1/2, class 1 = 2/3
        let mean_iu = (0.5 + 2.0 / 3.0) / 2.0;
        assert!((scores.mean_iu - mean_iu).abs() < 1e-12);
        let fwavacc = 0.5 * 0.5 + 0.5 * (2.0 / 3.0);
        assert!((scores.fwavacc - fwavacc).abs() < 1e-12);
    }

    #[test]
    fn test_absent_class_ignored_in_means() {
        let truth = vec![vec![0, 0]];
        let scores = label_accuracy_score(&truth, &truth, 5);
        assert_eq!(scores.acc_cls, 1.0);
        assert_eq!(scores.mean_iu, 1.0);
    }

    #[test]
    fn test_empty_matrix() {
        let truth = vec![vec![VOID_LABEL; 4]];
        let scores = label_accuracy_score(&truth, &truth, 3);
        assert_eq!(scores, SegmentationScores::default());
    }

    #[test]
    fn test_accumulates_across_updates() {
        let mut hist = ConfusionMatrix::new(2);
        hist.update(&[0, 1], &[0, 0]);
        hist.update(&[1], &[1]);
        assert_eq!(hist.counts()[[0, 0]], 1);
        assert_eq!(hist.counts()[[1, 0]], 1);
        assert_eq!(hist.counts()[[1, 1]], 1);
    }
}
