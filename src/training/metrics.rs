/// Task metrics: running loss, accuracy, F1 and AUPRC
use std::cmp::Ordering;

/// Batch-size-weighted running loss
///
/// mean = sum(loss_b * size_b) / sum(size_b)
#[derive(Debug, Clone, Default)]
pub struct RunningLoss {
    total: f64,
    count: usize,
}

impl RunningLoss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the mean loss of a batch of `batch_size` examples
    pub fn add(&mut self, batch_loss: f64, batch_size: usize) {
        self.total += batch_loss * batch_size as f64;
        self.count += batch_size;
    }

    /// Weighted mean, NaN before any example was seen
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.total / self.count as f64
        }
    }

    /// Number of examples seen
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Fraction of exact matches
pub fn accuracy(truth: &[u32], pred: &[u32]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    let correct = truth.iter().zip(pred.iter()).filter(|(t, p)| t == p).count();
    correct as f64 / truth.len() as f64
}

/// Averaging mode for multilabel F1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Average {
    /// Pool true/false positives over all labels
    Micro,
    /// Unweighted mean of per-label F1
    Macro,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counts {
    tp: usize,
    fp: usize,
    fn_: usize,
}

impl Counts {
    fn f1(&self) -> f64 {
        let denom = 2 * self.tp + self.fp + self.fn_;
        if denom == 0 {
            0.0
        } else {
            2.0 * self.tp as f64 / denom as f64
        }
    }
}

/// F1 score for multilabel 0/1 indicator rows
///
/// Values >= 0.5 count as positive. A label that is never present nor
/// predicted scores 0 under macro averaging.
pub fn f1_score(truth: &[Vec<f32>], pred: &[Vec<f32>], average: Average) -> f64 {
    let num_labels = truth.first().map(|r| r.len()).unwrap_or(0);
    if num_labels == 0 {
        return 0.0;
    }

    let mut per_label = vec![Counts::default(); num_labels];
    for (t_row, p_row) in truth.iter().zip(pred.iter()) {
        for (label, (t, p)) in t_row.iter().zip(p_row.iter()).enumerate() {
            let (t, p) = (*t >= 0.5, *p >= 0.5);
            let counts = &mut per_label[label];
            match (t, p) {
                (true, true) => counts.tp += 1,
                (false, true) => counts.fp += 1,
                (true, false) => counts.fn_ += 1,
                (false, false) => {}
            }
        }
    }

    match average {
        Average::Micro => {
            let pooled = per_label.iter().fold(Counts::default(), |acc, c| Counts {
                tp: acc.tp + c.tp,
                fp: acc.fp + c.fp,
                fn_: acc.fn_ + c.fn_,
            });
            pooled.f1()
        }
        Average::Macro => per_label.iter().map(Counts::f1).sum::<f64>() / num_labels as f64,
    }
}

/// Area under the precision-recall curve (average precision)
///
/// `pts` are (score of the positive class, label) pairs; label 1 is the
/// positive class. AP = sum over thresholds of (R_n - R_{n-1}) * P_n, with
/// tied scores forming a single threshold. NaN scores rank below every
/// finite score and tie with each other.
pub fn auprc(pts: &[(f64, u32)]) -> f64 {
    let positives = pts.iter().filter(|(_, label)| *label == 1).count();
    if positives == 0 {
        log::warn!("AUPRC undefined without positive examples");
        return 0.0;
    }

    let mut sorted: Vec<(f64, u32)> = pts.to_vec();
    sorted.sort_by(|a, b| descending_nan_last(a.0, b.0));

    let mut ap = 0.0;
    let mut tp = 0usize;
    let mut fp = 0usize;
    let mut prev_recall = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let score = sorted[i].0;
        while i < sorted.len() && same_score(sorted[i].0, score) {
            if sorted[i].1 == 1 {
                tp += 1;
            } else {
                fp += 1;
            }
            i += 1;
        }
        let recall = tp as f64 / positives as f64;
        let precision = tp as f64 / (tp + fp) as f64;
        ap += (recall - prev_recall) * precision;
        prev_recall = recall;
    }

    ap
}

fn descending_nan_last(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

fn same_score(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}
