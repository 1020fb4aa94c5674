/// Best-checkpoint selection and patience-based early stopping
use serde::{Deserialize, Serialize};

use crate::config::TaskKind;

/// Early stop fires once patience exceeds this many epochs
pub const PATIENCE_THRESHOLD: usize = 7;

/// Whether larger metric values are better
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricDirection {
    HigherIsBetter,
    LowerIsBetter,
}

impl MetricDirection {
    /// Accuracy and macro F1 grow, regression loss shrinks
    pub fn for_task(task: TaskKind) -> Self {
        match task {
            TaskKind::Classification | TaskKind::Multilabel => MetricDirection::HigherIsBetter,
            TaskKind::Regression => MetricDirection::LowerIsBetter,
        }
    }

    /// Starting "best" value that the first real epoch has to beat
    pub fn initial_best(&self) -> f64 {
        match self {
            MetricDirection::HigherIsBetter => 0.0,
            MetricDirection::LowerIsBetter => 10000.0,
        }
    }

    /// Strict improvement; NaN never improves
    pub fn is_better(&self, candidate: f64, best: f64) -> bool {
        match self {
            MetricDirection::HigherIsBetter => candidate > best,
            MetricDirection::LowerIsBetter => candidate < best,
        }
    }
}

/// Outcome of one validation epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// New best: the checkpoint must be rewritten
    Improved,
    NotImproved,
}

/// Tracks the best validation metric and the patience counter
#[derive(Debug, Clone)]
pub struct BestMetricTracker {
    direction: MetricDirection,
    best: f64,
    best_epoch: Option<usize>,
    patience: usize,
}

impl BestMetricTracker {
    pub fn new(direction: MetricDirection) -> Self {
        Self {
            direction,
            best: direction.initial_best(),
            best_epoch: None,
            patience: 0,
        }
    }

    pub fn for_task(task: TaskKind) -> Self {
        Self::new(MetricDirection::for_task(task))
    }

    /// Record the metric of `epoch`
    pub fn observe(&mut self, epoch: usize, metric: f64) -> Observation {
        if self.direction.is_better(metric, self.best) {
            self.best = metric;
            self.best_epoch = Some(epoch);
            self.patience = 0;
            Observation::Improved
        } else {
            self.patience += 1;
            Observation::NotImproved
        }
    }

    /// True when early stopping is enabled and patience ran out
    pub fn should_stop(&self, early_stop: bool) -> bool {
        early_stop && self.patience > PATIENCE_THRESHOLD
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn patience(&self) -> usize {
        self.patience
    }

    pub fn direction(&self) -> MetricDirection {
        self.direction
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Epochs (1-based) at which a checkpoint would be written
    fn saved_epochs(task: TaskKind, metrics: &[f64]) -> Vec<usize> {
        let mut tracker = BestMetricTracker::for_task(task);
        metrics
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| match tracker.observe(i + 1, m) {
                Observation::Improved => Some(i + 1),
                Observation::NotImproved => None,
            })
            .collect()
    }

    #[test]
    fn test_accuracy_sequence() {
        assert_eq!(saved_epochs(TaskKind::Classification, &[0.70, 0.65, 0.72]), vec![1, 3]);
    }

    #[test]
    fn test_regression_sequence() {
        assert_eq!(saved_epochs(TaskKind::Regression, &[1.2, 0.9, 1.0]), vec![1, 2]);
    }

    #[test]
    fn test_ties_do_not_improve() {
        assert_eq!(saved_epochs(TaskKind::Multilabel, &[0.4, 0.4, 0.41]), vec![1, 3]);
    }

    #[test]
    fn test_nan_never_improves() {
        assert_eq!(saved_epochs(TaskKind::Regression, &[f64::NAN, 2.0]), vec![2]);
    }

    #[test]
    fn test_best_is_running_optimum() {
        let metrics = [0.3, 0.5, 0.4, 0.45, 0.6, 0.1, 0.6];
        let mut tracker = BestMetricTracker::for_task(TaskKind::Classification);
        for (i, &m) in metrics.iter().enumerate() {
            tracker.observe(i + 1, m);
            let best_so_far = metrics[..=i].iter().cloned().fold(f64::MIN, f64::max);
            assert_eq!(tracker.best(), best_so_far);
        }
        assert_eq!(tracker.best_epoch(), Some(5));
    }

    #[test]
    fn test_patience_resets_and_increments() {
        let mut tracker = BestMetricTracker::for_task(TaskKind::Regression);
        tracker.observe(1, 1.0);
        assert_eq!(tracker.patience(), 0);
        tracker.observe(2, 1.5);
        tracker.observe(3, 1.1);
        assert_eq!(tracker.patience(), 2);
        tracker.observe(4, 0.5);
        assert_eq!(tracker.patience(), 0);
    }

    #[test]
    fn test_early_stop_after_patience_exceeds_threshold() {
        let mut tracker = BestMetricTracker::for_task(TaskKind::Classification);
        tracker.observe(1, 0.9);

        for epoch in 2..=(PATIENCE_THRESHOLD + 1) {
            tracker.observe(epoch, 0.1);
            assert!(!tracker.should_stop(true), "stopped early at patience {}", tracker.patience());
        }
        assert_eq!(tracker.patience(), PATIENCE_THRESHOLD);

        tracker.observe(PATIENCE_THRESHOLD + 2, 0.1);
        assert_eq!(tracker.patience(), PATIENCE_THRESHOLD + 1);
        assert!(tracker.should_stop(true));
        assert!(!tracker.should_stop(false));
    }
}
