use std::collections::BTreeSet;

use crossbeam_channel::Sender;
use log::info;
use serde::Serialize;

use super::{AnalysisResult, AnalyzerId, Controller, Signal};
use crate::drivers::AnalysisError;

/// Feedback emitted towards the experiment.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ControlSignal {
    ResponsiveUnit {
        analyzer: AnalyzerId,
        signal: Signal,
        unit: u32,
        mean_rate: f64,
        /// Condition with the strongest mean response.
        preferred_condition: usize,
    },
}

/// Flags each unit once, the first time its mean value across trials exceeds a threshold.
pub struct RateThresholdController {
    threshold: f64,
    min_trials: usize,
    notified: BTreeSet<u32>,
    tx: Sender<ControlSignal>,
}

impl RateThresholdController {
    pub fn new(threshold: f64, min_trials: usize, tx: Sender<ControlSignal>) -> Self {
        Self {
            threshold,
            min_trials: min_trials.max(1),
            notified: BTreeSet::new(),
            tx,
        }
    }
}

impl Controller for RateThresholdController {
    fn control(&mut self, result: &AnalysisResult) -> Result<(), AnalysisError> {
        if result.trial_count() < self.min_trials {
            return Ok(());
        }
        for (unit, values) in &result.values {
            if self.notified.contains(unit) {
                continue;
            }
            let mean_rate = values.iter().sum::<f64>() / values.len() as f64;
            if mean_rate <= self.threshold {
                continue;
            }
            let preferred_condition = result
                .condition_means(*unit)
                .into_iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(condition, _)| condition)
                .unwrap_or_default();
            info!("unit {unit} on {:?} responsive at {mean_rate:.1}", result.signal);
            self.tx
                .send(ControlSignal::ResponsiveUnit {
                    analyzer: result.analyzer,
                    signal: result.signal,
                    unit: *unit,
                    mean_rate,
                    preferred_condition,
                })
                .map_err(|e| AnalysisError::Controller {
                    id: result.analyzer.0,
                    reason: e.to_string(),
                })?;
            self.notified.insert(*unit);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.notified.clear();
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::unbounded;

    use super::*;

    #[test]
    fn notifies_each_unit_once() {
        let (tx, rx) = unbounded();
        let mut controller = RateThresholdController::new(10.0, 2, tx);
        let mut result = AnalysisResult::new(AnalyzerId(3), Signal::spike(1));
        result.push_trial(0, 0, [(1, 30.0), (2, 1.0)]);
        controller.control(&result).unwrap();
        assert!(rx.try_recv().is_err());

        result.push_trial(1, 1, [(1, 50.0), (2, 2.0)]);
        controller.control(&result).unwrap();
        controller.control(&result).unwrap();
        let signals: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            signals,
            vec![ControlSignal::ResponsiveUnit {
                analyzer: AnalyzerId(3),
                signal: Signal::spike(1),
                unit: 1,
                mean_rate: 40.0,
                preferred_condition: 1,
            }]
        );
    }

    #[test]
    fn reset_allows_units_to_be_flagged_again() {
        let (tx, rx) = unbounded();
        let mut controller = RateThresholdController::new(10.0, 1, tx);
        let mut result = AnalysisResult::new(AnalyzerId(5), Signal::spike(0));
        result.push_trial(0, 0, [(7, 20.0)]);
        controller.control(&result).unwrap();
        controller.control(&result).unwrap();
        assert_eq!(rx.try_iter().count(), 1);

        controller.reset();
        controller.control(&result).unwrap();
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn disconnected_receiver_is_an_error() {
        let (tx, rx) = unbounded();
        drop(rx);
        let mut controller = RateThresholdController::new(0.0, 1, tx);
        let mut result = AnalysisResult::new(AnalyzerId(4), Signal::spike(0));
        result.push_trial(0, 0, [(1, 5.0)]);
        assert!(matches!(
            controller.control(&result),
            Err(AnalysisError::Controller { id: 4, .. })
        ));
    }
}
