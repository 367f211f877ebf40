use std::collections::BTreeMap;

use log::trace;

use super::{AnalysisResult, Analyze, AnalyzerId, Signal, TrialCursor};
use crate::dataset::Dataset;
use crate::drivers::AnalysisError;

/// Mean firing rate (Hz) per sorted unit over each trial's onset..offset window.
pub struct SpikeRateAnalyzer {
    id: AnalyzerId,
    signal: Signal,
    response_delay_ms: f64,
    cursor: TrialCursor,
    result: AnalysisResult,
}

impl SpikeRateAnalyzer {
    /// `response_delay_ms` shifts the counting window to account for response latency.
    pub fn new(signal: Signal, response_delay_ms: f64) -> Self {
        let id = AnalyzerId::next();
        Self {
            id,
            signal,
            response_delay_ms,
            cursor: TrialCursor::default(),
            result: AnalysisResult::new(id, signal),
        }
    }
}

impl Analyze for SpikeRateAnalyzer {
    fn id(&self) -> AnalyzerId {
        self.id
    }

    fn signal(&self) -> Signal {
        self.signal
    }

    fn analyze(&mut self, dataset: &Dataset) -> Result<bool, AnalysisError> {
        let pending = self.cursor.take(dataset);
        if pending.is_empty() {
            return Ok(false);
        }
        for index in pending {
            let (Some(record), Some(timing)) = (dataset.record(index), dataset.timing(index)) else {
                continue;
            };
            let Some(offset) = timing.offset else {
                continue;
            };
            let from = timing.onset + self.response_delay_ms;
            let to = offset + self.response_delay_ms;
            let seconds = (to - from) / 1000.0;
            if seconds <= 0.0 {
                return Err(AnalysisError::Analyzer {
                    id: self.id.0,
                    reason: format!("trial {index} has non-positive duration"),
                });
            }
            let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
            for (_, unit) in dataset.spikes_between(self.signal.channel, from, to) {
                *counts.entry(unit).or_default() += 1;
            }
            trace!("trial {index}: {} units fired", counts.len());
            self.result.push_trial(
                index,
                record.condition,
                counts
                    .into_iter()
                    .map(|(unit, n)| (unit, n as f64 / seconds)),
            );
        }
        Ok(true)
    }

    fn reset(&mut self) {
        self.cursor.reset();
        self.result.clear();
    }

    fn result(&self) -> &AnalysisResult {
        &self.result
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::config::TimingConfig;
    use crate::drivers::SampleBatch;
    use crate::types::ConditionTest;

    fn trial(index: usize, start: f64) -> ConditionTest {
        ConditionTest::new(index, index % 2)
            .with_state("COND", start)
            .with_state("SUFICI", start + 100.0)
    }

    #[test]
    fn rates_follow_finalized_trials() {
        let mut ds = Dataset::new(TimingConfig::default(), 1000.0);
        let mut batch = SampleBatch::default();
        // unit 1 fires 5 times in trial 0, unit 2 fires twice in trial 1
        for t in [10.0, 20.0, 30.0, 40.0, 50.0] {
            batch.push_spike(3, t, 1);
        }
        for t in [210.0, 260.0] {
            batch.push_spike(3, t, 2);
        }
        ds.append_samples(batch);
        let mut analyzer = SpikeRateAnalyzer::new(Signal::spike(3), 0.0);
        assert!(!analyzer.analyze(&ds).unwrap());

        assert!(ds.record_trial(trial(0, 0.0), 150.0));
        assert!(analyzer.analyze(&ds).unwrap());
        assert!(!analyzer.analyze(&ds).unwrap());
        assert!(ds.record_trial(trial(1, 200.0), 350.0));
        assert!(analyzer.analyze(&ds).unwrap());

        let result = analyzer.result();
        assert_eq!(result.trials, vec![0, 1]);
        assert_eq!(result.conditions, vec![0, 1]);
        assert_relative_eq!(result.values[&1][0], 50.0);
        assert_relative_eq!(result.values[&1][1], 0.0);
        assert_relative_eq!(result.values[&2][1], 20.0);
    }

    #[test]
    fn evicted_trials_are_skipped_and_reset_restarts() {
        let mut ds = Dataset::new(TimingConfig::default(), 1000.0);
        for i in 0..3 {
            assert!(ds.record_trial(trial(i, i as f64 * 200.0), i as f64 * 200.0 + 150.0));
        }
        ds.evict_before(2);
        let mut analyzer = SpikeRateAnalyzer::new(Signal::spike(0), 0.0);
        assert!(analyzer.analyze(&ds).unwrap());
        assert_eq!(analyzer.result().trials, vec![2]);
        analyzer.reset();
        assert_eq!(analyzer.result().trial_count(), 0);
        assert!(analyzer.analyze(&ds).unwrap());
        assert_eq!(analyzer.result().trials, vec![2]);
    }
}
