use log::debug;

use super::{AnalysisResult, Analyze, AnalyzerId, Signal, TrialCursor};
use crate::dataset::Dataset;
use crate::drivers::{AnalysisError, SpectrumBuilder};

/// Band power of one LFP channel over each trial window, reported as unit 0.
pub struct LfpPowerAnalyzer {
    id: AnalyzerId,
    signal: Signal,
    low_hz: f32,
    high_hz: f32,
    cursor: TrialCursor,
    result: AnalysisResult,
}

impl LfpPowerAnalyzer {
    pub fn new(signal: Signal, low_hz: f32, high_hz: f32) -> Self {
        let id = AnalyzerId::next();
        Self {
            id,
            signal,
            low_hz,
            high_hz,
            cursor: TrialCursor::default(),
            result: AnalysisResult::new(id, signal),
        }
    }

    pub fn band(&self) -> (f32, f32) {
        (self.low_hz, self.high_hz)
    }
}

impl Analyze for LfpPowerAnalyzer {
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
        let fs = dataset.lfp_sample_rate_hz() as f32;
        for index in pending {
            let (Some(record), Some(timing)) = (dataset.record(index), dataset.timing(index)) else {
                continue;
            };
            let Some(offset) = timing.offset else {
                continue;
            };
            let window = dataset.lfp_window(self.signal.channel, timing.onset, offset);
            let power = if window.is_empty() {
                debug!("trial {index}: no LFP samples on channel {}", self.signal.channel);
                0.0
            } else {
                SpectrumBuilder::fitting(window.len())?
                    .compute(&window, fs)
                    .band_power(self.low_hz, self.high_hz)
            };
            self.result
                .push_trial(index, record.condition, [(0, power as f64)]);
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
    use std::f32::consts::PI;

    use super::*;
    use crate::config::TimingConfig;
    use crate::drivers::{LfpTrace, SampleBatch};
    use crate::types::ConditionTest;

    #[test]
    fn gamma_trial_outscores_quiet_trial() {
        let fs = 1000.0;
        let mut ds = Dataset::new(TimingConfig::default(), fs);
        // 60 Hz burst during trial 0, flat signal during trial 1
        let samples: Vec<f32> = (0..1024)
            .map(|n| {
                if n < 256 {
                    (2.0 * PI * 60.0 * n as f32 / fs as f32).sin()
                } else {
                    0.0
                }
            })
            .collect();
        let mut batch = SampleBatch::default();
        batch.push_lfp(LfpTrace {
            start_time: 0.0,
            samples: vec![samples],
        });
        ds.append_samples(batch);
        for (i, start) in [(0, 0.0), (1, 512.0)] {
            let test = ConditionTest::new(i, i)
                .with_state("COND", start)
                .with_state("SUFICI", start + 256.0);
            assert!(ds.record_trial(test, start + 300.0));
        }
        let mut analyzer = LfpPowerAnalyzer::new(Signal::lfp(0), 30.0, 80.0);
        assert!(analyzer.analyze(&ds).unwrap());
        let power = &analyzer.result().values[&0];
        assert_eq!(power.len(), 2);
        assert!(power[0] > 1e-3);
        assert!(power[1] < 1e-9);
    }

    #[test]
    fn missing_channel_reports_zero_power() {
        let mut ds = Dataset::new(TimingConfig::default(), 1000.0);
        let test = ConditionTest::new(0, 0)
            .with_state("COND", 0.0)
            .with_state("SUFICI", 100.0);
        assert!(ds.record_trial(test, 120.0));
        let mut analyzer = LfpPowerAnalyzer::new(Signal::lfp(5), 1.0, 10.0);
        assert!(analyzer.analyze(&ds).unwrap());
        assert_eq!(analyzer.result().values[&0], vec![0.0]);
        assert_eq!(analyzer.band(), (1.0, 10.0));
    }
}
