//! Pluggable analyzers and the result snapshots they publish.

pub mod controller;
pub mod lfp_power;
pub mod queue;
pub mod spike_rate;
pub mod table;

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::drivers::AnalysisError;
pub use controller::{ControlSignal, RateThresholdController};
pub use lfp_power::LfpPowerAnalyzer;
pub use queue::{result_queue, ResultConsumer, ResultProducer, ResultStream};
pub use spike_rate::SpikeRateAnalyzer;
pub use table::{AnalyzerTable, PassReport};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AnalyzerId(pub u64);

impl AnalyzerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        AnalyzerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    #[default]
    Spike,
    Lfp,
    Digital,
}

/// Channel an analyzer reads from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signal {
    pub channel: usize,
    pub kind: SignalType,
}

impl Signal {
    pub fn spike(channel: usize) -> Self {
        Self {
            channel,
            kind: SignalType::Spike,
        }
    }

    pub fn lfp(channel: usize) -> Self {
        Self {
            channel,
            kind: SignalType::Lfp,
        }
    }
}

/// Per-trial values keyed by unit id. Cloning yields an independent snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub analyzer: AnalyzerId,
    pub signal: Signal,
    /// Absolute trial index of every column.
    pub trials: Vec<usize>,
    pub conditions: Vec<usize>,
    pub values: BTreeMap<u32, Vec<f64>>,
}

impl AnalysisResult {
    pub fn new(analyzer: AnalyzerId, signal: Signal) -> Self {
        Self {
            analyzer,
            signal,
            ..Self::default()
        }
    }

    pub fn trial_count(&self) -> usize {
        self.trials.len()
    }

    /// Appends one trial column. Units absent from `values` get 0 for this trial and
    /// units seen for the first time get 0 for all earlier trials.
    pub fn push_trial(
        &mut self,
        trial: usize,
        condition: usize,
        values: impl IntoIterator<Item = (u32, f64)>,
    ) {
        let previous = self.trials.len();
        self.trials.push(trial);
        self.conditions.push(condition);
        for (unit, value) in values {
            let column = self
                .values
                .entry(unit)
                .or_insert_with(|| vec![0.0; previous]);
            column.push(value);
        }
        for column in self.values.values_mut() {
            column.resize(previous + 1, 0.0);
        }
    }

    /// Mean value of `unit` for every condition index.
    pub fn condition_means(&self, unit: u32) -> BTreeMap<usize, f64> {
        let mut sums: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
        if let Some(column) = self.values.get(&unit) {
            for (condition, value) in self.conditions.iter().zip(column) {
                let entry = sums.entry(*condition).or_default();
                entry.0 += value;
                entry.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(condition, (sum, n))| (condition, sum / n as f64))
            .collect()
    }

    pub fn clear(&mut self) {
        self.trials.clear();
        self.conditions.clear();
        self.values.clear();
    }
}

/// An online analysis over the growing dataset.
///
/// `analyze` is called once per engine pass and must only process trials it has not
/// seen yet. It returns `true` when its result changed.
pub trait Analyze: Send {
    fn id(&self) -> AnalyzerId;
    fn signal(&self) -> Signal;
    fn analyze(&mut self, dataset: &Dataset) -> Result<bool, AnalysisError>;
    fn reset(&mut self);
    fn result(&self) -> &AnalysisResult;
}

/// Acts on fresh results inside the analysis pass, right after its analyzer.
pub trait Controller: Send {
    fn control(&mut self, result: &AnalysisResult) -> Result<(), AnalysisError>;
    /// Forgets everything learned this session.
    fn reset(&mut self) {}
}

/// Consumes result snapshots on the consumer thread.
pub trait Visualizer: Send {
    fn visualize(&mut self, result: &AnalysisResult) -> Result<(), AnalysisError>;
    fn reset(&mut self) {}
}

/// Tracks which finalized trials an analyzer has already consumed.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrialCursor {
    consumed: usize,
}

impl TrialCursor {
    /// Trials finalized since the last call; evicted trials are skipped.
    pub fn take(&mut self, dataset: &Dataset) -> Range<usize> {
        let start = self.consumed.max(dataset.first_trial());
        let end = dataset.finalized_count().max(start);
        self.consumed = end;
        start..end
    }

    pub fn reset(&mut self) {
        self.consumed = 0;
    }
}

/// Closed set of built-in analyzers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AnalyzerKind {
    SpikeRate { response_delay_ms: f64 },
    LfpPower { low_hz: f32, high_hz: f32 },
}

impl AnalyzerKind {
    pub fn signal_type(&self) -> SignalType {
        match self {
            AnalyzerKind::SpikeRate { .. } => SignalType::Spike,
            AnalyzerKind::LfpPower { .. } => SignalType::Lfp,
        }
    }

    /// Default analyzers for a signal type.
    pub fn for_signal(kind: SignalType) -> Vec<AnalyzerKind> {
        match kind {
            SignalType::Spike => vec![AnalyzerKind::SpikeRate {
                response_delay_ms: 0.0,
            }],
            SignalType::Lfp => vec![AnalyzerKind::LfpPower {
                low_hz: 30.0,
                high_hz: 80.0,
            }],
            SignalType::Digital => Vec::new(),
        }
    }

    pub fn build(&self, channel: usize) -> Result<Box<dyn Analyze>, AnalysisError> {
        Ok(match *self {
            AnalyzerKind::SpikeRate { response_delay_ms } => Box::new(SpikeRateAnalyzer::new(
                Signal::spike(channel),
                response_delay_ms,
            )),
            AnalyzerKind::LfpPower { low_hz, high_hz } => {
                if !(low_hz >= 0.0 && high_hz > low_hz) {
                    return Err(AnalysisError::Config(format!(
                        "invalid LFP band {low_hz}..{high_hz} Hz"
                    )));
                }
                Box::new(LfpPowerAnalyzer::new(Signal::lfp(channel), low_hz, high_hz))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_units_are_back_filled() {
        let mut result = AnalysisResult::new(AnalyzerId(1), Signal::spike(0));
        result.push_trial(0, 0, [(1, 5.0)]);
        result.push_trial(1, 1, [(2, 3.0)]);
        result.push_trial(2, 0, [(1, 7.0), (2, 1.0)]);
        assert_eq!(result.values[&1], vec![5.0, 0.0, 7.0]);
        assert_eq!(result.values[&2], vec![0.0, 3.0, 1.0]);
        let means = result.condition_means(1);
        assert_eq!(means[&0], 6.0);
        assert_eq!(means[&1], 0.0);
    }

    #[test]
    fn snapshot_does_not_alias_live_result() {
        let mut live = AnalysisResult::new(AnalyzerId(2), Signal::spike(1));
        live.push_trial(0, 0, [(1, 1.0)]);
        let frozen = live.clone();
        live.push_trial(1, 0, [(1, 2.0)]);
        assert_eq!(frozen.trial_count(), 1);
        assert_eq!(frozen.values[&1], vec![1.0]);
    }

    #[test]
    fn factory_builds_matching_signal() {
        let analyzer = AnalyzerKind::SpikeRate {
            response_delay_ms: 5.0,
        }
        .build(7)
        .unwrap();
        assert_eq!(analyzer.signal(), Signal::spike(7));
        for kind in AnalyzerKind::for_signal(SignalType::Lfp) {
            assert_eq!(kind.signal_type(), SignalType::Lfp);
            assert_eq!(kind.build(2).unwrap().signal().kind, SignalType::Lfp);
        }
        assert!(AnalyzerKind::LfpPower {
            low_hz: 50.0,
            high_hz: 10.0
        }
        .build(0)
        .is_err());
        assert_ne!(AnalyzerId::next(), AnalyzerId::next());
    }
}
