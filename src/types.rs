use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Everything the experiment reports about one finished condition test.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionTest {
    /// Absolute trial sequence number, starting at 0.
    pub index: usize,
    /// Row of the experiment's condition table.
    pub condition: usize,
    pub repeat: Option<u32>,
    /// Named state transitions in experiment clock (ms), in order of occurrence.
    pub state_times: Vec<(String, f64)>,
    /// States that emitted a sync pulse, in order of occurrence.
    pub sync_events: Vec<String>,
}

impl ConditionTest {
    pub fn new(index: usize, condition: usize) -> Self {
        Self {
            index,
            condition,
            ..Self::default()
        }
    }

    pub fn with_state(mut self, name: impl Into<String>, time: f64) -> Self {
        self.state_times.push((name.into(), time));
        self
    }

    pub fn with_sync_event(mut self, name: impl Into<String>) -> Self {
        self.sync_events.push(name.into());
        self
    }

    /// First timestamp recorded for `state`.
    pub fn state_time(&self, state: &str) -> Option<f64> {
        self.state_times
            .iter()
            .find(|(name, _)| name == state)
            .map(|(_, t)| *t)
    }
}

/// Completion notice for one trial, in experiment clock.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialCompletion {
    pub index: usize,
    pub time: f64,
    /// Evict old history once this trial is analyzed.
    pub clear: bool,
}

/// Messages delivered by the experiment, processed strictly in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub enum ExperimentMessage {
    ConditionTest(ConditionTest),
    TrialCompleted(TrialCompletion),
    ExperimentEnd,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum EngineState {
    Idle,
    Running,
    Stopping,
}

impl EngineState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            EngineState::Idle => 0,
            EngineState::Running => 1,
            EngineState::Stopping => 2,
        }
    }

    pub(crate) fn from_u8(val: u8) -> Self {
        match val {
            1 => EngineState::Running,
            2 => EngineState::Stopping,
            _ => EngineState::Idle,
        }
    }
}

/// Where a trial's onset/offset came from.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Serialize, Deserialize)]
pub enum TimingSource {
    /// Read directly from a consistent mark channel.
    Mark,
    /// Single mark edge found near the model estimate.
    Recovered,
    /// Clock model estimate from state timestamps.
    Estimated,
    /// Offset taken from the next trial's onset (no inter-condition interval).
    Chained,
}

/// Progress counters shared between the engine worker and result consumers.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub events_enqueued: AtomicU64,
    pub trials_analyzed: AtomicU64,
    pub visualizations_done: AtomicU64,
    pub analysis_failures: AtomicU64,
}

impl EngineCounters {
    pub fn reset(&self) {
        self.events_enqueued.store(0, Ordering::Relaxed);
        self.trials_analyzed.store(0, Ordering::Relaxed);
        self.visualizations_done.store(0, Ordering::Relaxed);
        self.analysis_failures.store(0, Ordering::Relaxed);
    }
}
