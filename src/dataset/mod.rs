//! Append-only record of one recording session.
//!
//! Raw device samples and per-trial derived data live together so that the engine
//! worker can append, reconstruct and evict under one lock.

mod reconstruct;
pub mod timing;

use log::debug;
use serde::Serialize;

use crate::config::TimingConfig;
use crate::drivers::{LfpTrace, SampleBatch};
use crate::types::{ConditionTest, TimingSource};
pub use timing::ClockModel;

/// Condition record of one trial as reported by the experiment.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrialRecord {
    pub index: usize,
    pub condition: usize,
    pub repeat: Option<u32>,
    pub state_times: Vec<(String, f64)>,
    pub sync_events: Vec<String>,
    /// Device time of the completion notice.
    pub completed_at: f64,
    /// Latest device time whose edges may belong to this trial.
    pub horizon: f64,
}

impl TrialRecord {
    pub fn state_time(&self, state: &str) -> Option<f64> {
        self.state_times
            .iter()
            .find(|(name, _)| name == state)
            .map(|(_, t)| *t)
    }
}

/// Reconstructed onset/offset in device clock. The offset is `None` only while it
/// waits for the next trial's onset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TrialTiming {
    pub onset: f64,
    pub onset_source: TimingSource,
    pub offset: Option<f64>,
    pub offset_source: Option<TimingSource>,
}

impl TrialTiming {
    pub fn duration(&self) -> Option<f64> {
        self.offset.map(|off| off - self.onset)
    }
}

/// Device time of one labelled sync event.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventTime {
    pub name: String,
    pub time: f64,
    pub source: TimingSource,
}

pub struct Dataset {
    config: TimingConfig,
    lfp_sample_rate_hz: f64,
    clock: ClockModel,
    clock_zero_locked: bool,

    spikes: Vec<Vec<f64>>,
    units: Vec<Vec<u32>>,
    lfp: Vec<LfpTrace>,
    digital_times: Vec<Vec<f64>>,
    digital_values: Vec<Vec<u32>>,
    // Edges already evicted per digital channel.
    digital_base: Vec<usize>,

    first_trial: usize,
    next_index: usize,
    // Sorted by index; indices the experiment skipped leave gaps.
    trials: Vec<TrialRecord>,
    timings: Vec<TrialTiming>,
    sync_times: Vec<Vec<EventTime>>,
    measure_times: Vec<Vec<EventTime>>,
    sync_cursor: usize,
    measure_cursor: usize,

    mark_ok: bool,
    event_sync_ok: bool,
    event_measure_ok: bool,
    experiment_ended: bool,
}

impl Dataset {
    pub fn new(config: TimingConfig, lfp_sample_rate_hz: f64) -> Self {
        let clock = ClockModel::new(config.clock_zero, config.drift);
        Self {
            config,
            lfp_sample_rate_hz,
            clock,
            clock_zero_locked: false,
            spikes: Vec::new(),
            units: Vec::new(),
            lfp: Vec::new(),
            digital_times: Vec::new(),
            digital_values: Vec::new(),
            digital_base: Vec::new(),
            first_trial: 0,
            next_index: 0,
            trials: Vec::new(),
            timings: Vec::new(),
            sync_times: Vec::new(),
            measure_times: Vec::new(),
            sync_cursor: 0,
            measure_cursor: 0,
            mark_ok: true,
            event_sync_ok: true,
            event_measure_ok: true,
            experiment_ended: false,
        }
    }

    /// Drops everything recorded in this session; configuration survives.
    pub(crate) fn reset(&mut self) {
        let config = self.config.clone();
        *self = Dataset::new(config, self.lfp_sample_rate_hz);
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    pub fn clock(&self) -> ClockModel {
        self.clock
    }

    /// Device time by which every sample of an event at `experiment_time` has arrived.
    pub fn settle_time(&self, experiment_time: f64) -> f64 {
        self.clock.to_device(experiment_time) + self.config.total_latency_ms()
    }

    pub(crate) fn append_samples(&mut self, batch: SampleBatch) {
        for (channel, (times, units)) in batch.spikes.into_iter().zip(batch.units).enumerate() {
            if times.is_empty() {
                continue;
            }
            if self.spikes.len() <= channel {
                self.spikes.resize_with(channel + 1, Vec::new);
                self.units.resize_with(channel + 1, Vec::new);
            }
            self.spikes[channel].extend(times);
            self.units[channel].extend(units);
        }
        for (channel, (times, values)) in batch
            .digital_times
            .into_iter()
            .zip(batch.digital_values)
            .enumerate()
        {
            if times.is_empty() {
                continue;
            }
            if self.digital_times.len() <= channel {
                self.digital_times.resize_with(channel + 1, Vec::new);
                self.digital_values.resize_with(channel + 1, Vec::new);
                self.digital_base.resize(channel + 1, 0);
            }
            self.digital_times[channel].extend(times);
            self.digital_values[channel].extend(values);
        }
        self.lfp.extend(batch.lfp);
        self.lock_clock_zero();
    }

    fn lock_clock_zero(&mut self) {
        if self.clock_zero_locked {
            return;
        }
        let Some(channel) = self.config.start_sync_channel else {
            return;
        };
        if let Some(first) = self.digital_times.get(channel).and_then(|t| t.first()) {
            self.clock.clock_zero = *first;
            self.clock_zero_locked = true;
            debug!("clock zero locked to start sync edge at {first:.3} ms");
        }
    }

    /// Records the condition test of a trial and reconstructs its timing.
    /// Indices may skip ahead; returns `false` for an index at or before one
    /// already recorded.
    pub(crate) fn record_trial(&mut self, test: ConditionTest, completion_time: f64) -> bool {
        if test.index < self.next_index {
            return false;
        }
        if test.index > self.next_index {
            debug!(
                "trials {}..{} were never recorded",
                self.next_index, test.index
            );
        }
        self.next_index = test.index + 1;
        let completed_at = self.clock.to_device(completion_time);
        let horizon = completed_at + self.config.total_latency_ms() + self.config.search_radius_ms;
        self.trials.push(TrialRecord {
            index: test.index,
            condition: test.condition,
            repeat: test.repeat,
            state_times: test.state_times,
            sync_events: test.sync_events,
            completed_at,
            horizon,
        });
        self.reconstruct_last();
        true
    }

    /// Finalizes the pending offset of the last trial, if any.
    pub(crate) fn end_experiment(&mut self) {
        self.experiment_ended = true;
        let nominal = self.config.nominal_duration_ms;
        if let Some(last) = self.timings.last_mut() {
            if last.offset.is_none() {
                last.offset = Some(last.onset + nominal);
                last.offset_source = Some(TimingSource::Estimated);
            }
        }
    }

    pub fn experiment_ended(&self) -> bool {
        self.experiment_ended
    }

    /// Evicts trials before `first_kept` and raw samples older than the first kept trial.
    /// Returns the number of trials removed.
    pub(crate) fn evict_before(&mut self, first_kept: usize) -> usize {
        let first_kept = first_kept.min(self.trial_count().saturating_sub(1));
        if first_kept <= self.first_trial || self.trials.is_empty() {
            return 0;
        }
        let n = self.trials.partition_point(|t| t.index < first_kept);
        let cutoff = self.earliest_time(n);
        self.trials.drain(..n);
        self.timings.drain(..n);
        self.sync_times.drain(..n);
        self.measure_times.drain(..n);
        self.first_trial = first_kept;

        for (times, units) in self.spikes.iter_mut().zip(self.units.iter_mut()) {
            let k = times.partition_point(|t| *t < cutoff);
            times.drain(..k);
            units.drain(..k);
        }
        for ((times, values), base) in self
            .digital_times
            .iter_mut()
            .zip(self.digital_values.iter_mut())
            .zip(self.digital_base.iter_mut())
        {
            let k = times.partition_point(|t| *t < cutoff);
            times.drain(..k);
            values.drain(..k);
            *base += k;
        }
        let fs = self.lfp_sample_rate_hz;
        self.lfp.retain(|trace| trace.end_time(fs) > cutoff);
        debug!("evicted {n} trials, raw samples before {cutoff:.3} ms");
        n
    }

    /// Earliest device time attached to the retained trial at position `pos`.
    fn earliest_time(&self, pos: usize) -> f64 {
        let timing = self.timings[pos].onset;
        self.sync_times[pos]
            .iter()
            .chain(&self.measure_times[pos])
            .map(|e| e.time)
            .fold(timing, f64::min)
    }

    /// One past the highest trial index recorded this session, evicted and
    /// skipped trials included.
    pub fn trial_count(&self) -> usize {
        self.next_index
    }

    /// Absolute index of the oldest retained trial.
    pub fn first_trial(&self) -> usize {
        self.first_trial
    }

    /// Trials below this index have final onset and offset (or were never recorded).
    pub fn finalized_count(&self) -> usize {
        match (self.trials.last(), self.timings.last()) {
            (Some(record), Some(timing)) if timing.offset.is_none() => record.index,
            _ => self.trial_count(),
        }
    }

    fn position(&self, index: usize) -> Option<usize> {
        if index < self.first_trial {
            return None;
        }
        self.trials.binary_search_by_key(&index, |t| t.index).ok()
    }

    pub fn record(&self, index: usize) -> Option<&TrialRecord> {
        self.position(index).map(|pos| &self.trials[pos])
    }

    pub fn timing(&self, index: usize) -> Option<&TrialTiming> {
        self.position(index).map(|pos| &self.timings[pos])
    }

    pub fn sync_times(&self, index: usize) -> Option<&[EventTime]> {
        self.position(index).map(|pos| self.sync_times[pos].as_slice())
    }

    pub fn measure_times(&self, index: usize) -> Option<&[EventTime]> {
        self.position(index).map(|pos| self.measure_times[pos].as_slice())
    }

    /// Condition index of every retained trial.
    pub fn conditions(&self) -> Vec<usize> {
        self.trials.iter().map(|t| t.condition).collect()
    }

    pub fn onsets(&self) -> Vec<f64> {
        self.timings.iter().map(|t| t.onset).collect()
    }

    pub fn offsets(&self) -> Vec<Option<f64>> {
        self.timings.iter().map(|t| t.offset).collect()
    }

    pub fn spike_channels(&self) -> usize {
        self.spikes.len()
    }

    pub fn spikes(&self, channel: usize) -> (&[f64], &[u32]) {
        match (self.spikes.get(channel), self.units.get(channel)) {
            (Some(times), Some(units)) => (times, units),
            _ => (&[], &[]),
        }
    }

    /// Spikes with `from <= time < to` on one channel.
    pub fn spikes_between(
        &self,
        channel: usize,
        from: f64,
        to: f64,
    ) -> impl Iterator<Item = (f64, u32)> + '_ {
        let (times, units) = self.spikes(channel);
        let lo = times.partition_point(|t| *t < from);
        let hi = times.partition_point(|t| *t < to);
        times[lo..hi].iter().copied().zip(units[lo..hi].iter().copied())
    }

    pub fn digital(&self, channel: usize) -> (&[f64], &[u32]) {
        match (self.digital_times.get(channel), self.digital_values.get(channel)) {
            (Some(times), Some(values)) => (times, values),
            _ => (&[], &[]),
        }
    }

    pub fn lfp_sample_rate_hz(&self) -> f64 {
        self.lfp_sample_rate_hz
    }

    pub fn lfp_traces(&self) -> &[LfpTrace] {
        &self.lfp
    }

    /// LFP samples of `channel` with `from <= time < to`, concatenated across traces.
    pub fn lfp_window(&self, channel: usize, from: f64, to: f64) -> Vec<f32> {
        let dt = 1000.0 / self.lfp_sample_rate_hz;
        let mut out = Vec::new();
        for trace in &self.lfp {
            let Some(samples) = trace.samples.get(channel) else {
                continue;
            };
            if trace.end_time(self.lfp_sample_rate_hz) <= from || trace.start_time >= to {
                continue;
            }
            let lo = ((from - trace.start_time) / dt).ceil().max(0.0) as usize;
            let hi = (((to - trace.start_time) / dt).ceil().max(0.0) as usize).min(samples.len());
            if lo < hi {
                out.extend_from_slice(&samples[lo..hi]);
            }
        }
        out
    }

    /// False once the mark channel failed its count or level check this session.
    pub fn mark_ok(&self) -> bool {
        self.mark_ok
    }

    pub fn event_sync_ok(&self) -> bool {
        self.event_sync_ok
    }

    pub fn event_measure_ok(&self) -> bool {
        self.event_measure_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial(index: usize, cond: f64, off: f64) -> ConditionTest {
        ConditionTest::new(index, index % 2)
            .with_state("COND", cond)
            .with_state("SUFICI", off)
    }

    #[test]
    fn stale_trials_are_rejected() {
        let mut ds = Dataset::new(TimingConfig::default(), 1000.0);
        assert!(ds.record_trial(trial(0, 10.0, 20.0), 25.0));
        assert!(!ds.record_trial(trial(0, 10.0, 20.0), 25.0));
        assert_eq!(ds.trial_count(), 1);
    }

    #[test]
    fn skipped_indices_leave_a_gap() {
        let mut ds = Dataset::new(TimingConfig::default(), 1000.0);
        assert!(ds.record_trial(trial(0, 10.0, 20.0), 25.0));
        assert!(ds.record_trial(trial(2, 110.0, 120.0), 125.0));
        assert!(!ds.record_trial(trial(1, 60.0, 70.0), 75.0));
        assert!(ds.record_trial(trial(3, 210.0, 220.0), 225.0));
        assert_eq!(ds.trial_count(), 4);
        assert_eq!(ds.finalized_count(), 4);
        assert!(ds.record(1).is_none());
        assert_eq!(ds.record(2).map(|r| r.condition), Some(0));
        assert_eq!(ds.timing(3).map(|t| t.onset), Some(210.0));
        assert_eq!(ds.conditions(), vec![0, 0, 1]);

        assert_eq!(ds.evict_before(2), 1);
        assert_eq!(ds.first_trial(), 2);
        assert!(ds.record(0).is_none());
        assert_eq!(ds.record(2).map(|r| r.index), Some(2));
    }

    #[test]
    fn eviction_drops_old_trials_and_samples() {
        let mut ds = Dataset::new(TimingConfig::default(), 1000.0);
        let mut batch = SampleBatch::default();
        for t in 0..100 {
            batch.push_spike(0, t as f64 * 10.0, 1);
        }
        batch.push_digital(4, 5.0, 1);
        batch.push_digital(4, 500.0, 0);
        batch.push_lfp(LfpTrace {
            start_time: 0.0,
            samples: vec![vec![0.0; 100]],
        });
        batch.push_lfp(LfpTrace {
            start_time: 350.0,
            samples: vec![vec![0.0; 100]],
        });
        ds.append_samples(batch);
        for i in 0..4 {
            let start = i as f64 * 200.0;
            assert!(ds.record_trial(trial(i, start + 10.0, start + 110.0), start + 150.0));
        }
        assert_eq!(ds.evict_before(2), 2);
        assert_eq!(ds.first_trial(), 2);
        assert_eq!(ds.trial_count(), 4);
        assert!(ds.record(1).is_none());
        assert_eq!(ds.record(2).map(|r| r.index), Some(2));
        let (times, units) = ds.spikes(0);
        assert_eq!(times.first(), Some(&410.0));
        assert_eq!(times.len(), units.len());
        assert_eq!(ds.digital(4).0, &[500.0]);
        assert_eq!(ds.lfp_traces().len(), 1);
        assert_eq!(ds.evict_before(1), 0);
    }

    #[test]
    fn spikes_between_is_half_open() {
        let mut ds = Dataset::new(TimingConfig::default(), 1000.0);
        let mut batch = SampleBatch::default();
        for t in [1.0, 2.0, 3.0, 4.0] {
            batch.push_spike(2, t, t as u32);
        }
        ds.append_samples(batch);
        let picked: Vec<_> = ds.spikes_between(2, 2.0, 4.0).collect();
        assert_eq!(picked, vec![(2.0, 2), (3.0, 3)]);
        assert_eq!(ds.spikes_between(9, 0.0, 10.0).count(), 0);
    }

    #[test]
    fn lfp_window_spans_traces() {
        let mut ds = Dataset::new(TimingConfig::default(), 1000.0);
        let mut batch = SampleBatch::default();
        batch.push_lfp(LfpTrace {
            start_time: 0.0,
            samples: vec![(0..10).map(|v| v as f32).collect()],
        });
        batch.push_lfp(LfpTrace {
            start_time: 10.0,
            samples: vec![(10..20).map(|v| v as f32).collect()],
        });
        ds.append_samples(batch);
        let window = ds.lfp_window(0, 7.0, 13.0);
        assert_eq!(window, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn start_sync_edge_sets_clock_zero() {
        let config = TimingConfig {
            start_sync_channel: Some(1),
            ..TimingConfig::default()
        };
        let mut ds = Dataset::new(config, 1000.0);
        let mut batch = SampleBatch::default();
        batch.push_digital(1, 250.0, 1);
        ds.append_samples(batch);
        let mut later = SampleBatch::default();
        later.push_digital(1, 900.0, 0);
        ds.append_samples(later);
        assert_eq!(ds.clock().clock_zero, 250.0);
        assert!(ds.record_trial(trial(0, 10.0, 20.0), 30.0));
        assert_eq!(ds.onsets(), vec![260.0]);
    }

    #[test]
    fn reset_keeps_configuration() {
        let config = TimingConfig {
            drift: 0.5,
            ..TimingConfig::default()
        };
        let mut ds = Dataset::new(config, 500.0);
        assert!(ds.record_trial(trial(0, 10.0, 20.0), 30.0));
        ds.reset();
        assert_eq!(ds.trial_count(), 0);
        assert_eq!(ds.config().drift, 0.5);
        assert_eq!(ds.lfp_sample_rate_hz(), 500.0);
    }
}
