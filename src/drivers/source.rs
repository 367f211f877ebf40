use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use crate::drivers::AnalysisError;
/// Contiguous block of LFP samples starting at `start_time` (device clock, ms).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LfpTrace {
    pub start_time: f64,
    pub samples: Vec<Vec<f32>>, // channels x samples
}
impl LfpTrace {
    pub fn num_channels(&self) -> usize {
        self.samples.len()
    }
    pub fn samples_per_channel(&self) -> usize {
        self.samples.first().map(|c| c.len()).unwrap_or(0)
    }
    pub fn end_time(&self, sample_rate_hz: f64) -> f64 {
        self.start_time + self.samples_per_channel() as f64 * 1000.0 / sample_rate_hz
    }
}
/// Samples collected from a signal source between two drains.
///
/// Spike and digital vectors are indexed by channel and kept time-ordered.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SampleBatch {
    pub spikes: Vec<Vec<f64>>,
    pub units: Vec<Vec<u32>>,
    pub lfp: Vec<LfpTrace>,
    pub digital_times: Vec<Vec<f64>>,
    pub digital_values: Vec<Vec<u32>>,
}
impl SampleBatch {
    pub fn push_spike(&mut self, channel: usize, time: f64, unit: u32) {
        if self.spikes.len() <= channel {
            self.spikes.resize_with(channel + 1, Vec::new);
            self.units.resize_with(channel + 1, Vec::new);
        }
        self.spikes[channel].push(time);
        self.units[channel].push(unit);
    }
    pub fn push_digital(&mut self, channel: usize, time: f64, value: u32) {
        if self.digital_times.len() <= channel {
            self.digital_times.resize_with(channel + 1, Vec::new);
            self.digital_values.resize_with(channel + 1, Vec::new);
        }
        self.digital_times[channel].push(time);
        self.digital_values[channel].push(value);
    }
    pub fn push_lfp(&mut self, trace: LfpTrace) {
        self.lfp.push(trace);
    }
    /// Appends everything in `other` after the samples already held.
    pub fn extend(&mut self, other: SampleBatch) {
        for (channel, (times, units)) in other.spikes.into_iter().zip(other.units).enumerate() {
            for (time, unit) in times.into_iter().zip(units) {
                self.push_spike(channel, time, unit);
            }
        }
        for (channel, (times, values)) in other
            .digital_times
            .into_iter()
            .zip(other.digital_values)
            .enumerate()
        {
            for (time, value) in times.into_iter().zip(values) {
                self.push_digital(channel, time, value);
            }
        }
        self.lfp.extend(other.lfp);
    }
    pub fn spike_count(&self) -> usize {
        self.spikes.iter().map(Vec::len).sum()
    }
    pub fn digital_count(&self) -> usize {
        self.digital_times.iter().map(Vec::len).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.spike_count() == 0 && self.digital_count() == 0 && self.lfp.is_empty()
    }
}
/// Which class of channels a poll collects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cadence {
    /// Spikes and digital inputs.
    Fast,
    /// Continuous LFP traces.
    Slow,
}
/// Device driver contract. Implementations are owned by a
/// [`SampleCache`](crate::drivers::SampleCache), which serializes every call.
pub trait SignalSource: Send {
    /// Current device clock in milliseconds.
    fn time(&self) -> f64;
    /// Moves newly available samples of the given class into `batch`.
    fn poll(&mut self, cadence: Cadence, batch: &mut SampleBatch) -> Result<(), AnalysisError>;
    fn start(&mut self, clean: bool) -> Result<(), AnalysisError>;
    fn stop(&mut self, collect_remaining: bool) -> Result<(), AnalysisError>;
    fn restart(&mut self, clean_all: bool) -> Result<(), AnalysisError> {
        self.stop(false)?;
        self.start(clean_all)
    }
    fn is_alive(&self) -> bool;
}
/// Device clock that tests and playback sources can move by hand.
#[derive(Clone, Debug, Default)]
pub struct SourceClock(Arc<AtomicU64>);
impl SourceClock {
    pub fn new(time: f64) -> Self {
        Self(Arc::new(AtomicU64::new(time.to_bits())))
    }
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
    pub fn set(&self, time: f64) {
        self.0.store(time.to_bits(), Ordering::Release);
    }
    pub fn advance(&self, delta: f64) {
        self.set(self.get() + delta);
    }
}
/// Handle used to push batches into a [`ManualSource`] after it was moved into a cache.
#[derive(Clone)]
pub struct ManualFeed {
    queue: Arc<Mutex<VecDeque<SampleBatch>>>,
    clock: SourceClock,
    failing: Arc<AtomicBool>,
}
impl ManualFeed {
    pub fn push(&self, batch: SampleBatch) {
        self.queue.lock().push_back(batch);
    }
    pub fn clock(&self) -> &SourceClock {
        &self.clock
    }
    /// Makes every following poll fail until switched off again.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}
/// In-memory source useful for tests and deterministic playback.
pub struct ManualSource {
    feed: ManualFeed,
    running: bool,
}
impl ManualSource {
    pub fn new(batches: impl IntoIterator<Item = SampleBatch>) -> Self {
        Self {
            feed: ManualFeed {
                queue: Arc::new(Mutex::new(batches.into_iter().collect())),
                clock: SourceClock::new(0.0),
                failing: Arc::new(AtomicBool::new(false)),
            },
            running: false,
        }
    }
    pub fn feed(&self) -> ManualFeed {
        self.feed.clone()
    }
}
impl SignalSource for ManualSource {
    fn time(&self) -> f64 {
        self.feed.clock.get()
    }
    fn poll(&mut self, cadence: Cadence, batch: &mut SampleBatch) -> Result<(), AnalysisError> {
        if self.feed.failing.load(Ordering::Acquire) {
            return Err(AnalysisError::Poll("scripted failure".into()));
        }
        // Scripted batches carry all classes at once.
        if cadence == Cadence::Fast {
            while let Some(next) = self.feed.queue.lock().pop_front() {
                batch.extend(next);
            }
        }
        Ok(())
    }
    fn start(&mut self, clean: bool) -> Result<(), AnalysisError> {
        if clean {
            self.feed.queue.lock().clear();
        }
        self.running = true;
        Ok(())
    }
    fn stop(&mut self, _collect_remaining: bool) -> Result<(), AnalysisError> {
        self.running = false;
        Ok(())
    }
    fn is_alive(&self) -> bool {
        true
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn batch_grows_channels_on_demand() {
        let mut batch = SampleBatch::default();
        batch.push_spike(3, 1.5, 2);
        batch.push_digital(1, 2.0, 1);
        assert_eq!(batch.spikes.len(), 4);
        assert_eq!(batch.units[3], vec![2]);
        assert_eq!(batch.digital_values.len(), 2);
        assert_eq!(batch.spike_count(), 1);
        assert!(!batch.is_empty());
    }
    #[test]
    fn extend_keeps_channel_order() {
        let mut a = SampleBatch::default();
        a.push_spike(0, 1.0, 1);
        let mut b = SampleBatch::default();
        b.push_spike(0, 2.0, 1);
        b.push_spike(2, 3.0, 4);
        a.extend(b);
        assert_eq!(a.spikes[0], vec![1.0, 2.0]);
        assert_eq!(a.spikes[2], vec![3.0]);
        assert_eq!(a.units[2], vec![4]);
    }
    #[test]
    fn manual_source_replays_batches_on_fast_polls() {
        let mut first = SampleBatch::default();
        first.push_spike(0, 5.0, 1);
        let mut source = ManualSource::new(vec![first]);
        let feed = source.feed();
        let mut out = SampleBatch::default();
        source.poll(Cadence::Slow, &mut out).unwrap();
        assert!(out.is_empty());
        source.poll(Cadence::Fast, &mut out).unwrap();
        assert_eq!(out.spike_count(), 1);
        feed.set_failing(true);
        assert!(source.poll(Cadence::Fast, &mut out).is_err());
        feed.clock().set(42.0);
        assert_eq!(source.time(), 42.0);
    }
    #[test]
    fn lfp_trace_end_time_uses_sample_rate() {
        let trace = LfpTrace {
            start_time: 100.0,
            samples: vec![vec![0.0; 1000]],
        };
        assert_eq!(trace.end_time(1000.0), 1100.0);
    }
}
