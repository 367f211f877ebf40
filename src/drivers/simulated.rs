use std::time::Instant;
use crossbeam_channel::{unbounded, Receiver, Sender};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use crate::drivers::{AnalysisError, Cadence, LfpTrace, SampleBatch, SignalSource};
/// Settings for [`SimulatedSource`].
#[derive(Clone, Debug)]
pub struct SimulatedConfig {
    pub spike_channels: usize,
    pub units_per_channel: u32,
    pub rate_hz: f64,
    pub lfp_channels: usize,
    pub lfp_sample_rate_hz: f64,
    pub lfp_rhythm_hz: f64,
    pub seed: u64,
}
impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            spike_channels: 4,
            units_per_channel: 2,
            rate_hz: 20.0,
            lfp_channels: 2,
            lfp_sample_rate_hz: 1000.0,
            lfp_rhythm_hz: 10.0,
            seed: 7,
        }
    }
}
/// Handle for writing digital edges into a running [`SimulatedSource`].
#[derive(Clone)]
pub struct DigitalWriter {
    tx: Sender<(usize, u32)>,
}
impl DigitalWriter {
    /// Records an edge on `channel` at the source's current device time.
    pub fn edge(&self, channel: usize, value: u32) {
        let _ = self.tx.send((channel, value));
    }
}
/// Free-running source producing Poisson spikes and a noisy LFP rhythm in real time.
pub struct SimulatedSource {
    config: SimulatedConfig,
    epoch: Instant,
    rng: StdRng,
    last_fast: f64,
    last_slow: f64,
    edges: Receiver<(usize, u32)>,
    writer: DigitalWriter,
    running: bool,
}
impl SimulatedSource {
    pub fn new(config: SimulatedConfig) -> Self {
        let (tx, rx) = unbounded();
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            epoch: Instant::now(),
            last_fast: 0.0,
            last_slow: 0.0,
            edges: rx,
            writer: DigitalWriter { tx },
            running: false,
        }
    }
    pub fn digital_writer(&self) -> DigitalWriter {
        self.writer.clone()
    }
    fn collect_spikes(&mut self, now: f64, batch: &mut SampleBatch) {
        let span = now - self.last_fast;
        if span <= 0.0 {
            return;
        }
        let p = self.config.rate_hz * span / 1000.0;
        for channel in 0..self.config.spike_channels {
            let mut fired = Vec::new();
            for unit in 1..=self.config.units_per_channel {
                if self.rng.gen::<f64>() < p {
                    fired.push((self.last_fast + self.rng.gen::<f64>() * span, unit));
                }
            }
            fired.sort_by(|a, b| a.0.total_cmp(&b.0));
            for (time, unit) in fired {
                batch.push_spike(channel, time, unit);
            }
        }
        while let Ok((channel, value)) = self.edges.try_recv() {
            batch.push_digital(channel, now, value);
        }
        self.last_fast = now;
    }
    fn collect_lfp(&mut self, now: f64, batch: &mut SampleBatch) {
        let dt = 1000.0 / self.config.lfp_sample_rate_hz;
        let count = ((now - self.last_slow) / dt).floor() as usize;
        if count == 0 || self.config.lfp_channels == 0 {
            return;
        }
        let start_time = self.last_slow;
        let omega = 2.0 * std::f64::consts::PI * self.config.lfp_rhythm_hz / 1000.0;
        let samples = (0..self.config.lfp_channels)
            .map(|_| {
                (0..count)
                    .map(|i| {
                        let t = start_time + i as f64 * dt;
                        ((omega * t).sin() * 50.0 + self.rng.gen_range(-5.0..5.0)) as f32
                    })
                    .collect()
            })
            .collect();
        batch.push_lfp(LfpTrace { start_time, samples });
        self.last_slow = start_time + count as f64 * dt;
    }
}
impl SignalSource for SimulatedSource {
    fn time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }
    fn poll(&mut self, cadence: Cadence, batch: &mut SampleBatch) -> Result<(), AnalysisError> {
        if !self.running {
            return Ok(());
        }
        let now = self.time();
        match cadence {
            Cadence::Fast => self.collect_spikes(now, batch),
            Cadence::Slow => self.collect_lfp(now, batch),
        }
        Ok(())
    }
    fn start(&mut self, clean: bool) -> Result<(), AnalysisError> {
        let now = self.time();
        if clean || !self.running {
            self.last_fast = now;
            self.last_slow = now;
        }
        if clean {
            while self.edges.try_recv().is_ok() {}
        }
        self.running = true;
        Ok(())
    }
    fn stop(&mut self, collect_remaining: bool) -> Result<(), AnalysisError> {
        if !collect_remaining {
            while self.edges.try_recv().is_ok() {}
        }
        self.running = false;
        Ok(())
    }
    fn is_alive(&self) -> bool {
        true
    }
}
