use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::drivers::{AnalysisError, PollSchedule};
/// Clock model and channel layout used to reconstruct trial timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Fractional rate mismatch of the experiment clock against the device clock.
    pub drift: f64,
    /// Device time of experiment time zero.
    pub clock_zero: f64,
    /// Fixed latency between a state command and its physical effect.
    pub display_latency_ms: f64,
    /// Extra latency before device samples reach the host.
    pub pipeline_latency_ms: f64,
    /// Latency of the measure channel (e.g. photodiode) on top of the display latency.
    pub measure_latency_ms: f64,
    pub search_radius_ms: f64,
    pub mark_channel: Option<usize>,
    pub event_sync_channel: Option<usize>,
    pub event_measure_channel: Option<usize>,
    pub start_sync_channel: Option<usize>,
    pub onset_state: String,
    pub offset_state: String,
    pub nominal_duration_ms: f64,
    pub duration_tolerance_ms: f64,
    /// Zero means trials follow each other without an interval.
    pub inter_condition_interval_ms: f64,
    pub recalibrate_drift: bool,
    pub drift_fit_min_trials: usize,
}
impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            drift: 0.0,
            clock_zero: 0.0,
            display_latency_ms: 0.0,
            pipeline_latency_ms: 0.0,
            measure_latency_ms: 0.0,
            search_radius_ms: 20.0,
            mark_channel: None,
            event_sync_channel: None,
            event_measure_channel: None,
            start_sync_channel: None,
            onset_state: "COND".into(),
            offset_state: "SUFICI".into(),
            nominal_duration_ms: 1000.0,
            duration_tolerance_ms: 20.0,
            inter_condition_interval_ms: 500.0,
            recalibrate_drift: false,
            drift_fit_min_trials: 5,
        }
    }
}
impl TimingConfig {
    pub fn total_latency_ms(&self) -> f64 {
        self.display_latency_ms + self.pipeline_latency_ms
    }
    pub fn has_inter_condition_interval(&self) -> bool {
        self.inter_condition_interval_ms > 0.0
    }
}
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub fast_period_ms: u64,
    pub slow_period_ms: u64,
    pub lfp_sample_rate_hz: f64,
}
impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            fast_period_ms: 5,
            slow_period_ms: 20,
            lfp_sample_rate_hz: 1000.0,
        }
    }
}
impl AcquisitionConfig {
    pub fn schedule(&self) -> PollSchedule {
        PollSchedule::new(self.fast_period_ms, self.slow_period_ms)
    }
}
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub poll_sleep_ms: u64,
    pub clear_interval: usize,
    pub retain_count: usize,
    pub result_queue_capacity: usize,
    pub timing: TimingConfig,
    pub acquisition: AcquisitionConfig,
}
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_sleep_ms: 1,
            clear_interval: 20,
            retain_count: 10,
            result_queue_capacity: 64,
            timing: TimingConfig::default(),
            acquisition: AcquisitionConfig::default(),
        }
    }
}
impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, AnalysisError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        Ok(config.validated())
    }
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AnalysisError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|err| AnalysisError::Config(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&text)
    }
    /// Clamps every value to its allowed minimum.
    pub fn validated(mut self) -> Self {
        self.poll_sleep_ms = self.poll_sleep_ms.max(1);
        self.clear_interval = self.clear_interval.max(1);
        self.result_queue_capacity = self.result_queue_capacity.max(1);
        let t = &mut self.timing;
        t.display_latency_ms = t.display_latency_ms.max(0.0);
        t.pipeline_latency_ms = t.pipeline_latency_ms.max(0.0);
        t.measure_latency_ms = t.measure_latency_ms.max(0.0);
        t.search_radius_ms = t.search_radius_ms.max(0.0);
        t.nominal_duration_ms = t.nominal_duration_ms.max(1.0);
        t.duration_tolerance_ms = t.duration_tolerance_ms.max(0.0);
        t.inter_condition_interval_ms = t.inter_condition_interval_ms.max(0.0);
        t.drift_fit_min_trials = t.drift_fit_min_trials.max(2);
        self.acquisition.fast_period_ms = self.acquisition.fast_period_ms.max(1);
        self.acquisition.slow_period_ms = self.acquisition.slow_period_ms.max(1);
        if self.acquisition.lfp_sample_rate_hz <= 0.0 {
            self.acquisition.lfp_sample_rate_hz = AcquisitionConfig::default().lfp_sample_rate_hz;
        }
        self
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "retain_count": 3, "timing": { "mark_channel": 5, "drift": 0.001 } }"#,
        )
        .unwrap();
        assert_eq!(config.retain_count, 3);
        assert_eq!(config.timing.mark_channel, Some(5));
        assert_eq!(config.timing.onset_state, "COND");
        assert_eq!(config.acquisition, AcquisitionConfig::default());
    }
    #[test]
    fn validation_clamps_minimums() {
        let config = EngineConfig::from_json_str(
            r#"{ "poll_sleep_ms": 0, "clear_interval": 0, "timing": { "nominal_duration_ms": -4.0 } }"#,
        )
        .unwrap();
        assert_eq!(config.poll_sleep_ms, 1);
        assert_eq!(config.clear_interval, 1);
        assert_eq!(config.timing.nominal_duration_ms, 1.0);
    }
    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            EngineConfig::from_json_str("{ nope"),
            Err(AnalysisError::Config(_))
        ));
    }
}
