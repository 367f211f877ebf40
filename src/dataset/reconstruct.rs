use log::{debug, warn};

use super::timing::{
    count_until, find_single_edge, fit_line, levels_alternate, mark_levels_consistent, Polarity,
};
use super::{Dataset, EventTime, TrialTiming};
use crate::types::TimingSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EventChannel {
    Sync,
    Measure,
}

impl Dataset {
    /// Reconstructs onset/offset and event times of the trial just recorded.
    pub(super) fn reconstruct_last(&mut self) {
        let Some(pos) = self.trials.len().checked_sub(1) else {
            return;
        };
        let index = self.trials[pos].index;
        let horizon = self.trials[pos].horizon;
        let mut timing = match self.mark_pair(index, horizon) {
            Some((onset, offset)) => TrialTiming {
                onset,
                onset_source: TimingSource::Mark,
                offset: Some(offset),
                offset_source: Some(TimingSource::Mark),
            },
            None => self.estimate_timing(pos),
        };
        if pos > 0 {
            let adjacent = self.trials[pos - 1].index + 1 == index;
            self.finalize_chained(pos - 1, adjacent.then_some(timing.onset));
        }
        if let Some(offset) = timing.offset {
            if offset <= timing.onset {
                warn!("trial {index}: offset {offset:.3} not after onset {:.3}", timing.onset);
                timing.offset = Some(timing.onset + self.config.nominal_duration_ms);
                timing.offset_source = Some(TimingSource::Estimated);
            }
        }
        self.timings.push(timing);
        let sync = self.reconcile_events(pos, EventChannel::Sync);
        let measure = self.reconcile_events(pos, EventChannel::Measure);
        self.sync_times.push(sync);
        self.measure_times.push(measure);
        if timing.onset_source == TimingSource::Mark {
            self.recalibrate_drift();
        }
    }

    /// Onset/offset edges of trial `index` if the mark channel passes its checks.
    fn mark_pair(&mut self, index: usize, horizon: f64) -> Option<(f64, f64)> {
        let channel = self.config.mark_channel?;
        if !self.mark_ok {
            return None;
        }
        let base = self.digital_base.get(channel).copied().unwrap_or(0);
        let expected = 2 * (index + 1);
        let (observed, pair) = {
            let (times, values) = self.digital(channel);
            let local = count_until(times, horizon);
            let pair = if base + local == expected && mark_levels_consistent(&values[..local], base)
            {
                (2 * index)
                    .checked_sub(base)
                    .map(|k| (times[k], times[k + 1]))
            } else {
                None
            };
            (base + local, pair)
        };
        if pair.is_none() {
            warn!(
                "mark channel {channel} inconsistent at trial {index}: {observed} edges, expected {expected}"
            );
            self.mark_ok = false;
        }
        pair
    }

    /// Clock-model estimate, refined by a single nearby mark edge when one exists.
    fn estimate_timing(&self, pos: usize) -> TrialTiming {
        let config = &self.config;
        let record = &self.trials[pos];
        let latency = config.display_latency_ms;
        let mark = config.mark_channel.map(|channel| self.digital(channel));
        let refine = |target: f64, polarity: Polarity| {
            mark.and_then(|(times, values)| {
                find_single_edge(times, values, target, config.search_radius_ms, polarity)
            })
            .map(|edge| (edge, TimingSource::Recovered))
            .unwrap_or((target, TimingSource::Estimated))
        };
        let (onset, onset_source) = match record.state_time(&config.onset_state) {
            Some(t) => refine(self.clock.to_device(t) + latency, Polarity::Rising),
            None => {
                warn!(
                    "trial {} has no {} timestamp, estimating from completion",
                    record.index, config.onset_state
                );
                (
                    record.completed_at + latency - config.nominal_duration_ms,
                    TimingSource::Estimated,
                )
            }
        };
        let measured_offset = if config.has_inter_condition_interval() {
            record
                .state_time(&config.offset_state)
                .map(|t| refine(self.clock.to_device(t) + latency, Polarity::Falling))
        } else {
            None
        };
        TrialTiming {
            onset,
            onset_source,
            offset: measured_offset.map(|(t, _)| t),
            offset_source: measured_offset.map(|(_, s)| s),
        }
    }

    /// Resolves a pending offset from the following trial's onset. `None` when the
    /// following trial was skipped, which leaves only the nominal estimate.
    fn finalize_chained(&mut self, pos: usize, next_onset: Option<f64>) {
        let nominal = self.config.nominal_duration_ms;
        let tolerance = self.config.duration_tolerance_ms;
        let previous = &mut self.timings[pos];
        if previous.offset.is_some() {
            return;
        }
        let chained = next_onset.filter(|next| {
            let gap = next - previous.onset;
            gap > 0.0 && (gap - nominal).abs() <= tolerance
        });
        if let Some(next_onset) = chained {
            previous.offset = Some(next_onset);
            previous.offset_source = Some(TimingSource::Chained);
        } else {
            previous.offset = Some(previous.onset + nominal);
            previous.offset_source = Some(TimingSource::Estimated);
        }
    }

    fn reconcile_events(&mut self, pos: usize, kind: EventChannel) -> Vec<EventTime> {
        let (channel, extra_latency, cursor, ok) = match kind {
            EventChannel::Sync => (
                self.config.event_sync_channel,
                0.0,
                self.sync_cursor,
                self.event_sync_ok,
            ),
            EventChannel::Measure => (
                self.config.event_measure_channel,
                self.config.display_latency_ms + self.config.measure_latency_ms,
                self.measure_cursor,
                self.event_measure_ok,
            ),
        };
        let Some(channel) = channel else {
            return Vec::new();
        };
        let record = &self.trials[pos];
        if record.sync_events.is_empty() {
            return Vec::new();
        }
        let base = self.digital_base.get(channel).copied().unwrap_or(0);
        let expected = cursor + record.sync_events.len();
        let (times, values) = self.digital(channel);
        let local = count_until(times, record.horizon);
        let consistent = ok
            && cursor >= base
            && base + local == expected
            && levels_alternate(&values[..local]);
        let events: Vec<EventTime> = if consistent {
            record
                .sync_events
                .iter()
                .enumerate()
                .map(|(k, name)| EventTime {
                    name: name.clone(),
                    time: times[cursor - base + k],
                    source: TimingSource::Mark,
                })
                .collect()
        } else {
            record
                .sync_events
                .iter()
                .filter_map(|name| {
                    let target = self.clock.to_device(record.state_time(name)?) + extra_latency;
                    let (time, source) = find_single_edge(
                        times,
                        values,
                        target,
                        self.config.search_radius_ms,
                        Polarity::Any,
                    )
                    .map(|edge| (edge, TimingSource::Recovered))
                    .unwrap_or((target, TimingSource::Estimated));
                    Some(EventTime {
                        name: name.clone(),
                        time,
                        source,
                    })
                })
                .collect()
        };
        let observed = base + local;
        let index = record.index;
        match kind {
            EventChannel::Sync => {
                self.sync_cursor = expected;
                if ok && !consistent {
                    warn!("event sync mismatch at trial {index}: {observed} edges, expected {expected}");
                    self.event_sync_ok = false;
                }
            }
            EventChannel::Measure => {
                self.measure_cursor = expected;
                if ok && !consistent {
                    warn!("event measure mismatch at trial {index}: {observed} edges, expected {expected}");
                    self.event_measure_ok = false;
                }
            }
        }
        events
    }

    /// Refits drift and clock zero from mark-timed trials; affects later trials only.
    fn recalibrate_drift(&mut self) {
        if !self.config.recalibrate_drift {
            return;
        }
        let latency = self.config.display_latency_ms;
        let points: Vec<(f64, f64)> = self
            .trials
            .iter()
            .zip(&self.timings)
            .filter(|(_, timing)| timing.onset_source == TimingSource::Mark)
            .filter_map(|(record, timing)| {
                record
                    .state_time(&self.config.onset_state)
                    .map(|t| (t, timing.onset - latency))
            })
            .collect();
        if points.len() < self.config.drift_fit_min_trials {
            return;
        }
        if let Some((slope, intercept)) = fit_line(&points) {
            self.clock.drift = slope - 1.0;
            self.clock.clock_zero = intercept;
            debug!(
                "clock refit over {} trials: drift {:.6}, zero {:.3} ms",
                points.len(),
                self.clock.drift,
                self.clock.clock_zero
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TimingConfig;
    use crate::dataset::Dataset;
    use crate::drivers::SampleBatch;
    use crate::types::{ConditionTest, TimingSource};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    const MARK: usize = 3;

    fn marked_config() -> TimingConfig {
        TimingConfig {
            mark_channel: Some(MARK),
            ..TimingConfig::default()
        }
    }

    fn edges(channel: usize, list: &[(f64, u32)]) -> SampleBatch {
        let mut batch = SampleBatch::default();
        for (t, v) in list {
            batch.push_digital(channel, *t, *v);
        }
        batch
    }

    proptest! {
        #[test]
        fn consistent_marks_are_taken_verbatim(
            spans in prop::collection::vec((50.0f64..500.0, 100.0f64..400.0), 1..20)
        ) {
            let mut ds = Dataset::new(marked_config(), 1000.0);
            let mut mark = Vec::new();
            let mut trials = Vec::new();
            let mut t = 37.25;
            for (i, (duration, gap)) in spans.iter().enumerate() {
                let onset = t;
                let offset = t + duration;
                mark.push((onset, 1));
                mark.push((offset, 0));
                // State stamps deliberately disagree with the marks.
                trials.push((
                    ConditionTest::new(i, i % 3)
                        .with_state("COND", onset + 3.0)
                        .with_state("SUFICI", offset + 3.0),
                    offset + 1.0,
                ));
                t = offset + gap;
            }
            ds.append_samples(edges(MARK, &mark));
            for (test, completed) in trials {
                prop_assert!(ds.record_trial(test, completed));
            }
            let onsets: Vec<f64> = mark.iter().step_by(2).map(|e| e.0).collect();
            let offsets: Vec<Option<f64>> = mark.iter().skip(1).step_by(2).map(|e| Some(e.0)).collect();
            prop_assert_eq!(ds.onsets(), onsets);
            prop_assert_eq!(ds.offsets(), offsets);
            prop_assert!(ds.mark_ok());
        }
    }

    #[test]
    fn corrupted_mark_falls_back_with_ordered_offsets() {
        let mut ds = Dataset::new(
            TimingConfig {
                search_radius_ms: 2.0,
                ..marked_config()
            },
            1000.0,
        );
        // Trial 1 lost its offset edge.
        ds.append_samples(edges(
            MARK,
            &[(100.0, 1), (200.0, 0), (400.0, 1), (700.0, 1), (800.0, 0)],
        ));
        let tests = [
            ConditionTest::new(0, 0)
                .with_state("COND", 100.5)
                .with_state("SUFICI", 200.5),
            ConditionTest::new(1, 1)
                .with_state("COND", 410.0)
                .with_state("SUFICI", 405.0),
            ConditionTest::new(2, 0).with_state("COND", 690.0),
        ];
        let completions = [210.0, 510.0, 810.0];
        for (test, completed) in tests.into_iter().zip(completions) {
            assert!(ds.record_trial(test, completed));
        }
        assert!(!ds.mark_ok());
        ds.end_experiment();
        let timings: Vec<_> = (0..3).map(|i| *ds.timing(i).unwrap()).collect();
        assert_eq!(timings[0].onset_source, TimingSource::Mark);
        assert_eq!(timings[1].onset, 410.0);
        assert_eq!(timings[1].onset_source, TimingSource::Estimated);
        assert_eq!(timings[1].offset_source, Some(TimingSource::Estimated));
        assert_eq!(timings[2].onset, 690.0);
        for timing in &timings {
            let offset = timing.offset.unwrap();
            assert!(offset > timing.onset, "{timing:?}");
        }
    }

    #[test]
    fn single_nearby_edge_is_recovered() {
        let mut ds = Dataset::new(
            TimingConfig {
                display_latency_ms: 10.0,
                search_radius_ms: 15.0,
                ..marked_config()
            },
            1000.0,
        );
        // Spurious leading edge breaks the count from the start.
        ds.append_samples(edges(MARK, &[(5.0, 0), (112.0, 1), (213.0, 0)]));
        assert!(ds.record_trial(
            ConditionTest::new(0, 0)
                .with_state("COND", 100.0)
                .with_state("SUFICI", 200.0),
            205.0,
        ));
        let timing = ds.timing(0).unwrap();
        assert_eq!(timing.onset, 112.0);
        assert_eq!(timing.onset_source, TimingSource::Recovered);
        assert_eq!(timing.offset, Some(213.0));
        assert!(!ds.mark_ok());
    }

    #[test]
    fn chained_offsets_without_interval() {
        let mut ds = Dataset::new(
            TimingConfig {
                inter_condition_interval_ms: 0.0,
                nominal_duration_ms: 30.0,
                duration_tolerance_ms: 5.0,
                ..TimingConfig::default()
            },
            1000.0,
        );
        for (i, cond) in [10.0, 40.0, 100.0].into_iter().enumerate() {
            assert!(ds.record_trial(ConditionTest::new(i, 0).with_state("COND", cond), cond + 30.0));
            assert_eq!(ds.finalized_count(), i);
        }
        ds.end_experiment();
        assert_eq!(ds.finalized_count(), 3);
        assert_eq!(ds.offsets(), vec![Some(40.0), Some(70.0), Some(130.0)]);
        assert_eq!(
            ds.timing(0).unwrap().offset_source,
            Some(TimingSource::Chained)
        );
        assert_eq!(
            ds.timing(1).unwrap().offset_source,
            Some(TimingSource::Estimated)
        );
    }

    #[test]
    fn skipped_trial_breaks_the_chain() {
        let mut ds = Dataset::new(
            TimingConfig {
                inter_condition_interval_ms: 0.0,
                nominal_duration_ms: 30.0,
                duration_tolerance_ms: 5.0,
                ..TimingConfig::default()
            },
            1000.0,
        );
        assert!(ds.record_trial(ConditionTest::new(0, 0).with_state("COND", 10.0), 40.0));
        // Trial 1 never arrives; trial 2 starts two durations later.
        assert!(ds.record_trial(ConditionTest::new(2, 0).with_state("COND", 40.0), 100.0));
        assert_eq!(ds.finalized_count(), 2);
        let first = ds.timing(0).unwrap();
        assert_eq!(first.offset, Some(40.0));
        assert_eq!(first.offset_source, Some(TimingSource::Estimated));
    }

    #[test]
    fn sync_events_follow_edges_until_mismatch() {
        let mut ds = Dataset::new(
            TimingConfig {
                event_sync_channel: Some(2),
                search_radius_ms: 3.0,
                ..TimingConfig::default()
            },
            1000.0,
        );
        ds.append_samples(edges(2, &[(10.4, 1), (20.6, 0), (40.2, 1)]));
        let trial = |i: usize, cond: f64| {
            ConditionTest::new(i, 0)
                .with_state("COND", cond)
                .with_state("SUFICI", cond + 10.0)
                .with_sync_event("COND")
                .with_sync_event("SUFICI")
        };
        assert!(ds.record_trial(trial(0, 10.0), 25.0));
        let first = ds.sync_times(0).unwrap();
        assert_eq!(first[0].time, 10.4);
        assert_eq!(first[1].time, 20.6);
        assert_eq!(first[1].source, TimingSource::Mark);
        assert!(ds.event_sync_ok());
        // Trial 1 is missing its second pulse.
        assert!(ds.record_trial(trial(1, 40.0), 55.0));
        assert!(!ds.event_sync_ok());
        let second = ds.sync_times(1).unwrap();
        assert_eq!(second[0].time, 40.2);
        assert_eq!(second[0].source, TimingSource::Recovered);
        assert_eq!(second[1].time, 50.0);
        assert_eq!(second[1].source, TimingSource::Estimated);
        assert!(ds.event_measure_ok());
    }

    #[test]
    fn measure_channel_includes_its_latency() {
        let mut ds = Dataset::new(
            TimingConfig {
                event_measure_channel: Some(6),
                display_latency_ms: 8.0,
                measure_latency_ms: 2.0,
                ..TimingConfig::default()
            },
            1000.0,
        );
        ds.append_samples(edges(6, &[(120.0, 1)]));
        assert!(ds.record_trial(
            ConditionTest::new(0, 0)
                .with_state("COND", 110.0)
                .with_sync_event("COND"),
            150.0
        ));
        assert_eq!(ds.measure_times(0).unwrap()[0].time, 120.0);
        assert!(ds.event_measure_ok());
        // Second trial reports an event the photodiode never saw.
        assert!(ds.record_trial(
            ConditionTest::new(1, 0)
                .with_state("COND", 300.0)
                .with_sync_event("COND"),
            400.0
        ));
        assert!(!ds.event_measure_ok());
        let missed = &ds.measure_times(1).unwrap()[0];
        assert_eq!(missed.time, 310.0);
        assert_eq!(missed.source, TimingSource::Estimated);
    }

    #[test]
    fn drift_is_refit_from_marked_trials() {
        let true_drift = 0.001;
        let mut ds = Dataset::new(
            TimingConfig {
                recalibrate_drift: true,
                drift_fit_min_trials: 3,
                ..marked_config()
            },
            1000.0,
        );
        let mut mark = Vec::new();
        for i in 0..4 {
            let cond = i as f64 * 1000.0;
            mark.push((cond * (1.0 + true_drift), 1));
            mark.push(((cond + 300.0) * (1.0 + true_drift), 0));
        }
        ds.append_samples(edges(MARK, &mark));
        for i in 0..4 {
            let cond = i as f64 * 1000.0;
            let test = ConditionTest::new(i, 0)
                .with_state("COND", cond)
                .with_state("SUFICI", cond + 300.0);
            assert!(ds.record_trial(test, cond + 305.0));
        }
        assert!(ds.mark_ok());
        assert_relative_eq!(ds.clock().drift, true_drift, epsilon = 1e-9);
        assert_relative_eq!(ds.clock().clock_zero, 0.0, epsilon = 1e-6);
        // Earlier onsets keep their mark times.
        assert_eq!(ds.onsets()[1], mark[2].0);
    }
}
