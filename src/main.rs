// src/main.rs
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use log::info;
use serde::Serialize;

use condtest_online::drivers::{DigitalWriter, SimulatedConfig, SimulatedSource};
use condtest_online::{
    AnalysisEngine, AnalysisResult, AnalyzerKind, ConditionTest, ControlSignal, CsvVisualizer,
    EngineConfig, ExperimentSender, RateThresholdController, TimingConfig,
};

const MARK_CHANNEL: usize = 0;
const START_SYNC_CHANNEL: usize = 1;

#[derive(Serialize)]
struct Summary {
    trials_analyzed: u64,
    analysis_failures: u64,
    mark_ok: bool,
    spike_rates: Option<AnalysisResult>,
    lfp_snapshots_exported: usize,
    responsive_units: Vec<ControlSignal>,
}

fn demo_config() -> EngineConfig {
    EngineConfig {
        timing: TimingConfig {
            pipeline_latency_ms: 10.0,
            mark_channel: Some(MARK_CHANNEL),
            start_sync_channel: Some(START_SYNC_CHANNEL),
            nominal_duration_ms: 200.0,
            inter_condition_interval_ms: 100.0,
            ..TimingConfig::default()
        },
        ..EngineConfig::default()
    }
}

/// Plays a scripted session: each trial raises the mark line for the stimulus period,
/// then reports its condition test and completion.
fn run_session(
    sender: &ExperimentSender,
    mark: &DigitalWriter,
    timing: &TimingConfig,
    trials: usize,
) -> Result<()> {
    let stimulus = Duration::from_secs_f64(timing.nominal_duration_ms / 1000.0);
    let interval = Duration::from_secs_f64(timing.inter_condition_interval_ms / 1000.0);
    mark.edge(START_SYNC_CHANNEL, 1);
    let epoch = Instant::now();
    let clock = || epoch.elapsed().as_secs_f64() * 1000.0;
    for index in 0..trials {
        let onset = clock();
        mark.edge(MARK_CHANNEL, 1);
        thread::sleep(stimulus);
        let offset = clock();
        mark.edge(MARK_CHANNEL, 0);
        thread::sleep(interval);
        let test = ConditionTest {
            repeat: Some((index / 3) as u32),
            ..ConditionTest::new(index, index % 3)
        }
        .with_state(&timing.onset_state, onset)
        .with_state(&timing.offset_state, offset);
        sender.condition_test(test)?;
        sender.trial_completed(index, clock())?;
        info!("trial {index} played");
    }
    sender.experiment_end()?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => EngineConfig::from_json_file(&path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => demo_config(),
    };
    let trials: usize = match args.next() {
        Some(n) => n.parse().context("trial count must be a number")?,
        None => 9,
    };

    let source = SimulatedSource::new(SimulatedConfig::default());
    let writer = source.digital_writer();
    let engine =
        AnalysisEngine::new(source, config.clone()).context("failed to create analysis engine")?;

    let (control_tx, control_rx) = unbounded();
    let rates = engine.add_analyzer(
        AnalyzerKind::SpikeRate {
            response_delay_ms: 0.0,
        }
        .build(0)?,
        10,
        Some(Box::new(RateThresholdController::new(15.0, 3, control_tx))),
    );
    let mut power = engine.add_analyzer_kind(
        &AnalyzerKind::LfpPower {
            low_hz: 5.0,
            high_hz: 15.0,
        },
        0,
        0,
    )?;
    let csv_path = std::env::temp_dir().join("condtest-online-lfp.csv");
    power.set_visualizer(Box::new(CsvVisualizer::create(&csv_path, 3)?));

    engine.start()?;
    run_session(&engine.sender(), &writer, &config.timing, trials)?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.trials_analyzed() < trials as u64 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    thread::sleep(Duration::from_millis(50));
    let exported = power.pump();
    info!("{exported} LFP snapshots exported to {}", csv_path.display());

    let summary = Summary {
        trials_analyzed: engine.trials_analyzed(),
        analysis_failures: engine.analysis_failures(),
        mark_ok: engine.mark_ok(),
        spike_rates: rates.latest(),
        lfp_snapshots_exported: exported,
        responsive_units: control_rx.try_iter().collect(),
    };
    engine.shutdown();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
