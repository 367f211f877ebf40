//! Online analysis of condition tests against live electrophysiology samples.

pub mod analysis;
pub mod config;
pub mod dataset;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod types;

pub use analysis::{
    AnalysisResult, Analyze, AnalyzerId, AnalyzerKind, ControlSignal, Controller,
    LfpPowerAnalyzer, RateThresholdController, ResultStream, Signal, SignalType,
    SpikeRateAnalyzer, Visualizer,
};
pub use config::{AcquisitionConfig, EngineConfig, TimingConfig};
pub use dataset::Dataset;
pub use drivers::{AnalysisError, SampleBatch, SampleCache, SignalSource};
pub use engine::{AnalysisEngine, EngineSettings, ExperimentSender};
pub use recorder::CsvVisualizer;
pub use types::{ConditionTest, EngineState, ExperimentMessage, TimingSource, TrialCompletion};
