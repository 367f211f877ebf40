pub mod buffer;
pub mod error;
pub mod fft;
pub mod simulated;
pub mod source;
pub use buffer::{PollSchedule, SampleCache};
pub use error::AnalysisError;
pub use fft::{FrequencySpectrum, SpectrumBuilder};
pub use simulated::{DigitalWriter, SimulatedConfig, SimulatedSource};
pub use source::{
    Cadence, LfpTrace, ManualFeed, ManualSource, SampleBatch, SignalSource, SourceClock,
};
