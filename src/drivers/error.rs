use thiserror::Error;
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("signal source is not connected")]
    SourceDisconnected,
    #[error("signal source poll failed: {0}")]
    Poll(String),
    #[error("analysis worker has terminated and cannot be restarted")]
    WorkerTerminated,
    #[error("analyzer {0} is not registered")]
    UnknownAnalyzer(u64),
    #[error("analyzer {id} failed: {reason}")]
    Analyzer { id: u64, reason: String },
    #[error("controller for analyzer {id} failed: {reason}")]
    Controller { id: u64, reason: String },
    #[error("fft size must be greater than zero")]
    InvalidFftSize,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to export results: {0}")]
    Export(String),
}
impl From<serde_json::Error> for AnalysisError {
    fn from(value: serde_json::Error) -> Self {
        AnalysisError::Config(value.to_string())
    }
}
impl From<std::io::Error> for AnalysisError {
    fn from(value: std::io::Error) -> Self {
        AnalysisError::Export(value.to_string())
    }
}
