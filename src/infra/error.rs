use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact store error: {0}")]
    Artifacts(#[from] super::artifacts::ArtifactError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("metrics recorder installation failed: {message}")]
    Metrics { message: String },
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn metrics(message: impl Into<String>) -> Self {
        Self::Metrics {
            message: message.into(),
        }
    }
}
