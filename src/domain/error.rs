use {super::payment::SideEffect, thiserror::Error};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation: {0}")]
    Validation(String),

    /// Network, auth or availability failure talking to the gateway.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The gateway answered, but the answer is unusable.
    #[error("provider: {0}")]
    Provider(String),

    #[error("record not found: {0}")]
    RecordNotFound(String),

    #[error("dispatcher {effect}: {message}")]
    Dispatcher { effect: SideEffect, message: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A spawned unit of work panicked or was aborted.
    #[error("background task: {0}")]
    Task(String),
}

impl PipelineError {
    /// Whether the caller may retry the same request later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::Timeout(_) | Self::Database(_)
        )
    }
}
