#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("destination '{0}' not found")]
    DestinationNotFound(String),

    #[error("input '{path}': {detail}")]
    Input { path: String, detail: String },

    #[error("coordination: {0}")]
    Coordination(#[from] tabula_coordination::CoordinationError),

    #[error("{0}")]
    Reconcile(#[from] tabula_engine::EnsureTableError),

    #[error("signal: {0}")]
    Signal(#[from] std::io::Error),
}
