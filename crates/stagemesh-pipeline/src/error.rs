use stagemesh_types::TypesError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("graph error: {0}")]
    Graph(String),

    #[error("stage transform error: {0}")]
    Transform(String),

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("donation error: {0}")]
    Donation(String),

    #[error("mesh error: {0}")]
    Mesh(String),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("execution error: {0}")]
    Execution(String),

    #[error("buffer {var} for micro-batch {micro_batch} is not available to stage {stage}")]
    MissingBuffer {
        var: String,
        micro_batch: usize,
        stage: usize,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Types(#[from] TypesError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, PipelineError>;
