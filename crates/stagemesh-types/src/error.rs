// Errors raised by the shared data types.

#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    #[error("shape error: {0}")]
    Shape(String),

    #[error("mesh error: {0}")]
    Mesh(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, TypesError>;
