use thiserror::Error;

/// A result type for GP regression algorithm
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when using kernels, decompositions or the [`GaussianProcess`](crate::GaussianProcess) engine
#[derive(Error, Debug)]
pub enum GpError {
    /// When a configuration value is rejected (scale, loc, kernel parameter, solver option)
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
    /// When a structured array does not declare the requested field
    #[error("Field not found: {0}")]
    FieldNotFound(String),
    /// When structured inputs do not share the same fields and types
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
    /// When array shapes can not be broadcast or do not match
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    /// When a derivative is requested beyond what the kernel supports
    #[error("Kernel not derivable: {0}")]
    NotDerivable(String),
    /// When a factorization or a numerical check fails
    #[error("Numerical error in {operation}: {reason}")]
    NumericalError {
        /// Name of the failing operation
        operation: String,
        /// What went wrong
        reason: String,
    },
    #[error(transparent)]
    /// When linear algebra computation fails
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a key is registered twice in a GP
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
    /// When a key is not registered in a GP
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    /// When the hyperparameter optimization can not proceed
    #[error("Optimization error: {0}")]
    OptimizationError(String),
}

impl GpError {
    pub(crate) fn numerical(operation: &str, reason: impl Into<String>) -> Self {
        GpError::NumericalError {
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}
