//! Error types for the fluid solver
//!
//! Configuration errors are fatal: the solver never retries a failed kernel
//! load or a bad parameter binding. A solver that is not ready is not an
//! error; every operation silently does nothing until `init` completes.

use thiserror::Error;

/// Errors raised while configuring kernels or options
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    /// A parameter name that the kernel never declared
    #[error("kernel `{kernel}` has no parameter named `{parameter}`")]
    InvalidParameter { kernel: String, parameter: String },

    /// A kernel whose program could not be compiled or linked
    #[error("kernel `{kernel}` failed to load: {reason}")]
    ProgramLoadFailure { kernel: String, reason: String },

    /// Options that can never produce a working solver
    #[error("invalid fluid options: {0}")]
    InvalidOptions(String),
}

/// Top-level error for every fallible solver operation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FluidError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A field or render target is missing or does not match its role
    #[error("field `{field}` failed validation: {reason}")]
    ResourceValidation { field: String, reason: String },

    /// Device acquisition, submission or readback failure
    #[error("compute backend error: {0}")]
    Backend(String),
}

impl FluidError {
    pub fn invalid_parameter(kernel: impl Into<String>, parameter: impl Into<String>) -> Self {
        ConfigurationError::InvalidParameter {
            kernel: kernel.into(),
            parameter: parameter.into(),
        }
        .into()
    }

    pub fn program_load_failure(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigurationError::ProgramLoadFailure {
            kernel: kernel.into(),
            reason: reason.into(),
        }
        .into()
    }

    pub fn invalid_options(reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidOptions(reason.into()).into()
    }

    pub fn resource(field: impl Into<String>, reason: impl Into<String>) -> Self {
        FluidError::ResourceValidation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type FluidResult<T> = Result<T, FluidError>;
