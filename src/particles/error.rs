use thiserror::Error;

use super::pool::BufferHandle;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("buffer allocation failed for {label}: {reason}")]
    Allocation { label: String, reason: String },
    #[error("kernel `{0}` not found in compiled program")]
    KernelNotFound(String),
    #[error("invalid or already released buffer handle {0:?}")]
    InvalidHandle(BufferHandle),
    #[error("kernel `{kernel}` declares workgroup size {got:?}, expected {expected:?}")]
    WorkgroupMismatch {
        kernel: String,
        expected: [u32; 3],
        got: [u32; 3],
    },
    #[error("kernel `{kernel}` declares no binding named `{binding}`")]
    UnknownBinding { kernel: String, binding: String },
    #[error("kernel `{kernel}` dispatched with nothing bound to `{binding}`")]
    UnboundBinding { kernel: String, binding: String },
    #[error("simulation is not active")]
    NotActive,
    #[error("simulation is already active")]
    AlreadyActive,
    #[error(transparent)]
    PipelineConfig(#[from] super::pipeline::PipelineConfigError),
    #[error(transparent)]
    Program(#[from] crate::backend::program::ProgramError),
}

impl SimError {
    pub fn allocation(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Allocation {
            label: label.into(),
            reason: reason.into(),
        }
    }
}

/// Non-fatal diagnostic: a tunable was outside its declared bound and was
/// stored at the bound instead.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("parameter `{field}` clamped from {requested} to {stored}")]
pub struct ParameterClamped {
    pub field: &'static str,
    pub requested: f64,
    pub stored: f64,
}
