pub mod compute;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod render;
pub mod simulation;

pub use compute::{ParticleComputePlan, ParticleRecord, ParticleWorkgroup, PositionRecord};
pub use config::{ParameterInput, ParticleLayout, SimulationParameters};
pub use error::{ParameterClamped, SimError};
pub use pipeline::{KernelPipeline, PipelineConfig, PipelineConfigError, StepKind};
pub use pool::{BufferHandle, DeviceBufferPool};
pub use render::{DrawBounds, RenderSubmitter};
pub use simulation::{BufferRoles, ParticleSim, SimState};
