use thiserror::Error;

use crate::backend::{ComputeBackend, KernelId, Scalar};

use super::compute::ParticleComputePlan;
use super::config::{ParticleLayout, SimulationParameters};
use super::error::SimError;

pub const READ_BINDING: &str = "particleRead";
pub const WRITE_BINDING: &str = "particleWrite";
pub const POSITIONS_BINDING: &str = "particlePositions";

/// A named unit of GPU work run once per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Advances positions and velocities; writes render positions.
    Integration,
    /// Recomputes density and pressure from the integrated state.
    Density,
    /// Single-kernel analytic wave over a grid layout.
    Wave,
}

impl StepKind {
    pub const ALL: [StepKind; 3] = [Self::Integration, Self::Density, Self::Wave];

    pub fn kernel_name(self) -> &'static str {
        match self {
            Self::Integration => "integrate",
            Self::Density => "compute_density",
            Self::Wave => "wave",
        }
    }

    /// Whether the kernel indexes particles over a 2-D grid (8×8 groups)
    /// rather than a 1-D range (64-wide groups).
    pub fn dispatches_on_grid(self) -> bool {
        matches!(self, Self::Wave)
    }

    pub fn writes_positions(self) -> bool {
        matches!(self, Self::Integration | Self::Wave)
    }

    /// Step that must appear earlier in the same pipeline.
    pub fn requires(self) -> Option<StepKind> {
        match self {
            Self::Density => Some(Self::Integration),
            Self::Integration | Self::Wave => None,
        }
    }

    fn upload_uniforms<B: ComputeBackend>(
        self,
        backend: &mut B,
        params: &SimulationParameters,
        frame: FrameContext,
    ) {
        backend.set_scalar("particle_count", Scalar::U32(params.particle_count()));
        // Kernels seed on frame 0, so saturate instead of wrapping back to it.
        let frame_index = u32::try_from(frame.counter).unwrap_or(u32::MAX);
        backend.set_scalar("frame", Scalar::U32(frame_index));
        backend.set_scalar("time_step", Scalar::F32(params.time_step()));
        backend.set_scalar("time", Scalar::F32(frame.time));

        match self {
            Self::Integration => {
                let h = params.domain_half_extent();
                backend.set_scalar("particle_mass", Scalar::F32(params.particle_mass()));
                backend.set_scalar("viscosity", Scalar::F32(params.viscosity()));
                backend.set_scalar(
                    "interaction_radius",
                    Scalar::F32(params.interaction_radius()),
                );
                backend.set_vector("domain", [h, h, h, params.boundary_coefficient()]);
            }
            Self::Density => {
                backend.set_scalar("particle_mass", Scalar::F32(params.particle_mass()));
                backend.set_scalar("stiffness", Scalar::F32(params.stiffness()));
                backend.set_scalar("viscosity", Scalar::F32(params.viscosity()));
                backend.set_scalar(
                    "interaction_radius",
                    Scalar::F32(params.interaction_radius()),
                );
                backend.set_scalar("rest_density", Scalar::F32(params.rest_density()));
            }
            Self::Wave => {
                let (width, height) = params.layout().extent();
                backend.set_scalar("grid_width", Scalar::U32(width));
                backend.set_scalar("grid_height", Scalar::U32(height));
                backend.set_scalar(
                    "spacing",
                    Scalar::F32(4.0 * params.domain_half_extent() / width as f32),
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineConfigError {
    #[error("pipeline has no kernel steps")]
    Empty,
    #[error("{0:?} appears more than once")]
    Duplicate(StepKind),
    #[error("{step:?} must run after {requires:?}")]
    MissingPrerequisite { step: StepKind, requires: StepKind },
    #[error("no step writes render positions")]
    NoRenderOutput,
    #[error("{step:?} and {other:?} dispatch over different layouts")]
    MixedDispatch { step: StepKind, other: StepKind },
    #[error("{step:?} cannot dispatch over {layout:?}")]
    LayoutMismatch { step: StepKind, layout: ParticleLayout },
}

/// Ordered, validated list of kernel steps. Ordering mistakes are caught
/// here, before anything touches the device; [`PipelineConfig::validate_for`]
/// checks the steps against a particle layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    steps: Vec<StepKind>,
}

impl PipelineConfig {
    pub fn new(steps: impl IntoIterator<Item = StepKind>) -> Result<Self, PipelineConfigError> {
        let steps: Vec<StepKind> = steps.into_iter().collect();
        if steps.is_empty() {
            return Err(PipelineConfigError::Empty);
        }
        for (i, step) in steps.iter().enumerate() {
            let earlier = &steps[..i];
            if earlier.contains(step) {
                return Err(PipelineConfigError::Duplicate(*step));
            }
            if let Some(requires) = step.requires() {
                if !earlier.contains(&requires) {
                    return Err(PipelineConfigError::MissingPrerequisite {
                        step: *step,
                        requires,
                    });
                }
            }
        }
        if !steps.iter().any(|step| step.writes_positions()) {
            return Err(PipelineConfigError::NoRenderOutput);
        }
        let first = steps[0];
        if let Some(other) = steps
            .iter()
            .find(|step| step.dispatches_on_grid() != first.dispatches_on_grid())
        {
            return Err(PipelineConfigError::MixedDispatch {
                step: first,
                other: *other,
            });
        }
        Ok(Self { steps })
    }

    /// Integration followed by density.
    pub fn sph() -> Self {
        Self {
            steps: vec![StepKind::Integration, StepKind::Density],
        }
    }

    pub fn wave() -> Self {
        Self {
            steps: vec![StepKind::Wave],
        }
    }

    pub fn steps(&self) -> &[StepKind] {
        &self.steps
    }

    /// How far the frame counter advances per rendered frame. Every step
    /// reads one state buffer and writes the other.
    pub fn role_swaps_per_frame(&self) -> u64 {
        self.steps.len() as u64
    }

    /// Every step must index particles the way `layout` lays them out: grid
    /// kernels need a grid layout, linear kernels a linear one.
    pub fn validate_for(&self, layout: ParticleLayout) -> Result<(), PipelineConfigError> {
        match self
            .steps
            .iter()
            .find(|step| step.dispatches_on_grid() != layout.is_grid())
        {
            Some(step) => Err(PipelineConfigError::LayoutMismatch {
                step: *step,
                layout,
            }),
            None => Ok(()),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::sph()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelStep {
    pub kind: StepKind,
    pub kernel: KernelId,
}

/// Per-step frame inputs: the role-swap counter and simulated time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameContext {
    pub counter: u64,
    pub time: f32,
}

/// Kernel steps resolved against a compiled program, plus the dispatch
/// plan shared by all of them.
#[derive(Debug, Clone)]
pub struct KernelPipeline {
    steps: Vec<KernelStep>,
    plan: ParticleComputePlan,
}

impl KernelPipeline {
    /// Resolves every kernel by name. A layout the steps cannot dispatch
    /// over, a missing kernel, or one whose declared work-group size
    /// disagrees with the layout fails the whole pipeline.
    pub fn resolve<B: ComputeBackend>(
        backend: &mut B,
        config: &PipelineConfig,
        layout: ParticleLayout,
    ) -> Result<Self, SimError> {
        config.validate_for(layout)?;
        let plan = ParticleComputePlan::new(layout);
        let mut steps = Vec::with_capacity(config.steps().len());
        for kind in config.steps() {
            let kernel = backend.find_kernel(kind.kernel_name())?;
            if let Some(got) = backend.kernel_workgroup_size(kernel) {
                let expected = plan.workgroup.as_array();
                if got != expected {
                    return Err(SimError::WorkgroupMismatch {
                        kernel: kind.kernel_name().to_owned(),
                        expected,
                        got,
                    });
                }
            }
            steps.push(KernelStep { kind: *kind, kernel });
        }
        log::debug!(
            "resolved pipeline {:?} with dispatch {:?}",
            config.steps(),
            plan.dispatch
        );
        Ok(Self { steps, plan })
    }

    pub fn steps(&self) -> &[KernelStep] {
        &self.steps
    }

    pub fn plan(&self) -> ParticleComputePlan {
        self.plan
    }

    /// Binds `read` as the source, `write` as the target and, for steps with
    /// renderable output, `positions_out`; uploads the step's uniforms and
    /// dispatches over every particle.
    #[allow(clippy::too_many_arguments)]
    pub fn run<B: ComputeBackend>(
        &self,
        backend: &mut B,
        step: &KernelStep,
        read: &B::Buffer,
        write: &B::Buffer,
        positions_out: &B::Buffer,
        params: &SimulationParameters,
        frame: FrameContext,
    ) -> Result<(), SimError> {
        if self.plan.is_empty() {
            return Ok(());
        }
        backend.set_buffer(step.kernel, READ_BINDING, read)?;
        backend.set_buffer(step.kernel, WRITE_BINDING, write)?;
        if step.kind.writes_positions() {
            backend.set_buffer(step.kernel, POSITIONS_BINDING, positions_out)?;
        }
        step.kind.upload_uniforms(backend, params, frame);
        backend.dispatch(step.kernel, self.plan.dispatch)?;
        log::trace!(
            "dispatched {} at counter {} with {:?} groups",
            step.kind.kernel_name(),
            frame.counter,
            self.plan.dispatch
        );
        Ok(())
    }
}
