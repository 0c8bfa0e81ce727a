use crate::backend::{BufferUsage, ComputeBackend, RenderBackend};

use super::compute::ParticleBufferLayout;
use super::config::{ParameterInput, SimulationParameters};
use super::error::{ParameterClamped, SimError};
use super::pipeline::{FrameContext, KernelPipeline, PipelineConfig};
use super::pool::{BufferHandle, DeviceBufferPool};
use super::render::RenderSubmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Inactive,
    Active,
}

/// Which state buffer instance is read and which is written at a given
/// counter value. Even counters read instance 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRoles {
    pub read: usize,
    pub write: usize,
}

impl BufferRoles {
    pub fn for_counter(counter: u64) -> Self {
        let read = (counter % 2) as usize;
        Self {
            read,
            write: 1 - read,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimBuffers {
    state: [BufferHandle; 2],
    positions: BufferHandle,
}

/// Owns the device buffers and drives one simulation frame per [`step`].
///
/// The frame counter counts role swaps: every kernel step reads one state
/// buffer and writes the other, and the counter advances once after each, so
/// its parity always names the buffer written last. An SPH pipeline
/// therefore advances it by two per frame.
///
/// [`step`]: ParticleSim::step
pub struct ParticleSim<B: ComputeBackend + RenderBackend> {
    backend: B,
    params: SimulationParameters,
    config: PipelineConfig,
    pool: DeviceBufferPool<B::Buffer>,
    buffers: Option<SimBuffers>,
    pipeline: Option<KernelPipeline>,
    renderer: RenderSubmitter,
    counter: u64,
    frames_rendered: u64,
    time: f32,
}

impl<B: ComputeBackend + RenderBackend> ParticleSim<B> {
    /// Fails if `config` cannot dispatch over the parameters' layout.
    pub fn new(
        backend: B,
        params: SimulationParameters,
        config: PipelineConfig,
    ) -> Result<Self, SimError> {
        config.validate_for(params.layout())?;
        Ok(Self {
            backend,
            params,
            config,
            pool: DeviceBufferPool::new(),
            buffers: None,
            pipeline: None,
            renderer: RenderSubmitter,
            counter: 0,
            frames_rendered: 0,
            time: 0.0,
        })
    }

    pub fn state(&self) -> SimState {
        if self.buffers.is_some() {
            SimState::Active
        } else {
            SimState::Inactive
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == SimState::Active
    }

    /// Allocates both state buffers and the position buffer, then resolves
    /// every kernel. Any failure releases what was allocated and leaves the
    /// simulation inactive.
    pub fn activate(&mut self) -> Result<(), SimError> {
        if self.is_active() {
            return Err(SimError::AlreadyActive);
        }

        let count = self.params.particle_count();
        let layout = ParticleBufferLayout::default();
        let requests = [
            ("particles.state.0", layout.particle_stride_bytes, BufferUsage::ParticleState),
            ("particles.state.1", layout.particle_stride_bytes, BufferUsage::ParticleState),
            ("particles.positions", layout.position_stride_bytes, BufferUsage::Positions),
        ];

        let mut allocated = Vec::with_capacity(requests.len());
        for (label, stride, usage) in requests {
            match self
                .pool
                .allocate(&mut self.backend, label, count, stride, usage)
            {
                Ok(handle) => allocated.push(handle),
                Err(err) => {
                    log::error!("activation failed: {err}");
                    self.release_all(allocated.into_iter().rev());
                    return Err(err);
                }
            }
        }

        let pipeline =
            match KernelPipeline::resolve(&mut self.backend, &self.config, self.params.layout()) {
                Ok(pipeline) => pipeline,
                Err(err) => {
                    log::error!("activation failed: {err}");
                    self.release_all(allocated.into_iter().rev());
                    return Err(err);
                }
            };

        self.buffers = Some(SimBuffers {
            state: [allocated[0], allocated[1]],
            positions: allocated[2],
        });
        self.pipeline = Some(pipeline);
        self.counter = 0;
        self.frames_rendered = 0;
        self.time = 0.0;
        log::info!(
            "activated {count} particles ({:?}), {} bytes of device memory",
            self.config.steps(),
            self.pool.live_bytes()
        );
        Ok(())
    }

    /// Releases every buffer in reverse allocation order. Every buffer is
    /// released even if one fails; the first error is returned. Calling this
    /// while inactive is [`SimError::InvalidHandle`].
    pub fn deactivate(&mut self) -> Result<(), SimError> {
        let buffers = self
            .buffers
            .take()
            .ok_or(SimError::InvalidHandle(BufferHandle::UNBOUND))?;
        self.pipeline = None;

        let first_error = self.release_all([
            buffers.positions,
            buffers.state[1],
            buffers.state[0],
        ]);
        log::info!("deactivated after {} frames", self.frames_rendered);
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs one rendered frame: every kernel step in order, advancing the
    /// counter after each role-swapping step, then the instanced draw.
    pub fn step(&mut self) -> Result<(), SimError> {
        let (Some(buffers), Some(pipeline)) = (self.buffers, self.pipeline.as_ref()) else {
            return Err(SimError::NotActive);
        };
        let params = self.params;
        let positions = self.pool.get(buffers.positions)?;

        for step in pipeline.steps() {
            let roles = BufferRoles::for_counter(self.counter);
            let read = self.pool.get(buffers.state[roles.read])?;
            let write = self.pool.get(buffers.state[roles.write])?;
            pipeline.run(
                &mut self.backend,
                step,
                read,
                write,
                positions,
                &params,
                FrameContext {
                    counter: self.counter,
                    time: self.time,
                },
            )?;
            self.counter += 1;
        }

        self.frames_rendered += 1;
        self.time += params.time_step();

        let layout = params.layout();
        self.renderer.draw(
            &mut self.backend,
            Some(positions),
            layout.particle_count(),
            params.domain_half_extent(),
            layout.min_dimension(),
        )?;
        Ok(())
    }

    /// Replaces the parameter set before the next frame. A different particle
    /// layout while active reallocates every buffer and restarts the counter.
    /// A layout the current pipeline cannot dispatch over is rejected and the
    /// previous parameters stay in effect.
    pub fn set_parameters(
        &mut self,
        input: ParameterInput,
    ) -> Result<Vec<ParameterClamped>, SimError> {
        let (params, clamped) = SimulationParameters::new(input);
        if let Err(err) = self.config.validate_for(params.layout()) {
            log::warn!("rejected parameter update: {err}");
            return Err(err.into());
        }
        let relayout = params.layout() != self.params.layout();
        self.params = params;
        if relayout && self.is_active() {
            log::info!("particle layout changed to {:?}; reallocating", params.layout());
            self.deactivate()?;
            self.activate()?;
        }
        Ok(clamped)
    }

    /// Swaps in a different kernel pipeline. Only allowed while inactive, and
    /// only for one that can dispatch over the current layout.
    pub fn set_pipeline(&mut self, config: PipelineConfig) -> Result<(), SimError> {
        if self.is_active() {
            return Err(SimError::AlreadyActive);
        }
        config.validate_for(self.params.layout())?;
        self.config = config;
        Ok(())
    }

    pub fn params(&self) -> &SimulationParameters {
        &self.params
    }

    pub fn pipeline_config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pipeline(&self) -> Option<&KernelPipeline> {
        self.pipeline.as_ref()
    }

    /// Role-swap counter; its parity selects the read buffer.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    pub fn roles(&self) -> BufferRoles {
        BufferRoles::for_counter(self.counter)
    }

    pub fn pool(&self) -> &DeviceBufferPool<B::Buffer> {
        &self.pool
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn state_handles(&self) -> Option<[BufferHandle; 2]> {
        self.buffers.map(|b| b.state)
    }

    pub fn positions_handle(&self) -> Option<BufferHandle> {
        self.buffers.map(|b| b.positions)
    }

    /// Buffer holding the last completed step's state.
    pub fn current_state_buffer(&self) -> Option<&B::Buffer> {
        let buffers = self.buffers?;
        self.pool.get(buffers.state[self.roles().read]).ok()
    }

    pub fn positions_buffer(&self) -> Option<&B::Buffer> {
        self.pool.get(self.buffers?.positions).ok()
    }

    fn release_all(&mut self, handles: impl IntoIterator<Item = BufferHandle>) -> Option<SimError> {
        let mut first_error = None;
        for handle in handles {
            if let Err(err) = self.pool.release(&mut self.backend, handle) {
                log::error!("failed to release {handle:?}: {err}");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        first_error
    }
}

impl<B: ComputeBackend + RenderBackend> Drop for ParticleSim<B> {
    fn drop(&mut self) {
        if self.is_active() {
            if let Err(err) = self.deactivate() {
                log::warn!("release on drop failed: {err}");
            }
        }
    }
}
