//! Activation, teardown and parameter changes against the recording backend.
//!
//! Tests cover:
//! - buffer allocation sizes for every legal particle count
//! - activation failures leaving nothing allocated
//! - double teardown
//! - reallocation on particle layout changes
//! - layout edits the running pipeline cannot dispatch over

use std::collections::HashSet;

use particle_orchestrator::backend::recording::{Command, RecordingBackend};
use particle_orchestrator::particles::{
    BufferHandle, ParameterInput, ParticleLayout, ParticleSim, PipelineConfig,
    PipelineConfigError, SimError, SimState, SimulationParameters, StepKind,
};
use proptest::prelude::*;

// =============================================================================
// HELPERS
// =============================================================================

fn params_for(layout: ParticleLayout) -> SimulationParameters {
    SimulationParameters::new(ParameterInput {
        layout,
        ..ParameterInput::default()
    })
    .0
}

fn sph_sim(count: u32, backend: RecordingBackend) -> ParticleSim<RecordingBackend> {
    ParticleSim::new(
        backend,
        params_for(ParticleLayout::Linear { count }),
        PipelineConfig::sph(),
    )
    .unwrap()
}

fn buffer_sizes(sim: &ParticleSim<RecordingBackend>) -> (u64, u64, u64) {
    let [a, b] = sim.state_handles().unwrap();
    let positions = sim.positions_handle().unwrap();
    let size = |h| sim.pool().get(h).unwrap().size_bytes();
    (size(a), size(b), size(positions))
}

// =============================================================================
// ACTIVATION
// =============================================================================

proptest! {
    #[test]
    fn activation_allocates_three_buffers_sized_for_every_particle(count in 2u32..=200) {
        let mut sim = sph_sim(count, RecordingBackend::default());
        sim.activate().unwrap();

        prop_assert_eq!(sim.state(), SimState::Active);
        prop_assert_eq!(sim.pool().live_count(), 3);
        prop_assert_eq!(sim.backend().live_buffers(), 3);

        let (state0, state1, positions) = buffer_sizes(&sim);
        prop_assert_eq!(state0, 32 * u64::from(count));
        prop_assert_eq!(state1, 32 * u64::from(count));
        prop_assert_eq!(positions, 16 * u64::from(count));

        let live: HashSet<BufferHandle> = sim.pool().live_handles().collect();
        let [a, b] = sim.state_handles().unwrap();
        let owned = HashSet::from([a, b, sim.positions_handle().unwrap()]);
        prop_assert_eq!(live, owned);

        sim.deactivate().unwrap();
        prop_assert_eq!(sim.backend().live_buffers(), 0);
    }
}

#[test]
fn missing_kernel_aborts_activation_and_releases_buffers() {
    let mut sim = sph_sim(10, RecordingBackend::new(["integrate"]));

    let err = sim.activate().unwrap_err();

    assert!(matches!(err, SimError::KernelNotFound(ref name) if name == "compute_density"));
    assert_eq!(sim.state(), SimState::Inactive);
    assert_eq!(sim.pool().live_count(), 0);
    assert_eq!(sim.backend().live_buffers(), 0);
}

#[test]
fn out_of_memory_on_last_buffer_releases_the_first_two() {
    // Two 320-byte state buffers fit, the 160-byte position buffer does not.
    let backend = RecordingBackend::default().with_memory_budget(700);
    let mut sim = sph_sim(10, backend);

    let err = sim.activate().unwrap_err();

    assert!(matches!(err, SimError::Allocation { ref label, .. } if label == "particles.positions"));
    assert_eq!(sim.backend().live_buffers(), 0);
    let destroyed = sim
        .backend()
        .commands()
        .iter()
        .filter(|c| matches!(c, Command::DestroyBuffer { .. }))
        .count();
    assert_eq!(destroyed, 2);
}

#[test]
fn oversized_buffer_is_rejected_before_reaching_the_device() {
    let backend = RecordingBackend::default().with_max_buffer_size(100);
    let mut sim = sph_sim(10, backend);

    assert!(matches!(sim.activate(), Err(SimError::Allocation { .. })));
    assert!(sim.backend().commands().is_empty());
}

#[test]
fn workgroup_mismatch_fails_activation() {
    let backend = RecordingBackend::default().with_workgroup_size("integrate", [8, 8, 1]);
    let mut sim = sph_sim(10, backend);

    let err = sim.activate().unwrap_err();

    assert!(matches!(
        err,
        SimError::WorkgroupMismatch { expected: [64, 1, 1], got: [8, 8, 1], .. }
    ));
    assert_eq!(sim.backend().live_buffers(), 0);
}

// =============================================================================
// TEARDOWN
// =============================================================================

#[test]
fn deactivate_twice_reports_invalid_handle() {
    let mut sim = sph_sim(10, RecordingBackend::default());
    sim.activate().unwrap();

    sim.deactivate().unwrap();
    let err = sim.deactivate().unwrap_err();

    assert!(matches!(err, SimError::InvalidHandle(h) if h.is_unbound()));
    assert_eq!(sim.backend().live_buffers(), 0);
}

#[test]
fn deactivate_releases_in_reverse_allocation_order() {
    let mut sim = sph_sim(10, RecordingBackend::default());
    sim.activate().unwrap();
    sim.backend_mut().clear_commands();

    sim.deactivate().unwrap();

    let destroyed: Vec<u64> = sim
        .backend()
        .commands()
        .iter()
        .filter_map(|c| match c {
            Command::DestroyBuffer { id } => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(destroyed, vec![2, 1, 0]);
}

// =============================================================================
// PARAMETER CHANGES
// =============================================================================

#[test]
fn layout_change_while_active_reallocates() {
    let mut sim = sph_sim(10, RecordingBackend::default());
    sim.activate().unwrap();
    sim.step().unwrap();

    let clamped = sim
        .set_parameters(ParameterInput {
            layout: ParticleLayout::Linear { count: 20 },
            ..ParameterInput::default()
        })
        .unwrap();

    assert!(clamped.is_empty());
    assert!(sim.is_active());
    assert_eq!(sim.counter(), 0);
    assert_eq!(buffer_sizes(&sim), (640, 640, 320));
    assert_eq!(sim.backend().live_buffers(), 3);
}

#[test]
fn same_layout_keeps_buffers() {
    let mut sim = sph_sim(10, RecordingBackend::default());
    sim.activate().unwrap();
    let before = sim.state_handles();

    let clamped = sim
        .set_parameters(ParameterInput {
            layout: ParticleLayout::Linear { count: 10 },
            stiffness: -5.0,
            ..ParameterInput::default()
        })
        .unwrap();

    assert_eq!(clamped.len(), 1);
    assert_eq!(clamped[0].field, "stiffness");
    assert_eq!(sim.params().stiffness(), 0.0);
    assert_eq!(sim.state_handles(), before);
}

#[test]
fn layout_change_while_inactive_only_updates_parameters() {
    let mut sim = sph_sim(10, RecordingBackend::default());

    sim.set_parameters(ParameterInput {
        layout: ParticleLayout::Linear { count: 50 },
        ..ParameterInput::default()
    })
    .unwrap();

    assert!(!sim.is_active());
    assert!(sim.backend().commands().is_empty());
    assert_eq!(sim.params().particle_count(), 50);
}

#[test]
fn grid_edit_on_running_sph_is_rejected_and_sim_keeps_running() {
    let backend = RecordingBackend::default()
        .with_workgroup_size("integrate", [64, 1, 1])
        .with_workgroup_size("compute_density", [64, 1, 1]);
    let mut sim = sph_sim(10, backend);
    sim.activate().unwrap();
    sim.step().unwrap();
    let before = sim.state_handles();

    let err = sim
        .set_parameters(ParameterInput {
            layout: ParticleLayout::Grid {
                width: 10,
                height: 10,
            },
            ..ParameterInput::default()
        })
        .unwrap_err();

    assert!(matches!(
        err,
        SimError::PipelineConfig(PipelineConfigError::LayoutMismatch {
            step: StepKind::Integration,
            ..
        })
    ));
    assert!(sim.is_active());
    assert_eq!(sim.state_handles(), before);
    assert_eq!(sim.params().layout(), ParticleLayout::Linear { count: 10 });
    assert_eq!(sim.counter(), 2);
    sim.step().unwrap();
    assert_eq!(sim.counter(), 4);
}

#[test]
fn linear_edit_on_running_wave_is_rejected_and_sim_keeps_running() {
    let backend = RecordingBackend::default().with_workgroup_size("wave", [8, 8, 1]);
    let mut sim = ParticleSim::new(
        backend,
        params_for(ParticleLayout::Grid {
            width: 4,
            height: 4,
        }),
        PipelineConfig::wave(),
    )
    .unwrap();
    sim.activate().unwrap();

    let err = sim
        .set_parameters(ParameterInput {
            layout: ParticleLayout::Linear { count: 100 },
            ..ParameterInput::default()
        })
        .unwrap_err();

    assert!(matches!(
        err,
        SimError::PipelineConfig(PipelineConfigError::LayoutMismatch {
            step: StepKind::Wave,
            ..
        })
    ));
    assert!(sim.is_active());
    assert_eq!(sim.params().particle_count(), 16);
    sim.step().unwrap();
}

#[test]
fn grid_resize_on_running_wave_reallocates() {
    let mut sim = ParticleSim::new(
        RecordingBackend::default(),
        params_for(ParticleLayout::Grid {
            width: 4,
            height: 4,
        }),
        PipelineConfig::wave(),
    )
    .unwrap();
    sim.activate().unwrap();

    sim.set_parameters(ParameterInput {
        layout: ParticleLayout::Grid {
            width: 8,
            height: 5,
        },
        ..ParameterInput::default()
    })
    .unwrap();

    assert!(sim.is_active());
    assert_eq!(buffer_sizes(&sim), (32 * 40, 32 * 40, 16 * 40));
}

#[test]
fn sph_over_a_grid_is_rejected_at_construction() {
    let result = ParticleSim::new(
        RecordingBackend::default(),
        params_for(ParticleLayout::Grid {
            width: 20,
            height: 17,
        }),
        PipelineConfig::sph(),
    );

    assert!(matches!(
        result,
        Err(SimError::PipelineConfig(PipelineConfigError::LayoutMismatch { .. }))
    ));
}
