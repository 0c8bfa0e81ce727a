use particle_orchestrator::backend::draw::RenderTargetConfig;
use particle_orchestrator::backend::gpu::WgpuBackend;
use particle_orchestrator::backend::program::KernelProgram;
use particle_orchestrator::backend::recording::RecordingBackend;
use particle_orchestrator::backend::{ComputeBackend, RenderBackend};
use particle_orchestrator::particles::{
    ParameterInput, ParticleLayout, ParticleSim, PipelineConfig, SimulationParameters,
};

type BoxError = Box<dyn std::error::Error>;

fn main() {
    env_logger::init();
    if let Err(err) = pollster::block_on(run()) {
        eprintln!("particle-orchestrator failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let frames = parse_arg::<u64>(&args, "--frames").unwrap_or(120);
    let pipeline = parse_arg::<String>(&args, "--pipeline");
    let dry_run = args.iter().any(|v| v == "--dry-run");

    let mut input = match parse_arg::<String>(&args, "--params") {
        Some(path) => ParameterInput::load(path)?,
        None => ParameterInput::default(),
    };
    if let Some(count) = parse_arg::<u32>(&args, "--count") {
        input.layout = ParticleLayout::Linear { count };
    }
    if let Some((width, height)) = parse_arg::<String>(&args, "--grid").and_then(|v| parse_grid(&v))
    {
        input.layout = ParticleLayout::Grid { width, height };
    }
    // Without an explicit pipeline, pick the one that dispatches over the layout.
    let wave = match pipeline.as_deref() {
        Some("wave") => true,
        Some(_) => false,
        None => input.layout.is_grid(),
    };
    if wave && !input.layout.is_grid() {
        input.layout = ParticleLayout::Grid {
            width: 10,
            height: 10,
        };
    }

    let (params, clamped) = SimulationParameters::new(input);
    for c in &clamped {
        println!("note: {c}");
    }
    let config = if wave {
        PipelineConfig::wave()
    } else {
        PipelineConfig::sph()
    };

    println!(
        "Particle orchestrator: {} frames, {:?}, pipeline={:?}{}",
        frames,
        params.layout(),
        config.steps(),
        if dry_run { " (dry run)" } else { "" }
    );

    if dry_run {
        let mut sim = ParticleSim::new(RecordingBackend::default(), params, config)?;
        drive(&mut sim, frames)?;
        println!(
            "Recorded {} dispatches and {} draws.",
            sim.backend().dispatch_log().len(),
            sim.backend().draws().count()
        );
        sim.deactivate()?;
        return Ok(());
    }

    let program = if wave {
        KernelProgram::builtin_wave()?
    } else {
        KernelProgram::builtin_sph()?
    };
    let backend = WgpuBackend::request_headless(program)
        .await?
        .with_render_target(RenderTargetConfig::default());
    let mut sim = ParticleSim::new(backend, params, config)?;
    drive(&mut sim, frames)?;

    if let Some(buffer) = sim.positions_buffer() {
        let sample = sim
            .backend()
            .read_positions(buffer, params.particle_count().min(8))?;
        for (i, p) in sample.iter().enumerate() {
            println!(
                "  particle[{i}] = ({:.3}, {:.3}, {:.3})",
                p.position[0], p.position[1], p.position[2]
            );
        }
    }
    sim.deactivate()?;
    Ok(())
}

fn drive<B: ComputeBackend + RenderBackend>(
    sim: &mut ParticleSim<B>,
    frames: u64,
) -> Result<(), BoxError> {
    sim.activate()?;
    for _ in 0..frames {
        sim.step()?;
    }
    println!(
        "Done. frames_rendered={} counter={} live_bytes={}",
        sim.frames_rendered(),
        sim.counter(),
        sim.pool().live_bytes()
    );
    Ok(())
}

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str) -> Option<T> {
    args.iter()
        .position(|v| v == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse::<T>().ok())
}

fn parse_grid(value: &str) -> Option<(u32, u32)> {
    let (width, height) = value.split_once(['x', 'X'])?;
    Some((width.parse().ok()?, height.parse().ok()?))
}
