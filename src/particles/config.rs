use std::ops::RangeInclusive;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::ParameterClamped;

pub const PARTICLE_COUNT_RANGE: RangeInclusive<u32> = 2..=200;
pub const GRID_DIM_RANGE: RangeInclusive<u32> = 2..=200;
pub const TIME_STEP_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const PARTICLE_MASS_RANGE: RangeInclusive<f32> = 0.0..=10.0;
pub const STIFFNESS_RANGE: RangeInclusive<f32> = 0.0..=1000.0;
pub const VISCOSITY_RANGE: RangeInclusive<f32> = 0.0..=10.0;
pub const INTERACTION_RADIUS_RANGE: RangeInclusive<f32> = 0.0..=2.0;
pub const REST_DENSITY_RANGE: RangeInclusive<f32> = 0.0..=1000.0;
pub const DOMAIN_HALF_EXTENT_RANGE: RangeInclusive<f32> = 0.1..=100.0;
pub const BOUNDARY_COEFFICIENT_RANGE: RangeInclusive<f32> = 0.0..=1.0;

/// How particles are indexed on the device. Linear layouts dispatch a 1-D
/// range, grid layouts a 2-D one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticleLayout {
    Linear { count: u32 },
    Grid { width: u32, height: u32 },
}

impl Default for ParticleLayout {
    fn default() -> Self {
        Self::Linear { count: 64 }
    }
}

impl ParticleLayout {
    pub fn particle_count(self) -> u32 {
        match self {
            Self::Linear { count } => count,
            Self::Grid { width, height } => width * height,
        }
    }

    /// Smallest extent along any particle axis; sizes the draw bounds margin.
    pub fn min_dimension(self) -> u32 {
        match self {
            Self::Linear { count } => count,
            Self::Grid { width, height } => width.min(height),
        }
    }

    /// `(width, height)` in particles; a linear layout is a single row.
    pub fn extent(self) -> (u32, u32) {
        match self {
            Self::Linear { count } => (count, 1),
            Self::Grid { width, height } => (width, height),
        }
    }

    pub fn is_grid(self) -> bool {
        matches!(self, Self::Grid { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read parameter file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse parameter file: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// Unvalidated tunables as supplied by the host (sliders, a RON file, CLI).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterInput {
    pub layout: ParticleLayout,
    pub time_step: f32,
    pub particle_mass: f32,
    pub stiffness: f32,
    pub viscosity: f32,
    pub interaction_radius: f32,
    pub rest_density: f32,
    pub domain_half_extent: f32,
    pub boundary_coefficient: f32,
}

impl Default for ParameterInput {
    fn default() -> Self {
        Self {
            layout: ParticleLayout::default(),
            time_step: 1.0 / 60.0,
            particle_mass: 1.0,
            stiffness: 200.0,
            viscosity: 0.25,
            interaction_radius: 0.2,
            rest_density: 10.0,
            domain_half_extent: 1.0,
            boundary_coefficient: 0.5,
        }
    }
}

impl ParameterInput {
    pub fn from_ron_str(source: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_ron_str(&contents)
    }
}

/// Validated parameter set. Every field is inside its declared range; the
/// only way to build one is through [`SimulationParameters::new`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationParameters {
    layout: ParticleLayout,
    time_step: f32,
    particle_mass: f32,
    stiffness: f32,
    viscosity: f32,
    interaction_radius: f32,
    rest_density: f32,
    domain_half_extent: f32,
    boundary_coefficient: f32,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self::new(ParameterInput::default()).0
    }
}

impl SimulationParameters {
    /// Clamps each field into range. Out-of-range fields never fail; each one
    /// produces a [`ParameterClamped`] diagnostic.
    pub fn new(input: ParameterInput) -> (Self, Vec<ParameterClamped>) {
        let defaults = ParameterInput::default();
        let mut clamp = Clamper::default();

        let layout = match input.layout {
            ParticleLayout::Linear { count } => ParticleLayout::Linear {
                count: clamp.int("particle_count", count, PARTICLE_COUNT_RANGE),
            },
            ParticleLayout::Grid { width, height } => ParticleLayout::Grid {
                width: clamp.int("grid_width", width, GRID_DIM_RANGE),
                height: clamp.int("grid_height", height, GRID_DIM_RANGE),
            },
        };

        let params = Self {
            layout,
            time_step: clamp.float("time_step", input.time_step, TIME_STEP_RANGE, defaults.time_step),
            particle_mass: clamp.float(
                "particle_mass",
                input.particle_mass,
                PARTICLE_MASS_RANGE,
                defaults.particle_mass,
            ),
            stiffness: clamp.float("stiffness", input.stiffness, STIFFNESS_RANGE, defaults.stiffness),
            viscosity: clamp.float("viscosity", input.viscosity, VISCOSITY_RANGE, defaults.viscosity),
            interaction_radius: clamp.float(
                "interaction_radius",
                input.interaction_radius,
                INTERACTION_RADIUS_RANGE,
                defaults.interaction_radius,
            ),
            rest_density: clamp.float(
                "rest_density",
                input.rest_density,
                REST_DENSITY_RANGE,
                defaults.rest_density,
            ),
            domain_half_extent: clamp.float(
                "domain_half_extent",
                input.domain_half_extent,
                DOMAIN_HALF_EXTENT_RANGE,
                defaults.domain_half_extent,
            ),
            boundary_coefficient: clamp.float(
                "boundary_coefficient",
                input.boundary_coefficient,
                BOUNDARY_COEFFICIENT_RANGE,
                defaults.boundary_coefficient,
            ),
        };

        (params, clamp.diagnostics)
    }

    pub fn layout(&self) -> ParticleLayout {
        self.layout
    }

    pub fn particle_count(&self) -> u32 {
        self.layout.particle_count()
    }

    pub fn time_step(&self) -> f32 {
        self.time_step
    }

    pub fn particle_mass(&self) -> f32 {
        self.particle_mass
    }

    pub fn stiffness(&self) -> f32 {
        self.stiffness
    }

    pub fn viscosity(&self) -> f32 {
        self.viscosity
    }

    pub fn interaction_radius(&self) -> f32 {
        self.interaction_radius
    }

    pub fn rest_density(&self) -> f32 {
        self.rest_density
    }

    pub fn domain_half_extent(&self) -> f32 {
        self.domain_half_extent
    }

    pub fn boundary_coefficient(&self) -> f32 {
        self.boundary_coefficient
    }

    /// Inverse of [`SimulationParameters::new`]; feeding the result back in
    /// yields no diagnostics.
    pub fn to_input(&self) -> ParameterInput {
        ParameterInput {
            layout: self.layout,
            time_step: self.time_step,
            particle_mass: self.particle_mass,
            stiffness: self.stiffness,
            viscosity: self.viscosity,
            interaction_radius: self.interaction_radius,
            rest_density: self.rest_density,
            domain_half_extent: self.domain_half_extent,
            boundary_coefficient: self.boundary_coefficient,
        }
    }
}

#[derive(Default)]
struct Clamper {
    diagnostics: Vec<ParameterClamped>,
}

impl Clamper {
    fn int(&mut self, field: &'static str, value: u32, range: RangeInclusive<u32>) -> u32 {
        let stored = value.clamp(*range.start(), *range.end());
        if stored != value {
            self.report(field, f64::from(value), f64::from(stored));
        }
        stored
    }

    fn float(
        &mut self,
        field: &'static str,
        value: f32,
        range: RangeInclusive<f32>,
        fallback: f32,
    ) -> f32 {
        let stored = if value.is_nan() {
            fallback
        } else {
            value.clamp(*range.start(), *range.end())
        };
        if value.is_nan() || stored != value {
            self.report(field, f64::from(value), f64::from(stored));
        }
        stored
    }

    fn report(&mut self, field: &'static str, requested: f64, stored: f64) {
        let diagnostic = ParameterClamped {
            field,
            requested,
            stored,
        };
        log::warn!("{diagnostic}");
        self.diagnostics.push(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::{ParameterInput, ParticleLayout, SimulationParameters};

    #[test]
    fn negative_stiffness_clamps_to_zero() {
        let (params, clamped) = SimulationParameters::new(ParameterInput {
            stiffness: -1.0,
            ..ParameterInput::default()
        });
        assert_eq!(params.stiffness(), 0.0);
        assert_eq!(clamped.len(), 1);
        assert_eq!(clamped[0].field, "stiffness");
        assert_eq!(clamped[0].requested, -1.0);
        assert_eq!(clamped[0].stored, 0.0);
    }

    #[test]
    fn defaults_are_in_range() {
        let (_, clamped) = SimulationParameters::new(ParameterInput::default());
        assert!(clamped.is_empty());
    }

    #[test]
    fn particle_count_clamps_both_ends() {
        let (low, _) = SimulationParameters::new(ParameterInput {
            layout: ParticleLayout::Linear { count: 0 },
            ..ParameterInput::default()
        });
        let (high, _) = SimulationParameters::new(ParameterInput {
            layout: ParticleLayout::Linear { count: 5_000 },
            ..ParameterInput::default()
        });
        assert_eq!(low.particle_count(), 2);
        assert_eq!(high.particle_count(), 200);
    }

    #[test]
    fn grid_dimensions_clamp_independently() {
        let (params, clamped) = SimulationParameters::new(ParameterInput {
            layout: ParticleLayout::Grid { width: 1, height: 300 },
            ..ParameterInput::default()
        });
        assert_eq!(params.layout(), ParticleLayout::Grid { width: 2, height: 200 });
        assert_eq!(params.particle_count(), 400);
        let fields: Vec<_> = clamped.iter().map(|c| c.field).collect();
        assert_eq!(fields, ["grid_width", "grid_height"]);
    }

    #[test]
    fn nan_falls_back_to_default() {
        let (params, clamped) = SimulationParameters::new(ParameterInput {
            time_step: f32::NAN,
            ..ParameterInput::default()
        });
        assert_eq!(params.time_step(), ParameterInput::default().time_step);
        assert_eq!(clamped.len(), 1);
    }

    #[test]
    fn ron_input_fills_missing_fields_with_defaults() {
        let input = ParameterInput::from_ron_str(
            "(layout: Grid(width: 16, height: 8), viscosity: 0.5)",
        )
        .unwrap();
        assert_eq!(input.layout, ParticleLayout::Grid { width: 16, height: 8 });
        assert_eq!(input.viscosity, 0.5);
        assert_eq!(input.stiffness, ParameterInput::default().stiffness);
    }

    #[test]
    fn to_input_round_trips_without_diagnostics() {
        let (params, _) = SimulationParameters::new(ParameterInput {
            rest_density: 4_000.0,
            ..ParameterInput::default()
        });
        let (again, clamped) = SimulationParameters::new(params.to_input());
        assert_eq!(again, params);
        assert!(clamped.is_empty());
    }
}
