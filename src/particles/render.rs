use glam::Vec3;

use crate::backend::RenderBackend;

use super::error::SimError;
use super::pool::BufferHandle;

/// Axis-aligned box handed to the renderer for culling and framing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawBounds {
    pub center: Vec3,
    pub size: Vec3,
    /// Extra room past the domain so boundary particles are not clipped;
    /// also roughly one particle spacing.
    pub margin: f32,
}

impl DrawBounds {
    /// Cube of side `2·h + 2·h / min_dimension` centred at the origin.
    pub fn for_domain(half_extent: f32, min_dimension: u32) -> Self {
        let side = 2.0 * half_extent;
        let margin = side / min_dimension.max(1) as f32;
        Self {
            center: Vec3::ZERO,
            size: Vec3::splat(side + margin),
            margin,
        }
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.size * 0.5
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.size * 0.5
    }

    pub fn contains(&self, point: Vec3) -> bool {
        point.cmpge(self.min()).all() && point.cmple(self.max()).all()
    }
}

/// Issues the per-frame instanced draw of the simulated particles.
#[derive(Debug, Default, Clone, Copy)]
pub struct RenderSubmitter;

impl RenderSubmitter {
    /// Draws `count` instances reading `positions`. Drawing with no position
    /// buffer bound is a programming error.
    pub fn draw<B: RenderBackend>(
        &self,
        backend: &mut B,
        positions: Option<&B::Buffer>,
        count: u32,
        half_extent: f32,
        min_dimension: u32,
    ) -> Result<DrawBounds, SimError> {
        let positions = positions.ok_or(SimError::InvalidHandle(BufferHandle::UNBOUND))?;
        let bounds = DrawBounds::for_domain(half_extent, min_dimension);
        backend.draw_instanced(positions, count, bounds);
        Ok(bounds)
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::{DrawBounds, RenderSubmitter};
    use crate::backend::recording::RecordingBackend;
    use crate::particles::error::SimError;

    #[test]
    fn bounds_match_unit_domain_formula() {
        // 2 + 2 / min(nx, ny) at half-extent 1
        let bounds = DrawBounds::for_domain(1.0, 10);
        assert!((bounds.size.x - 2.2).abs() < 1e-6);
        assert_eq!(bounds.size.x, bounds.size.z);
        assert_eq!(bounds.center, Vec3::ZERO);
    }

    #[test]
    fn bounds_cover_boundary_particles() {
        let bounds = DrawBounds::for_domain(3.0, 50);
        assert!(bounds.contains(Vec3::splat(3.0)));
        assert!(bounds.contains(Vec3::splat(-3.0)));
        assert!(!bounds.contains(Vec3::new(4.0, 0.0, 0.0)));
    }

    #[test]
    fn unbound_positions_is_invalid_handle() {
        let mut backend = RecordingBackend::default();
        let err = RenderSubmitter
            .draw(&mut backend, None, 10, 1.0, 10)
            .unwrap_err();
        assert!(matches!(err, SimError::InvalidHandle(h) if h.is_unbound()));
        assert_eq!(backend.draws().count(), 0);
    }
}
