use bytemuck::{Pod, Zeroable};

use super::config::ParticleLayout;

/// Threads per work group. Linear layouts use 64×1×1, grid layouts 8×8×1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleWorkgroup {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl ParticleWorkgroup {
    pub const LINEAR: Self = Self { x: 64, y: 1, z: 1 };
    pub const GRID: Self = Self { x: 8, y: 8, z: 1 };

    pub fn for_layout(layout: ParticleLayout) -> Self {
        if layout.is_grid() {
            Self::GRID
        } else {
            Self::LINEAR
        }
    }

    pub fn as_array(self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

impl Default for ParticleWorkgroup {
    fn default() -> Self {
        Self::LINEAR
    }
}

/// Group counts for one dispatch over every particle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleComputePlan {
    pub particle_count: u32,
    pub workgroup: ParticleWorkgroup,
    pub dispatch: [u32; 3],
}

impl ParticleComputePlan {
    pub fn new(layout: ParticleLayout) -> Self {
        let workgroup = ParticleWorkgroup::for_layout(layout);
        let dispatch = match layout {
            ParticleLayout::Linear { count } => [group_count(count, workgroup.x), 1, 1],
            ParticleLayout::Grid { width, height } => [
                group_count(width, workgroup.x),
                group_count(height, workgroup.y),
                1,
            ],
        };
        Self {
            particle_count: layout.particle_count(),
            workgroup,
            dispatch,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dispatch.contains(&0)
    }

    pub fn threads_launched(&self) -> u64 {
        self.dispatch
            .iter()
            .zip(self.workgroup.as_array())
            .map(|(groups, size)| u64::from(*groups) * u64::from(size))
            .product()
    }
}

/// `ceil(items / group_size)`; zero items need zero groups.
pub fn group_count(items: u32, group_size: u32) -> u32 {
    if items == 0 {
        0
    } else {
        ((items - 1) / group_size) + 1
    }
}

/// One particle's full physical state as laid out on the device.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct ParticleRecord {
    pub position: [f32; 3],
    pub density: f32,
    pub velocity: [f32; 3],
    pub pressure: f32,
}

/// Render-side copy of a particle position; `w` is unused padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PositionRecord {
    pub position: [f32; 3],
    pub _pad: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct ParticleBufferLayout {
    pub particle_stride_bytes: u64,
    pub position_stride_bytes: u64,
}

impl Default for ParticleBufferLayout {
    fn default() -> Self {
        Self {
            // position.xyz + density + velocity.xyz + pressure
            particle_stride_bytes: std::mem::size_of::<ParticleRecord>() as u64,
            // WGSL arrays of vec3<f32> have a 16-byte stride.
            position_stride_bytes: std::mem::size_of::<PositionRecord>() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{group_count, ParticleBufferLayout, ParticleComputePlan, ParticleWorkgroup};
    use crate::particles::config::ParticleLayout;

    #[test]
    fn linear_plan_rounds_up_dispatch() {
        for (count, groups) in [(100, 2), (128, 2), (129, 3), (64, 1), (2, 1)] {
            let plan = ParticleComputePlan::new(ParticleLayout::Linear { count });
            assert_eq!(plan.dispatch, [groups, 1, 1], "count {count}");
            assert_eq!(plan.workgroup, ParticleWorkgroup::LINEAR);
        }
    }

    #[test]
    fn grid_plan_uses_eight_by_eight() {
        let plan = ParticleComputePlan::new(ParticleLayout::Grid { width: 10, height: 17 });
        assert_eq!(plan.workgroup, ParticleWorkgroup::GRID);
        assert_eq!(plan.dispatch, [2, 3, 1]);
        assert_eq!(plan.particle_count, 170);
        assert!(plan.threads_launched() >= 170);
    }

    #[test]
    fn zero_items_need_no_groups() {
        assert_eq!(group_count(0, 64), 0);
        assert!(ParticleComputePlan::new(ParticleLayout::Linear { count: 0 }).is_empty());
    }

    #[test]
    fn record_strides_match_device_layout() {
        let layout = ParticleBufferLayout::default();
        assert_eq!(layout.particle_stride_bytes, 32);
        assert_eq!(layout.position_stride_bytes, 16);
    }
}
