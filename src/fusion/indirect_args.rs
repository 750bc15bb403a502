//! Indirect draw/dispatch arguments derived from the triangle counter

use bytemuck::{Pod, Zeroable};

/// Default triangle capacity
pub const DEFAULT_MAX_TRIANGLES: u32 = 200_000;

/// Headroom added on top of the sampled count when recalibrating capacity
pub const TRIANGLE_HEADROOM: f32 = 0.2;

/// Default thread-group size of downstream per-triangle passes
pub const DEFAULT_DISPATCH_GROUP_SIZE: u32 = super::WORKGROUP_SIZE_1D;

/// Layout of wgpu's `draw_indirect` arguments
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndirectArgs {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// Layout of wgpu's `dispatch_workgroups_indirect` arguments
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchIndirectArgs {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ArgsUniforms {
    pub capacity: u32,
    pub instance_count: u32,
    pub group_size: u32,
    pub groups_y: u32,
    pub groups_z: u32,
    pub _padding: [u32; 3],
}

/// Indirect-args settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgsSettings {
    pub capacity: u32,
    pub stereo_instancing: bool,
    pub group_size: u32,
    pub groups_y: u32,
    pub groups_z: u32,
}

impl Default for ArgsSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MAX_TRIANGLES,
            stereo_instancing: false,
            group_size: DEFAULT_DISPATCH_GROUP_SIZE,
            groups_y: 1,
            groups_z: 1,
        }
    }
}

impl ArgsSettings {
    pub fn uniforms(&self) -> ArgsUniforms {
        ArgsUniforms {
            capacity: self.capacity,
            instance_count: if self.stereo_instancing { 2 } else { 1 },
            group_size: self.group_size.max(1),
            groups_y: self.groups_y.max(1),
            groups_z: self.groups_z.max(1),
            _padding: [0; 3],
        }
    }
}

/// Draw and dispatch args for a raw append-counter value.
///
/// The counter may exceed capacity; only stored triangles are drawn.
pub fn prepare_args(counter: u32, uniforms: &ArgsUniforms) -> (DrawIndirectArgs, DispatchIndirectArgs) {
    let stored = counter.min(uniforms.capacity);
    let draw = DrawIndirectArgs {
        vertex_count: stored.saturating_mul(3),
        instance_count: uniforms.instance_count,
        first_vertex: 0,
        first_instance: 0,
    };
    let dispatch = DispatchIndirectArgs {
        x: stored.div_ceil(uniforms.group_size.max(1)),
        y: uniforms.groups_y,
        z: uniforms.groups_z,
    };
    (draw, dispatch)
}

/// Capacity for a sampled triangle count plus headroom
pub fn recalibrated_capacity(count: u32) -> u32 {
    let capacity = count.saturating_add((count as f32 * TRIANGLE_HEADROOM).floor() as u32);
    if capacity == 0 {
        DEFAULT_MAX_TRIANGLES
    } else {
        capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_layouts() {
        assert_eq!(std::mem::size_of::<DrawIndirectArgs>(), 16);
        assert_eq!(std::mem::size_of::<DispatchIndirectArgs>(), 12);
        assert_eq!(std::mem::size_of::<ArgsUniforms>(), 32);
    }

    #[test]
    fn test_stereo_doubles_instances() {
        let settings = ArgsSettings {
            stereo_instancing: true,
            ..Default::default()
        };
        let (draw, dispatch) = prepare_args(100, &settings.uniforms());
        assert_eq!(draw.vertex_count, 300);
        assert_eq!(draw.instance_count, 2);
        assert_eq!(dispatch.x, 2);
        assert_eq!((dispatch.y, dispatch.z), (1, 1));
    }

    #[test]
    fn test_empty_counter_dispatches_nothing() {
        let (draw, dispatch) = prepare_args(0, &ArgsSettings::default().uniforms());
        assert_eq!(draw.vertex_count, 0);
        assert_eq!(dispatch.x, 0);
        assert_eq!((dispatch.y, dispatch.z), (1, 1));
    }

    #[test]
    fn test_overflowing_counter_is_clamped() {
        let settings = ArgsSettings {
            capacity: 10,
            ..Default::default()
        };
        let (draw, _) = prepare_args(25, &settings.uniforms());
        assert_eq!(draw.vertex_count, 30);
    }

    #[test]
    fn test_recalibration_headroom() {
        assert_eq!(recalibrated_capacity(1000), 1200);
        assert_eq!(recalibrated_capacity(7), 8);
        assert_eq!(recalibrated_capacity(0), DEFAULT_MAX_TRIANGLES);
    }
}
