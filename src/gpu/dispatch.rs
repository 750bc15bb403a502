//! Workgroup count math shared by every compute pass

use glam::UVec3;

/// Number of groups needed to cover `threads`, never less than one.
///
/// For host-recorded dispatches only; indirect dispatch args may be zero.
pub fn calculate_workgroups(threads: u32, group_size: u32) -> u32 {
    threads.div_ceil(group_size.max(1)).max(1)
}

/// Calculate workgroup counts for a 3D dispatch
pub fn workgroups_3d(size: UVec3, group_size: u32) -> (u32, u32, u32) {
    (
        calculate_workgroups(size.x, group_size),
        calculate_workgroups(size.y, group_size),
        calculate_workgroups(size.z, group_size),
    )
}

/// Calculate workgroup counts for a layered 2D dispatch
pub fn workgroups_2d(width: u32, height: u32, layers: u32, group_size: u32) -> (u32, u32, u32) {
    (
        calculate_workgroups(width, group_size),
        calculate_workgroups(height, group_size),
        layers.max(1),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workgroups_round_up_and_never_zero() {
        assert_eq!(calculate_workgroups(0, 64), 1);
        assert_eq!(calculate_workgroups(64, 64), 1);
        assert_eq!(calculate_workgroups(65, 64), 2);
        assert_eq!(workgroups_3d(UVec3::new(50, 9, 1), 4), (13, 3, 1));
        assert_eq!(workgroups_2d(17, 8, 0, 8), (3, 1, 1));
    }
}
