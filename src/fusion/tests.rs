#[cfg(test)]
mod tests {
    use crate::fusion::march_tables::{flattened_triangle_table, EDGE_CORNERS, TRIANGLE_COUNT, TRIANGLE_TABLE};
    use crate::fusion::surface::{cell_case, extract_surface, ExtractUniforms, TriangleAppendBuffer};
    use crate::fusion::grid::{VolumeBounds, VoxelGrid};
    use crate::fusion::{WORKGROUP_SIZE_2D, WORKGROUP_SIZE_3D};
    use glam::{UVec3, Vec3};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn valid_triples(case: usize) -> usize {
        TRIANGLE_TABLE[case]
            .chunks_exact(3)
            .take_while(|triple| triple[0] >= 0)
            .count()
    }

    #[test]
    fn test_table_matches_triangle_counts() {
        for case in 0..256 {
            assert_eq!(
                valid_triples(case) as u32,
                TRIANGLE_COUNT[case],
                "case {} disagrees with its triangle count",
                case
            );
        }
        assert_eq!(TRIANGLE_COUNT[0], 0);
        assert_eq!(TRIANGLE_COUNT[255], 0);
    }

    #[test]
    fn test_table_rows_are_sentinel_terminated() {
        for (case, row) in TRIANGLE_TABLE.iter().enumerate() {
            let used = valid_triples(case) * 3;
            assert!(row[..used].iter().all(|&edge| (0..12).contains(&edge)), "case {}", case);
            assert!(row[used..].iter().all(|&edge| edge == -1), "case {}", case);
        }
        assert_eq!(flattened_triangle_table().len(), 256 * 16);
    }

    #[test]
    fn test_edges_join_adjacent_corners() {
        use crate::fusion::march_tables::CORNER_OFFSETS;
        for [a, b] in EDGE_CORNERS {
            let pa = UVec3::from_array(CORNER_OFFSETS[a]).as_ivec3();
            let pb = UVec3::from_array(CORNER_OFFSETS[b]).as_ivec3();
            let d = (pa - pb).abs();
            assert_eq!(d.x + d.y + d.z, 1);
        }
    }

    #[test]
    fn test_counter_equals_sum_of_case_counts() {
        let grid = VoxelGrid::new(VolumeBounds::new(Vec3::ZERO, Vec3::splat(1.0)), 10.0);
        let mut rng = StdRng::seed_from_u64(7);
        let field: Vec<f32> = (0..grid.total_voxels()).map(|_| rng.gen_range(0.0..1.0)).collect();
        let uniforms = ExtractUniforms::new(&grid, 1, 0.5, u32::MAX);

        let cells = uniforms.cell_dims();
        let mut expected = 0;
        for z in 0..cells.z {
            for y in 0..cells.y {
                for x in 0..cells.x {
                    let cell = UVec3::new(x, y, z);
                    let mut corners = [0.0f32; 8];
                    for (corner, offset) in corners.iter_mut().zip(crate::fusion::march_tables::CORNER_OFFSETS) {
                        *corner = field[grid.index(cell + UVec3::from_array(offset))];
                    }
                    expected += TRIANGLE_COUNT[cell_case(&corners, 0.5)];
                }
            }
        }

        let mut output = TriangleAppendBuffer::with_capacity(u32::MAX);
        extract_surface(&field, &uniforms, &mut output);
        assert_eq!(output.counter(), expected);
        assert!(expected > 0);
    }

    #[test]
    fn test_kernel_workgroup_sizes_match_host_constants() {
        let three_d = format!("@workgroup_size({0}, {0}, {0})", WORKGROUP_SIZE_3D);
        let two_d = format!("@workgroup_size({0}, {0}, 1)", WORKGROUP_SIZE_2D);
        assert!(include_str!("shaders/volume.wgsl").contains(&three_d));
        assert!(include_str!("shaders/extract.wgsl").contains(&three_d));
        assert!(include_str!("shaders/gaussian_blur.wgsl").contains(&three_d));
        assert!(include_str!("shaders/gaussian_blur.wgsl").contains(&two_d));
        assert!(include_str!("shaders/mask_sobel.wgsl").contains(&two_d));
        assert!(include_str!("shaders/mask_downscale.wgsl").contains(&two_d));
        assert!(include_str!("shaders/normal_weight.wgsl").contains(&two_d));
    }
}
