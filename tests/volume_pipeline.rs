//! Volume Pipeline Integration Tests
//!
//! Runs a volumetric mesh source on the CPU kernels through the generator
//! tree and checks the fused field, the extracted surface and the indirect
//! arguments for synthetic captures.

use depth_fusion_engine::config::PerspectiveOverride;
use depth_fusion_engine::fusion::indirect_args::DEFAULT_DISPATCH_GROUP_SIZE;
use depth_fusion_engine::fusion::{recalibrated_capacity, MaskView};
use depth_fusion_engine::perspective::synthetic::SyntheticCapture;
use depth_fusion_engine::{
    BackendPreference, FusionBackend, FusionConfig, GenerationStrategy, GeneratorTree, NodeHandle, SharedFrame,
    TriangleRecord, VolumetricMeshSource,
};
use glam::{UVec3, Vec3};
use std::sync::Arc;

const FIELD_TOLERANCE: f32 = 1e-5;

fn cpu_config(density: f32) -> FusionConfig {
    let mut config = FusionConfig::default();
    config.backend = BackendPreference::Cpu;
    config.volume.density = density;
    config
}

/// One camera at the origin facing a plane at z = 1, inside a unit cube
/// centered on the plane
fn plane_capture() -> SyntheticCapture {
    SyntheticCapture::facing_plane(64, 1.0, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE).unwrap()
}

fn run_source(capture: SyntheticCapture, config: FusionConfig) -> (GeneratorTree, NodeHandle, Arc<SharedFrame>) {
    let frames = SharedFrame::new();
    frames.present(capture.frame);
    let mut source = VolumetricMeshSource::new("test", config, frames.clone());
    source.set_table(capture.table);

    let mut tree = GeneratorTree::new();
    let handle = tree.insert(source, None).unwrap();
    tree.tick().unwrap();
    (tree, handle, frames)
}

fn source(tree: &GeneratorTree, handle: NodeHandle) -> &VolumetricMeshSource {
    tree.node::<VolumetricMeshSource>(handle).unwrap()
}

#[test]
fn test_grid_dims_follow_density() {
    let (tree, handle, _frames) = run_source(plane_capture(), cpu_config(50.0));
    let grid = source(&tree, handle).grid().copied().unwrap();
    assert_eq!(grid.dims, UVec3::splat(50));
    assert_eq!(grid.total_voxels(), 125_000);
    assert_eq!(source(&tree, handle).field_snapshot().unwrap().len(), 125_000);
}

#[test]
fn test_plane_surface_lies_on_the_plane() {
    let (tree, handle, _frames) = run_source(plane_capture(), cpu_config(50.0));
    let source = source(&tree, handle);

    let count = source.triangle_count().unwrap();
    assert!(count > 0);
    // One crossing per column at most two triangles per cell
    assert!(count <= 2 * 49 * 49, "{} triangles for a single plane", count);

    let triangles = source.triangles().unwrap();
    assert_eq!(triangles.len(), count as usize);
    let mean_z = triangles
        .iter()
        .flat_map(|t| t.vertices.iter())
        .map(|v| v.position[2])
        .sum::<f32>()
        / (triangles.len() * 3) as f32;
    assert!((mean_z - 1.0).abs() < 0.05, "surface sits at z = {}", mean_z);

    let (draw, dispatch) = source.draw_args().unwrap();
    assert_eq!(draw.vertex_count, count * 3);
    assert_eq!(draw.instance_count, 1);
    assert_eq!(dispatch.x, count.div_ceil(DEFAULT_DISPATCH_GROUP_SIZE));
}

#[test]
fn test_disabled_perspectives_resolve_to_unknown_weight() {
    let mut config = cpu_config(50.0);
    config.perspectives.push(PerspectiveOverride {
        index: 0,
        enabled: Some(false),
        ..Default::default()
    });
    let unknown = config.weights.weight_unknown;
    let (tree, handle, _frames) = run_source(plane_capture(), config);
    let source = source(&tree, handle);

    let field = source.field_snapshot().unwrap();
    assert!(field.iter().all(|v| (v - unknown).abs() < FIELD_TOLERANCE));
    assert_eq!(source.triangle_count().unwrap(), 0);
    let (draw, dispatch) = source.draw_args().unwrap();
    assert_eq!(draw.vertex_count, 0);
    // Nothing stored, so the consumer dispatch is empty
    assert_eq!(dispatch.x, 0);
}

#[test]
fn test_single_and_multi_pass_fields_agree() {
    let capture = || SyntheticCapture::sphere_ring(3, 32, 0.3).unwrap();

    let mut single = cpu_config(40.0);
    single.volume.generation_method = GenerationStrategy::SinglePass;
    let mut multi = single.clone();
    multi.volume.generation_method = GenerationStrategy::MultiPass;

    let (tree_a, a, _fa) = run_source(capture(), single);
    let (tree_b, b, _fb) = run_source(capture(), multi);

    let field_a = source(&tree_a, a).field_snapshot().unwrap();
    let field_b = source(&tree_b, b).field_snapshot().unwrap();
    assert_eq!(field_a.len(), field_b.len());
    for (i, (x, y)) in field_a.iter().zip(&field_b).enumerate() {
        assert!((x - y).abs() < FIELD_TOLERANCE, "voxel {}: {} vs {}", i, x, y);
    }
    assert_eq!(
        source(&tree_a, a).triangle_count().unwrap(),
        source(&tree_b, b).triangle_count().unwrap()
    );
}

#[test]
fn test_smoothing_keeps_the_surface() {
    let mut config = cpu_config(40.0);
    config.smoothing.enabled = true;
    config.smoothing.radius = 1.0;
    let (tree, handle, _frames) = run_source(SyntheticCapture::sphere_ring(3, 32, 0.3).unwrap(), config);
    let field = source(&tree, handle).field_snapshot().unwrap();
    assert!(field.iter().all(|v| (0.0..=1.0).contains(v)));
    assert!(source(&tree, handle).triangle_count().unwrap() > 0);
}

#[test]
fn test_coarser_lod_emits_fewer_triangles() {
    let (mut tree, handle, _frames) = run_source(plane_capture(), cpu_config(50.0));
    assert_eq!(source(&tree, handle).num_levels(), 1);
    let full = source(&tree, handle).triangle_count().unwrap();

    tree.node_mut::<VolumetricMeshSource>(handle).unwrap().set_lod_level(1);
    tree.tick().unwrap();
    assert_eq!(source(&tree, handle).lod_level(), 1);
    let coarse = source(&tree, handle).triangle_count().unwrap();
    assert!(coarse > 0);
    assert!(coarse < full, "LOD 1 gave {} triangles, LOD 0 gave {}", coarse, full);

    // Levels past the grid's range clamp to the coarsest one
    tree.node_mut::<VolumetricMeshSource>(handle).unwrap().set_lod_level(9);
    tree.tick().unwrap();
    assert_eq!(source(&tree, handle).lod_level(), 1);
    assert_eq!(source(&tree, handle).triangle_count().unwrap(), coarse);
}

#[test]
fn test_overflow_is_clamped_then_recalibrated() {
    let mut config = cpu_config(50.0);
    config.triangles.max_triangles = 100;
    let (mut tree, handle, _frames) = run_source(plane_capture(), config);

    let count = source(&tree, handle).triangle_count().unwrap();
    assert!(count > 100);
    assert_eq!(source(&tree, handle).triangles().unwrap().len(), 100);
    let (draw, _) = source(&tree, handle).draw_args().unwrap();
    assert_eq!(draw.vertex_count, 300);

    let capacity = tree
        .node_mut::<VolumetricMeshSource>(handle)
        .unwrap()
        .request_recalibration()
        .unwrap();
    assert_eq!(capacity, recalibrated_capacity(count));
    tree.tick().unwrap();

    let source = source(&tree, handle);
    assert_eq!(source.triangle_count().unwrap(), count);
    assert_eq!(source.triangles().unwrap().len(), count as usize);
}

#[test]
fn test_downscaled_mask_reaches_the_volume_pass() {
    let mut config = cpu_config(40.0);
    config.mask.enabled = true;
    config.mask.downscale = 4;
    let (tree, handle, _frames) = run_source(SyntheticCapture::sphere_ring(2, 64, 0.3).unwrap(), config);

    let Some(FusionBackend::Cpu(cpu)) = source(&tree, handle).backend() else {
        panic!("expected the CPU backend");
    };
    let full = cpu.mask().mask_texture().unwrap();
    let down = cpu.mask().downscaled_mask().unwrap();
    assert!(matches!(down, MaskView::Reduced { .. }));
    assert_eq!(down.width(), full.width() / 4);
    assert_eq!(down.height(), full.height() / 4);
    assert_eq!(down.scale(), 4);
}

#[test]
fn test_normal_weights_reach_the_volume_pass() {
    let capture = || SyntheticCapture::sphere_ring(3, 64, 0.3).unwrap();
    let mut weighted = cpu_config(40.0);
    weighted.normal_weights.resolution_reduction = 2;
    let mut unweighted = weighted.clone();
    unweighted.normal_weights.enabled = false;

    let (tree_a, a, _fa) = run_source(capture(), weighted);
    let (tree_b, b, _fb) = run_source(capture(), unweighted);

    let Some(FusionBackend::Cpu(cpu)) = source(&tree_a, a).backend() else {
        panic!("expected the CPU backend");
    };
    let layout = *cpu.normal_weights().layout().unwrap();
    assert_eq!((layout.width(), layout.height(), layout.slices), (32, 32, 3));
    let weights = cpu.normal_weights().view().unwrap();
    // The sphere curves away from every camera toward its silhouette
    assert!(weights.values.iter().any(|w| *w < 0.9));

    let Some(FusionBackend::Cpu(plain)) = source(&tree_b, b).backend() else {
        panic!("expected the CPU backend");
    };
    assert!(plain.normal_weights().layout().is_none());

    let field_a = source(&tree_a, a).field_snapshot().unwrap();
    let field_b = source(&tree_b, b).field_snapshot().unwrap();
    assert!(field_a.iter().zip(&field_b).any(|(x, y)| (x - y).abs() > FIELD_TOLERANCE));
    assert!(source(&tree_a, a).triangle_count().unwrap() > 0);
}

#[test]
fn test_new_frame_regenerates_on_next_tick() {
    let (mut tree, handle, frames) = run_source(SyntheticCapture::sphere_ring(3, 32, 0.3).unwrap(), cpu_config(40.0));
    let before = source(&tree, handle).triangles().unwrap();

    frames.present(SyntheticCapture::sphere_ring(3, 32, 0.2).unwrap().frame);
    tree.tick().unwrap();
    let after = source(&tree, handle).triangles().unwrap();

    let mean_radius = |triangles: &[TriangleRecord]| {
        let sum: f32 = triangles
            .iter()
            .flat_map(|t| t.vertices.iter())
            .map(|v| Vec3::from_array(v.position).length())
            .sum();
        sum / (triangles.len() * 3).max(1) as f32
    };
    assert!(!after.is_empty());
    assert!(mean_radius(&after) < mean_radius(&before));
}
