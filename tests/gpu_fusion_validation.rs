//! GPU Fusion Validation Tests
//!
//! Runs the WGSL kernels against the CPU reference kernels on the same
//! synthetic captures. Skips when no adapter is available.

use depth_fusion_engine::perspective::synthetic::SyntheticCapture;
use depth_fusion_engine::{
    BackendPreference, FusionConfig, GenerationStrategy, GeneratorTree, GpuContext, NodeHandle, SharedFrame,
    VolumetricMeshSource,
};
use glam::Vec3;
use std::sync::Arc;

/// Tolerance for floating point comparisons
const FLOAT_TOLERANCE: f32 = 0.001;

/// Initialize GPU context for tests
fn init_gpu() -> Option<(Arc<wgpu::Device>, Arc<wgpu::Queue>)> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });

    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))?;

    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("GPU Test Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
        },
        None,
    ))
    .ok()?;

    Some((Arc::new(device), Arc::new(queue)))
}

fn run(
    capture: impl Fn() -> SyntheticCapture,
    mut config: FusionConfig,
    gpu: Option<GpuContext>,
) -> (GeneratorTree, NodeHandle, Arc<SharedFrame>) {
    let capture = capture();
    let frames = SharedFrame::new();
    frames.present(capture.frame);

    config.backend = if gpu.is_some() {
        BackendPreference::Gpu
    } else {
        BackendPreference::Cpu
    };
    let mut source = VolumetricMeshSource::new("validation", config, frames.clone());
    if let Some(context) = gpu {
        source = source.with_gpu(context);
    }
    source.set_table(capture.table);

    let mut tree = GeneratorTree::new();
    let handle = tree.insert(source, None).unwrap();
    tree.tick().unwrap();
    (tree, handle, frames)
}

fn source(tree: &GeneratorTree, handle: NodeHandle) -> &VolumetricMeshSource {
    tree.node::<VolumetricMeshSource>(handle).unwrap()
}

fn assert_fields_match(cpu: &[f32], gpu: &[f32]) {
    assert_eq!(cpu.len(), gpu.len());
    let mut mismatches = 0;
    for (i, (c, g)) in cpu.iter().zip(gpu).enumerate() {
        if (c - g).abs() > FLOAT_TOLERANCE {
            if mismatches < 10 {
                println!("voxel {}: cpu {} gpu {}", i, c, g);
            }
            mismatches += 1;
        }
    }
    assert_eq!(mismatches, 0, "{} voxels differ between CPU and GPU", mismatches);
}

fn plane() -> SyntheticCapture {
    SyntheticCapture::facing_plane(64, 1.0, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE).unwrap()
}

fn sphere() -> SyntheticCapture {
    SyntheticCapture::sphere_ring(3, 32, 0.3).unwrap()
}

#[test]
fn test_gpu_plane_matches_cpu() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };
    let mut config = FusionConfig::default();
    config.volume.density = 50.0;

    let (cpu_tree, cpu, _cpu_frames) = run(plane, config.clone(), None);
    let (gpu_tree, gpu, _gpu_frames) = run(plane, config, Some(GpuContext::from_parts(device, queue)));
    assert!(source(&gpu_tree, gpu).backend().unwrap().is_gpu());

    let cpu_source = source(&cpu_tree, cpu);
    let gpu_source = source(&gpu_tree, gpu);
    assert_fields_match(&cpu_source.field_snapshot().unwrap(), &gpu_source.field_snapshot().unwrap());

    let count = gpu_source.triangle_count().unwrap();
    assert_eq!(count, cpu_source.triangle_count().unwrap());
    assert_eq!(gpu_source.draw_args().unwrap(), cpu_source.draw_args().unwrap());
    // The GPU backend never stalls inside generate
    assert_eq!(gpu_source.last_report().triangle_count, None);
}

#[test]
fn test_gpu_multi_pass_with_smoothing_matches_cpu() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };
    let mut config = FusionConfig::default();
    config.volume.density = 40.0;
    config.volume.generation_method = GenerationStrategy::MultiPass;
    config.smoothing.enabled = true;
    config.smoothing.radius = 1.0;

    let (cpu_tree, cpu, _cpu_frames) = run(sphere, config.clone(), None);
    let (gpu_tree, gpu, _gpu_frames) = run(sphere, config, Some(GpuContext::from_parts(device, queue)));

    assert_fields_match(
        &source(&cpu_tree, cpu).field_snapshot().unwrap(),
        &source(&gpu_tree, gpu).field_snapshot().unwrap(),
    );
    let cpu_count = source(&cpu_tree, cpu).triangle_count().unwrap();
    let gpu_count = source(&gpu_tree, gpu).triangle_count().unwrap();
    // Cells sitting exactly on the threshold may flip between backends
    let slack = cpu_count / 100 + 2;
    assert!(cpu_count.abs_diff(gpu_count) <= slack, "cpu {} gpu {}", cpu_count, gpu_count);
}

#[test]
fn test_gpu_mask_and_lod_pass_runs() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };
    let mut config = FusionConfig::default();
    config.volume.density = 50.0;
    config.mask.enabled = true;
    config.mask.blur_enabled = true;
    config.mask.downscale = 4;

    let (mut tree, handle, _frames) = run(plane, config, Some(GpuContext::from_parts(device, queue)));
    let full = source(&tree, handle).triangle_count().unwrap();
    assert!(full > 0);

    tree.node_mut::<VolumetricMeshSource>(handle).unwrap().set_lod_level(1);
    tree.tick().unwrap();
    let coarse = source(&tree, handle).triangle_count().unwrap();
    assert!(coarse > 0 && coarse < full, "LOD 1 gave {} triangles, LOD 0 gave {}", coarse, full);

    let (draw, dispatch) = source(&tree, handle).draw_args().unwrap();
    assert_eq!(draw.vertex_count, coarse * 3);
    assert!(dispatch.x >= 1);
}

#[test]
fn test_gpu_overflow_keeps_counting() {
    let Some((device, queue)) = init_gpu() else {
        println!("Skipping GPU test - no GPU available");
        return;
    };
    let mut config = FusionConfig::default();
    config.volume.density = 50.0;
    config.triangles.max_triangles = 64;

    let (tree, handle, _frames) = run(plane, config, Some(GpuContext::from_parts(device, queue)));
    let source = source(&tree, handle);
    assert!(source.triangle_count().unwrap() > 64);
    assert_eq!(source.triangles().unwrap().len(), 64);
    assert_eq!(source.draw_args().unwrap().0.vertex_count, 64 * 3);
}
