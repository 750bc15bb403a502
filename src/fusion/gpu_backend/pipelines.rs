//! Compute pipelines and bind group layouts for the fusion kernels

use crate::fusion::error::{FusionErrorContext, FusionResult};
use std::borrow::Cow;
use wgpu::{BindGroupLayout, BufferBindingType, ComputePipeline, Device};

/// Constants generated by build.rs, prepended to every kernel
const FUSION_CONSTANTS: &str = include_str!(concat!(env!("OUT_DIR"), "/fusion_constants.wgsl"));

const MASK_SOBEL: &str = include_str!("../shaders/mask_sobel.wgsl");
const GAUSSIAN_BLUR: &str = include_str!("../shaders/gaussian_blur.wgsl");
const MASK_DOWNSCALE: &str = include_str!("../shaders/mask_downscale.wgsl");
const NORMAL_WEIGHT: &str = include_str!("../shaders/normal_weight.wgsl");
const VOLUME: &str = include_str!("../shaders/volume.wgsl");
const EXTRACT: &str = include_str!("../shaders/extract.wgsl");
const PREPARE_ARGS: &str = include_str!("../shaders/prepare_args.wgsl");

/// Every kernel body with its label
pub const KERNEL_SOURCES: [(&str, &str); 7] = [
    ("Mask Sobel", MASK_SOBEL),
    ("Gaussian Blur", GAUSSIAN_BLUR),
    ("Mask Downscale", MASK_DOWNSCALE),
    ("Normal Weights", NORMAL_WEIGHT),
    ("Volume Generation", VOLUME),
    ("Surface Extraction", EXTRACT),
    ("Indirect Args", PREPARE_ARGS),
];

/// Full WGSL source of a kernel body
pub fn kernel_source(body: &str) -> String {
    format!("{}\n{}", FUSION_CONSTANTS, body)
}

const UNIFORM: BufferBindingType = BufferBindingType::Uniform;
const READ: BufferBindingType = BufferBindingType::Storage { read_only: true };
const READ_WRITE: BufferBindingType = BufferBindingType::Storage { read_only: false };

/// One layout plus the pipelines that share it
pub struct KernelPipelines {
    pub layout: BindGroupLayout,
    pub pipelines: Vec<ComputePipeline>,
}

impl KernelPipelines {
    pub fn pipeline(&self, index: usize) -> FusionResult<&ComputePipeline> {
        self.pipelines.get(index).fusion_context("compute pipeline")
    }
}

/// Every pipeline the GPU backend dispatches
pub struct FusionPipelines {
    pub sobel: KernelPipelines,
    /// `[blur_volume, blur_image]`
    pub blur: KernelPipelines,
    pub downscale: KernelPipelines,
    pub normal_weight: KernelPipelines,
    /// `[generate_single_pass, generate_multi_pass]`
    pub volume: KernelPipelines,
    pub extract: KernelPipelines,
    pub args: KernelPipelines,
}

pub const BLUR_VOLUME: usize = 0;
pub const BLUR_IMAGE: usize = 1;
pub const VOLUME_SINGLE_PASS: usize = 0;
pub const VOLUME_MULTI_PASS: usize = 1;

impl FusionPipelines {
    /// Compile every kernel, reporting validation errors instead of panicking
    pub fn new(device: &Device) -> FusionResult<Self> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let pipelines = Self {
            sobel: create_kernel(
                device,
                "Mask Sobel",
                MASK_SOBEL,
                &[
                    // Mask uniforms
                    UNIFORM,
                    // Perspectives
                    READ,
                    // Frame atlas
                    READ,
                    // Mask output
                    READ_WRITE,
                ],
                &["generate_mask"],
            ),
            blur: create_kernel(
                device,
                "Gaussian Blur",
                GAUSSIAN_BLUR,
                &[
                    // Gaussian uniforms
                    UNIFORM,
                    // Source
                    READ,
                    // Destination
                    READ_WRITE,
                ],
                &["blur_volume", "blur_image"],
            ),
            downscale: create_kernel(
                device,
                "Mask Downscale",
                MASK_DOWNSCALE,
                &[
                    // Downscale uniforms
                    UNIFORM,
                    // Source mask
                    READ,
                    // Min/max output
                    READ_WRITE,
                ],
                &["downscale"],
            ),
            normal_weight: create_kernel(
                device,
                "Normal Weights",
                NORMAL_WEIGHT,
                &[
                    // Normal weight uniforms
                    UNIFORM,
                    // Perspectives
                    READ,
                    // Frame atlas
                    READ,
                    // Weight output
                    READ_WRITE,
                ],
                &["generate_normal_weights"],
            ),
            volume: create_kernel(
                device,
                "Volume Generation",
                VOLUME,
                &[
                    // Volume uniforms
                    UNIFORM,
                    // Perspectives
                    READ,
                    // Geometry weight records
                    READ,
                    // Frame atlas
                    READ,
                    // Edge mask
                    READ,
                    // Normal weights
                    READ,
                    // Field (current side)
                    READ_WRITE,
                    // Weight accumulator (other side)
                    READ_WRITE,
                ],
                &["generate_single_pass", "generate_multi_pass"],
            ),
            extract: create_kernel(
                device,
                "Surface Extraction",
                EXTRACT,
                &[
                    // Extract uniforms
                    UNIFORM,
                    // Field
                    READ,
                    // Triangle table
                    READ,
                    // Append counter
                    READ_WRITE,
                    // Triangle records
                    READ_WRITE,
                ],
                &["extract_surface"],
            ),
            args: create_kernel(
                device,
                "Indirect Args",
                PREPARE_ARGS,
                &[
                    // Args uniforms
                    UNIFORM,
                    // Append counter
                    READ,
                    // Draw args
                    READ_WRITE,
                    // Dispatch args
                    READ_WRITE,
                ],
                &["prepare_args"],
            ),
        };

        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            log::error!("[FusionPipelines] Kernel validation failed: {}", error);
            return Err(crate::error::EngineError::GpuOperationFailed {
                operation: "create_compute_pipeline".to_string(),
                error: error.to_string(),
            });
        }

        log::info!("[FusionPipelines] Compiled fusion kernels");
        Ok(pipelines)
    }
}

fn create_kernel(
    device: &Device,
    label: &str,
    body: &str,
    bindings: &[BufferBindingType],
    entry_points: &[&str],
) -> KernelPipelines {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(Cow::Owned(kernel_source(body))),
    });

    let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
        .iter()
        .enumerate()
        .map(|(binding, ty)| wgpu::BindGroupLayoutEntry {
            binding: binding as u32,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: *ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect();

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(&format!("{} Bind Group Layout", label)),
        entries: &entries,
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{} Pipeline Layout", label)),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });

    let pipelines = entry_points
        .iter()
        .map(|&entry_point| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&format!("{} ({})", label, entry_point)),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point,
            })
        })
        .collect();

    KernelPipelines { layout, pipelines }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kernel_validates() {
        for (label, body) in KERNEL_SOURCES {
            let module = naga::front::wgsl::parse_str(&kernel_source(body))
                .unwrap_or_else(|e| panic!("{} failed to parse: {}", label, e));
            naga::valid::Validator::new(naga::valid::ValidationFlags::all(), naga::valid::Capabilities::empty())
                .validate(&module)
                .unwrap_or_else(|e| panic!("{} failed validation: {:?}", label, e));
        }
    }

    #[test]
    fn test_constants_precede_kernel_body() {
        let source = kernel_source(EXTRACT);
        assert!(source.starts_with(FUSION_CONSTANTS));
        assert!(source.contains("MAX_PERSPECTIVES"));
        assert!(source.ends_with(EXTRACT));
    }
}
