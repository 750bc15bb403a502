//! Separable Gaussian filter
//!
//! One axis per pass. The 3D field blur runs x, y, z over the LOD sample
//! points of a [`PingPong`] field; the 2D mask blur runs x, y over every slice
//! of a mask treated as a `(width, height, slices)` volume with stride 1.

use super::field::PingPong;
use bytemuck::{Pod, Zeroable};
use glam::UVec3;
use rayon::prelude::*;

/// Upper bound on the tap radius the kernels accept
pub const MAX_KERNEL_RADIUS: u32 = 8;

/// Kernel coefficients derived from σ on every call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianKernel {
    pub sigma: f32,
    pub kernel_size: u32,
    pub radius: u32,
    pub normalization: f32,
    pub exponential: f32,
}

impl GaussianKernel {
    pub fn from_sigma(sigma: f32) -> Self {
        let sigma = sigma.max(1.0e-3);
        let kernel_size = (4.0 * sigma + 1.0).ceil() as u32;
        let radius = (kernel_size / 2).clamp(1, MAX_KERNEL_RADIUS);
        Self {
            sigma,
            kernel_size,
            radius,
            normalization: 1.0 / (2.0 * std::f32::consts::PI * sigma * sigma).sqrt(),
            exponential: -1.0 / (2.0 * sigma * sigma),
        }
    }

    pub fn tap(&self, offset: i32) -> f32 {
        self.normalization * (self.exponential * (offset * offset) as f32).exp()
    }
}

/// Per-pass parameters, shared by the CPU and WGSL kernels
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GaussianUniforms {
    pub dims: [u32; 3],
    pub axis: u32,
    pub lod_dims: [u32; 3],
    pub stride: u32,
    pub radius: u32,
    pub normalization: f32,
    pub exponential: f32,
    pub _padding: u32,
}

impl GaussianUniforms {
    pub fn new(kernel: &GaussianKernel, dims: UVec3, lod_dims: UVec3, stride: u32, axis: u32) -> Self {
        Self {
            dims: dims.to_array(),
            axis,
            lod_dims: lod_dims.to_array(),
            stride: stride.max(1),
            radius: kernel.radius,
            normalization: kernel.normalization,
            exponential: kernel.exponential,
            _padding: 0,
        }
    }

    /// Plain 2D blur over `slices` images of `width x height`
    pub fn image(kernel: &GaussianKernel, width: u32, height: u32, slices: u32, axis: u32) -> Self {
        let dims = UVec3::new(width, height, slices);
        Self::new(kernel, dims, dims, 1, axis)
    }

    fn dims(&self) -> UVec3 {
        UVec3::from_array(self.dims)
    }

    fn lod_dims(&self) -> UVec3 {
        UVec3::from_array(self.lod_dims)
    }
}

/// Blur one axis from `src` into `dst`.
///
/// Voxels that are not LOD sample points are copied through unchanged.
pub fn blur_axis(src: &[f32], dst: &mut [f32], uniforms: &GaussianUniforms) {
    let dims = uniforms.dims();
    let lod_dims = uniforms.lod_dims();
    let stride = uniforms.stride.max(1);
    let axis = uniforms.axis.min(2) as usize;
    let radius = uniforms.radius as i32;
    let plane = dims.x as usize * dims.y as usize;

    dst.par_iter_mut().enumerate().for_each(|(index, out)| {
        let coord = UVec3::new(
            (index % dims.x as usize) as u32,
            ((index / dims.x as usize) % dims.y as usize) as u32,
            (index / plane) as u32,
        );
        if coord.x % stride != 0 || coord.y % stride != 0 || coord.z % stride != 0 {
            *out = src[index];
            return;
        }
        let lod = coord / stride;
        let mut sum = 0.0f32;
        let mut weight_sum = 0.0f32;
        for k in -radius..=radius {
            let tap = lod[axis] as i32 + k;
            if tap < 0 || tap >= lod_dims[axis] as i32 {
                continue;
            }
            let mut sample = coord;
            sample[axis] = ((tap as u32) * stride).min(dims[axis] - 1);
            let w = uniforms.normalization * (uniforms.exponential * (k * k) as f32).exp();
            let sample_index = (sample.z as usize * dims.y as usize + sample.y as usize) * dims.x as usize
                + sample.x as usize;
            sum += src[sample_index] * w;
            weight_sum += w;
        }
        *out = if weight_sum > 0.0 { sum / weight_sum } else { src[index] };
    });
}

/// Three-axis blur of a scalar field; the result is the current side
pub fn smooth_field(field: &mut PingPong<Vec<f32>>, sigma: f32, dims: UVec3, lod_dims: UVec3, stride: u32) {
    let kernel = GaussianKernel::from_sigma(sigma);
    for axis in 0..3 {
        let uniforms = GaussianUniforms::new(&kernel, dims, lod_dims, stride, axis);
        let (src, dst) = field.split_mut();
        blur_axis(src, dst, &uniforms);
        field.flip();
    }
}

/// Horizontal then vertical blur of every slice of `source` into `target`.
///
/// The blurred image is `target`'s current side afterwards; `source` is left
/// untouched.
pub fn blur_image(
    source: &[f32],
    target: &mut PingPong<Vec<f32>>,
    sigma: f32,
    width: u32,
    height: u32,
    slices: u32,
) {
    let kernel = GaussianKernel::from_sigma(sigma);
    let horizontal = GaussianUniforms::image(&kernel, width, height, slices, 0);
    blur_axis(source, target.other_mut(), &horizontal);
    target.flip();

    let vertical = GaussianUniforms::image(&kernel, width, height, slices, 1);
    let (src, dst) = target.split_mut();
    blur_axis(src, dst, &vertical);
    target.flip();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_coefficients() {
        let kernel = GaussianKernel::from_sigma(0.3);
        assert_eq!(kernel.kernel_size, 3);
        assert_eq!(kernel.radius, 1);
        let kernel = GaussianKernel::from_sigma(1.12);
        assert_eq!(kernel.kernel_size, 6);
        assert_eq!(kernel.radius, 3);
        assert!((kernel.exponential + 1.0 / (2.0 * 1.12 * 1.12)).abs() < 1e-6);
        assert!((kernel.tap(0) - kernel.normalization).abs() < 1e-7);
    }

    #[test]
    fn test_constant_field_is_preserved() {
        let dims = UVec3::splat(6);
        let mut field = PingPong::new(vec![0.7; 216], vec![0.0; 216]);
        smooth_field(&mut field, 1.0, dims, dims, 1);
        assert!(!field.current_is_a());
        assert!(field.current().iter().all(|v| (v - 0.7).abs() < 1e-5));
    }

    #[test]
    fn test_impulse_spreads_symmetrically() {
        let mut source = vec![0.0; 25];
        source[12] = 1.0;
        let mut image = PingPong::new(vec![0.0; 25], vec![0.0; 25]);
        blur_image(&source, &mut image, 0.8, 5, 5, 1);
        assert!(image.current_is_a());
        assert_eq!(source[12], 1.0);
        let out = image.current();
        assert!(out[12] < 1.0);
        assert!((out[11] - out[13]).abs() < 1e-6);
        assert!((out[7] - out[17]).abs() < 1e-6);
        assert!(out[11] > 0.0);
    }

    #[test]
    fn test_non_sample_voxels_pass_through() {
        let dims = UVec3::splat(5);
        let lod_dims = UVec3::splat(3);
        let values: Vec<f32> = (0..125).map(|i| i as f32).collect();
        let mut field = PingPong::new(values.clone(), vec![0.0; 125]);
        smooth_field(&mut field, 0.5, dims, lod_dims, 2);
        assert_eq!(field.current()[1], values[1]);
    }
}
