//! Analytic captures for tests and demos
//!
//! Renders depth atlases of simple shapes seen from pinhole cameras, so the
//! whole pipeline can run without recorded footage.

use crate::error::EngineResult;
use crate::perspective::{FrameAtlas, Perspective, PerspectiveTable};
use glam::{Mat4, UVec2, Vec2, Vec3};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Camera-to-local transform of a camera at `eye` looking at `target`.
///
/// Camera +Z points at the target and image rows grow opposite to `up`.
pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
    let forward = (target - eye).normalize();
    let x = forward.cross(up).normalize();
    let y = forward.cross(x);
    Mat4::from_cols(x.extend(0.0), y.extend(0.0), forward.extend(0.0), eye.extend(1.0))
}

/// Square pinhole camera with a symmetric field of view
pub fn pinhole(resolution: u32, half_fov_deg: f32, near: f32, far: f32, extrinsics: Mat4) -> Perspective {
    let size = resolution as f32;
    let focal = (size * 0.5) / half_fov_deg.to_radians().tan();
    Perspective::new(
        Vec2::splat(size),
        Vec2::splat(size * 0.5),
        Vec2::splat(focal),
        near,
        far,
        extrinsics,
    )
}

/// `count` cameras on a horizontal circle, all looking at `center`
pub fn camera_ring(
    center: Vec3,
    distance: f32,
    count: usize,
    resolution: u32,
    half_fov_deg: f32,
    near: f32,
    far: f32,
) -> Vec<Perspective> {
    (0..count)
        .map(|i| {
            let angle = i as f32 / count as f32 * std::f32::consts::TAU;
            let eye = center + Vec3::new(angle.sin(), 0.0, -angle.cos()) * distance;
            pinhole(resolution, half_fov_deg, near, far, look_at(eye, center, Vec3::Y))
        })
        .collect()
}

/// Shapes the synthetic renderer can intersect
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    Plane { point: Vec3, normal: Vec3 },
    Sphere { center: Vec3, radius: f32 },
}

impl Shape {
    /// Smallest positive ray parameter of the hit
    fn intersect(&self, origin: Vec3, dir: Vec3) -> Option<f32> {
        match *self {
            Shape::Plane { point, normal } => {
                let denom = dir.dot(normal);
                if denom.abs() < 1e-8 {
                    return None;
                }
                let t = (point - origin).dot(normal) / denom;
                (t > 0.0).then_some(t)
            }
            Shape::Sphere { center, radius } => {
                let oc = origin - center;
                let a = dir.dot(dir);
                let b = 2.0 * oc.dot(dir);
                let c = oc.dot(oc) - radius * radius;
                let disc = b * b - 4.0 * a * c;
                if disc < 0.0 {
                    return None;
                }
                let sqrt = disc.sqrt();
                let near = (-b - sqrt) / (2.0 * a);
                let far = (-b + sqrt) / (2.0 * a);
                [near, far].into_iter().find(|t| *t > 0.0)
            }
        }
    }
}

/// A perspective table with one rendered frame
pub struct SyntheticCapture {
    pub table: PerspectiveTable,
    pub frame: FrameAtlas,
}

impl SyntheticCapture {
    /// Render `shapes` from every perspective into a grid atlas
    pub fn render(
        perspectives: Vec<Perspective>,
        columns: u32,
        bounds_center: Vec3,
        bounds_size: Vec3,
        shapes: &[Shape],
    ) -> EngineResult<Self> {
        let resolution = perspectives
            .first()
            .map(|p| p.depth_image_size.as_uvec2())
            .unwrap_or(UVec2::ONE);
        let columns = columns.max(1);
        let rows = (perspectives.len() as u32).div_ceil(columns).max(1);
        let texture = UVec2::new(resolution.x * columns, resolution.y * 2 * rows);
        let table = PerspectiveTable::new(perspectives, texture, columns, rows, bounds_center, bounds_size)?;

        let mut frame = FrameAtlas::new(texture.x, texture.y);
        for (index, camera) in table.perspectives.iter().enumerate() {
            let origin = table.cell_origin(index);
            for py in 0..resolution.y {
                for px in 0..resolution.x {
                    let pixel = Vec2::new(px as f32 + 0.5, py as f32 + 0.5);
                    let ray = (pixel - camera.depth_principal_point) / camera.depth_focal_length;
                    let dir = camera.extrinsics.transform_vector3(ray.extend(1.0));
                    let eye = camera.camera_center();

                    // Camera rays have unit z, so the ray parameter is the depth
                    let depth = shapes
                        .iter()
                        .filter_map(|shape| shape.intersect(eye, dir))
                        .fold(None, |best: Option<f32>, t| Some(best.map_or(t, |b| b.min(t))));

                    frame.write_depth(&table, index, px, py, depth);
                    if depth.is_some() {
                        frame.set_texel(origin.x + px, origin.y + py, [0.8, 0.8, 0.8, 1.0]);
                    }
                }
            }
        }

        Ok(Self { table, frame })
    }

    /// One camera at the origin looking down +Z at a plane `z = plane_z`
    pub fn facing_plane(resolution: u32, plane_z: f32, bounds_center: Vec3, bounds_size: Vec3) -> EngineResult<Self> {
        let camera = pinhole(resolution, 50.0, 0.1, 3.0, look_at(Vec3::ZERO, Vec3::Z, Vec3::Y));
        Self::render(
            vec![camera],
            1,
            bounds_center,
            bounds_size,
            &[Shape::Plane {
                point: Vec3::new(0.0, 0.0, plane_z),
                normal: Vec3::Z,
            }],
        )
    }

    /// A sphere surrounded by `count` cameras
    pub fn sphere_ring(count: usize, resolution: u32, radius: f32) -> EngineResult<Self> {
        let cameras = camera_ring(Vec3::ZERO, 1.5, count, resolution, 30.0, 0.1, 3.0);
        let columns = (count as f32).sqrt().ceil() as u32;
        Self::render(
            cameras,
            columns,
            Vec3::ZERO,
            Vec3::splat(radius * 2.0 + 0.2),
            &[Shape::Sphere {
                center: Vec3::ZERO,
                radius,
            }],
        )
    }

    /// Perturb every valid depth sample by up to `amplitude` meters
    pub fn add_depth_noise(&mut self, amplitude: f32, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let res = self.table.perspective_resolution();
        for index in 0..self.table.len() {
            for py in 0..res.y {
                for px in 0..res.x {
                    if let Some(depth) = self.frame.depth_at(&self.table, index, px, py) {
                        let noisy = depth + rng.gen_range(-amplitude..=amplitude);
                        self.frame.write_depth(&self.table, index, px, py, Some(noisy));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_look_at_points_camera_z_at_target() {
        let m = look_at(Vec3::new(0.0, 0.0, -2.0), Vec3::ZERO, Vec3::Y);
        let forward = m.transform_vector3(Vec3::Z);
        assert!((forward - Vec3::Z).length() < 1e-6);
        assert!((m.determinant() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_plane_depth_is_constant() {
        let capture = SyntheticCapture::facing_plane(16, 1.0, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE).unwrap();
        for (px, py) in [(0, 0), (8, 8), (15, 3)] {
            let depth = capture.frame.depth_at(&capture.table, 0, px, py).unwrap();
            assert!((depth - 1.0).abs() < 1e-5, "depth {} at {},{}", depth, px, py);
        }
    }

    #[test]
    fn test_sphere_ring_sees_sphere_in_center() {
        let capture = SyntheticCapture::sphere_ring(4, 32, 0.3).unwrap();
        assert_eq!(capture.table.len(), 4);
        for index in 0..4 {
            let depth = capture.frame.depth_at(&capture.table, index, 16, 16).unwrap();
            assert!((depth - 1.2).abs() < 0.01);
            assert!(capture.frame.depth_at(&capture.table, index, 0, 0).is_none());
        }
    }

    #[test]
    fn test_noise_is_bounded() {
        let mut capture = SyntheticCapture::facing_plane(8, 1.0, Vec3::new(0.0, 0.0, 1.0), Vec3::ONE).unwrap();
        capture.add_depth_noise(0.01, 7);
        let depth = capture.frame.depth_at(&capture.table, 0, 4, 4).unwrap();
        assert!((depth - 1.0).abs() <= 0.0101);
    }
}
