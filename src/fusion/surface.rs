//! Marching-cubes surface extraction into an append buffer

use super::grid::VoxelGrid;
use super::march_tables::{CORNER_OFFSETS, EDGE_CORNERS, TRIANGLE_TABLE};
use bytemuck::{Pod, Zeroable};
use glam::{UVec3, Vec3};
use rayon::prelude::*;

/// Below this corner difference the crossing sits mid-edge
const FLAT_EDGE_EPSILON: f32 = 1.0e-6;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct SurfaceVertex {
    pub position: [f32; 3],
    /// Field gradient length at the crossing, per meter
    pub gradient_magnitude: f32,
    pub normal: [f32; 3],
    pub _padding: f32,
}

/// Three vertices, counter-clockwise when seen from outside
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TriangleRecord {
    pub vertices: [SurfaceVertex; 3],
}

/// Extraction parameters, shared by the CPU and WGSL kernels
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ExtractUniforms {
    pub dims: [u32; 3],
    pub lod_stride: u32,
    pub lod_dims: [u32; 3],
    pub capacity: u32,
    pub bounds_min: [f32; 3],
    pub threshold: f32,
    pub voxel_size: [f32; 3],
    pub _padding: u32,
}

impl ExtractUniforms {
    pub fn new(grid: &VoxelGrid, lod_stride: u32, threshold: f32, capacity: u32) -> Self {
        let stride = lod_stride.max(1);
        Self {
            dims: grid.dims.to_array(),
            lod_stride: stride,
            lod_dims: grid.lod_dims(stride).to_array(),
            capacity,
            bounds_min: grid.bounds.min().to_array(),
            threshold,
            voxel_size: grid.voxel_size().to_array(),
            _padding: 0,
        }
    }

    /// Cells between neighbouring LOD samples
    pub fn cell_dims(&self) -> UVec3 {
        UVec3::from_array(self.lod_dims).saturating_sub(UVec3::ONE)
    }
}

/// Growable triangle output with an append counter.
///
/// The counter counts every append attempt; records past `capacity` are
/// dropped, so `counter` may exceed `records.len()`.
#[derive(Debug, Clone, Default)]
pub struct TriangleAppendBuffer {
    records: Vec<TriangleRecord>,
    capacity: u32,
    counter: u32,
}

impl TriangleAppendBuffer {
    pub fn with_capacity(capacity: u32) -> Self {
        Self {
            records: Vec::new(),
            capacity,
            counter: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn set_capacity(&mut self, capacity: u32) {
        self.capacity = capacity;
        self.records.truncate(capacity as usize);
    }

    /// Reset the counter; stored records become invalid
    pub fn clear(&mut self) {
        self.counter = 0;
        self.records.clear();
    }

    /// Returns the slot the append claimed
    pub fn append(&mut self, record: TriangleRecord) -> u32 {
        let slot = self.counter;
        self.counter = self.counter.saturating_add(1);
        if slot < self.capacity {
            self.records.push(record);
        }
        slot
    }

    /// Raw counter value
    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn triangles(&self) -> &[TriangleRecord] {
        &self.records
    }

    pub fn overflowed(&self) -> bool {
        self.counter > self.capacity
    }
}

struct FieldSampler<'a> {
    field: &'a [f32],
    uniforms: &'a ExtractUniforms,
}

impl FieldSampler<'_> {
    fn value(&self, lod: UVec3) -> f32 {
        let dims = self.uniforms.dims;
        let stride = self.uniforms.lod_stride;
        let coord = (lod * stride).min(UVec3::from_array(dims) - UVec3::ONE);
        let index = (coord.z as usize * dims[1] as usize + coord.y as usize) * dims[0] as usize
            + coord.x as usize;
        self.field[index]
    }

    fn position(&self, lod: UVec3) -> Vec3 {
        let coord = lod * self.uniforms.lod_stride;
        Vec3::from_array(self.uniforms.bounds_min)
            + (coord.as_vec3() + 0.5) * Vec3::from_array(self.uniforms.voxel_size)
    }

    /// Central-difference gradient at an LOD sample
    fn gradient(&self, lod: UVec3) -> Vec3 {
        let lod_dims = UVec3::from_array(self.uniforms.lod_dims);
        let step = Vec3::from_array(self.uniforms.voxel_size) * self.uniforms.lod_stride as f32;
        let mut gradient = Vec3::ZERO;
        for axis in 0..3 {
            let lo_c = lod[axis].saturating_sub(1);
            let hi_c = (lod[axis] + 1).min(lod_dims[axis] - 1);
            if hi_c == lo_c {
                continue;
            }
            let mut lo = lod;
            let mut hi = lod;
            lo[axis] = lo_c;
            hi[axis] = hi_c;
            gradient[axis] = (self.value(hi) - self.value(lo)) / ((hi_c - lo_c) as f32 * step[axis]);
        }
        gradient
    }
}

/// Marching-cubes case of a cell; bit `i` set when corner `i` is outside
pub fn cell_case(corners: &[f32; 8], threshold: f32) -> usize {
    corners
        .iter()
        .enumerate()
        .fold(0, |case, (i, v)| if *v < threshold { case | (1 << i) } else { case })
}

fn edge_vertex(sampler: &FieldSampler<'_>, cell: UVec3, edge: usize, corners: &[f32; 8]) -> SurfaceVertex {
    let [a, b] = EDGE_CORNERS[edge];
    let ca = cell + UVec3::from_array(CORNER_OFFSETS[a]);
    let cb = cell + UVec3::from_array(CORNER_OFFSETS[b]);
    let (va, vb) = (corners[a], corners[b]);
    let t = if (vb - va).abs() < FLAT_EDGE_EPSILON {
        0.5
    } else {
        ((sampler.uniforms.threshold - va) / (vb - va)).clamp(0.0, 1.0)
    };
    let position = sampler.position(ca).lerp(sampler.position(cb), t);
    let gradient = sampler.gradient(ca).lerp(sampler.gradient(cb), t);
    SurfaceVertex {
        position: position.to_array(),
        gradient_magnitude: gradient.length(),
        normal: (-gradient.normalize_or_zero()).to_array(),
        _padding: 0.0,
    }
}

/// Triangles of one cell, in table order
pub fn polygonise_cell(field: &[f32], uniforms: &ExtractUniforms, cell: UVec3) -> Vec<TriangleRecord> {
    let sampler = FieldSampler { field, uniforms };
    let mut corners = [0.0f32; 8];
    for (corner, offset) in corners.iter_mut().zip(CORNER_OFFSETS.iter()) {
        *corner = sampler.value(cell + UVec3::from_array(*offset));
    }
    let case = cell_case(&corners, uniforms.threshold);
    let edges = &TRIANGLE_TABLE[case];

    edges
        .chunks_exact(3)
        .take_while(|triple| triple[0] >= 0)
        .map(|triple| TriangleRecord {
            vertices: [
                edge_vertex(&sampler, cell, triple[0] as usize, &corners),
                edge_vertex(&sampler, cell, triple[2] as usize, &corners),
                edge_vertex(&sampler, cell, triple[1] as usize, &corners),
            ],
        })
        .collect()
}

/// Extract every cell of the LOD grid into `output`.
///
/// The buffer is cleared first. Cells are appended in x-fastest order, so the
/// CPU output is deterministic.
pub fn extract_surface(field: &[f32], uniforms: &ExtractUniforms, output: &mut TriangleAppendBuffer) {
    output.clear();
    let cells = uniforms.cell_dims();
    let total = cells.x as usize * cells.y as usize * cells.z as usize;
    if total == 0 || field.len() < (uniforms.dims[0] * uniforms.dims[1] * uniforms.dims[2]) as usize {
        return;
    }

    let plane = cells.x as usize * cells.y as usize;
    let triangles: Vec<TriangleRecord> = (0..total)
        .into_par_iter()
        .flat_map_iter(|index| {
            let cell = UVec3::new(
                (index % cells.x as usize) as u32,
                ((index % plane) / cells.x as usize) as u32,
                (index / plane) as u32,
            );
            polygonise_cell(field, uniforms, cell)
        })
        .collect();

    for triangle in triangles {
        output.append(triangle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::grid::VolumeBounds;

    fn grid(size: u32) -> VoxelGrid {
        VoxelGrid::new(VolumeBounds::new(Vec3::ZERO, Vec3::splat(size as f32 * 0.1)), 10.0)
    }

    #[test]
    fn test_record_layouts() {
        assert_eq!(std::mem::size_of::<SurfaceVertex>(), 32);
        assert_eq!(std::mem::size_of::<TriangleRecord>(), 96);
        assert_eq!(std::mem::size_of::<ExtractUniforms>(), 64);
    }

    #[test]
    fn test_uniform_field_has_no_crossings() {
        let grid = grid(8);
        let field = vec![0.2; grid.total_voxels()];
        let uniforms = ExtractUniforms::new(&grid, 1, 0.5, 1000);
        let mut output = TriangleAppendBuffer::with_capacity(1000);
        extract_surface(&field, &uniforms, &mut output);
        assert_eq!(output.counter(), 0);
    }

    #[test]
    fn test_single_corner_case() {
        let corners = [0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        assert_eq!(cell_case(&corners, 0.5), 1);
        assert_eq!(cell_case(&[1.0; 8], 0.5), 0);
        assert_eq!(cell_case(&[0.0; 8], 0.5), 255);
    }

    #[test]
    fn test_overflow_counts_but_drops() {
        let mut output = TriangleAppendBuffer::with_capacity(2);
        for _ in 0..5 {
            output.append(TriangleRecord::default());
        }
        assert_eq!(output.counter(), 5);
        assert_eq!(output.triangles().len(), 2);
        assert!(output.overflowed());
        output.clear();
        assert_eq!(output.counter(), 0);
    }

    #[test]
    fn test_step_field_normals_point_outward() {
        // Occupied for z >= 4
        let grid = grid(8);
        let field: Vec<f32> = (0..grid.total_voxels())
            .map(|i| if grid.coord(i).z >= 4 { 1.0 } else { 0.0 })
            .collect();
        let uniforms = ExtractUniforms::new(&grid, 1, 0.5, 10_000);
        let mut output = TriangleAppendBuffer::with_capacity(10_000);
        extract_surface(&field, &uniforms, &mut output);
        assert_eq!(output.counter(), 2 * 7 * 7);

        for triangle in output.triangles() {
            let [a, b, c] = triangle.vertices.map(|v| Vec3::from_array(v.position));
            let face = (b - a).cross(c - a);
            assert!(face.z < 0.0);
            assert!(triangle.vertices[0].normal[2] < 0.0);
        }
    }
}
