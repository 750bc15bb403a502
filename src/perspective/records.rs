//! Per-perspective weight records mirrored to the GPU on change

use crate::gpu::GpuBufferManager;
use bytemuck::{Pod, Zeroable};

/// Range accepted by the per-perspective unknown-weight override
pub const WEIGHT_UNKNOWN_RANGE: (f32, f32) = (0.0001, 0.05);

fn approx_eq(a: f32, b: f32) -> bool {
    (a - b).abs() <= f32::EPSILON * 4.0
}

/// Host-side record array with a dirty flag and a lazily synced GPU copy
pub struct SyncedRecords<T: Pod> {
    records: Vec<T>,
    dirty: bool,
    buffer: Option<wgpu::Buffer>,
    label: &'static str,
}

impl<T: Pod> SyncedRecords<T> {
    pub fn new(label: &'static str, len: usize, value: T) -> Self {
        Self {
            records: vec![value; len],
            dirty: true,
            buffer: None,
            label,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.records
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.records.get(index)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Grow or shrink to `len`, filling new slots with `value`
    pub fn resize(&mut self, len: usize, value: T) {
        if self.records.len() != len {
            self.records.resize(len, value);
            self.dirty = true;
        }
    }

    /// Run `edit` on one record. `edit` reports whether it changed anything.
    pub fn update(&mut self, index: usize, edit: impl FnOnce(&mut T) -> bool) -> bool {
        let Some(record) = self.records.get_mut(index) else {
            return false;
        };
        let changed = edit(record);
        self.dirty |= changed;
        changed
    }

    /// Upload when dirty or when the GPU copy is missing or the wrong size.
    /// Returns true when an upload happened.
    pub fn sync(&mut self, buffers: &GpuBufferManager) -> bool {
        let size = std::mem::size_of_val(self.records.as_slice()) as u64;
        let reallocated =
            buffers.ensure_storage(&mut self.buffer, self.label, size, wgpu::BufferUsages::empty());
        if !self.dirty && !reallocated {
            return false;
        }
        if let Some(buffer) = &self.buffer {
            if let Err(e) = buffers.write(self.label, buffer, &self.records) {
                log::error!("[SyncedRecords] {}", e);
                return false;
            }
        }
        self.dirty = false;
        true
    }

    /// Consume the dirty flag for host-only consumers
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }

    pub fn buffer(&self) -> Option<&wgpu::Buffer> {
        self.buffer.as_ref()
    }
}

/// Geometry weighting of one perspective
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PerspectiveGeometry {
    pub enabled: i32,
    pub override_weight_unknown: i32,
    pub weight_unknown: f32,
    pub view_dependent_unseen_amount: f32,
    pub view_dependent_in_front_amount: f32,
    pub view_dependent_weight: f32,
    pub _pad: [f32; 2],
}

impl Default for PerspectiveGeometry {
    fn default() -> Self {
        Self {
            enabled: 1,
            override_weight_unknown: 0,
            weight_unknown: 0.005,
            view_dependent_unseen_amount: 1.0,
            view_dependent_in_front_amount: 1.0,
            view_dependent_weight: 1.0,
            _pad: [0.0; 2],
        }
    }
}

/// Geometry records plus host-only view-dependence settings
pub struct PerspectiveGeometryData {
    records: SyncedRecords<PerspectiveGeometry>,
    view_dependent_contributions: Vec<f32>,
    matches_color_weights: Vec<bool>,
}

impl PerspectiveGeometryData {
    pub fn new(count: usize) -> Self {
        Self {
            records: SyncedRecords::new("Perspective Geometry", count, PerspectiveGeometry::default()),
            view_dependent_contributions: vec![1.0; count],
            matches_color_weights: vec![false; count],
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn resize(&mut self, count: usize) {
        self.records.resize(count, PerspectiveGeometry::default());
        self.view_dependent_contributions.resize(count, 1.0);
        self.matches_color_weights.resize(count, false);
    }

    pub fn records(&self) -> &SyncedRecords<PerspectiveGeometry> {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut SyncedRecords<PerspectiveGeometry> {
        &mut self.records
    }

    pub fn is_enabled(&self, index: usize) -> bool {
        self.records.get(index).map(|r| r.enabled != 0).unwrap_or(false)
    }

    /// Indices of enabled perspectives in ascending order
    pub fn active_indices(&self) -> Vec<u32> {
        (0..self.len())
            .filter(|&i| self.is_enabled(i))
            .map(|i| i as u32)
            .collect()
    }

    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> bool {
        let value = enabled as i32;
        self.records.update(index, |r| {
            let changed = r.enabled != value;
            r.enabled = value;
            changed
        })
    }

    pub fn set_override_weight_unknown(&mut self, index: usize, enabled: bool) -> bool {
        let value = enabled as i32;
        self.records.update(index, |r| {
            let changed = r.override_weight_unknown != value;
            r.override_weight_unknown = value;
            changed
        })
    }

    pub fn set_weight_unknown(&mut self, index: usize, weight: f32) -> bool {
        let value = weight.clamp(WEIGHT_UNKNOWN_RANGE.0, WEIGHT_UNKNOWN_RANGE.1);
        self.records.update(index, |r| {
            let changed = !approx_eq(r.weight_unknown, value);
            r.weight_unknown = value;
            changed
        })
    }

    pub fn set_view_dependent_unseen_amount(&mut self, index: usize, amount: f32) -> bool {
        let value = amount.clamp(0.0, 1.0);
        self.records.update(index, |r| {
            let changed = !approx_eq(r.view_dependent_unseen_amount, value);
            r.view_dependent_unseen_amount = value;
            changed
        })
    }

    pub fn set_view_dependent_in_front_amount(&mut self, index: usize, amount: f32) -> bool {
        let value = amount.clamp(0.0, 1.0);
        self.records.update(index, |r| {
            let changed = !approx_eq(r.view_dependent_in_front_amount, value);
            r.view_dependent_in_front_amount = value;
            changed
        })
    }

    pub fn set_view_dependent_weight(&mut self, index: usize, weight: f32) -> bool {
        let value = weight.clamp(0.0, 1.0);
        self.records.update(index, |r| {
            let changed = !approx_eq(r.view_dependent_weight, value);
            r.view_dependent_weight = value;
            changed
        })
    }

    pub fn view_dependent_contribution(&self, index: usize) -> f32 {
        self.view_dependent_contributions.get(index).copied().unwrap_or(1.0)
    }

    pub fn set_view_dependent_contribution(&mut self, index: usize, contribution: f32) {
        if let Some(slot) = self.view_dependent_contributions.get_mut(index) {
            *slot = contribution.clamp(0.0, 1.0);
        }
    }

    pub fn matches_color_weight(&self, index: usize) -> bool {
        self.matches_color_weights.get(index).copied().unwrap_or(false)
    }

    pub fn set_matches_color_weight(&mut self, index: usize, matches: bool) {
        if let Some(slot) = self.matches_color_weights.get_mut(index) {
            *slot = matches;
        }
    }
}

/// Color blending of one perspective
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct PerspectiveColorBlending {
    pub enabled: i32,
    pub edge_mask_enabled: f32,
    pub edge_mask_blend_edge_min: f32,
    pub edge_mask_blend_edge_max: f32,
    pub edge_mask_strength: f32,
    pub view_weight_power_contribution: f32,
    pub _pad: [f32; 2],
}

impl Default for PerspectiveColorBlending {
    fn default() -> Self {
        Self {
            enabled: 1,
            edge_mask_enabled: 1.0,
            edge_mask_blend_edge_min: 0.0,
            edge_mask_blend_edge_max: 1.0,
            edge_mask_strength: 1.0,
            view_weight_power_contribution: 1.0,
            _pad: [0.0; 2],
        }
    }
}

pub struct PerspectiveColorBlendingData {
    records: SyncedRecords<PerspectiveColorBlending>,
}

impl PerspectiveColorBlendingData {
    pub fn new(count: usize) -> Self {
        Self {
            records: SyncedRecords::new("Perspective Color Blending", count, PerspectiveColorBlending::default()),
        }
    }

    pub fn resize(&mut self, count: usize) {
        self.records.resize(count, PerspectiveColorBlending::default());
    }

    pub fn records(&self) -> &SyncedRecords<PerspectiveColorBlending> {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut SyncedRecords<PerspectiveColorBlending> {
        &mut self.records
    }

    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> bool {
        let value = enabled as i32;
        self.records.update(index, |r| {
            let changed = r.enabled != value;
            r.enabled = value;
            changed
        })
    }

    pub fn set_edge_mask_enabled(&mut self, index: usize, enabled: bool) -> bool {
        let value = if enabled { 1.0 } else { 0.0 };
        self.records.update(index, |r| {
            let changed = !approx_eq(r.edge_mask_enabled, value);
            r.edge_mask_enabled = value;
            changed
        })
    }

    /// Edge blend window; `min` never exceeds `max`
    pub fn set_edge_mask_blend_edges(&mut self, index: usize, min: f32, max: f32) -> bool {
        let max = max.clamp(0.0, 1.0);
        let min = min.clamp(0.0, max);
        self.records.update(index, |r| {
            let changed =
                !approx_eq(r.edge_mask_blend_edge_min, min) || !approx_eq(r.edge_mask_blend_edge_max, max);
            r.edge_mask_blend_edge_min = min;
            r.edge_mask_blend_edge_max = max;
            changed
        })
    }

    pub fn set_edge_mask_strength(&mut self, index: usize, strength: f32) -> bool {
        let value = strength.clamp(0.0, 1.0);
        self.records.update(index, |r| {
            let changed = !approx_eq(r.edge_mask_strength, value);
            r.edge_mask_strength = value;
            changed
        })
    }

    pub fn view_weight_power_contribution(&self, index: usize) -> f32 {
        self.records
            .get(index)
            .map(|r| r.view_weight_power_contribution)
            .unwrap_or(1.0)
    }

    pub fn set_view_weight_power_contribution(&mut self, index: usize, contribution: f32) -> bool {
        let value = contribution.clamp(0.0, 1.0);
        self.records.update(index, |r| {
            let changed = !approx_eq(r.view_weight_power_contribution, value);
            r.view_weight_power_contribution = value;
            changed
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layouts_are_32_bytes() {
        assert_eq!(std::mem::size_of::<PerspectiveGeometry>(), 32);
        assert_eq!(std::mem::size_of::<PerspectiveColorBlending>(), 32);
    }

    #[test]
    fn test_setters_mark_dirty_only_on_change() {
        let mut data = PerspectiveGeometryData::new(2);
        assert!(data.records_mut().take_dirty());

        assert!(!data.set_enabled(0, true));
        assert!(!data.records().is_dirty());

        assert!(data.set_enabled(0, false));
        assert!(data.records().is_dirty());
        assert_eq!(data.active_indices(), vec![1]);
    }

    #[test]
    fn test_weight_unknown_is_clamped() {
        let mut data = PerspectiveGeometryData::new(1);
        data.set_weight_unknown(0, 1.0);
        assert_eq!(data.records().get(0).unwrap().weight_unknown, WEIGHT_UNKNOWN_RANGE.1);
        data.set_weight_unknown(0, 0.0);
        assert_eq!(data.records().get(0).unwrap().weight_unknown, WEIGHT_UNKNOWN_RANGE.0);
    }

    #[test]
    fn test_blend_edges_keep_order() {
        let mut data = PerspectiveColorBlendingData::new(1);
        data.set_edge_mask_blend_edges(0, 0.8, 0.4);
        let record = data.records().get(0).unwrap();
        assert_eq!(record.edge_mask_blend_edge_max, 0.4);
        assert_eq!(record.edge_mask_blend_edge_min, 0.4);
    }

    #[test]
    fn test_out_of_range_update_is_ignored() {
        let mut data = PerspectiveGeometryData::new(1);
        data.records_mut().take_dirty();
        assert!(!data.set_enabled(5, false));
        assert!(!data.records().is_dirty());
    }
}
