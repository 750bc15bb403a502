//! Weighting policy for blending perspective contributions

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Floor for view-dependent weights so no perspective vanishes entirely
pub const MIN_VIEW_WEIGHT: f32 = 1.0e-4;

/// Global weights for known, unknown, unseen and in-front samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightingParams {
    /// Weight of voxels no perspective observed
    pub weight_unknown: f32,
    /// Unseen weight right behind the observed surface
    pub weight_unseen_max: f32,
    /// Unseen weight far behind the observed surface
    pub weight_unseen_min: f32,
    pub weight_unseen_falloff_power: f32,
    /// In-front weight right at the observed surface
    pub weight_in_front_max: f32,
    /// In-front weight far in front of the observed surface
    pub weight_in_front_min: f32,
}

impl Default for WeightingParams {
    fn default() -> Self {
        Self {
            weight_unknown: 0.005,
            weight_unseen_max: 1.0,
            weight_unseen_min: 0.0025,
            weight_unseen_falloff_power: 10.0,
            weight_in_front_max: 1.0,
            weight_in_front_min: 0.1,
        }
    }
}

impl WeightingParams {
    /// Preset that favours surfaces seen head-on
    pub fn front_biased() -> Self {
        Self {
            weight_unknown: 0.005,
            weight_unseen_max: 1.0,
            weight_unseen_min: 0.0,
            weight_unseen_falloff_power: 8.0,
            weight_in_front_max: 1.0,
            weight_in_front_min: 0.1,
        }
    }

    /// Clamp every field into its supported range
    pub fn clamped(self) -> Self {
        Self {
            weight_unknown: self.weight_unknown.clamp(0.0, 0.05),
            weight_unseen_max: self.weight_unseen_max.clamp(0.0, 1.0),
            weight_unseen_min: self.weight_unseen_min.clamp(0.0, 0.01),
            weight_unseen_falloff_power: self.weight_unseen_falloff_power.clamp(1.0, 10.0),
            weight_in_front_max: self.weight_in_front_max.clamp(0.0, 1.0),
            weight_in_front_min: self.weight_in_front_min.clamp(0.0, 1.0),
        }
    }

    /// Weight of a sample `t` (0 at the surface, 1 at the truncation band)
    /// in front of the observed surface
    pub fn in_front_weight(&self, t: f32, view_weight: f32, amount: f32) -> f32 {
        lerp(self.weight_in_front_max, self.weight_in_front_min, t.clamp(0.0, 1.0))
            * lerp(1.0, view_weight, amount)
    }

    /// Weight of a sample `t` behind the observed surface
    pub fn unseen_weight(&self, t: f32, view_weight: f32, amount: f32) -> f32 {
        let falloff = (1.0 - t.clamp(0.0, 1.0)).powf(self.weight_unseen_falloff_power);
        lerp(self.weight_unseen_min, self.weight_unseen_max, falloff) * lerp(1.0, view_weight, amount)
    }
}

/// Inputs for the per-perspective view-dependent weight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewDependence {
    pub enabled: bool,
    /// Global exponent for geometry blending
    pub geometry_weight: f32,
    /// Global exponent for perspectives that follow the color weights
    pub color_weight: f32,
}

impl Default for ViewDependence {
    fn default() -> Self {
        Self {
            enabled: false,
            geometry_weight: 1.0,
            color_weight: 1.0,
        }
    }
}

impl ViewDependence {
    /// Weight of a perspective whose (world-space) camera normal is
    /// `camera_normal`, seen from a viewer looking along `view_forward`.
    pub fn weight(&self, view_forward: Vec3, camera_normal: Vec3, power: f32) -> f32 {
        if !self.enabled {
            return 1.0;
        }
        let facing = view_forward.dot(camera_normal).max(MIN_VIEW_WEIGHT);
        facing.powf(power).clamp(0.0, 1.0).max(MIN_VIEW_WEIGHT)
    }

    /// Exponent for a perspective from its blend contribution
    pub fn power(&self, contribution: f32, matches_color: bool) -> f32 {
        let global = if matches_color {
            self.color_weight
        } else {
            self.geometry_weight
        };
        lerp(0.0, global, contribution)
    }
}

/// Time-of-flight radial bias, globally and per perspective
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RadialBias {
    global_cm: f32,
    overrides_cm: Vec<Option<f32>>,
    effective_cm: Vec<f32>,
}

/// Supported radial bias range in centimeters
pub const RADIAL_BIAS_RANGE_CM: (f32, f32) = (0.0, 2.5);

impl RadialBias {
    pub fn new(global_cm: f32, count: usize) -> Self {
        let global_cm = global_cm.clamp(RADIAL_BIAS_RANGE_CM.0, RADIAL_BIAS_RANGE_CM.1);
        Self {
            global_cm,
            overrides_cm: vec![None; count],
            effective_cm: vec![global_cm; count],
        }
    }

    pub fn resize(&mut self, count: usize) {
        self.overrides_cm.resize(count, None);
        self.effective_cm.resize(count, self.global_cm);
    }

    pub fn set_global_cm(&mut self, cm: f32) {
        self.global_cm = cm.clamp(RADIAL_BIAS_RANGE_CM.0, RADIAL_BIAS_RANGE_CM.1);
    }

    pub fn global_cm(&self) -> f32 {
        self.global_cm
    }

    /// Pin one perspective to its own bias, or release it with `None`
    pub fn set_override_cm(&mut self, index: usize, cm: Option<f32>) {
        if let Some(slot) = self.overrides_cm.get_mut(index) {
            *slot = cm.map(|v| v.clamp(RADIAL_BIAS_RANGE_CM.0, RADIAL_BIAS_RANGE_CM.1));
            if let Some(value) = *slot {
                self.effective_cm[index] = value;
            }
        }
    }

    /// Push the global value to every perspective without an override.
    /// Returns true when any effective value changed.
    pub fn propagate(&mut self) -> bool {
        let mut changed = false;
        for (effective, over) in self.effective_cm.iter_mut().zip(&self.overrides_cm) {
            let value = over.unwrap_or(self.global_cm);
            if *effective != value {
                *effective = value;
                changed = true;
            }
        }
        changed
    }

    /// Effective per-perspective bias in meters
    pub fn meters(&self) -> Vec<f32> {
        self.effective_cm.iter().map(|cm| cm / 100.0).collect()
    }
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_front_weight_decays_from_max_to_min() {
        let w = WeightingParams::default();
        assert_eq!(w.in_front_weight(0.0, 1.0, 1.0), 1.0);
        assert!((w.in_front_weight(1.0, 1.0, 1.0) - 0.1).abs() < 1e-6);
        assert!((w.in_front_weight(5.0, 1.0, 1.0) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_unseen_weight_falls_off() {
        let w = WeightingParams::default();
        assert_eq!(w.unseen_weight(0.0, 1.0, 1.0), 1.0);
        assert!((w.unseen_weight(1.0, 1.0, 1.0) - 0.0025).abs() < 1e-6);
        assert!(w.unseen_weight(0.2, 1.0, 1.0) < w.unseen_weight(0.1, 1.0, 1.0));
    }

    #[test]
    fn test_view_amount_scales_weight() {
        let w = WeightingParams::default();
        assert!((w.in_front_weight(0.0, 0.5, 0.0) - 1.0).abs() < 1e-6);
        assert!((w.in_front_weight(0.0, 0.5, 1.0) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_view_dependence_floor() {
        let view = ViewDependence {
            enabled: true,
            ..Default::default()
        };
        assert_eq!(view.weight(Vec3::Z, -Vec3::Z, 1.0), MIN_VIEW_WEIGHT);
        assert!((view.weight(Vec3::Z, Vec3::Z, 1.0) - 1.0).abs() < 1e-6);
        assert_eq!(ViewDependence::default().weight(Vec3::Z, -Vec3::Z, 1.0), 1.0);
    }

    #[test]
    fn test_power_picks_color_weight_when_matched() {
        let view = ViewDependence {
            enabled: true,
            geometry_weight: 2.0,
            color_weight: 6.0,
        };
        assert_eq!(view.power(0.5, false), 1.0);
        assert_eq!(view.power(0.5, true), 3.0);
    }

    #[test]
    fn test_radial_bias_overrides_survive_propagation() {
        let mut bias = RadialBias::new(0.8, 3);
        bias.set_override_cm(1, Some(2.0));
        bias.set_global_cm(1.0);
        assert!(bias.propagate());
        let meters = bias.meters();
        assert!((meters[0] - 0.01).abs() < 1e-7);
        assert!((meters[1] - 0.02).abs() < 1e-7);
        assert!(!bias.propagate());
    }
}
