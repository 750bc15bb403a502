//! Fusion configuration
//!
//! `FusionConfig` is the full option surface of a volumetric mesh source. It
//! loads from TOML or JSON (picked by file extension), saves back in either
//! format, and is validated on load: hard errors for values no kernel can
//! work with, clamping for the soft ranges the setters also enforce.

use crate::error::EngineError;
use crate::fusion::backend::PassSettings;
use crate::fusion::grid::VolumeBounds;
use crate::fusion::indirect_args::{ArgsSettings, DEFAULT_DISPATCH_GROUP_SIZE, DEFAULT_MAX_TRIANGLES};
use crate::fusion::lod::LevelOfDetail;
use crate::fusion::mask::{MaskSettings, MAX_MASK_SCALE};
use crate::fusion::normal_weight::NormalWeightSettings;
use crate::fusion::volume::GenerationStrategy;
use crate::fusion::weighting::{ViewDependence, WeightingParams, RADIAL_BIAS_RANGE_CM};
use crate::perspective::records::WEIGHT_UNKNOWN_RANGE;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Supported voxel density range (voxels per meter)
pub const DENSITY_RANGE: (f32, f32) = (30.0, 300.0);

/// Supported smoothing σ range in voxels
pub const SMOOTHING_RADIUS_RANGE: (f32, f32) = (0.3, 1.12);

/// Supported LOD distance scalar range
pub const LOD_DISTANCE_RANGE: (f32, f32) = (1.0, 100.0);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {format:?} config: {error}")]
    Parse { format: ConfigFormat, error: String },

    #[error("Failed to serialize {format:?} config: {error}")]
    Serialize { format: ConfigFormat, error: String },

    #[error("Unknown configuration format for {0}")]
    UnknownFormat(String),

    #[error("Invalid value {value} for {field}: {reason}")]
    Invalid {
        field: String,
        value: String,
        reason: String,
    },
}

impl From<ConfigError> for EngineError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::Io { path, source } => EngineError::IoError {
                path,
                error: source.to_string(),
            },
            ConfigError::Parse { format, error } => EngineError::DeserializationError {
                context: format!("{:?} config", format),
                error,
            },
            ConfigError::Serialize { format, error } => EngineError::SerializationError {
                context: format!("{:?} config", format),
                error,
            },
            ConfigError::UnknownFormat(path) => EngineError::InvalidConfig {
                field: "path".to_string(),
                value: path,
                reason: "expected a .toml or .json file".to_string(),
            },
            ConfigError::Invalid { field, value, reason } => EngineError::InvalidConfig { field, value, reason },
        }
    }
}

/// Configuration file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Some(ConfigFormat::Json),
            Some("toml") => Some(ConfigFormat::Toml),
            _ => None,
        }
    }
}

/// Which compute backend runs the fusion kernels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// GPU when an adapter is available, CPU otherwise
    #[default]
    Auto,
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Voxels per meter
    pub density: f32,
    /// Overrides the metadata bounds when present with a non-zero size
    pub bounds: Option<VolumeBounds>,
    pub generation_method: GenerationStrategy,
    /// Iso threshold of the extracted surface
    pub surface_sensitivity: f32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            density: 100.0,
            bounds: None,
            generation_method: GenerationStrategy::SinglePass,
            surface_sensitivity: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub enabled: bool,
    /// Gaussian σ in voxels
    pub radius: f32,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            radius: SMOOTHING_RADIUS_RANGE.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    pub automatic: bool,
    pub distance: f32,
    pub level: i32,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            automatic: false,
            distance: LOD_DISTANCE_RANGE.0,
            level: 0,
        }
    }
}

impl From<LodConfig> for LevelOfDetail {
    fn from(config: LodConfig) -> Self {
        let mut lod = LevelOfDetail {
            automatic: config.automatic,
            distance: config.distance,
            level: 0,
        };
        lod.set_level(config.level);
        lod
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadialBiasConfig {
    pub bias_cm: f32,
}

impl Default for RadialBiasConfig {
    fn default() -> Self {
        Self { bias_cm: 0.8 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriangleConfig {
    /// Triangle buffer capacity, 0 selects the default
    pub max_triangles: u32,
    pub stereo_instancing: bool,
    pub dispatch_group_size: u32,
}

impl Default for TriangleConfig {
    fn default() -> Self {
        Self {
            max_triangles: DEFAULT_MAX_TRIANGLES,
            stereo_instancing: false,
            dispatch_group_size: DEFAULT_DISPATCH_GROUP_SIZE,
        }
    }
}

impl TriangleConfig {
    pub fn capacity(&self) -> u32 {
        if self.max_triangles == 0 {
            DEFAULT_MAX_TRIANGLES
        } else {
            self.max_triangles
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    pub pause_generation_when_invisible: bool,
    pub pause_player_when_invisible: bool,
}

/// Per-perspective overrides; unset fields keep the record defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerspectiveOverride {
    pub index: usize,
    pub enabled: Option<bool>,
    pub override_weight_unknown: Option<bool>,
    pub weight_unknown: Option<f32>,
    pub view_dependent_contribution: Option<f32>,
    pub match_color_weight: Option<bool>,
    pub radial_bias_cm: Option<f32>,
}

/// Every option of a volumetric mesh source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub backend: BackendPreference,
    pub volume: VolumeConfig,
    pub weights: WeightingParams,
    pub smoothing: SmoothingConfig,
    pub lod: LodConfig,
    pub view_dependence: ViewDependence,
    pub mask: MaskSettings,
    pub normal_weights: NormalWeightSettings,
    pub radial_bias: RadialBiasConfig,
    pub triangles: TriangleConfig,
    pub visibility: VisibilityConfig,
    pub perspectives: Vec<PerspectiveOverride>,
}

impl FusionConfig {
    /// Load and validate a `.toml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path).ok_or_else(|| ConfigError::UnknownFormat(path.display().to_string()))?;
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::parse(&raw, format)?;
        config.validate()?;
        log::info!("[FusionConfig] Loaded {:?} config from {}", format, path.display());
        Ok(config)
    }

    pub fn parse(raw: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let parsed = match format {
            ConfigFormat::Json => serde_json::from_str(raw).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::from_str(raw).map_err(|e| e.to_string()),
        };
        parsed.map_err(|error| ConfigError::Parse { format, error })
    }

    /// Write in the format implied by the extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path).ok_or_else(|| ConfigError::UnknownFormat(path.display().to_string()))?;
        let raw = match format {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(|e| e.to_string()),
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|e| e.to_string()),
        }
        .map_err(|error| ConfigError::Serialize { format, error })?;
        std::fs::write(path, raw).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Reject unusable values, clamp soft ranges
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        let density = self.volume.density;
        if !density.is_finite() || density <= 0.0 {
            return Err(invalid("volume.density", density, "must be a positive finite number"));
        }
        if let Some(bounds) = self.volume.bounds {
            if !bounds.center.is_finite() || !bounds.size.is_finite() || bounds.size.min_element() < 0.0 {
                return Err(invalid("volume.bounds", format!("{:?}", bounds), "must be finite and non-negative"));
            }
        }
        if self.smoothing.radius.is_nan() || self.smoothing.radius < 0.0 {
            return Err(invalid("smoothing.radius", self.smoothing.radius, "must not be negative"));
        }
        if self.mask.blur_radius.is_nan() || self.mask.blur_radius < 0.0 {
            return Err(invalid("mask.blur_radius", self.mask.blur_radius, "must not be negative"));
        }
        let scale = self.mask.scale;
        if scale == 0 || !scale.is_power_of_two() || scale > MAX_MASK_SCALE {
            return Err(invalid("mask.scale", scale, "must be a power of two in 1..=8"));
        }
        for (slot, over) in self.perspectives.iter().enumerate() {
            if over.index >= crate::perspective::MAX_PERSPECTIVES {
                return Err(invalid(
                    &format!("perspectives[{}].index", slot),
                    over.index,
                    "exceeds the perspective limit",
                ));
            }
        }

        self.volume.density = density.clamp(DENSITY_RANGE.0, DENSITY_RANGE.1);
        self.volume.surface_sensitivity = self.volume.surface_sensitivity.clamp(0.0, 1.0);
        self.weights = self.weights.clamped();
        self.smoothing.radius = self.smoothing.radius.clamp(SMOOTHING_RADIUS_RANGE.0, SMOOTHING_RADIUS_RANGE.1);
        self.lod.distance = self.lod.distance.clamp(LOD_DISTANCE_RANGE.0, LOD_DISTANCE_RANGE.1);
        self.lod.level = self.lod.level.max(0);
        self.mask = self.mask.clamped();
        self.normal_weights = self.normal_weights.clamped();
        self.radial_bias.bias_cm = self.radial_bias.bias_cm.clamp(RADIAL_BIAS_RANGE_CM.0, RADIAL_BIAS_RANGE_CM.1);
        self.triangles.dispatch_group_size = self.triangles.dispatch_group_size.max(1);
        for over in &mut self.perspectives {
            over.weight_unknown = over
                .weight_unknown
                .map(|w| w.clamp(WEIGHT_UNKNOWN_RANGE.0, WEIGHT_UNKNOWN_RANGE.1));
            over.view_dependent_contribution = over.view_dependent_contribution.map(|c| c.clamp(0.0, 1.0));
            over.radial_bias_cm = over
                .radial_bias_cm
                .map(|cm| cm.clamp(RADIAL_BIAS_RANGE_CM.0, RADIAL_BIAS_RANGE_CM.1));
        }
        Ok(())
    }

    /// Preset tuned for captures viewed mostly from the front
    pub fn load_front_biased_defaults(&mut self) {
        self.volume.surface_sensitivity = 0.2;
        self.weights = WeightingParams::front_biased();
    }

    /// Bounds override, `None` when the metadata bounds apply
    pub fn bounds_override(&self) -> Option<VolumeBounds> {
        self.volume.bounds.filter(|bounds| !bounds.is_degenerate())
    }

    /// Per-pass settings at full resolution
    pub fn pass_settings(&self) -> PassSettings {
        PassSettings {
            strategy: self.volume.generation_method,
            weights: self.weights,
            mask: self.mask,
            normals: self.normal_weights,
            smoothing: self.smoothing.enabled.then_some(self.smoothing.radius),
            lod_stride: 1,
            threshold: self.volume.surface_sensitivity,
            args: ArgsSettings {
                capacity: self.triangles.capacity(),
                stereo_instancing: self.triangles.stereo_instancing,
                group_size: self.triangles.dispatch_group_size.max(1),
                groups_y: 1,
                groups_z: 1,
            },
        }
    }
}

fn invalid(field: &str, value: impl std::fmt::Display, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_defaults() {
        let config = FusionConfig::default();
        assert_eq!(config.backend, BackendPreference::Auto);
        assert_eq!(config.volume.density, 100.0);
        assert_eq!(config.volume.surface_sensitivity, 0.5);
        assert_eq!(config.weights.weight_unknown, 0.005);
        assert_eq!(config.triangles.capacity(), DEFAULT_MAX_TRIANGLES);
        assert_eq!(config.radial_bias.bias_cm, 0.8);
        assert!(config.pass_settings().smoothing.is_none());
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.toml")), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), Some(ConfigFormat::Json));
        assert_eq!(ConfigFormat::from_path(Path::new("a.yaml")), None);
    }

    #[test]
    fn test_partial_toml_keeps_section_defaults() {
        let raw = r#"
            backend = "cpu"

            [volume]
            density = 50.0
            generation_method = "multi_pass"

            [smoothing]
            enabled = true

            [[perspectives]]
            index = 2
            enabled = false
        "#;
        let config = FusionConfig::parse(raw, ConfigFormat::Toml).unwrap();
        assert_eq!(config.backend, BackendPreference::Cpu);
        assert_eq!(config.volume.density, 50.0);
        assert_eq!(config.volume.surface_sensitivity, 0.5);
        assert_eq!(config.volume.generation_method, GenerationStrategy::MultiPass);
        assert_eq!(config.pass_settings().smoothing, Some(SMOOTHING_RADIUS_RANGE.0));
        assert_eq!(config.perspectives[0].index, 2);
        assert_eq!(config.perspectives[0].enabled, Some(false));
        assert_eq!(config.perspectives[0].weight_unknown, None);
    }

    #[test]
    fn test_validate_clamps_soft_ranges() {
        let mut config = FusionConfig::default();
        config.volume.density = 1000.0;
        config.smoothing.radius = 5.0;
        config.radial_bias.bias_cm = 10.0;
        config.lod.level = -2;
        config.perspectives.push(PerspectiveOverride {
            index: 0,
            weight_unknown: Some(1.0),
            ..Default::default()
        });
        config.validate().unwrap();
        assert_eq!(config.volume.density, DENSITY_RANGE.1);
        assert_eq!(config.smoothing.radius, SMOOTHING_RADIUS_RANGE.1);
        assert_eq!(config.radial_bias.bias_cm, RADIAL_BIAS_RANGE_CM.1);
        assert_eq!(config.lod.level, 0);
        assert_eq!(config.perspectives[0].weight_unknown, Some(WEIGHT_UNKNOWN_RANGE.1));
    }

    #[test]
    fn test_validate_rejects_hard_errors() {
        let mut config = FusionConfig::default();
        config.volume.density = f32::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = FusionConfig::default();
        config.mask.scale = 3;
        let err: EngineError = config.validate().unwrap_err().into();
        assert!(matches!(err, EngineError::InvalidConfig { ref field, .. } if field == "mask.scale"));

        let mut config = FusionConfig::default();
        config.smoothing.radius = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_front_biased_preset() {
        let mut config = FusionConfig::default();
        config.load_front_biased_defaults();
        assert_eq!(config.volume.surface_sensitivity, 0.2);
        assert_eq!(config.weights.weight_unseen_min, 0.0);
        assert_eq!(config.weights.weight_unseen_falloff_power, 8.0);
    }

    #[test]
    fn test_degenerate_bounds_override_is_ignored() {
        let mut config = FusionConfig::default();
        config.volume.bounds = Some(VolumeBounds::new(Vec3::ZERO, Vec3::ZERO));
        assert!(config.bounds_override().is_none());
        config.volume.bounds = Some(VolumeBounds::new(Vec3::Z, Vec3::ONE));
        assert!(config.bounds_override().is_some());
    }

    #[test]
    fn test_save_and_load_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FusionConfig::default();
        config.backend = BackendPreference::Gpu;
        config.volume.bounds = Some(VolumeBounds::new(Vec3::new(0.0, 0.0, 1.0), Vec3::ONE));
        config.mask.enabled = true;
        config.mask.downscale = 4;

        for name in ["fusion.toml", "fusion.json"] {
            let path = dir.path().join(name);
            config.save(&path).unwrap();
            let loaded = FusionConfig::load(&path).unwrap();
            assert_eq!(loaded, config);
        }
    }

    #[test]
    fn test_load_unknown_extension_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fusion.ini");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(FusionConfig::load(&path), Err(ConfigError::UnknownFormat(_))));
    }
}
