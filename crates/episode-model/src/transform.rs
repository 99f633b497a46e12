//! Per-camera image transform settings.
//!
//! These are plain settings; the pixel work lives in the edit core's image
//! pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::episode::CameraId;

/// Sub-rectangle in source pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Target dimensions for the resize stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeTarget {
    pub width: u32,
    pub height: u32,
}

/// Fine-grained colour adjustment.
///
/// `brightness`, `contrast` and `saturation` are signed offsets in `[-1, 1]`
/// (0 = unchanged), `gamma` is an exponent (1 = unchanged) and `hue` is a
/// rotation in degrees within `[-180, 180]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorAdjustment {
    pub brightness: f64,
    pub contrast: f64,
    pub saturation: f64,
    pub gamma: f64,
    pub hue: f64,
}

impl Default for ColorAdjustment {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 0.0,
            saturation: 0.0,
            gamma: 1.0,
            hue: 0.0,
        }
    }
}

impl ColorAdjustment {
    /// Whether every component is at its neutral value.
    pub fn is_identity(&self) -> bool {
        self == &Self::default()
    }
}

/// Preset colour filter, applied after any [`ColorAdjustment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColorFilter {
    #[default]
    None,
    Grayscale,
    Sepia,
    Invert,
    Warm,
    Cool,
}

/// Transform stages for one camera. Absent stages are no-ops.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageTransform {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropRect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeTarget>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_adjustment: Option<ColorAdjustment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_filter: Option<ColorFilter>,
}

impl ImageTransform {
    /// Whether applying this transform leaves pixels untouched.
    pub fn is_noop(&self) -> bool {
        self.crop.is_none()
            && self.resize.is_none()
            && self.color_adjustment.map_or(true, |a| a.is_identity())
            && self.color_filter.map_or(true, |f| f == ColorFilter::None)
    }
}

/// Global and per-camera transforms.
///
/// A per-camera entry replaces the global transform for that camera as a
/// whole; fields are never merged across the two scopes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSettings {
    pub global: Option<ImageTransform>,
    pub per_camera: BTreeMap<CameraId, ImageTransform>,
}

impl TransformSettings {
    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.per_camera.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_transform_is_noop() {
        assert!(ImageTransform::default().is_noop());
        let neutral = ImageTransform {
            color_adjustment: Some(ColorAdjustment::default()),
            color_filter: Some(ColorFilter::None),
            ..Default::default()
        };
        assert!(neutral.is_noop());
    }

    #[test]
    fn test_transform_json_omits_absent_stages() {
        let transform = ImageTransform {
            color_filter: Some(ColorFilter::Sepia),
            ..Default::default()
        };
        let json = serde_json::to_string(&transform).unwrap();
        assert_eq!(json, r#"{"color_filter":"sepia"}"#);
    }

    #[test]
    fn test_partial_color_adjustment_defaults_neutral() {
        let adj: ColorAdjustment = serde_json::from_str(r#"{"brightness":0.2}"#).unwrap();
        assert!((adj.gamma - 1.0).abs() < 1e-12);
        assert!((adj.brightness - 0.2).abs() < 1e-12);
        assert!(!adj.is_identity());
    }
}
