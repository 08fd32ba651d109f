// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use serde::{Deserialize, Serialize};

use super::shape::Shape;
use crate::constants::{DEFAULT_CAMERA_POSITION, DEFAULT_FOV};

// serde requires free functions for `default =` and `skip_serializing_if =`
// attributes — const expressions are not accepted.
fn is_zero_vec3(v: &[f32; 3]) -> bool {
    *v == [0.0, 0.0, 0.0]
}

fn default_fov() -> f32 {
    DEFAULT_FOV
}

fn is_default_fov(v: &f32) -> bool {
    *v == DEFAULT_FOV
}

fn default_scale() -> f32 {
    1.0
}

fn default_structure() -> String {
    "default".to_owned()
}

fn is_default_structure(v: &str) -> bool {
    v == "default"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    #[serde(default, skip_serializing_if = "is_zero_vec3")]
    pub position: [f32; 3],

    /// Euler rotation in degrees, pitch then yaw then roll (roll unused).
    #[serde(default, skip_serializing_if = "is_zero_vec3")]
    pub rotation: [f32; 3],

    #[serde(default = "default_fov", skip_serializing_if = "is_default_fov")]
    pub fov: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: DEFAULT_CAMERA_POSITION,
            rotation: [0.0, 0.0, 0.0],
            fov: DEFAULT_FOV,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRef {
    pub path: String,

    #[serde(default)]
    pub position: [f32; 3],

    #[serde(default = "default_scale")]
    pub scale: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub shapes: Vec<Shape>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelRef>,

    /// Acceleration structure to build over the scene, by name.
    #[serde(
        default = "default_structure",
        skip_serializing_if = "is_default_structure"
    )]
    pub intersection_structure: String,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            shapes: Vec::new(),
            models: Vec::new(),
            intersection_structure: default_structure(),
        }
    }
}

impl Scene {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::shape::ShapeType;

    #[test]
    fn test_scene_defaults() {
        let scene: Scene = serde_json::from_str("{}").unwrap();

        assert!(scene.shapes.is_empty());
        assert!(scene.models.is_empty());
        assert_eq!(scene.intersection_structure, "default");
        assert_eq!(scene.camera.fov, DEFAULT_FOV);
        assert_eq!(scene.camera.position, DEFAULT_CAMERA_POSITION);
    }

    #[test]
    fn test_scene_with_shapes() {
        let scene: Scene = serde_json::from_str(
            r#"{
                "intersection_structure": "kdtree",
                "shapes": [
                    {"type": "sphere", "position": [1.0, 2.0, 3.0], "radius": 0.5},
                    {"type": "triangle", "v0": [0, 0, 0], "v1": [1, 0, 0], "v2": [0, 1, 0]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(scene.intersection_structure, "kdtree");
        assert_eq!(scene.shapes.len(), 2);
        assert_eq!(scene.shapes[0].shape_type, ShapeType::Sphere);
        assert_eq!(scene.shapes[0].radius, 0.5);
        assert_eq!(scene.shapes[1].shape_type, ShapeType::Triangle);
    }
}
