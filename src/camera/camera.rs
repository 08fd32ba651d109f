// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use glam::{Quat, Vec3};

use crate::scene::primitive::Ray;
use crate::scene::scene::CameraConfig;

pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,   // degrees
    pub pitch: f32, // degrees
    pub fov: f32,   // degrees
}

impl Camera {
    pub fn new(position: Vec3, rotation: [f32; 3], fov: f32) -> Self {
        Self {
            position,
            yaw: rotation[1],
            pitch: rotation[0],
            fov,
        }
    }

    pub fn from_config(cfg: &CameraConfig) -> Self {
        Self::new(cfg.position.into(), cfg.rotation, cfg.fov)
    }

    pub fn orientation(&self) -> Quat {
        Quat::from_euler(
            glam::EulerRot::YXZ,
            self.yaw.to_radians(),
            self.pitch.to_radians(),
            0.0,
        )
    }

    pub fn basis_vectors(&self) -> (Vec3, Vec3, Vec3) {
        let rot = self.orientation();
        let forward = rot * Vec3::Z;
        let right = rot * Vec3::X;
        let up = rot * Vec3::Y;
        (right, up, forward)
    }

    /// Construct a world-space ray through a screen pixel, with pixel
    /// coordinates measured from the top-left corner. The returned direction
    /// is normalised.
    pub fn primary_ray(&self, pixel_x: f32, pixel_y: f32, width: u32, height: u32) -> Ray {
        let (right, up, forward) = self.basis_vectors();
        let aspect = width as f32 / height as f32;
        let focal_length = 1.0 / (self.fov.to_radians() * 0.5).tan();

        let ndc_x = (2.0 * pixel_x / width as f32 - 1.0) * aspect;
        let ndc_y = 1.0 - 2.0 * pixel_y / height as f32;

        let dir = (forward * focal_length + right * ndc_x + up * ndc_y).normalize();
        Ray::new(self.position, dir)
    }
}

#[cfg(test)]
mod tests {
    use glam::vec3;

    use super::*;

    #[test]
    fn test_default_orientation_looks_along_positive_z() {
        let camera = Camera::new(vec3(0.0, 0.0, -5.0), [0.0, 0.0, 0.0], 60.0);
        let (_, _, forward) = camera.basis_vectors();
        assert!((forward - Vec3::Z).length() < 1e-5);
    }

    #[test]
    fn test_primary_ray_through_image_center() {
        let camera = Camera::new(vec3(0.0, 0.0, -5.0), [0.0, 0.0, 0.0], 60.0);

        // Pixel centers of a 9x9 image put (4, 4) exactly on the axis.
        let ray = camera.primary_ray(4.5, 4.5, 9, 9);
        assert_eq!(ray.origin, vec3(0.0, 0.0, -5.0));
        assert!(ray.direction.z > 0.999);
        assert!(ray.direction.x.abs() < 1e-5);
        assert!(ray.direction.y.abs() < 1e-5);
    }

    #[test]
    fn test_primary_ray_spread_widens_with_fov() {
        let narrow = Camera::new(Vec3::ZERO, [0.0, 0.0, 0.0], 30.0);
        let wide = Camera::new(Vec3::ZERO, [0.0, 0.0, 0.0], 90.0);

        let narrow_corner = narrow.primary_ray(0.5, 0.5, 9, 9);
        let wide_corner = wide.primary_ray(0.5, 0.5, 9, 9);

        assert!(wide_corner.direction.z < narrow_corner.direction.z);
    }
}
