// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::primitive::{Hit, Primitive, Ray};
use crate::accel::aabb::Aabb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeType {
    Sphere,
    Cube,
    Cylinder,
    Disc,
    Triangle,
    Ellipsoid,
}

impl ShapeType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Sphere => "Sphere",
            Self::Cube => "Cube",
            Self::Cylinder => "Cylinder",
            Self::Disc => "Disc",
            Self::Triangle => "Triangle",
            Self::Ellipsoid => "Ellipsoid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shape {
    #[serde(rename = "type")]
    pub shape_type: ShapeType,

    #[serde(default, skip_serializing_if = "is_zero_vec3")]
    pub position: [f32; 3],

    /// Direction/normal (disc normal, cylinder axis).
    #[serde(default = "default_normal", skip_serializing_if = "is_default_normal")]
    pub normal: [f32; 3],

    /// Radius (sphere, cylinder, disc, ellipsoid x-radius, cube half extent).
    #[serde(default = "default_radius", skip_serializing_if = "is_default_radius")]
    pub radius: f32,

    /// Secondary radius (ellipsoid z-radius).
    #[serde(default, skip_serializing_if = "is_zero_f32")]
    pub radius2: f32,

    /// Height (cylinder, ellipsoid y-radius).
    #[serde(default, skip_serializing_if = "is_zero_f32")]
    pub height: f32,

    /// Triangle vertex 0.
    #[serde(default, skip_serializing_if = "is_zero_vec3")]
    pub v0: [f32; 3],
    /// Triangle vertex 1.
    #[serde(default, skip_serializing_if = "is_zero_vec3")]
    pub v1: [f32; 3],
    /// Triangle vertex 2.
    #[serde(default, skip_serializing_if = "is_zero_vec3")]
    pub v2: [f32; 3],
}

fn default_normal() -> [f32; 3] {
    [0.0, 1.0, 0.0]
}

fn default_radius() -> f32 {
    1.0
}

fn is_zero_vec3(v: &[f32; 3]) -> bool {
    *v == [0.0, 0.0, 0.0]
}

fn is_default_normal(v: &[f32; 3]) -> bool {
    *v == default_normal()
}

fn is_default_radius(v: &f32) -> bool {
    *v == default_radius()
}

fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

impl Shape {
    pub fn sphere(position: [f32; 3], radius: f32) -> Self {
        Self {
            shape_type: ShapeType::Sphere,
            position,
            radius,
            ..Self::placeholder()
        }
    }

    pub fn triangle(v0: [f32; 3], v1: [f32; 3], v2: [f32; 3]) -> Self {
        Self {
            shape_type: ShapeType::Triangle,
            v0,
            v1,
            v2,
            ..Self::placeholder()
        }
    }

    pub fn cube(position: [f32; 3], half_extent: f32) -> Self {
        Self {
            shape_type: ShapeType::Cube,
            position,
            radius: half_extent,
            ..Self::placeholder()
        }
    }

    fn placeholder() -> Self {
        Self {
            shape_type: ShapeType::Sphere,
            position: [0.0; 3],
            normal: default_normal(),
            radius: default_radius(),
            radius2: 0.0,
            height: 0.0,
            v0: [0.0; 3],
            v1: [0.0; 3],
            v2: [0.0; 3],
        }
    }

    fn ellipsoid_radii(&self) -> Vec3 {
        // radius = x-radius, radius2 = z-radius, height = y-radius
        Vec3::new(
            self.radius,
            self.height.max(self.radius),
            self.radius2.max(self.radius),
        )
    }

    /// Exact intersection distance along the ray, or None on miss.
    fn intersect_t(&self, ray: &Ray) -> Option<f32> {
        let pos = Vec3::from(self.position);
        let normal = Vec3::from(self.normal).normalize_or_zero();

        match self.shape_type {
            ShapeType::Sphere => ray_sphere(ray.origin, ray.direction, pos, self.radius),
            ShapeType::Cube => ray_cube(ray.origin, ray.direction, pos, self.radius),
            ShapeType::Cylinder => ray_cylinder(
                ray.origin,
                ray.direction,
                pos,
                normal,
                self.radius,
                self.height,
            ),
            ShapeType::Disc => ray_disc(ray.origin, ray.direction, pos, normal, self.radius),
            ShapeType::Triangle => ray_triangle(
                ray.origin,
                ray.direction,
                Vec3::from(self.v0),
                Vec3::from(self.v1),
                Vec3::from(self.v2),
            ),
            ShapeType::Ellipsoid => {
                ray_ellipsoid(ray.origin, ray.direction, pos, self.ellipsoid_radii())
            }
        }
    }
}

impl Primitive for Shape {
    fn aabb(&self) -> Aabb {
        let pos = Vec3::from(self.position);

        match self.shape_type {
            ShapeType::Sphere => {
                let r = Vec3::splat(self.radius);
                Aabb::new(pos - r, pos + r)
            }
            ShapeType::Cube => {
                let half = Vec3::splat(self.radius);
                Aabb::new(pos - half, pos + half)
            }
            ShapeType::Cylinder => {
                let axis = Vec3::from(self.normal).normalize_or_zero();
                // Exact box of a cylinder around a unit axis: half the height
                // projected onto each component plus the rim circle's extent.
                let rim = self.radius
                    * Vec3::new(
                        (1.0 - axis.x * axis.x).max(0.0).sqrt(),
                        (1.0 - axis.y * axis.y).max(0.0).sqrt(),
                        (1.0 - axis.z * axis.z).max(0.0).sqrt(),
                    );
                let extent = axis.abs() * (self.height * 0.5) + rim;
                Aabb::new(pos - extent, pos + extent)
            }
            ShapeType::Disc => {
                let normal = Vec3::from(self.normal).normalize_or_zero();
                // Axis-aligned discs are planar on their normal axis on
                // purpose, so the builder sees them as planar events.
                let extent = self.radius
                    * Vec3::new(
                        (1.0 - normal.x * normal.x).max(0.0).sqrt(),
                        (1.0 - normal.y * normal.y).max(0.0).sqrt(),
                        (1.0 - normal.z * normal.z).max(0.0).sqrt(),
                    );
                Aabb::new(pos - extent, pos + extent)
            }
            ShapeType::Triangle => Aabb::from_points(&[
                Vec3::from(self.v0),
                Vec3::from(self.v1),
                Vec3::from(self.v2),
            ]),
            ShapeType::Ellipsoid => {
                let extent = self.ellipsoid_radii();
                Aabb::new(pos - extent, pos + extent)
            }
        }
    }

    fn intersects(&self, ray: &Ray) -> bool {
        self.intersect_t(ray).is_some()
    }

    fn intersect(&self, ray: &Ray, hit: &mut Hit) -> bool {
        match self.intersect_t(ray) {
            Some(t) => hit.record(t, ray.at(t)),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Exact ray-shape intersection tests
// ---------------------------------------------------------------------------

/// Return the smallest positive of two values, or `None` if both are <= 0.
fn closest_positive(t1: f32, t2: f32) -> Option<f32> {
    if t1 > 0.0 {
        Some(t1)
    } else if t2 > 0.0 {
        Some(t2)
    } else {
        None
    }
}

fn ray_sphere(origin: Vec3, dir: Vec3, center: Vec3, radius: f32) -> Option<f32> {
    let oc = origin - center;
    let b = oc.dot(dir);
    let c = oc.dot(oc) - radius * radius;
    let discriminant = b * b - c;
    if discriminant < 0.0 {
        return None;
    }
    let sqrt_d = discriminant.sqrt();
    closest_positive(-b - sqrt_d, -b + sqrt_d)
}

fn ray_plane(origin: Vec3, dir: Vec3, point: Vec3, normal: Vec3) -> Option<f32> {
    let denom = dir.dot(normal);
    if denom.abs() <= 1e-6 {
        return None;
    }
    let t = (point - origin).dot(normal) / denom;
    (t > 0.0).then_some(t)
}

fn ray_disc(origin: Vec3, dir: Vec3, center: Vec3, normal: Vec3, radius: f32) -> Option<f32> {
    let t = ray_plane(origin, dir, center, normal)?;
    let hit = origin + dir * t;
    let dist_sq = (hit - center).length_squared();
    (dist_sq <= radius * radius).then_some(t)
}

fn ray_cube(origin: Vec3, dir: Vec3, center: Vec3, half: f32) -> Option<f32> {
    let inv_dir = dir.recip();
    let box_min = center - Vec3::splat(half);
    let box_max = center + Vec3::splat(half);
    let t1 = (box_min - origin) * inv_dir;
    let t2 = (box_max - origin) * inv_dir;
    let t_enter = t1.min(t2).max_element();
    let t_exit = t1.max(t2).min_element();
    if t_enter > t_exit || t_exit < 0.0 {
        None
    } else {
        Some(if t_enter > 0.0 { t_enter } else { t_exit })
    }
}

fn ray_cylinder(
    origin: Vec3,
    dir: Vec3,
    center: Vec3,
    axis: Vec3,
    radius: f32,
    height: f32,
) -> Option<f32> {
    let oc = origin - center;
    let d_along = dir.dot(axis);
    let oc_along = oc.dot(axis);
    let d_perp = dir - axis * d_along;
    let oc_perp = oc - axis * oc_along;

    let a = d_perp.dot(d_perp);
    let b = 2.0 * d_perp.dot(oc_perp);
    let c = oc_perp.dot(oc_perp) - radius * radius;

    let half_h = height * 0.5;
    let mut best: Option<f32> = None;

    // Side surface — test near root first, fall through to the far root if
    // the near one misses the height cap.
    let discriminant = b * b - 4.0 * a * c;
    if discriminant >= 0.0 && a.abs() > 1e-12 {
        let sqrt_d = discriminant.sqrt();
        for t in [(-b - sqrt_d) / (2.0 * a), (-b + sqrt_d) / (2.0 * a)] {
            if t > 0.0 {
                let y = oc_along + d_along * t;
                if y.abs() <= half_h && best.is_none_or(|prev| t < prev) {
                    best = Some(t);
                    break;
                }
            }
        }
    }

    // Top and bottom caps
    if d_along.abs() > 1e-6 {
        for cap_y in [-half_h, half_h] {
            let t = (cap_y - oc_along) / d_along;
            if t > 0.0 && best.is_none_or(|prev| t < prev) {
                let hit_perp = oc_perp + d_perp * t;
                if hit_perp.length_squared() <= radius * radius {
                    best = Some(t);
                }
            }
        }
    }

    best
}

/// Möller-Trumbore ray-triangle intersection.
fn ray_triangle(origin: Vec3, dir: Vec3, v0: Vec3, v1: Vec3, v2: Vec3) -> Option<f32> {
    let e1 = v1 - v0;
    let e2 = v2 - v0;
    let h = dir.cross(e2);
    let a = e1.dot(h);
    if a.abs() < 1e-7 {
        return None;
    }
    let f = 1.0 / a;
    let s = origin - v0;
    let u = f * s.dot(h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }
    let q = s.cross(e1);
    let v = f * dir.dot(q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }
    let t = f * e2.dot(q);
    (t > 0.0).then_some(t)
}

fn ray_ellipsoid(origin: Vec3, dir: Vec3, center: Vec3, radii: Vec3) -> Option<f32> {
    let inv_r = radii.recip();
    let oc = (origin - center) * inv_r;
    let d = dir * inv_r;
    let a = d.dot(d);
    let b = 2.0 * oc.dot(d);
    let c = oc.dot(oc) - 1.0;
    let discriminant = b * b - 4.0 * a * c;
    if discriminant < 0.0 {
        return None;
    }
    let sqrt_d = discriminant.sqrt();
    closest_positive((-b - sqrt_d) / (2.0 * a), (-b + sqrt_d) / (2.0 * a))
}
