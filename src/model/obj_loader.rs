// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;

use anyhow::{Context, Result};
use glam::Vec3;

use crate::scene::shape::Shape;

/// Load an OBJ model, auto-scaling so its largest dimension equals `target_size`.
/// Returns the loaded triangles centered at `position`.
pub fn load_obj_auto_scaled(path: &str, position: [f32; 3], target_size: f32) -> Result<Vec<Shape>> {
    let (models, _) = tobj::load_obj(Path::new(path), &tobj::GPU_LOAD_OPTIONS)
        .with_context(|| format!("Failed to load OBJ: {path}"))?;

    // Compute extent at scale 1.0 to determine the auto-scale factor.
    let (bb_min, bb_max) = model_bounds(&models, 1.0);
    let size = bb_max - bb_min;
    let extent = size.x.max(size.y).max(size.z);
    let scale = if extent > 0.0 {
        target_size / extent
    } else {
        1.0
    };

    build_triangles(&models, path, position, scale)
}

/// Load an OBJ model with an explicit scale factor.
pub fn load_obj(path: &str, position: [f32; 3], scale: f32) -> Result<Vec<Shape>> {
    let (models, _) = tobj::load_obj(Path::new(path), &tobj::GPU_LOAD_OPTIONS)
        .with_context(|| format!("Failed to load OBJ: {path}"))?;

    build_triangles(&models, path, position, scale)
}

fn model_bounds(models: &[tobj::Model], scale: f32) -> (Vec3, Vec3) {
    let mut bb_min = Vec3::splat(f32::MAX);
    let mut bb_max = Vec3::splat(f32::MIN);

    for model in models {
        for idx in &model.mesh.indices {
            let v = read_vertex(&model.mesh.positions, *idx as usize, scale);
            bb_min = bb_min.min(v);
            bb_max = bb_max.max(v);
        }
    }

    (bb_min, bb_max)
}

fn build_triangles(
    models: &[tobj::Model],
    path: &str,
    position: [f32; 3],
    scale: f32,
) -> Result<Vec<Shape>> {
    // Recenter the scaled model on the requested position.
    let (bb_min, bb_max) = model_bounds(models, scale);
    let center = (bb_min + bb_max) * 0.5;
    let offset = Vec3::from(position) - center;

    let total_tris: usize = models.iter().map(|m| m.mesh.indices.len() / 3).sum();
    let mut triangles = Vec::with_capacity(total_tris);

    for model in models {
        let mesh = &model.mesh;

        for tri in mesh.indices.chunks_exact(3) {
            let v0 = read_vertex(&mesh.positions, tri[0] as usize, scale) + offset;
            let v1 = read_vertex(&mesh.positions, tri[1] as usize, scale) + offset;
            let v2 = read_vertex(&mesh.positions, tri[2] as usize, scale) + offset;

            triangles.push(Shape::triangle(v0.into(), v1.into(), v2.into()));
        }
    }

    log::info!("Loaded OBJ '{}': {} triangles", path, triangles.len());
    Ok(triangles)
}

fn read_vertex(positions: &[f32], index: usize, scale: f32) -> Vec3 {
    Vec3::new(
        positions[index * 3] * scale,
        positions[index * 3 + 1] * scale,
        positions[index * 3 + 2] * scale,
    )
}
