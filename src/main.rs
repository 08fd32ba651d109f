// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use std::env;
use std::path::Path;

use anyhow::{Context, Result};

use kd_tracer::accel::{StructureKind, structure_build};
use kd_tracer::camera::Camera;
use kd_tracer::concurrency::{Cancellable, ThreadPool};
use kd_tracer::constants::{DEFAULT_IMAGE_HEIGHT, DEFAULT_IMAGE_WIDTH, MODEL_AUTO_SCALE_TARGET};
use kd_tracer::model::obj_loader;
use kd_tracer::render::render_depthmap;
use kd_tracer::scene::loader::load_scene;
use kd_tracer::scene::primitive::Primitive;

fn main() -> Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let scene_path = args
        .next()
        .context("usage: kd-tracer <scene.{json,yml}> [output.png]")?;
    let output_path = args.next().unwrap_or_else(|| "depth.png".to_owned());

    run(Path::new(&scene_path), Path::new(&output_path))
}

fn run(scene_path: &Path, output_path: &Path) -> Result<()> {
    let scene = load_scene(scene_path)?;

    let mut shapes = scene.shapes.clone();
    for model in &scene.models {
        shapes.extend(obj_loader::load_obj_auto_scaled(
            &model.path,
            model.position,
            MODEL_AUTO_SCALE_TARGET * model.scale,
        )?);
    }

    let kind = StructureKind::from_name(
        &scene.intersection_structure,
        &scene_path.display().to_string(),
    )?;

    let camera = Camera::from_config(&scene.camera);
    let cancellable = Cancellable::new();
    let thread_pool = ThreadPool::with_default_size()?;

    let primitives: Vec<&dyn Primitive> =
        shapes.iter().map(|shape| shape as &dyn Primitive).collect();
    let structure = structure_build(kind, primitives, &cancellable, &thread_pool);

    let image = render_depthmap(
        structure.as_ref(),
        &camera,
        DEFAULT_IMAGE_WIDTH,
        DEFAULT_IMAGE_HEIGHT,
    );
    image
        .save(output_path)
        .with_context(|| format!("Failed to save depth map to {}", output_path.display()))?;

    log::info!("Depth map written to {}", output_path.display());
    Ok(())
}
