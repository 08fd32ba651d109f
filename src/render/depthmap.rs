// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use std::num::NonZeroUsize;
use std::thread;

use image::{GrayImage, Luma};

use crate::camera::Camera;
use crate::scene::primitive::{Hit, Primitive};

/// Traces one closest-hit ray per pixel and maps the hit distances to a
/// grayscale image, nearest surfaces brightest. Rows are traced in bands
/// across all available threads; the structure is immutable so concurrent
/// traversals share it freely.
pub fn render_depthmap(
    structure: &dyn Primitive,
    camera: &Camera,
    width: u32,
    height: u32,
) -> GrayImage {
    let depths = trace_depths(structure, camera, width, height);
    normalize_to_image(&depths, width, height)
}

fn trace_depths(structure: &dyn Primitive, camera: &Camera, width: u32, height: u32) -> Vec<f32> {
    let mut depths = vec![f32::INFINITY; (width as usize) * (height as usize)];
    let threads = thread::available_parallelism().map_or(1, NonZeroUsize::get);
    let rows_per_band = height.div_ceil(threads as u32).max(1);

    thread::scope(|scope| {
        let band_len = (rows_per_band as usize) * (width as usize);

        for (band_index, band) in depths.chunks_mut(band_len).enumerate() {
            let first_row = band_index as u32 * rows_per_band;

            scope.spawn(move || {
                for (i, depth) in band.iter_mut().enumerate() {
                    let x = i as u32 % width;
                    let y = first_row + i as u32 / width;

                    let ray = camera.primary_ray(x as f32 + 0.5, y as f32 + 0.5, width, height);
                    let mut hit = Hit::none();
                    if structure.intersect(&ray, &mut hit) {
                        *depth = hit.t;
                    }
                }
            });
        }
    });

    depths
}

fn normalize_to_image(depths: &[f32], width: u32, height: u32) -> GrayImage {
    let mut min = f32::INFINITY;
    let mut max = 0.0f32;
    for &depth in depths {
        if depth.is_finite() {
            min = min.min(depth);
            max = max.max(depth);
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        let depth = depths[(y as usize) * (width as usize) + x as usize];
        if !depth.is_finite() {
            return Luma([0]);
        }

        let normalized = if max > min { (depth - min) / (max - min) } else { 0.0 };
        Luma([(255.0 - normalized * 200.0) as u8])
    })
}

#[cfg(test)]
mod tests {
    use glam::vec3;

    use super::*;
    use crate::scene::shape::Shape;

    #[test]
    fn test_depthmap_of_single_sphere() {
        let sphere = Shape::sphere([0.0, 0.0, 0.0], 2.0);
        let camera = Camera::new(vec3(0.0, 0.0, -5.0), [0.0, 0.0, 0.0], 60.0);

        let image = render_depthmap(&sphere, &camera, 9, 9);

        // Center pixel hits the sphere, the corner ray misses it.
        assert!(image.get_pixel(4, 4)[0] > 0);
        assert_eq!(image.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_depthmap_of_empty_scene_is_black() {
        struct Nothing;

        impl Primitive for Nothing {
            fn aabb(&self) -> crate::accel::Aabb {
                crate::accel::Aabb::EMPTY
            }

            fn intersects(&self, _: &crate::scene::primitive::Ray) -> bool {
                false
            }

            fn intersect(&self, _: &crate::scene::primitive::Ray, _: &mut Hit) -> bool {
                false
            }
        }

        let camera = Camera::new(vec3(0.0, 0.0, -5.0), [0.0, 0.0, 0.0], 60.0);
        let image = render_depthmap(&Nothing, &camera, 4, 4);

        assert!(image.pixels().all(|pixel| pixel[0] == 0));
    }
}
