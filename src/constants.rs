// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

// SAH cost model, see "On building fast kd-Trees for Ray Tracing, and on
// doing that in O(N log N)" by Wald & Havran (2006).
pub const SAH_TRAVERSAL_COST: f32 = 0.3;
pub const SAH_INTERSECTION_COST: f32 = 1.0;
pub const SAH_EMPTY_BONUS: f32 = 0.8;

// Kd-tree construction. ABSOLUTE_MAX_DEPTH also bounds the traversal stack.
pub const ABSOLUTE_MAX_DEPTH: usize = 64;
pub const THREAD_MIN_PRIMITIVES: u32 = 10_000;

// Max (start + end) * 3 axes = 6 events per primitive. Planar events (one
// per axis) should be fairly uncommon so not much reserve is wasted.
pub const MAX_EVENTS_PER_PRIMITIVE: usize = 6;

// Camera defaults
pub const DEFAULT_FOV: f32 = 60.0;
pub const DEFAULT_CAMERA_POSITION: [f32; 3] = [0.0, 2.0, -10.0];

// Render defaults
pub const DEFAULT_IMAGE_WIDTH: u32 = 1280;
pub const DEFAULT_IMAGE_HEIGHT: u32 = 720;

// OBJ import / model scaling
pub const MODEL_AUTO_SCALE_TARGET: f32 = 3.0;
