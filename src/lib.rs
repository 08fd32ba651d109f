// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! CPU ray tracer built around a parallel SAH kd-tree.

pub mod accel;
pub mod camera;
pub mod concurrency;
pub mod constants;
pub mod model;
pub mod render;
pub mod scene;
