// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod aabb;
pub mod kdtree;
pub mod structure;

pub use aabb::Aabb;
pub use kdtree::{KdTree, kdtree_build};
pub use structure::{StructureKind, UnknownStructureError, structure_build};
