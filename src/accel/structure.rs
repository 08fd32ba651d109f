// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use super::kdtree::kdtree_build;
use crate::concurrency::{Cancellable, ThreadPool};
use crate::scene::primitive::Primitive;

/// Which acceleration structure a scene asks for. `Bvh` is still accepted by
/// name for scene compatibility but has no builder of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureKind {
    Bvh,
    KdTree,
    Default,
}

#[derive(Debug, Error)]
#[error("{path}: unknown intersection structure {name:?}")]
pub struct UnknownStructureError {
    pub path: String,
    pub name: String,
}

impl StructureKind {
    /// Maps a scene config string to a kind. `path` names where the string
    /// came from and is carried in the error for unknown names.
    pub fn from_name(name: &str, path: &str) -> Result<Self, UnknownStructureError> {
        match name {
            "bvh" => Ok(Self::Bvh),
            "kdtree" => Ok(Self::KdTree),
            "default" => Ok(Self::Default),
            _ => Err(UnknownStructureError {
                path: path.to_owned(),
                name: name.to_owned(),
            }),
        }
    }
}

/// Builds the acceleration structure of the requested kind over the
/// primitives, behind the same trait the primitives implement.
pub fn structure_build<'a>(
    kind: StructureKind,
    primitives: Vec<&'a dyn Primitive>,
    cancellable: &Cancellable,
    thread_pool: &ThreadPool,
) -> Box<dyn Primitive + 'a> {
    if kind == StructureKind::Bvh {
        log::warn!("no bvh builder available, building a kd-tree instead");
    }

    Box::new(kdtree_build(primitives, cancellable, thread_pool))
}
