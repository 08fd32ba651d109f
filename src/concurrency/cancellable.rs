// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag shared between a controlling thread and long
/// running work. Work polls `cancelled()` between units and winds down on its
/// own; nothing is ever interrupted mid-step.
///
/// Relaxed ordering is enough since no other data is published through the
/// flag — observers only ever react by returning early.
#[derive(Debug, Default)]
pub struct Cancellable {
    cancelled: AtomicBool,
}

impl Cancellable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
