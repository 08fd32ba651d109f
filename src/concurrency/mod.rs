// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod barrier;
pub mod cancellable;
pub mod thread_pool;

pub use barrier::Barrier;
pub use cancellable::Cancellable;
pub use thread_pool::{PoolError, TaskFuture, ThreadPool};
