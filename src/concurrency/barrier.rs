// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::{Condvar, Mutex};

/// Reusable N-party rendezvous. `arrive_and_wait` blocks until all parties
/// have arrived, releases everyone and resets for the next cycle.
///
/// A generation counter distinguishes cycles so a thread woken spuriously (or
/// arriving early for the next cycle) never escapes the wrong generation.
pub struct Barrier {
    state: Mutex<BarrierState>,
    condition: Condvar,
    parties: usize,
}

struct BarrierState {
    arrived: usize,
    generation: u64,
}

impl Barrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "barrier needs at least one party");
        Self {
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            condition: Condvar::new(),
            parties,
        }
    }

    pub fn arrive_and_wait(&self) {
        let mut state = self.state.lock().unwrap();

        state.arrived += 1;

        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.condition.notify_all();
        } else {
            let generation = state.generation;
            while generation == state.generation {
                state = self.condition.wait(state).unwrap();
            }
        }
    }
}
