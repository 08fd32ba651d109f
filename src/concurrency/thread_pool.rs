// Copyright (C) Pavlo Hrytsenko <pashagricenko@gmail.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("thread pool requires at least one worker")]
    NoWorkers,
    #[error("unable to detect available parallelism for the default pool size")]
    UnknownParallelism(#[source] std::io::Error),
}

thread_local! {
    // Index of the pool worker running on this thread, None outside workers.
    static WORKER_INDEX: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Fixed-size worker pool with a FIFO task queue.
///
/// Tasks queued but not yet started when the pool is dropped are discarded;
/// tasks already running are joined.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    work_done: Condvar,
}

#[derive(Default)]
struct PoolState {
    tasks: VecDeque<Task>,
    working: usize,
    waiting: usize,
    stop: bool,
}

impl ThreadPool {
    pub fn new(size: usize) -> Result<Self, PoolError> {
        if size == 0 {
            return Err(PoolError::NoWorkers);
        }

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            work_available: Condvar::new(),
            work_done: Condvar::new(),
        });

        let workers = (0..size)
            .map(|index| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || Self::work(&shared, index))
            })
            .collect();

        Ok(Self { shared, workers })
    }

    pub fn with_default_size() -> Result<Self, PoolError> {
        Self::new(Self::default_size()?)
    }

    pub fn default_size() -> Result<usize, PoolError> {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .map_err(PoolError::UnknownParallelism)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Index of the pool worker the calling thread belongs to. Returns None
    /// on threads that are not pool workers, e.g. the thread that created the
    /// pool. Usable from inside tasks to key per-worker data.
    pub fn worker_index() -> Option<usize> {
        WORKER_INDEX.get()
    }

    pub fn add_task(&self, task: impl FnOnce() + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        state.tasks.push_back(Box::new(task));
        self.shared.work_available.notify_one();
    }

    pub fn add_tasks(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut state = self.shared.state.lock().unwrap();
        state.tasks.extend(tasks);
        self.shared.work_available.notify_all();
    }

    /// Blocks until the queue is empty and no task is in flight.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock().unwrap();

        state.waiting += 1;
        while !state.tasks.is_empty() || state.working > 0 {
            state = self.shared.work_done.wait(state).unwrap();
        }
        state.waiting -= 1;
    }

    /// Submits a task and returns a future carrying its result. The future
    /// supports exactly one waiter.
    pub fn async_task<T, F>(&self, function: F) -> TaskFuture<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let shared = Arc::new(FutureShared {
            value: Mutex::new(None),
            ready: Condvar::new(),
        });

        let task_shared = Arc::clone(&shared);
        self.add_task(move || {
            *task_shared.value.lock().unwrap() = Some(function());
            task_shared.ready.notify_one();
        });

        TaskFuture { shared }
    }

    /// Best-effort count of workers not currently executing a task.
    pub fn idle_workers(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        self.workers.len() - state.working
    }

    fn work(shared: &PoolShared, index: usize) {
        WORKER_INDEX.set(Some(index));

        let mut state = shared.state.lock().unwrap();

        loop {
            while !state.stop && state.tasks.is_empty() {
                state = shared.work_available.wait(state).unwrap();
            }

            if state.stop {
                break;
            }

            let task = state.tasks.pop_front().unwrap();
            state.working += 1;
            drop(state);

            task();

            state = shared.state.lock().unwrap();
            state.working -= 1;

            if state.waiting > 0 && state.tasks.is_empty() && state.working == 0 {
                shared.work_done.notify_all();
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stop = true;
            self.shared.work_available.notify_all();
        }

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Single-consumer future for a result produced by a pool task.
pub struct TaskFuture<T> {
    shared: Arc<FutureShared<T>>,
}

struct FutureShared<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> TaskFuture<T> {
    /// Blocks until the task has run and returns its result. Never returns if
    /// the pool is dropped before the task gets to run.
    pub fn get(self) -> T {
        let mut value = self.shared.value.lock().unwrap();

        loop {
            if let Some(value) = value.take() {
                return value;
            }
            value = self.shared.ready.wait(value).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::concurrency::Barrier;

    const SUM_TERM_COUNT: usize = 100;
    const SUM: usize = SUM_TERM_COUNT * (SUM_TERM_COUNT - 1) / 2;

    #[test]
    fn test_default_size_greater_than_zero() {
        assert!(ThreadPool::default_size().unwrap() > 0);
    }

    #[test]
    fn test_zero_size_is_an_error() {
        assert!(matches!(ThreadPool::new(0), Err(PoolError::NoWorkers)));
    }

    #[test]
    fn test_add_task_and_wait() {
        let thread_pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..SUM_TERM_COUNT {
            let counter = Arc::clone(&counter);
            thread_pool.add_task(move || {
                counter.fetch_add(i, Ordering::SeqCst);
            });
        }

        thread_pool.wait();

        assert_eq!(counter.load(Ordering::SeqCst), SUM);
    }

    #[test]
    fn test_add_tasks_and_wait() {
        let thread_pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task> = (0..SUM_TERM_COUNT)
            .map(|i| {
                let counter = Arc::clone(&counter);
                Box::new(move || {
                    counter.fetch_add(i, Ordering::SeqCst);
                }) as Task
            })
            .collect();

        thread_pool.add_tasks(tasks);
        thread_pool.wait();

        assert_eq!(counter.load(Ordering::SeqCst), SUM);
    }

    #[test]
    fn test_custom_number_of_threads() {
        // No size query is exposed beyond size(), so verify that the right
        // number of workers actually run by parking them all on a barrier.
        const NUM_THREADS: usize = 8;

        let thread_pool = ThreadPool::new(NUM_THREADS).unwrap();
        let barrier = Arc::new(Barrier::new(NUM_THREADS + 1));
        let counter1 = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::new(AtomicUsize::new(0));

        for _ in 0..NUM_THREADS {
            let barrier = Arc::clone(&barrier);
            let counter1 = Arc::clone(&counter1);
            thread_pool.add_task(move || {
                counter1.fetch_add(1, Ordering::SeqCst);
                barrier.arrive_and_wait(); // counter1 has been increased.
                barrier.arrive_and_wait(); // Wait for counter2 comparison.
            });
        }

        for _ in 0..NUM_THREADS * 2 {
            let counter2 = Arc::clone(&counter2);
            thread_pool.add_task(move || {
                counter2.fetch_add(1, Ordering::SeqCst);
            });
        }

        barrier.arrive_and_wait(); // Wait for counter1 to be increased.

        assert_eq!(counter1.load(Ordering::SeqCst), NUM_THREADS);
        assert_eq!(counter2.load(Ordering::SeqCst), 0);

        barrier.arrive_and_wait(); // counter2 has been compared against 0.

        thread_pool.wait();

        assert_eq!(counter1.load(Ordering::SeqCst), NUM_THREADS);
        assert_eq!(counter2.load(Ordering::SeqCst), NUM_THREADS * 2);
    }

    #[test]
    fn test_async_task() {
        let thread_pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..SUM_TERM_COUNT)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread_pool.async_task(move || counter.fetch_add(1, Ordering::SeqCst))
            })
            .collect();

        let sum: usize = futures.into_iter().map(TaskFuture::get).sum();

        assert_eq!(sum, SUM);
    }

    #[test]
    fn test_async_task_without_return_value() {
        let thread_pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..SUM_TERM_COUNT)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread_pool.async_task(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for future in futures {
            future.get();
        }

        assert_eq!(counter.load(Ordering::SeqCst), SUM_TERM_COUNT);
    }

    #[test]
    fn test_idle_workers() {
        const NUM_THREADS: usize = 2;

        let thread_pool = ThreadPool::new(NUM_THREADS).unwrap();
        let barrier = Arc::new(Barrier::new(NUM_THREADS + 1));

        assert_eq!(thread_pool.idle_workers(), NUM_THREADS);

        for _ in 0..NUM_THREADS {
            let barrier = Arc::clone(&barrier);
            thread_pool.add_task(move || {
                barrier.arrive_and_wait(); // Both tasks are running.
                barrier.arrive_and_wait(); // Wait for the idle check.
            });
        }

        barrier.arrive_and_wait(); // Both tasks are running.
        assert_eq!(thread_pool.idle_workers(), 0);
        barrier.arrive_and_wait(); // Idle count has been checked.

        thread_pool.wait();
        assert_eq!(thread_pool.idle_workers(), NUM_THREADS);
    }

    #[test]
    fn test_worker_index() {
        let thread_pool = ThreadPool::new(2).unwrap();

        assert_eq!(ThreadPool::worker_index(), None);

        let index = thread_pool.async_task(ThreadPool::worker_index).get();
        assert!(index.is_some_and(|index| index < 2));
    }
}
