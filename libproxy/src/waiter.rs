// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Semaphore-like gate over the pager's free-page count. Producers
//! (receivers, the connector) call `wait` before taking a page; the
//! pager's `release` path calls `adjust_resource(1)` on every page
//! return, which wakes every blocked producer once the count crosses
//! the configured threshold.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::{consts::MAX_RESPONSE, signal::Signal, task::TaskHandle};

pub struct ResourceWaiter {
    signal: Signal,
    counter: AtomicI64,
    required: i64,
    on_block: Box<dyn Fn() + Send + Sync>,
    on_release: Box<dyn Fn() + Send + Sync>,
}

impl ResourceWaiter {
    pub fn new(required: i64) -> Self {
        ResourceWaiter {
            signal: Signal::new(),
            counter: AtomicI64::new(0),
            required,
            on_block: Box::new(|| {}),
            on_release: Box::new(|| {}),
        }
    }

    /// Installs the callback invoked every time a producer first blocks
    /// on this waiter (the proxy wires this to "pause every consumer
    /// control" so starved producers don't keep demanding more pages).
    pub fn with_on_block(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_block = Box::new(f);
        self
    }

    /// Installs the callback invoked whenever `adjust_resource` crosses
    /// the threshold and wakes waiters.
    pub fn with_on_release(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_release = Box::new(f);
        self
    }

    /// Blocks `task` until the counter exceeds the threshold, or the
    /// task is stopped or yielding. Returns `true` if woken by resources
    /// recovering.
    pub fn wait(&self, task: &TaskHandle) -> bool {
        let _guard = task.block_on_memory();
        (self.on_block)();
        self.signal.wait(MAX_RESPONSE, || task.is_stopped() || task.is_yielding())
    }

    /// Mutates the counter and wakes every waiter iff the new value
    /// exceeds the threshold. Called from every page take (`-1`) and
    /// release (`+1`).
    pub fn adjust_resource(&self, increment: i64) {
        let required = self.required;
        let counter = &self.counter;
        let released = self.signal.notify_all(|| {
            let new_val = counter.fetch_add(increment, Ordering::AcqRel) + increment;
            let enough = required < new_val;
            if enough || new_val < 0 {
                counter.store(0, Ordering::Release);
            }
            enough
        });
        if released {
            (self.on_release)();
        }
    }

    /// Force-wakes every waiter regardless of the counter; used by the
    /// supervisor to break a stall when producers are parked and no
    /// natural release is coming.
    pub fn release_tasks(&self) {
        self.adjust_resource(self.required);
    }

    pub fn reset(&self) {
        self.signal.reset();
        self.counter.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskControl;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_wakes_once_threshold_crossed() {
        let waiter = Arc::new(ResourceWaiter::new(2));
        let control = TaskControl::new();
        let handle = Arc::new(TaskHandle::new(control));
        let w2 = waiter.clone();
        let h2 = handle.clone();
        let joiner = std::thread::spawn(move || w2.wait(&h2));

        while !handle.is_blocked_on_memory() {
            std::thread::yield_now();
        }
        let start = Instant::now();
        waiter.adjust_resource(1);
        waiter.adjust_resource(1);
        waiter.adjust_resource(1);
        assert!(joiner.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn wait_returns_false_when_stopped() {
        let waiter = ResourceWaiter::new(100);
        let control = TaskControl::new();
        control.stop();
        let handle = TaskHandle::new(control);
        assert!(!waiter.wait(&handle));
    }

    #[test]
    fn release_tasks_force_wakes_regardless_of_threshold() {
        let waiter = Arc::new(ResourceWaiter::new(1_000_000));
        let control = TaskControl::new();
        let handle = Arc::new(TaskHandle::new(control));
        let w2 = waiter.clone();
        let h2 = handle.clone();
        let joiner = std::thread::spawn(move || w2.wait(&h2));
        while !handle.is_blocked_on_memory() {
            std::thread::yield_now();
        }
        waiter.release_tasks();
        assert!(joiner.join().unwrap());
    }
}
