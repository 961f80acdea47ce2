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

//! The uniform worker lifecycle every proxy thread runs under: a
//! `Task` is driven by `run()` through `on_start -> (tick && one_step)* ->
//! on_finish`, with a shared `TaskControl` carrying the stop/pause
//! switches the supervisor and `Proxy::stop()` use to manage the fleet.

use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc, Condvar, Mutex,
};

use crate::consts::MAX_RESPONSE;

pub const NO_UTILITY_FLAG: u8 = 0;
pub const TASK_BLOCKED: u8 = 1;

/// Shared stop/pause switch for one worker thread. Cloned (via `Arc`)
/// into the task body so the supervisor and `Proxy::stop()` can reach it
/// without touching the thread itself.
#[derive(Default)]
pub struct TaskControl {
    stop_flag: AtomicBool,
    pause_flag: AtomicBool,
    resume_cv: Condvar,
    resume_mx: Mutex<()>,
}

impl TaskControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.resume_cv.notify_all();
    }

    pub fn pause(&self) {
        self.pause_flag.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        if self.pause_flag.load(Ordering::Acquire) {
            let _guard = self.resume_mx.lock().unwrap();
            self.pause_flag.store(false, Ordering::Release);
            self.resume_cv.notify_all();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.pause_flag.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.stop_flag.store(false, Ordering::Release);
        self.pause_flag.store(false, Ordering::Release);
    }

    /// Returns `false` when the task should stop; otherwise blocks while
    /// paused (re-checking stop at every `MAX_RESPONSE` wakeup) and
    /// returns `true` once runnable again.
    pub fn tick(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        if self.is_paused() {
            let mut guard = self.resume_mx.lock().unwrap();
            while self.is_paused() {
                if self.is_stopped() {
                    return false;
                }
                let (g, _) = self.resume_cv.wait_timeout(guard, MAX_RESPONSE).unwrap();
                guard = g;
            }
        }
        !self.is_stopped()
    }
}

/// One worker's single long-running body. Implementors hold whatever
/// state a `Connector`/`Receiver`/`Sender`/etc. needs between steps.
pub trait Task {
    /// Runs once before the step loop starts. Returning `false` skips
    /// the loop entirely and goes straight to `on_finish`.
    fn on_start(&mut self) -> bool {
        true
    }

    /// One unit of work. Returning `false` ends the run loop.
    fn one_step(&mut self) -> bool;

    fn on_finish(&mut self) {}
}

/// Scoped handle a running task exposes to the primitives it blocks on
/// (`ResourceWaiter::wait`, per-lane `Signal::wait`). Reading
/// `utility_flag` lock-free is what lets the supervisor notice a stalled
/// producer without taking any lock.
pub struct TaskHandle {
    pub control: Arc<TaskControl>,
    utility_flag: AtomicU8,
    yield_flag: AtomicBool,
}

impl TaskHandle {
    pub fn new(control: Arc<TaskControl>) -> Self {
        TaskHandle { control, utility_flag: AtomicU8::new(NO_UTILITY_FLAG), yield_flag: AtomicBool::new(false) }
    }

    pub fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }

    /// Consumes the one-shot yield bit: true at most once per `yield_now`
    /// call, used by a blocked wait to notice it should give up its slot.
    pub fn is_yielding(&self) -> bool {
        self.yield_flag.swap(false, Ordering::AcqRel)
    }

    pub fn yield_now(&self) {
        self.yield_flag.store(true, Ordering::Release);
    }

    pub fn utility_flag(&self) -> u8 {
        self.utility_flag.load(Ordering::Acquire)
    }

    pub fn is_blocked_on_memory(&self) -> bool {
        self.utility_flag() == TASK_BLOCKED
    }

    /// RAII acquisition of the "blocked on memory" utility flag for the
    /// duration of a resource wait; cleared on every exit path including
    /// panics.
    pub fn block_on_memory(&self) -> UtilityFlagGuard<'_> {
        self.utility_flag.store(TASK_BLOCKED, Ordering::Release);
        UtilityFlagGuard { flag: &self.utility_flag }
    }

    fn clear(&self) {
        self.yield_flag.store(false, Ordering::Release);
        self.utility_flag.store(NO_UTILITY_FLAG, Ordering::Release);
    }
}

pub struct UtilityFlagGuard<'a> {
    flag: &'a AtomicU8,
}

impl Drop for UtilityFlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(NO_UTILITY_FLAG, Ordering::Release);
    }
}

/// Drives a `Task` through its lifecycle, owning the `TaskHandle` the
/// task's step function receives.
pub struct TaskRunner<T: Task> {
    pub handle: Arc<TaskHandle>,
    task: T,
}

impl<T: Task> TaskRunner<T> {
    pub fn new(control: Arc<TaskControl>, task: T) -> Self {
        TaskRunner { handle: Arc::new(TaskHandle::new(control)), task }
    }

    pub fn run(&mut self) {
        if self.task.on_start() {
            loop {
                if !self.handle.control.tick() || !self.task.one_step() {
                    break;
                }
            }
        }
        self.task.on_finish();
        self.handle.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct CountToThree {
        n: u32,
    }
    impl Task for CountToThree {
        fn one_step(&mut self) -> bool {
            self.n += 1;
            self.n < 3
        }
    }

    #[test]
    fn run_executes_steps_until_false() {
        let control = TaskControl::new();
        let mut runner = TaskRunner::new(control, CountToThree { n: 0 });
        runner.run();
        assert_eq!(runner.task.n, 3);
    }

    #[test]
    fn stop_before_first_tick_skips_all_steps() {
        let control = TaskControl::new();
        control.stop();
        let mut runner = TaskRunner::new(control, CountToThree { n: 0 });
        runner.run();
        assert_eq!(runner.task.n, 0);
    }

    #[test]
    fn pause_blocks_tick_until_resumed() {
        let control = TaskControl::new();
        control.pause();
        let control2 = control.clone();
        let handle = std::thread::spawn(move || control2.tick());
        std::thread::sleep(Duration::from_millis(50));
        control.resume();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn utility_flag_guard_clears_on_drop() {
        let control = TaskControl::new();
        let handle = TaskHandle::new(control);
        {
            let _g = handle.block_on_memory();
            assert!(handle.is_blocked_on_memory());
        }
        assert!(!handle.is_blocked_on_memory());
    }
}
