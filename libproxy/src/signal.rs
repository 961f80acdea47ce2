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

//! A condition-variable wrapper with a lock-free fast path for the
//! common case of notifying when nobody is waiting. Used both directly
//! (per-lane data signals) and as the wakeup primitive inside
//! [`crate::waiter::ResourceWaiter`].

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Condvar, Mutex,
    },
    time::Duration,
};

#[derive(Default)]
struct State {
    generation: u64,
}

pub struct Signal {
    state: Mutex<State>,
    cv: Condvar,
    blocked_cnt: AtomicUsize,
}

impl Default for Signal {
    fn default() -> Self {
        Signal { state: Mutex::new(State::default()), cv: Condvar::new(), blocked_cnt: AtomicUsize::new(0) }
    }
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        self.blocked_cnt.store(0, Ordering::Relaxed);
    }

    /// Runs `condition` under the internal lock and wakes every waiter
    /// iff it returns `true`. Skips taking the lock entirely when no one
    /// is waiting. Returns whether a wakeup was actually issued, so
    /// callers (e.g. a resource waiter crossing its threshold) can chain
    /// a release callback off the same check.
    pub fn notify_all(&self, condition: impl FnOnce() -> bool) -> bool {
        if self.blocked_cnt.load(Ordering::Acquire) == 0 {
            return false;
        }
        let mut notified = false;
        {
            let mut guard = self.state.lock().unwrap();
            if self.blocked_cnt.load(Ordering::Relaxed) > 0 && condition() {
                guard.generation = guard.generation.wrapping_add(1);
                notified = true;
            }
        }
        if notified {
            self.cv.notify_all();
        }
        notified
    }

    pub fn notify_one(&self, condition: impl FnOnce() -> bool) -> bool {
        self.notify_n(1, condition)
    }

    pub fn notify_n(&self, n: usize, condition: impl FnOnce() -> bool) -> bool {
        if n == 0 {
            return false;
        }
        if self.blocked_cnt.load(Ordering::Acquire) == 0 {
            return false;
        }
        let mut notified = false;
        {
            let mut guard = self.state.lock().unwrap();
            if self.blocked_cnt.load(Ordering::Relaxed) > 0 && condition() {
                guard.generation = guard.generation.wrapping_add(1);
                notified = true;
            }
        }
        if notified {
            for _ in 0..n {
                self.cv.notify_one();
            }
        }
        notified
    }

    /// Blocks in `timeout`-sized increments, re-checking `stop` on every
    /// wakeup, until a notification bumps the generation counter or
    /// `stop` returns true. Returns `true` if woken by a notification.
    pub fn wait(&self, timeout: Duration, stop: impl Fn() -> bool) -> bool {
        let mut guard = self.state.lock().unwrap();
        let start_gen = guard.generation;
        self.blocked_cnt.fetch_add(1, Ordering::Relaxed);
        let mut ok = true;
        loop {
            let (g, _) = self.cv.wait_timeout(guard, timeout).unwrap();
            guard = g;
            if guard.generation != start_gen {
                break;
            }
            if stop() {
                ok = false;
                break;
            }
        }
        self.blocked_cnt.fetch_sub(1, Ordering::Relaxed);
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn notify_all_wakes_waiter_before_timeout() {
        let sig = Arc::new(Signal::new());
        let sig2 = sig.clone();
        let handle = std::thread::spawn(move || sig2.wait(Duration::from_secs(5), || false));
        while sig.blocked_cnt.load(Ordering::Acquire) == 0 {
            std::thread::yield_now();
        }
        let start = Instant::now();
        assert!(sig.notify_all(|| true));
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stop_condition_breaks_wait_without_notification() {
        let sig = Signal::new();
        let woke = sig.wait(Duration::from_millis(20), || true);
        assert!(!woke);
    }

    #[test]
    fn notify_all_is_noop_when_condition_false() {
        let sig = Arc::new(Signal::new());
        let sig2 = sig.clone();
        let handle = std::thread::spawn(move || sig2.wait(Duration::from_millis(50), || false));
        while sig.blocked_cnt.load(Ordering::Acquire) == 0 {
            std::thread::yield_now();
        }
        assert!(!sig.notify_all(|| false));
        assert!(!handle.join().unwrap());
    }
}
