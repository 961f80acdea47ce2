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

//! Fixed-size page pool backing the transfer conveyor. A `Page` is
//! handed out by `Pager::get_page` and returned to the free list
//! automatically once every shared owner (`Arc<Page>`) drops it; the
//! accompanying `ResourceWaiter` is nudged on every take and release so
//! producers can be gated on free-page availability.

use std::sync::{
    atomic::{AtomicU32, AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::waiter::ResourceWaiter;

/// A generic free-list cache with an atomic size for a lock-free
/// fast-path check before taking the mutex. Only ever holds up to
/// `size` elements; anything returned past that is simply dropped.
struct Cache<T> {
    free: Mutex<Vec<T>>,
    create: Box<dyn Fn() -> T + Send + Sync>,
    size: usize,
    cur_size: AtomicUsize,
}

impl<T> Cache<T> {
    fn new(create: impl Fn() -> T + Send + Sync + 'static, size: usize, prefill: bool) -> Self {
        let mut free = Vec::with_capacity(size);
        if prefill {
            for _ in 0..size {
                free.push(create());
            }
        }
        let cur = if prefill { size } else { 0 };
        Cache { free: Mutex::new(free), create: Box::new(create), size, cur_size: AtomicUsize::new(cur) }
    }

    fn take(&self) -> T {
        if self.cur_size.load(Ordering::Acquire) > 0 {
            let mut guard = self.free.lock().unwrap();
            if self.cur_size.load(Ordering::Relaxed) > 0 {
                if let Some(v) = guard.pop() {
                    self.cur_size.fetch_sub(1, Ordering::Relaxed);
                    return v;
                }
            }
        }
        (self.create)()
    }

    fn store(&self, v: T) {
        if self.cur_size.load(Ordering::Acquire) < self.size {
            let mut guard = self.free.lock().unwrap();
            if self.cur_size.load(Ordering::Relaxed) < self.size {
                guard.push(v);
                self.cur_size.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn reset(&self, prefill: bool) {
        let mut guard = self.free.lock().unwrap();
        guard.clear();
        if prefill {
            for _ in 0..self.size {
                guard.push((self.create)());
            }
            self.cur_size.store(self.size, Ordering::Release);
        } else {
            self.cur_size.store(0, Ordering::Release);
        }
    }

    fn elements_available(&self) -> usize {
        self.cur_size.load(Ordering::Acquire)
    }
}

pub struct Pager {
    prefill_cache: bool,
    cache: Cache<Vec<u8>>,
    waiter: Arc<ResourceWaiter>,
    page_size: usize,
    release_counter: AtomicU32,
}

impl Pager {
    pub fn new(waiter: Arc<ResourceWaiter>, page_size: usize, cache_size: usize, prefill_cache: bool) -> Arc<Self> {
        Arc::new(Pager {
            prefill_cache,
            cache: Cache::new(move || vec![0u8; page_size], cache_size, prefill_cache),
            waiter,
            page_size,
            release_counter: AtomicU32::new(0),
        })
    }

    pub fn get_page(self: &Arc<Self>) -> Arc<Page> {
        let buf = self.cache.take();
        self.waiter.adjust_resource(-1);
        Arc::new(Page { pager: self.clone(), buf: Some(buf) })
    }

    pub fn reset(&self) {
        self.release_counter.store(0, Ordering::Release);
        self.cache.reset(self.prefill_cache);
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn cache_size(&self) -> usize {
        self.cache.size
    }

    pub fn pages_available(&self) -> usize {
        self.cache.elements_available()
    }

    pub fn waiter(&self) -> &Arc<ResourceWaiter> {
        &self.waiter
    }

    pub fn release_counter(&self) -> u32 {
        self.release_counter.load(Ordering::Acquire)
    }

    fn free(&self, buf: Vec<u8>) {
        self.cache.store(buf);
        self.waiter.adjust_resource(1);
        self.release_counter.fetch_add(1, Ordering::Release);
    }
}

/// An owned page, shared (`Arc<Page>`) across the writer cursor, every
/// lane node covering it, and any in-flight `PageWrapper`. Returned to
/// the pager's free list the instant the last `Arc` drops.
pub struct Page {
    pager: Arc<Pager>,
    buf: Option<Vec<u8>>,
}

impl Page {
    pub fn data(&self) -> &[u8] {
        self.buf.as_ref().expect("page used after drop")
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("page used after drop")
    }

    pub fn size(&self) -> usize {
        self.pager.page_size()
    }

    /// Mutable access to a shared page.
    ///
    /// # Safety
    /// The caller must hold the owning transfer line's writer slot lock
    /// for the whole borrow, which is what guarantees no lane is reading
    /// the bytes being written — the writer only ever touches the range
    /// past what it has already committed via `advance_writer`.
    pub unsafe fn data_mut_unsynchronized(&self) -> &mut [u8] {
        let buf = self.buf.as_ref().expect("page used after drop");
        std::slice::from_raw_parts_mut(buf.as_ptr() as *mut u8, buf.len())
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pager.free(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_pager(page_size: usize, cache_size: usize) -> Arc<Pager> {
        let waiter = Arc::new(ResourceWaiter::new((cache_size / 5) as i64));
        Pager::new(waiter, page_size, cache_size, true)
    }

    #[test]
    fn pager_conservation_holds_across_take_and_drop() {
        let pager = new_pager(64, 8);
        assert_eq!(pager.pages_available(), 8);
        let p1 = pager.get_page();
        let p2 = pager.get_page();
        assert_eq!(pager.pages_available(), 6);
        drop(p1);
        assert_eq!(pager.pages_available(), 7);
        drop(p2);
        assert_eq!(pager.pages_available(), 8);
    }

    #[test]
    fn shared_ownership_delays_release_until_last_drop() {
        let pager = new_pager(64, 4);
        let page = pager.get_page();
        let page2 = page.clone();
        assert_eq!(Arc::strong_count(&page), 2);
        drop(page);
        assert_eq!(pager.pages_available(), 3);
        drop(page2);
        assert_eq!(pager.pages_available(), 4);
    }

    #[test]
    fn reset_refills_cache_to_full() {
        let pager = new_pager(64, 4);
        let _held = pager.get_page();
        pager.reset();
        assert_eq!(pager.pages_available(), 4);
    }

    #[test]
    fn release_counter_tracks_frees() {
        let pager = new_pager(64, 4);
        let p = pager.get_page();
        assert_eq!(pager.release_counter(), 0);
        drop(p);
        assert_eq!(pager.release_counter(), 1);
    }
}
