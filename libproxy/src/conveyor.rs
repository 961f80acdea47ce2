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

//! Registry of `TransferLoop`s — one per proxied connection pair — each
//! holding a client-bound and a server-bound [`TransferLine`]. Workers
//! never touch a line directly; they go through [`Conveyor::write`],
//! [`Conveyor::read`], [`Conveyor::ready_read`] and [`Conveyor::flag`],
//! which round-robin across every registered peer on the requested side
//! so one slow connection can't starve the others.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use crate::{
    buffer::Buffer,
    consts::{MAX_RESPONSE, ONE_TIME_MAX},
    pager::{Page, Pager},
    task::TaskHandle,
};

pub const OPERATIONAL_ERROR: i32 = -3;
pub const DESCRIPTOR_ERROR: i32 = -2;
pub const DESCRIPTOR_SHUTDOWN: i32 = -1;
pub const NO_TRANSFER_FLAG: i32 = 0;
pub const DATA_PENDING: i32 = 1;

pub type Descriptor = i32;
pub const INVALID_DESCRIPTOR: Descriptor = -1;

const WRITER_INDEX: usize = 0;
const READER_INDEX_START: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// One direction of a proxied connection: a fixed-size page buffer, one
/// writer slot and `lane_cnt` reader slots, each independently
/// lockable. Slot 0 is always the writer; slots `1..=lane_cnt` are the
/// lanes, so `index_count() == lane_cnt + 1`.
pub struct TransferLine {
    description: String,
    buffer: Buffer,
    locks: Vec<AtomicBool>,
    flags: Vec<AtomicI32>,
    tasks: Vec<Mutex<Option<Arc<TaskHandle>>>>,
}

impl TransferLine {
    pub fn new(description: impl Into<String>, lane_cnt: usize, pager: Arc<Pager>) -> Self {
        let index_cnt = lane_cnt + 1;
        TransferLine {
            description: description.into(),
            buffer: Buffer::new(lane_cnt, pager),
            locks: (0..index_cnt).map(|_| AtomicBool::new(false)).collect(),
            flags: (0..index_cnt).map(|_| AtomicI32::new(NO_TRANSFER_FLAG)).collect(),
            tasks: (0..index_cnt).map(|_| Mutex::new(None)).collect(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn index_count(&self) -> usize {
        self.flags.len()
    }

    pub fn transfer_flag(&self, idx: usize) -> i32 {
        self.flags[idx].load(Ordering::Acquire)
    }

    pub fn set_transfer_flag(&self, idx: usize, val: i32) {
        self.flags[idx].store(val, Ordering::Release);
    }

    /// Spins on a test-and-set flag. `force` keeps retrying (sleeping
    /// 1ms between attempts) instead of giving up immediately — used by
    /// `drop_peer` to wait out an in-flight operation.
    fn acquire_buffer_lock(&self, task: Option<Arc<TaskHandle>>, idx: usize, force: bool) -> bool {
        loop {
            if self.locks[idx].compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed).is_ok() {
                *self.tasks[idx].lock().unwrap() = task;
                return true;
            }
            if !force {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn release_buffer_lock(&self, idx: usize) {
        *self.tasks[idx].lock().unwrap() = None;
        self.locks[idx].store(false, Ordering::Release);
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn active_task(&self, idx: usize) -> Option<Arc<TaskHandle>> {
        self.tasks[idx].lock().unwrap().clone()
    }
}

/// RAII lock over one slot of a [`TransferLine`]. Releases the slot on
/// drop; `is_valid()` is `false` when the slot couldn't be acquired
/// (non-forced acquisition lost the race) or the descriptor wasn't
/// found at all.
struct TransferHandle {
    descriptor: Descriptor,
    line: Option<Arc<TransferLine>>,
    idx: usize,
    valid: bool,
}

impl TransferHandle {
    fn new(task: Option<Arc<TaskHandle>>, descriptor: Descriptor, line: Option<Arc<TransferLine>>, idx: usize, force_lock: bool) -> Self {
        let valid = match &line {
            Some(l) => l.acquire_buffer_lock(task, idx, force_lock),
            None => false,
        };
        TransferHandle { descriptor, line, idx, valid }
    }

    fn invalid() -> Self {
        TransferHandle { descriptor: INVALID_DESCRIPTOR, line: None, idx: 0, valid: false }
    }

    fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn line(&self) -> &Arc<TransferLine> {
        self.line.as_ref().expect("transfer handle used without a line")
    }

    fn set_transfer_flag(&self, val: i32) {
        self.line().set_transfer_flag(self.idx, val);
    }

    fn transfer_flag(&self) -> i32 {
        self.line().transfer_flag(self.idx)
    }

    fn description(&self) -> &str {
        self.line().description()
    }

    fn buffer(&self) -> &Buffer {
        self.line().buffer()
    }
}

impl Drop for TransferHandle {
    fn drop(&mut self) {
        if self.valid {
            if let Some(line) = &self.line {
                line.release_buffer_lock(self.idx);
            }
        }
    }
}

pub struct WriteHandle(TransferHandle);

impl WriteHandle {
    pub fn descriptor(&self) -> Descriptor {
        self.0.descriptor()
    }
    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
    pub fn set_transfer_flag(&self, val: i32) {
        self.0.set_transfer_flag(val)
    }
    pub fn transfer_flag(&self) -> i32 {
        self.0.transfer_flag()
    }
    pub fn description(&self) -> &str {
        self.0.description()
    }
    pub fn advance(&self, bytes_written: usize) -> usize {
        self.0.buffer().advance_writer(bytes_written)
    }
    pub fn page(&self) -> Arc<Page> {
        self.0.buffer().writer_page()
    }
    pub fn pos(&self) -> usize {
        self.0.buffer().writer_pos()
    }
}

pub struct ReadHandle {
    handle: TransferHandle,
    lane_num: usize,
}

impl ReadHandle {
    pub fn descriptor(&self) -> Descriptor {
        self.handle.descriptor()
    }
    pub fn is_valid(&self) -> bool {
        self.handle.is_valid()
    }
    pub fn set_transfer_flag(&self, val: i32) {
        self.handle.set_transfer_flag(val)
    }
    pub fn transfer_flag(&self) -> i32 {
        self.handle.transfer_flag()
    }
    pub fn description(&self) -> &str {
        self.handle.description()
    }
    pub fn advance(&self, bytes_read: usize) -> usize {
        self.handle.buffer().advance_reader(self.lane_num, bytes_read)
    }
    pub fn page(&self) -> Arc<Page> {
        self.handle.buffer().reader_page(self.lane_num)
    }
    pub fn pos(&self) -> usize {
        self.handle.buffer().reader_pos(self.lane_num)
    }
}

/// A slice of a committed page handed to a reader's `take_f` callback.
/// `adjust_pos` lets a partial consumer (e.g. a logger that only wants
/// the first N bytes of a larger chunk) report how much it actually
/// used.
pub struct PageWrapper {
    page: Arc<Page>,
    pos: usize,
    sz: usize,
}

impl PageWrapper {
    fn new(page: Arc<Page>, pos: usize, sz: usize) -> Self {
        PageWrapper { page, pos, sz }
    }
    pub fn data(&self) -> &[u8] {
        &self.page.data()[self.pos..self.pos + self.sz]
    }
    pub fn size(&self) -> usize {
        self.sz
    }
    pub fn adjust_pos(&mut self, inc: usize) {
        assert!(inc <= self.sz);
        self.pos += inc;
        self.sz -= inc;
    }
}

/// One client connection's pair of transfer lines: `client_line` carries
/// client-to-server bytes, `server_line` carries server-to-client bytes.
pub struct TransferLoop {
    client_line: Arc<TransferLine>,
    server_line: Arc<TransferLine>,
    client_descriptor: Descriptor,
    server_descriptor: Descriptor,
}

impl TransferLoop {
    fn descriptor(&self, side: Side) -> Descriptor {
        match side {
            Side::Client => self.client_descriptor,
            Side::Server => self.server_descriptor,
        }
    }

    fn line(&self, side: Side) -> &Arc<TransferLine> {
        match side {
            Side::Client => &self.client_line,
            Side::Server => &self.server_line,
        }
    }

    fn line_for_descriptor(&self, d: Descriptor) -> Option<&Arc<TransferLine>> {
        if self.server_descriptor == d {
            Some(&self.server_line)
        } else if self.client_descriptor == d {
            Some(&self.client_line)
        } else {
            None
        }
    }
}

struct Inner {
    loops: Vec<TransferLoop>,
    index: HashMap<Descriptor, usize>,
}

impl Inner {
    fn find_loop_idx(&self, descriptor: Descriptor) -> Option<usize> {
        self.index.get(&descriptor).copied()
    }

    fn line(&self, descriptor: Descriptor) -> Option<&Arc<TransferLine>> {
        let idx = self.find_loop_idx(descriptor)?;
        self.loops[idx].line_for_descriptor(descriptor)
    }

    fn start_after_prev(&self, prev: Descriptor) -> usize {
        if prev == INVALID_DESCRIPTOR {
            return 0;
        }
        match self.find_loop_idx(prev) {
            Some(idx) => idx + 1,
            None => 0,
        }
    }
}

/// Thread-safe registry of every active proxied connection. Reads
/// (`write`/`read`/`ready_read`/`flag`/`other_side`) take a shared lock;
/// only `add_peer` and removal take the exclusive lock.
pub struct Conveyor {
    lane_cnt: usize,
    pager: Arc<Pager>,
    inner: RwLock<Inner>,
}

impl Conveyor {
    pub fn new(lane_cnt: usize, pager: Arc<Pager>) -> Self {
        assert!(lane_cnt > 0);
        Conveyor { lane_cnt, pager, inner: RwLock::new(Inner { loops: Vec::new(), index: HashMap::new() }) }
    }

    pub fn lane_count(&self) -> usize {
        self.lane_cnt
    }

    pub fn add_peer(&self, peer_name: &str, client_descriptor: Descriptor, server_descriptor: Descriptor) {
        let mut inner = self.inner.write().unwrap();
        let loop_ = TransferLoop {
            client_line: Arc::new(TransferLine::new(format!("from {peer_name}"), self.lane_cnt, self.pager.clone())),
            server_line: Arc::new(TransferLine::new(format!("to {peer_name}"), self.lane_cnt, self.pager.clone())),
            client_descriptor,
            server_descriptor,
        };
        let idx = inner.loops.len();
        inner.loops.push(loop_);
        inner.index.insert(client_descriptor, idx);
        inner.index.insert(server_descriptor, idx);
    }

    fn find_to_write(&self, task: Option<Arc<TaskHandle>>, side: Side, pred: &dyn Fn(i32) -> bool, prev: Descriptor) -> WriteHandle {
        let inner = self.inner.read().unwrap();
        let start = inner.start_after_prev(prev);
        for loop_ in &inner.loops[start..] {
            let line = loop_.line(side);
            if pred(line.transfer_flag(WRITER_INDEX)) {
                let descriptor = loop_.descriptor(side);
                return WriteHandle(TransferHandle::new(task, descriptor, Some(line.clone()), WRITER_INDEX, false));
            }
        }
        WriteHandle(TransferHandle::invalid())
    }

    fn find_to_read(&self, task: Option<Arc<TaskHandle>>, side: Side, lane_num: usize, pred: &dyn Fn(i32) -> bool, prev: Descriptor) -> ReadHandle {
        let inner = self.inner.read().unwrap();
        let start = inner.start_after_prev(prev);
        for loop_ in &inner.loops[start..] {
            let line = loop_.line(side);
            if pred(line.transfer_flag(READER_INDEX_START + lane_num)) {
                let descriptor = loop_.descriptor(side);
                let handle = TransferHandle::new(task.clone(), descriptor, Some(line.clone()), READER_INDEX_START + lane_num, false);
                return ReadHandle { handle, lane_num };
            }
        }
        ReadHandle { handle: TransferHandle::invalid(), lane_num }
    }

    fn write_handle(&self, task: Option<Arc<TaskHandle>>, descriptor: Descriptor) -> WriteHandle {
        let inner = self.inner.read().unwrap();
        let line = inner.line(descriptor).cloned();
        WriteHandle(TransferHandle::new(task, descriptor, line, WRITER_INDEX, true))
    }

    fn read_handle(&self, task: Option<Arc<TaskHandle>>, descriptor: Descriptor, lane_num: usize) -> ReadHandle {
        let inner = self.inner.read().unwrap();
        let line = inner.line(descriptor).cloned();
        let handle = TransferHandle::new(task, descriptor, line, READER_INDEX_START + lane_num, true);
        ReadHandle { handle, lane_num }
    }

    /// Round-robins every peer on `side` whose writer flag matches
    /// `pred`, handing each one's data through `get_f`. Returns the
    /// number of peers that accepted at least one byte this pass.
    pub fn write(
        &self,
        task: &Arc<TaskHandle>,
        side: Side,
        pred: impl Fn(i32) -> bool,
        mut get_f: impl FnMut(&str, Descriptor, &mut i32) -> Option<Vec<u8>>,
        mut on_error: impl FnMut(&str),
    ) -> usize {
        let mut prev = INVALID_DESCRIPTOR;
        let mut peers_processed = 0;
        loop {
            let handle = self.find_to_write(Some(task.clone()), side, &pred, prev);
            prev = handle.descriptor();
            if prev == INVALID_DESCRIPTOR {
                break;
            }
            if handle.is_valid() && pred(handle.transfer_flag()) && write_operation(&handle, &mut get_f, &mut on_error) {
                peers_processed += 1;
            }
        }
        peers_processed
    }

    /// Single-descriptor variant used when a worker already knows which
    /// connection it's servicing (e.g. the connector writing the freshly
    /// accepted client's first bytes).
    pub fn write_one(&self, task: &Arc<TaskHandle>, descriptor: Descriptor, get_f: impl FnMut(&str, Descriptor, &mut i32) -> Option<Vec<u8>>, on_error: impl FnMut(&str)) -> bool {
        let handle = self.write_handle(Some(task.clone()), descriptor);
        if !handle.is_valid() {
            return false;
        }
        let mut get_f = get_f;
        let mut on_error = on_error;
        write_operation(&handle, &mut get_f, &mut on_error)
    }

    pub fn read(
        &self,
        task: &Arc<TaskHandle>,
        side: Side,
        lane_num: usize,
        pred: impl Fn(i32) -> bool,
        mut take_f: impl FnMut(&str, Descriptor, PageWrapper, &mut i32) -> usize,
        mut on_error: impl FnMut(&str),
    ) -> usize {
        let mut prev = INVALID_DESCRIPTOR;
        let mut peers_processed = 0;
        loop {
            let handle = self.find_to_read(Some(task.clone()), side, lane_num, &pred, prev);
            prev = handle.descriptor();
            if prev == INVALID_DESCRIPTOR {
                break;
            }
            if handle.is_valid() && pred(handle.transfer_flag()) && read_operation(&handle, &mut take_f, &mut on_error) {
                peers_processed += 1;
            }
        }
        peers_processed
    }

    pub fn read_one(&self, task: &Arc<TaskHandle>, descriptor: Descriptor, lane_num: usize, take_f: impl FnMut(&str, Descriptor, PageWrapper, &mut i32) -> usize, on_error: impl FnMut(&str)) -> bool {
        let handle = self.read_handle(Some(task.clone()), descriptor, lane_num);
        if !handle.is_valid() {
            return false;
        }
        let mut take_f = take_f;
        let mut on_error = on_error;
        read_operation(&handle, &mut take_f, &mut on_error)
    }

    pub fn ready_read(&self, task: &Arc<TaskHandle>, side: Side, lane_num: usize, pred: impl Fn(i32) -> bool, mut on_error: impl FnMut(&str)) -> usize {
        let mut prev = INVALID_DESCRIPTOR;
        let mut peers_processed = 0;
        loop {
            let handle = self.find_to_read(Some(task.clone()), side, lane_num, &pred, prev);
            prev = handle.descriptor();
            if prev == INVALID_DESCRIPTOR {
                break;
            }
            if handle.is_valid() && pred(handle.transfer_flag()) && ready_read_operation(&handle, &mut on_error) {
                peers_processed += 1;
            }
        }
        peers_processed
    }

    pub fn flag_reader(&self, task: &Arc<TaskHandle>, descriptor: Descriptor, lane_num: usize, flag_f: impl FnOnce(&mut i32) -> bool) -> bool {
        let handle = self.read_handle(Some(task.clone()), descriptor, lane_num);
        flag_handle(handle.is_valid(), handle.transfer_flag(), |v| handle.set_transfer_flag(v), flag_f)
    }

    pub fn flag_writer(&self, task: &Arc<TaskHandle>, descriptor: Descriptor, flag_f: impl FnOnce(&mut i32) -> bool) -> bool {
        let handle = self.write_handle(Some(task.clone()), descriptor);
        flag_handle(handle.is_valid(), handle.transfer_flag(), |v| handle.set_transfer_flag(v), flag_f)
    }

    pub fn other_side(&self, descriptor: Descriptor) -> Descriptor {
        let inner = self.inner.read().unwrap();
        if let Some(idx) = inner.find_loop_idx(descriptor) {
            let loop_ = &inner.loops[idx];
            if loop_.client_descriptor == descriptor {
                return loop_.server_descriptor;
            }
            if loop_.server_descriptor == descriptor {
                return loop_.client_descriptor;
            }
        }
        INVALID_DESCRIPTOR
    }

    pub fn peers_count(&self) -> usize {
        self.inner.read().unwrap().loops.len()
    }

    /// An arbitrary client descriptor from the registry, or `None` if no
    /// peer is connected. Used by the supervisor's last-resort eviction
    /// under sustained memory exhaustion; picking the first entry rather
    /// than a truly random one keeps this crate off a `rand` dependency
    /// the rest of the proxy has no other use for.
    pub fn any_descriptor(&self) -> Option<Descriptor> {
        self.inner.read().unwrap().loops.first().map(|l| l.client_descriptor)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.loops.clear();
        inner.index.clear();
    }

    /// Drops every peer with at least one slot whose flag matches
    /// `pred`, after waiting for any in-flight operation on that peer to
    /// finish (yielding a blocked task's memory wait so it notices the
    /// shutdown promptly).
    pub fn drop_peers(&self, pred: impl Fn(i32) -> bool, on_error: impl Fn(&str), clear_f: impl Fn(Descriptor, Descriptor)) {
        loop {
            let victim = {
                let inner = self.inner.read().unwrap();
                inner.loops.iter().position(|loop_| line_matches(&loop_.client_line, &pred) || line_matches(&loop_.server_line, &pred))
            };
            match victim {
                Some(idx) => {
                    let mut inner = self.inner.write().unwrap();
                    if idx < inner.loops.len() {
                        drop_peer_at(&mut inner, idx, &on_error, &clear_f);
                    }
                }
                None => break,
            }
        }
    }

    pub fn drop_peer(&self, descriptor: Descriptor, on_error: impl Fn(&str), clear_f: impl Fn(Descriptor, Descriptor)) {
        let mut inner = self.inner.write().unwrap();
        if let Some(idx) = inner.find_loop_idx(descriptor) {
            drop_peer_at(&mut inner, idx, &on_error, &clear_f);
        }
    }
}

fn line_matches(line: &TransferLine, pred: &impl Fn(i32) -> bool) -> bool {
    (0..line.index_count()).any(|idx| pred(line.transfer_flag(idx)))
}

/// Spins (up to ten supervisor periods) acquiring every slot of `line`
/// with `force = true` semantics but bails out early to log which lane
/// is stuck and on whose behalf.
fn acquire_all_locks(line: &TransferLine, on_error: &impl Fn(&str)) -> bool {
    let desperate_delay = MAX_RESPONSE * 10;
    for idx in 0..line.index_count() {
        let mut delay = Duration::ZERO;
        let mut done = line.acquire_buffer_lock(None, idx, false);
        while !done && delay < desperate_delay {
            let task = line.active_task(idx);
            let mut sleep_delay = Duration::from_millis(1);
            if let Some(task) = &task {
                if task.is_blocked_on_memory() {
                    task.yield_now();
                    sleep_delay += MAX_RESPONSE;
                }
            }
            std::thread::sleep(sleep_delay);
            delay += sleep_delay;
            done = line.acquire_buffer_lock(None, idx, false);
        }
        if !done {
            let task = line.active_task(idx);
            let msg = match task {
                Some(_) => format!("unable to remove peer : [{}] lane {idx} is blocked by an active task", line.description()),
                None => format!("unable to remove peer : [{}] lane {idx} is blocked, task pointer is null", line.description()),
            };
            on_error(&msg);
            return false;
        }
    }
    true
}

fn release_all_locks(line: &TransferLine) {
    for idx in 0..line.index_count() {
        line.release_buffer_lock(idx);
    }
}

fn drop_peer_at(inner: &mut Inner, idx: usize, on_error: &impl Fn(&str), clear_f: &impl Fn(Descriptor, Descriptor)) {
    let (client_line, server_line, client_descriptor, server_descriptor) = {
        let loop_ = &inner.loops[idx];
        (loop_.client_line.clone(), loop_.server_line.clone(), loop_.client_descriptor, loop_.server_descriptor)
    };
    if !acquire_all_locks(&client_line, on_error) {
        return;
    }
    if !acquire_all_locks(&server_line, on_error) {
        release_all_locks(&client_line);
        return;
    }
    release_all_locks(&client_line);
    release_all_locks(&server_line);

    inner.index.remove(&client_descriptor);
    inner.index.remove(&server_descriptor);
    clear_f(client_descriptor, server_descriptor);

    let last = inner.loops.len() - 1;
    inner.loops.swap_remove(idx);
    if idx != last {
        let moved = &inner.loops[idx];
        inner.index.insert(moved.client_descriptor, idx);
        inner.index.insert(moved.server_descriptor, idx);
    }
}

fn flag_handle(valid: bool, mut flag: i32, set: impl FnOnce(i32), flag_f: impl FnOnce(&mut i32) -> bool) -> bool {
    if valid && flag_f(&mut flag) {
        set(flag);
        return true;
    }
    false
}

fn write_operation(handle: &WriteHandle, get_f: &mut dyn FnMut(&str, Descriptor, &mut i32) -> Option<Vec<u8>>, _on_error: &mut dyn FnMut(&str)) -> bool {
    let mut flag = handle.transfer_flag();
    let mut total_written = 0usize;
    while total_written < ONE_TIME_MAX {
        let data = match get_f(handle.description(), handle.descriptor(), &mut flag) {
            Some(v) if !v.is_empty() => v,
            _ => break,
        };
        total_written += data.len();
        let mut to_write = data.len();
        let mut offset = 0usize;
        let mut bytes_written = 0usize;
        loop {
            let bytes_available = handle.advance(bytes_written);
            if to_write == 0 {
                break;
            }
            let page = handle.page();
            bytes_written = to_write.min(bytes_available);
            let pos = handle.pos();
            // Safety: this line holds the writer slot lock for the
            // duration of the handle, and only the bytes past `pos`
            // (not yet committed to any lane) are touched.
            unsafe {
                page.data_mut_unsynchronized()[pos..pos + bytes_written].copy_from_slice(&data[offset..offset + bytes_written]);
            }
            offset += bytes_written;
            to_write -= bytes_written;
        }
    }
    handle.set_transfer_flag(flag);
    total_written != 0
}

fn read_operation(handle: &ReadHandle, take_f: &mut dyn FnMut(&str, Descriptor, PageWrapper, &mut i32) -> usize, on_error: &mut dyn FnMut(&str)) -> bool {
    let orig_flag = handle.transfer_flag();
    let mut flag = orig_flag;
    let mut total_read = 0usize;
    let mut bytes_read = 0usize;
    loop {
        let to_read = handle.advance(bytes_read);
        if to_read == 0 || total_read > ONE_TIME_MAX {
            break;
        }
        let page = handle.page();
        flag = orig_flag;
        let wrapper = PageWrapper::new(page, handle.pos(), to_read);
        bytes_read = take_f(handle.description(), handle.descriptor(), wrapper, &mut flag);
        if bytes_read == 0 {
            break;
        }
        total_read += bytes_read;
    }
    let _ = on_error;
    handle.set_transfer_flag(flag);
    total_read != 0
}

fn ready_read_operation(handle: &ReadHandle, _on_error: &mut dyn FnMut(&str)) -> bool {
    handle.advance(0) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{task::TaskControl, waiter::ResourceWaiter};

    fn new_conveyor(page_size: usize, cache_size: usize, lanes: usize) -> Conveyor {
        let waiter = Arc::new(ResourceWaiter::new((cache_size / 5).max(1) as i64));
        let pager = Pager::new(waiter, page_size, cache_size, true);
        Conveyor::new(lanes, pager)
    }

    fn handle() -> Arc<TaskHandle> {
        Arc::new(TaskHandle::new(TaskControl::new()))
    }

    #[test]
    fn write_then_read_round_trips_bytes() {
        let conv = new_conveyor(16, 8, 1);
        conv.add_peer("peer", 10, 20);
        let task = handle();

        let mut chunks = vec![b"hello world".to_vec()];
        conv.write(&task, Side::Server, |f| f == NO_TRANSFER_FLAG, |_, _, _| chunks.pop(), |_| {});

        let mut out = Vec::new();
        conv.read(&task, Side::Server, 0, |f| f == NO_TRANSFER_FLAG, |_, _, mut wrapper, _| {
            out.extend_from_slice(wrapper.data());
            let n = wrapper.size();
            wrapper.adjust_pos(n);
            n
        }, |_| {});

        assert_eq!(out, b"hello world");
    }

    #[test]
    fn ready_read_reports_pending_bytes_without_consuming() {
        let conv = new_conveyor(16, 8, 1);
        conv.add_peer("peer", 1, 2);
        let task = handle();
        let mut chunks = vec![b"data".to_vec()];
        conv.write(&task, Side::Server, |f| f == NO_TRANSFER_FLAG, |_, _, _| chunks.pop(), |_| {});

        let pending = conv.ready_read(&task, Side::Server, 0, |f| f == NO_TRANSFER_FLAG, |_| {});
        assert_eq!(pending, 1);
        // still unread, a second probe reports the same thing
        let pending_again = conv.ready_read(&task, Side::Server, 0, |f| f == NO_TRANSFER_FLAG, |_| {});
        assert_eq!(pending_again, 1);
    }

    #[test]
    fn other_side_maps_both_descriptors() {
        let conv = new_conveyor(16, 4, 1);
        conv.add_peer("peer", 5, 6);
        assert_eq!(conv.other_side(5), 6);
        assert_eq!(conv.other_side(6), 5);
        assert_eq!(conv.other_side(999), INVALID_DESCRIPTOR);
    }

    #[test]
    fn drop_peer_removes_both_descriptors_and_fires_clear() {
        let conv = new_conveyor(16, 4, 1);
        conv.add_peer("a", 1, 2);
        conv.add_peer("b", 3, 4);
        assert_eq!(conv.peers_count(), 2);

        let cleared = Arc::new(Mutex::new(Vec::new()));
        let cleared2 = cleared.clone();
        conv.drop_peer(1, |_| {}, move |c, s| cleared2.lock().unwrap().push((c, s)));

        assert_eq!(conv.peers_count(), 1);
        assert_eq!(conv.other_side(3), 4);
        assert_eq!(conv.other_side(1), INVALID_DESCRIPTOR);
        assert_eq!(*cleared.lock().unwrap(), vec![(1, 2)]);
    }

    #[test]
    fn drop_peers_removes_everything_matching_predicate() {
        let conv = new_conveyor(16, 4, 1);
        conv.add_peer("a", 1, 2);
        conv.add_peer("b", 3, 4);
        let task = handle();
        conv.flag_writer(&task, 1, |f| {
            *f = DESCRIPTOR_SHUTDOWN;
            true
        });

        conv.drop_peers(|f| f == DESCRIPTOR_SHUTDOWN, |_| {}, |_, _| {});
        assert_eq!(conv.peers_count(), 1);
        assert_eq!(conv.other_side(3), 4);
    }

    #[test]
    fn flag_writer_updates_stored_flag() {
        let conv = new_conveyor(16, 4, 1);
        conv.add_peer("a", 7, 8);
        let task = handle();
        assert!(conv.flag_writer(&task, 7, |f| {
            *f = DATA_PENDING;
            true
        }));
        let mut seen = 0;
        conv.write(&task, Side::Server, |f| f == DATA_PENDING, |_, _, f| {
            seen += 1;
            *f = NO_TRANSFER_FLAG;
            None
        }, |_| {});
        assert_eq!(seen, 1);
    }
}
