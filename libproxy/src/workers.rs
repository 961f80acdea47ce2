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

//! The worker fleet: one `Connector`, a pool each of client/server
//! `Receiver`s and `Sender`s, a `SendersHelper` per side, a `Logger` per
//! side (the client-side one decodes the PostgreSQL wire protocol, the
//! server-side one just records byte counts) and one `Supervisor`.

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    os::fd::{AsRawFd, FromRawFd, IntoRawFd},
    sync::{Arc, Mutex},
    time::Duration,
};

use mio::{net::TcpStream as MioTcpStream, Interest, Token};

use crate::{
    consts::{MAX_RESPONSE, RECV_BUF_SIZE},
    conveyor::{
        Conveyor, Descriptor, DATA_PENDING, DESCRIPTOR_ERROR, DESCRIPTOR_SHUTDOWN, NO_TRANSFER_FLAG, OPERATIONAL_ERROR,
    },
    reactor::Reactor,
    signal::Signal,
    task::{Task, TaskControl, TaskHandle},
    waiter::ResourceWaiter,
};
use pgproto::DecoderTable;

/// One `Signal` per lane, matching a transfer line's lane count. A
/// receiver finishing a write notifies every lane at once (the bytes it
/// just committed landed on every lane simultaneously); a senders-helper
/// only ever notifies lane 0.
pub struct SignalPack {
    signals: Vec<Signal>,
}

impl SignalPack {
    pub fn new(lane_cnt: usize) -> Self {
        SignalPack { signals: (0..lane_cnt).map(|_| Signal::new()).collect() }
    }

    pub fn wait(&self, lane: usize, timeout: Duration, stop: impl Fn() -> bool) -> bool {
        self.signals[lane].wait(timeout, stop)
    }

    pub fn notify_n(&self, n: usize) {
        for signal in &self.signals {
            signal.notify_n(n, || true);
        }
    }

    pub fn notify_one_waiter(&self, lane: usize) {
        self.signals[lane].notify_one(|| true);
    }

    pub fn reset(&self) {
        for signal in &self.signals {
            signal.reset();
        }
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock)
}

/// Reads `SO_ERROR` off a socket that just became writable, the
/// standard way to tell a completed non-blocking connect from a refused
/// one (both make the socket writable-ready).
fn socket_error(fd: std::os::fd::RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut err as *mut _ as *mut libc::c_void, &mut len);
    }
    err
}

/// Accepts client sockets off a listening socket, dials the backend, and
/// registers the pair with the conveyor and every readiness domain.
/// Failing partway through a registration leaves already-registered fds
/// alone — `Proxy::stop()` tears the whole conveyor down anyway, so a
/// half-registered peer is cleaned up the same way a healthy one is.
pub struct Connector {
    backend_addr: std::net::SocketAddr,
    reactor: Arc<Mutex<Reactor>>,
    client_receivers: Arc<Mutex<Reactor>>,
    server_receivers: Arc<Mutex<Reactor>>,
    client_senders: Arc<Mutex<Reactor>>,
    server_senders: Arc<Mutex<Reactor>>,
    conveyor: Arc<Conveyor>,
    control: Arc<TaskControl>,
    listener: mio::net::TcpListener,
}

impl Connector {
    pub fn new(
        listener: mio::net::TcpListener,
        backend_addr: std::net::SocketAddr,
        reactor: Arc<Mutex<Reactor>>,
        client_receivers: Arc<Mutex<Reactor>>,
        server_receivers: Arc<Mutex<Reactor>>,
        client_senders: Arc<Mutex<Reactor>>,
        server_senders: Arc<Mutex<Reactor>>,
        conveyor: Arc<Conveyor>,
        control: Arc<TaskControl>,
    ) -> Self {
        Connector { backend_addr, reactor, client_receivers, server_receivers, client_senders, server_senders, conveyor, control, listener }
    }

    /// Non-blocking connect, waited out on a scratch one-shot reactor and
    /// confirmed via `SO_ERROR` rather than trusting the writable
    /// readiness alone (a refused connection is still writable once).
    /// Retried up to 5 times on transient failure.
    fn dial_backend(&self) -> Option<TcpStream> {
        for _attempt in 0..5 {
            if self.control.is_stopped() {
                return None;
            }
            if let Some(stream) = self.try_connect_once() {
                return Some(stream);
            }
            std::thread::sleep(MAX_RESPONSE);
        }
        None
    }

    fn try_connect_once(&self) -> Option<TcpStream> {
        let mut stream = MioTcpStream::connect(self.backend_addr).ok()?;
        let mut scratch = Reactor::new(1).ok()?;
        scratch.register(&mut stream, Token(0), Interest::WRITABLE).ok()?;
        let ready = scratch.poll_until_ready_or_stopped(&self.control).ok()?;
        if ready.is_empty() {
            return None;
        }
        if socket_error(stream.as_raw_fd()) != 0 {
            return None;
        }
        Some(unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) })
    }

    fn add_peer(&mut self, client: std::net::TcpStream) {
        let peer_name = client.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "<unknown>".into());
        client.set_nonblocking(true).ok();
        let Some(server) = self.dial_backend() else { return };
        server.set_nonblocking(true).ok();

        let client_fd = client.as_raw_fd();
        let server_fd = server.as_raw_fd();
        self.conveyor.add_peer(&peer_name, client_fd, server_fd);

        let mut client_mio = MioTcpStream::from_std(client);
        let mut server_mio = MioTcpStream::from_std(server);
        let _ = self.client_receivers.lock().unwrap().register(&mut client_mio, Token(client_fd as usize), Interest::READABLE);
        let _ = self.server_receivers.lock().unwrap().register(&mut server_mio, Token(server_fd as usize), Interest::READABLE);
        let _ = self.client_senders.lock().unwrap().register(&mut client_mio, Token(client_fd as usize), Interest::WRITABLE);
        let _ = self.server_senders.lock().unwrap().register(&mut server_mio, Token(server_fd as usize), Interest::WRITABLE);

        // Registration hands ownership of the fd's readiness tracking to
        // the four reactors above; the sockets themselves stay open
        // under their raw fds until the peer is dropped from the
        // conveyor, so leak the mio wrappers here rather than closing
        // the fds out from under the reactors.
        std::mem::forget(client_mio);
        std::mem::forget(server_mio);
    }
}

impl Task for Connector {
    fn one_step(&mut self) -> bool {
        let ready = match self.reactor.lock().unwrap().poll(MAX_RESPONSE) {
            Ok(r) => r,
            Err(_) => return !self.control.is_stopped(),
        };
        if !ready.is_empty() {
            loop {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        let std_stream = unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) };
                        self.add_peer(std_stream);
                    }
                    Err(e) if would_block(&e) => break,
                    Err(_) => break,
                }
            }
        }
        !self.control.is_stopped()
    }
}

/// Reads from every ready socket on `side` into the conveyor. One pool
/// of these runs per side; each receiver independently round-robins the
/// whole peer set via `Conveyor::write`.
pub struct Receiver {
    conveyor: Arc<Conveyor>,
    reactor: Arc<Mutex<Reactor>>,
    data_signal: Arc<SignalPack>,
    side: crate::conveyor::Side,
    control: Arc<TaskControl>,
}

impl Receiver {
    pub fn new(conveyor: Arc<Conveyor>, reactor: Arc<Mutex<Reactor>>, data_signal: Arc<SignalPack>, side: crate::conveyor::Side, control: Arc<TaskControl>) -> Self {
        Receiver { conveyor, reactor, data_signal, side, control }
    }

    fn recv(sock_fd: Descriptor, buf: &mut [u8; RECV_BUF_SIZE]) -> (Vec<u8>, i32) {
        // SAFETY-equivalent note: in the original this borrows the raw fd
        // directly via `read(2)`; we do the same through a non-owning
        // wrapper so closing stays the peer record's job.
        let mut stream = unsafe { TcpStream::from_raw_fd(sock_fd) };
        let result = stream.read(buf);
        std::mem::forget(stream);
        match result {
            Ok(0) => (Vec::new(), DESCRIPTOR_SHUTDOWN),
            Ok(n) => (buf[..n].to_vec(), DATA_PENDING),
            Err(e) if would_block(&e) => (Vec::new(), NO_TRANSFER_FLAG),
            Err(_) => (Vec::new(), DESCRIPTOR_ERROR),
        }
    }
}

impl Task for Receiver {
    fn one_step(&mut self) -> bool {
        let handle = Arc::new(TaskHandle::new(self.control.clone()));
        let mut buf = [0u8; RECV_BUF_SIZE];
        let cnt = self.conveyor.write(
            &handle,
            self.side,
            |f| f == DATA_PENDING,
            |_, sock, flag| {
                let (data, new_flag) = Receiver::recv(sock, &mut buf);
                *flag = new_flag;
                if data.is_empty() {
                    None
                } else {
                    Some(data)
                }
            },
            |_| {},
        );
        if cnt > 0 {
            self.data_signal.notify_n(cnt);
        }

        match self.reactor.lock().unwrap().poll(MAX_RESPONSE) {
            Ok(ready) => {
                for token in ready {
                    let fd = token.0 as Descriptor;
                    let wrote = self.conveyor.write_one(
                        &handle,
                        fd,
                        |_, sock, flag| {
                            let (data, new_flag) = Receiver::recv(sock, &mut buf);
                            *flag = new_flag;
                            if data.is_empty() {
                                None
                            } else {
                                Some(data)
                            }
                        },
                        |_| {},
                    );
                    if wrote {
                        self.data_signal.notify_n(1);
                    }
                }
            }
            Err(_) => {}
        }
        !self.control.is_stopped()
    }
}

/// Reads lane 0 and writes it straight to the opposite socket. Stops
/// mid-page on `EAGAIN`/`EWOULDBLOCK`, leaving the read-side flag at
/// `DataPending` so the senders-helper's readiness notification is what
/// wakes this lane again.
pub struct Sender {
    conveyor: Arc<Conveyor>,
    data_signal: Arc<SignalPack>,
    side: crate::conveyor::Side,
    control: Arc<TaskControl>,
}

const SENDER_LANE: usize = 0;
const LOGGER_LANE: usize = 1;

impl Sender {
    pub fn new(conveyor: Arc<Conveyor>, data_signal: Arc<SignalPack>, side: crate::conveyor::Side, control: Arc<TaskControl>) -> Self {
        Sender { conveyor, data_signal, side, control }
    }

    fn send_all(dest_fd: Descriptor, data: &[u8]) -> (usize, i32) {
        let mut stream = unsafe { TcpStream::from_raw_fd(dest_fd) };
        let mut sent = 0;
        let mut flag = NO_TRANSFER_FLAG;
        while sent != data.len() {
            match stream.write(&data[sent..]) {
                Ok(0) => {
                    flag = DESCRIPTOR_SHUTDOWN;
                    break;
                }
                Ok(n) => sent += n,
                Err(e) if would_block(&e) => {
                    flag = DATA_PENDING;
                    break;
                }
                Err(_) => {
                    flag = DESCRIPTOR_ERROR;
                    break;
                }
            }
        }
        std::mem::forget(stream);
        (sent, flag)
    }
}

impl Task for Sender {
    fn one_step(&mut self) -> bool {
        let handle = Arc::new(TaskHandle::new(self.control.clone()));
        let processed = self.conveyor.read(
            &handle,
            self.side,
            SENDER_LANE,
            |f| f == NO_TRANSFER_FLAG,
            |_, sock, mut wrapper, flag| {
                let dest = self.conveyor.other_side(sock);
                let (sent, new_flag) = Sender::send_all(dest, wrapper.data());
                if new_flag != NO_TRANSFER_FLAG {
                    *flag = new_flag;
                }
                wrapper.adjust_pos(sent);
                sent
            },
            |_| {},
        );
        if processed > 0 {
            return true;
        }
        self.data_signal.wait(SENDER_LANE, MAX_RESPONSE, || self.control.is_stopped())
    }
}

/// Clears a lane-0 `DataPending` flag back to `NoTransferFlag` once a
/// send-readiness fd fires, letting the sender retry that peer.
pub struct SendersHelper {
    conveyor: Arc<Conveyor>,
    reactor: Arc<Mutex<Reactor>>,
    data_signal: Arc<SignalPack>,
    control: Arc<TaskControl>,
}

impl SendersHelper {
    pub fn new(conveyor: Arc<Conveyor>, reactor: Arc<Mutex<Reactor>>, data_signal: Arc<SignalPack>, control: Arc<TaskControl>) -> Self {
        SendersHelper { conveyor, reactor, data_signal, control }
    }
}

impl Task for SendersHelper {
    fn one_step(&mut self) -> bool {
        let handle = Arc::new(TaskHandle::new(self.control.clone()));
        if let Ok(ready) = self.reactor.lock().unwrap().poll(MAX_RESPONSE) {
            for token in ready {
                let fd = token.0 as Descriptor;
                let cleared = self.conveyor.flag_reader(&handle, fd, SENDER_LANE, |flag| {
                    if *flag == DATA_PENDING {
                        *flag = NO_TRANSFER_FLAG;
                        true
                    } else {
                        false
                    }
                });
                if cleared {
                    self.data_signal.notify_one_waiter(SENDER_LANE);
                }
            }
        }
        !self.control.is_stopped()
    }
}

/// What lane-1 does with a committed chunk: either a size-only record
/// (server side) or feeding the PostgreSQL frame decoder (client side).
pub enum LogSink {
    SizeOnly,
    Decoded(Arc<DecoderTable>),
}

pub struct Logger {
    conveyor: Arc<Conveyor>,
    data_signal: Arc<SignalPack>,
    side: crate::conveyor::Side,
    control: Arc<TaskControl>,
    sink: LogSink,
    out: Mutex<std::fs::File>,
    start: std::time::Instant,
}

impl Logger {
    pub fn new(conveyor: Arc<Conveyor>, data_signal: Arc<SignalPack>, side: crate::conveyor::Side, control: Arc<TaskControl>, sink: LogSink, out: std::fs::File) -> Self {
        Logger { conveyor, data_signal, side, control, sink, out: Mutex::new(out), start: std::time::Instant::now() }
    }

    fn time_stamp(&self) -> String {
        let elapsed = self.start.elapsed();
        let ms = elapsed.as_millis() as u64;
        let (secs, ms) = (ms / 1000, ms % 1000);
        let (mins, secs) = (secs / 60, secs % 60);
        let (hours, mins) = (mins / 60, mins % 60);
        let (days, hours) = (hours / 24, hours % 24);
        format!("{days}d{hours}h{mins}m{secs}s{ms}ms")
    }
}

impl Task for Logger {
    /// Writes the transcript header once, before the first record: a
    /// wall-clock "logging started" stamp bracketed by dashed rules,
    /// same shape the original `logger_t::on_start` wrote.
    fn on_start(&mut self) -> bool {
        let banner_message = match &self.sink {
            LogSink::SizeOnly => "! This is server side logging, for SQL queries see clients side !\n",
            LogSink::Decoded(_) => "",
        };
        let mut out = self.out.lock().unwrap();
        let _ = writeln!(out, "-----------------------");
        let _ = write!(out, "{banner_message}");
        let _ = writeln!(out, "    logging started");
        let _ = writeln!(out, "{}", chrono::Local::now().format("%c %Z"));
        let _ = writeln!(out, "-----------------------");
        true
    }

    fn one_step(&mut self) -> bool {
        let handle = Arc::new(TaskHandle::new(self.control.clone()));
        let processed = self.conveyor.read(
            &handle,
            self.side,
            LOGGER_LANE,
            |f| f == NO_TRANSFER_FLAG,
            |dsc, sock, mut wrapper, _flag| {
                let sz = wrapper.size();
                let preamble = format!("({}) {} : ", self.time_stamp(), dsc);
                match &self.sink {
                    LogSink::SizeOnly => {
                        let mut out = self.out.lock().unwrap();
                        use std::io::Write as _;
                        let _ = writeln!(out, "{preamble}{sz} bytes transferred");
                    }
                    LogSink::Decoded(table) => {
                        let mut out = self.out.lock().unwrap();
                        let _ = table.add_data(sock, wrapper.data(), &preamble, &mut *out);
                    }
                }
                wrapper.adjust_pos(sz);
                sz
            },
            |_| {},
        );
        if processed > 0 {
            return true;
        }
        self.data_signal.wait(LOGGER_LANE, MAX_RESPONSE, || self.control.is_stopped())
    }
}

/// 10Hz sweep: drops dead peers, unsticks a starved producer by forcing
/// the resource waiter open, and resumes paused consumers once memory
/// recovers past `cache_size / 15` free pages.
pub struct Supervisor {
    conveyor: Arc<Conveyor>,
    decoder_table: Arc<DecoderTable>,
    consumer_controls: Vec<Arc<TaskControl>>,
    producer_handles: Vec<Arc<TaskHandle>>,
    waiter: Arc<ResourceWaiter>,
    pager: Arc<crate::pager::Pager>,
    control: Arc<TaskControl>,
    drop_random_peer_on_exhaustion: bool,
    starved_streak: u32,
}

/// Consecutive starved ticks (at [`crate::consts::SUPERVISOR_PERIOD`]
/// each) before the last-resort eviction kicks in, giving
/// `release_tasks` a fair chance to work first.
const STARVATION_EVICTION_THRESHOLD: u32 = 10;

impl Supervisor {
    pub fn new(
        conveyor: Arc<Conveyor>,
        decoder_table: Arc<DecoderTable>,
        consumer_controls: Vec<Arc<TaskControl>>,
        producer_handles: Vec<Arc<TaskHandle>>,
        waiter: Arc<ResourceWaiter>,
        pager: Arc<crate::pager::Pager>,
        control: Arc<TaskControl>,
        drop_random_peer_on_exhaustion: bool,
    ) -> Self {
        Supervisor { conveyor, decoder_table, consumer_controls, producer_handles, waiter, pager, control, drop_random_peer_on_exhaustion, starved_streak: 0 }
    }
}

impl Task for Supervisor {
    fn one_step(&mut self) -> bool {
        let table = self.decoder_table.clone();
        self.conveyor.drop_peers(
            |f| f == DESCRIPTOR_SHUTDOWN || f == DESCRIPTOR_ERROR || f == OPERATIONAL_ERROR,
            |_| {},
            move |client_fd, _server_fd| table.clear_from(client_fd),
        );

        let producer_blocked = self.producer_handles.iter().any(|h| h.is_blocked_on_memory());
        if producer_blocked {
            self.waiter.release_tasks();
            self.starved_streak += 1;
            if self.drop_random_peer_on_exhaustion && self.starved_streak >= STARVATION_EVICTION_THRESHOLD {
                if let Some(victim) = self.conveyor.any_descriptor() {
                    let table = self.decoder_table.clone();
                    self.conveyor.drop_peer(victim, |_| {}, move |client_fd, _server_fd| table.clear_from(client_fd));
                }
                self.starved_streak = 0;
            }
        } else {
            self.starved_streak = 0;
            let consumers_paused = self.consumer_controls.iter().any(|c| c.is_paused());
            if consumers_paused && self.pager.cache_size() / 15 < self.pager.pages_available() {
                for ctrl in &self.consumer_controls {
                    ctrl.resume();
                }
            }
        }
        std::thread::sleep(crate::consts::SUPERVISOR_PERIOD);
        !self.control.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{conveyor::Side, pager::Pager};

    #[test]
    fn signal_pack_notify_n_reaches_every_lane() {
        let pack = Arc::new(SignalPack::new(2));
        let p0 = pack.clone();
        let p1 = pack.clone();
        let h0 = std::thread::spawn(move || p0.wait(0, Duration::from_secs(5), || false));
        let h1 = std::thread::spawn(move || p1.wait(1, Duration::from_secs(5), || false));
        std::thread::sleep(Duration::from_millis(20));
        pack.notify_n(1);
        assert!(h0.join().unwrap());
        assert!(h1.join().unwrap());
    }

    #[test]
    fn supervisor_resumes_consumers_once_memory_recovers() {
        let waiter = Arc::new(ResourceWaiter::new(1));
        let pager = Pager::new(waiter.clone(), 64, 32, true);
        let conveyor = Arc::new(Conveyor::new(2, pager.clone()));
        let table = Arc::new(DecoderTable::new());
        let consumer = TaskControl::new();
        consumer.pause();
        let control = TaskControl::new();
        let mut supervisor = Supervisor::new(conveyor, table, vec![consumer.clone()], vec![], waiter, pager, control, false);
        supervisor.one_step();
        assert!(!consumer.is_paused());
    }

    #[test]
    fn side_enum_selects_correct_line() {
        assert_ne!(Side::Client, Side::Server);
    }

    #[test]
    fn supervisor_evicts_a_peer_after_sustained_starvation_when_enabled() {
        let waiter = Arc::new(ResourceWaiter::new(1));
        let pager = Pager::new(waiter.clone(), 64, 32, true);
        let conveyor = Arc::new(Conveyor::new(2, pager.clone()));
        conveyor.add_peer("stuck", 11, 12);
        let table = Arc::new(DecoderTable::new());
        let control = TaskControl::new();
        let producer_control = TaskControl::new();
        let producer = Arc::new(TaskHandle::new(producer_control));
        let _guard = producer.block_on_memory();
        let mut supervisor =
            Supervisor::new(conveyor.clone(), table, vec![], vec![producer.clone()], waiter, pager, control, true);
        for _ in 0..STARVATION_EVICTION_THRESHOLD {
            supervisor.one_step();
        }
        assert_eq!(conveyor.peers_count(), 0);
    }
}
