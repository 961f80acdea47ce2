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

//! The top-level orchestrator. Owns every long-lived piece of shared
//! state (conveyor, pager, resource waiter, per-side signal packs, the
//! five reactors) and, on `start()`, builds and spawns the whole worker
//! fleet on top of them. `stop()` tears the fleet down and resets
//! everything back to a clean slate so the same `Proxy` can be started
//! again.

use std::{
    fs::{self, OpenOptions},
    net::TcpListener as StdTcpListener,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::Context;
use mio::{net::TcpListener, Interest, Token};
use tracing::{info, instrument, warn};

use pgproto::DecoderTable;

use crate::{
    config::ProxyConfig,
    conveyor::{Conveyor, Side},
    pager::Pager,
    reactor::Reactor,
    task::{Task, TaskControl, TaskHandle, TaskRunner},
    waiter::ResourceWaiter,
    workers::{Connector, LogSink, Logger, Receiver, Sender, SendersHelper, SignalPack, Supervisor},
};

pub struct Proxy {
    config: ProxyConfig,

    conveyor: Arc<Conveyor>,
    pager: Arc<Pager>,
    waiter: Arc<ResourceWaiter>,
    decoder_table: Arc<DecoderTable>,
    client_data_signal: Arc<SignalPack>,
    server_data_signal: Arc<SignalPack>,

    supervisor_control: Arc<TaskControl>,
    connector_control: Arc<TaskControl>,
    client_receiver_control: Arc<TaskControl>,
    server_receiver_control: Arc<TaskControl>,
    client_sender_control: Arc<TaskControl>,
    server_sender_control: Arc<TaskControl>,
    client_logger_control: Arc<TaskControl>,
    server_logger_control: Arc<TaskControl>,

    connector_reactor: Arc<Mutex<Reactor>>,
    client_receivers_reactor: Arc<Mutex<Reactor>>,
    server_receivers_reactor: Arc<Mutex<Reactor>>,
    client_senders_reactor: Arc<Mutex<Reactor>>,
    server_senders_reactor: Arc<Mutex<Reactor>>,

    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Spawns `task` on its own thread under `control`, without needing the
/// task's handle afterwards (connector, receivers, senders-helpers,
/// supervisor).
fn spawn_task<T: Task + Send + 'static>(control: Arc<TaskControl>, task: T) -> JoinHandle<()> {
    let mut runner = TaskRunner::new(control, task);
    thread::spawn(move || runner.run())
}

/// Same as [`spawn_task`], but also hands back the running task's
/// handle, for the two roles (senders, loggers) the supervisor watches
/// for a blocked-on-memory utility flag.
fn spawn_task_with_handle<T: Task + Send + 'static>(control: Arc<TaskControl>, task: T) -> (JoinHandle<()>, Arc<TaskHandle>) {
    let mut runner = TaskRunner::new(control, task);
    let handle = runner.handle.clone();
    (thread::spawn(move || runner.run()), handle)
}

impl Proxy {
    #[instrument(skip_all)]
    pub fn new(config: ProxyConfig) -> anyhow::Result<Self> {
        let threading_level = config.threading_level.max(1);

        let connector_control = TaskControl::new();
        let client_receiver_control = TaskControl::new();
        let server_receiver_control = TaskControl::new();
        let client_sender_control = TaskControl::new();
        let server_sender_control = TaskControl::new();
        let client_logger_control = TaskControl::new();
        let server_logger_control = TaskControl::new();
        let supervisor_control = TaskControl::new();

        // The three controls that demand fresh pages: the connector
        // (registering a new peer doesn't itself take a page, but shares
        // a control with the accept loop that feeds the receivers) and
        // both receiver pools. Paused the instant a sender or logger
        // reports it's stuck waiting on the resource waiter, so a
        // starved consumer doesn't keep piling more data into an
        // already-exhausted cache.
        let pausable_on_exhaustion = vec![connector_control.clone(), client_receiver_control.clone(), server_receiver_control.clone()];
        let waiter = Arc::new(ResourceWaiter::new((config.cache_size / 5) as i64).with_on_block(move || {
            for ctrl in &pausable_on_exhaustion {
                ctrl.pause();
            }
        }));
        let pager = Pager::new(waiter.clone(), config.page_size, config.cache_size, true);
        let conveyor = Arc::new(Conveyor::new(config.lane_cnt, pager.clone()));
        let decoder_table = Arc::new(DecoderTable::new());
        let client_data_signal = Arc::new(SignalPack::new(config.lane_cnt));
        let server_data_signal = Arc::new(SignalPack::new(config.lane_cnt));

        fs::create_dir_all(&config.log_dir).with_context(|| format!("creating log directory {}", config.log_dir.display()))?;

        let connector_reactor = Arc::new(Mutex::new(Reactor::new(1)?));
        let client_receivers_reactor = Arc::new(Mutex::new(Reactor::new(threading_level * 2)?));
        let server_receivers_reactor = Arc::new(Mutex::new(Reactor::new(threading_level * 2)?));
        let client_senders_reactor = Arc::new(Mutex::new(Reactor::new(threading_level * 2)?));
        let server_senders_reactor = Arc::new(Mutex::new(Reactor::new(threading_level * 2)?));

        Ok(Proxy {
            config,
            conveyor,
            pager,
            waiter,
            decoder_table,
            client_data_signal,
            server_data_signal,
            supervisor_control,
            connector_control,
            client_receiver_control,
            server_receiver_control,
            client_sender_control,
            server_sender_control,
            client_logger_control,
            server_logger_control,
            connector_reactor,
            client_receivers_reactor,
            server_receivers_reactor,
            client_senders_reactor,
            server_senders_reactor,
            threads: Mutex::new(Vec::new()),
        })
    }

    fn all_controls(&self) -> [&Arc<TaskControl>; 8] {
        [
            &self.supervisor_control,
            &self.connector_control,
            &self.client_receiver_control,
            &self.server_receiver_control,
            &self.client_sender_control,
            &self.server_sender_control,
            &self.client_logger_control,
            &self.server_logger_control,
        ]
    }

    /// Binds the listening socket and spawns the whole worker fleet:
    /// one connector, `threading_level` each of client/server receivers
    /// and senders, a senders-helper per side, `threading_level` each of
    /// client/server loggers, and one supervisor — `6 * threading_level
    /// + 4` threads in total. The connector stays a singleton regardless
    /// of `threading_level`: it owns the listening socket outright
    /// rather than sharing it behind a lock, so there is nothing for a
    /// second instance to multiplex over.
    #[instrument(skip_all)]
    pub fn start(&self) -> anyhow::Result<()> {
        let mut threads = self.threads.lock().unwrap();
        if !threads.is_empty() || self.conveyor.peers_count() > 0 {
            anyhow::bail!("proxy is already running");
        }

        info!("starting proxy...");
        info!("memory cache: {} bytes", self.pager.page_size() * self.pager.cache_size());
        let tl = self.config.threading_level.max(1);
        info!(
            "threading level: {tl} client receivers + {tl} server receivers + {tl} client senders + \
             {tl} server senders + {tl} client loggers + {tl} server loggers + 1 connector"
        );

        let std_listener = StdTcpListener::bind(self.config.listen_addr)
            .with_context(|| format!("binding listen address {}", self.config.listen_addr))?;
        std_listener.set_nonblocking(true).context("setting listener non-blocking")?;
        let mut listener = TcpListener::from_std(std_listener);
        self.connector_reactor
            .lock()
            .unwrap()
            .register(&mut listener, Token(0), Interest::READABLE)
            .context("registering listening socket")?;

        let mut handles = Vec::with_capacity(tl * 6 + 4);

        let connector = Connector::new(
            listener,
            self.config.backend_addr,
            self.connector_reactor.clone(),
            self.client_receivers_reactor.clone(),
            self.server_receivers_reactor.clone(),
            self.client_senders_reactor.clone(),
            self.server_senders_reactor.clone(),
            self.conveyor.clone(),
            self.connector_control.clone(),
        );
        handles.push(spawn_task(self.connector_control.clone(), connector));

        for _ in 0..tl {
            let receiver = Receiver::new(
                self.conveyor.clone(),
                self.client_receivers_reactor.clone(),
                self.client_data_signal.clone(),
                Side::Client,
                self.client_receiver_control.clone(),
            );
            handles.push(spawn_task(self.client_receiver_control.clone(), receiver));
        }
        for _ in 0..tl {
            let receiver = Receiver::new(
                self.conveyor.clone(),
                self.server_receivers_reactor.clone(),
                self.server_data_signal.clone(),
                Side::Server,
                self.server_receiver_control.clone(),
            );
            handles.push(spawn_task(self.server_receiver_control.clone(), receiver));
        }

        let mut producer_handles = Vec::with_capacity(tl * 4);
        for _ in 0..tl {
            let sender = Sender::new(self.conveyor.clone(), self.client_data_signal.clone(), Side::Client, self.client_sender_control.clone());
            let (handle, task_handle) = spawn_task_with_handle(self.client_sender_control.clone(), sender);
            handles.push(handle);
            producer_handles.push(task_handle);
        }
        for _ in 0..tl {
            let sender = Sender::new(self.conveyor.clone(), self.server_data_signal.clone(), Side::Server, self.server_sender_control.clone());
            let (handle, task_handle) = spawn_task_with_handle(self.server_sender_control.clone(), sender);
            handles.push(handle);
            producer_handles.push(task_handle);
        }

        handles.push(spawn_task(
            self.client_sender_control.clone(),
            SendersHelper::new(self.conveyor.clone(), self.client_senders_reactor.clone(), self.client_data_signal.clone(), self.client_sender_control.clone()),
        ));
        handles.push(spawn_task(
            self.server_sender_control.clone(),
            SendersHelper::new(self.conveyor.clone(), self.server_senders_reactor.clone(), self.server_data_signal.clone(), self.server_sender_control.clone()),
        ));

        for i in 0..tl {
            let path = self.config.log_dir.join(format!("from_clients_{i}.log"));
            let file = OpenOptions::new().create(true).append(true).open(&path).with_context(|| format!("opening log file {}", path.display()))?;
            let logger = Logger::new(
                self.conveyor.clone(),
                self.client_data_signal.clone(),
                Side::Client,
                self.client_logger_control.clone(),
                LogSink::Decoded(self.decoder_table.clone()),
                file,
            );
            let (handle, task_handle) = spawn_task_with_handle(self.client_logger_control.clone(), logger);
            handles.push(handle);
            producer_handles.push(task_handle);
        }
        for i in 0..tl {
            let path = self.config.log_dir.join(format!("to_clients_{i}.log"));
            let file = OpenOptions::new().create(true).append(true).open(&path).with_context(|| format!("opening log file {}", path.display()))?;
            let logger = Logger::new(
                self.conveyor.clone(),
                self.server_data_signal.clone(),
                Side::Server,
                self.server_logger_control.clone(),
                LogSink::SizeOnly,
                file,
            );
            let (handle, task_handle) = spawn_task_with_handle(self.server_logger_control.clone(), logger);
            handles.push(handle);
            producer_handles.push(task_handle);
        }

        let consumer_controls = vec![self.connector_control.clone(), self.client_receiver_control.clone(), self.server_receiver_control.clone()];
        let supervisor = Supervisor::new(
            self.conveyor.clone(),
            self.decoder_table.clone(),
            consumer_controls,
            producer_handles,
            self.waiter.clone(),
            self.pager.clone(),
            self.supervisor_control.clone(),
            self.config.drop_random_peer_on_exhaustion,
        );
        handles.push(spawn_task(self.supervisor_control.clone(), supervisor));

        *threads = handles;
        info!("proxy started");
        Ok(())
    }

    /// Stops every worker, joins all threads, and resets every piece of
    /// shared state back to how `new()` left it. A no-op if the proxy
    /// isn't running. Safe to call again after a prior `start()`.
    #[instrument(skip_all)]
    pub fn stop(&self) {
        let mut threads = self.threads.lock().unwrap();
        if threads.is_empty() {
            return;
        }
        info!("stopping...");
        for ctrl in self.all_controls() {
            ctrl.stop();
        }
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                warn!("a worker thread panicked");
            }
        }
        self.conveyor.clear();
        self.waiter.reset();
        self.pager.reset();
        self.client_data_signal.reset();
        self.server_data_signal.reset();
        self.decoder_table.reset();
        for ctrl in self.all_controls() {
            ctrl.reset();
        }
        info!("proxy stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.threads.lock().unwrap().is_empty()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.stop();
    }
}
