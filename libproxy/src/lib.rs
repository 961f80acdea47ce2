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

use std::{fs, io, sync::Mutex};

use clap::Parser;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod buffer;
pub mod config;
pub mod console;
pub mod consts;
pub mod conveyor;
pub mod pager;
pub mod proxy;
pub mod reactor;
pub mod signal;
pub mod task;
pub mod waiter;
pub mod workers;

pub use config::ProxyConfig;
pub use proxy::Proxy;

/// The command line arguments the proxy expects. Can be directly parsed
/// with clap or manually constructed to present some other interface.
///
/// NOTE: you must check `version` and handle it yourself, clap's
/// automatic version support doesn't play well with a library binary
/// split like this one.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(short, long, action, help = "Print version")]
    pub version: bool,

    #[clap(short, long, action, help = "The port to listen for client connections on")]
    pub port: Option<u16>,

    #[clap(long = "sh", action, help = "The backend server's host name or address")]
    pub server_host: Option<String>,

    #[clap(long = "sp", action, help = "The backend server's port")]
    pub server_port: Option<u16>,

    #[clap(short, long, action, help = "Write diagnostic/operational logs to this file instead of stderr")]
    pub log_file: Option<String>,

    #[clap(
        long = "log-dir",
        action,
        long_help = "The directory to write per-connection transcript logs to

Defaults to a `logs/` directory relative to the current working directory."
    )]
    pub log_dir: Option<String>,

    #[clap(short, long, action = clap::ArgAction::Count, help = "Show more in logs, may be provided multiple times")]
    pub verbose: u8,

    #[clap(short, long, action, help = "A toml file containing configuration")]
    pub config_file: Option<String>,
}

/// Runs the proxy tool with the given arguments: sets up logging, loads
/// the layered configuration, builds the [`Proxy`], and drives the
/// interactive console loop until the user quits or a fatal error
/// propagates out.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    match &args.log_file {
        Some(log_file) => {
            let file = fs::File::create(log_file)?;
            tracing_subscriber::fmt()
                .with_max_level(trace_level)
                .with_thread_ids(true)
                .with_target(false)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(trace_level)
                .with_thread_ids(true)
                .with_target(false)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_writer(io::stderr)
                .init();
        }
    }

    let cfg = match ProxyConfig::load(&args) {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::warn!("{:?}; falling back to defaults for unspecified fields", err);
            ProxyConfig::default()
        }
    };

    let proxy = std::sync::Arc::new(Proxy::new(cfg)?);
    let code = console::run(proxy);
    std::process::exit(code);
}
