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

//! The interactive command loop `run()` drives from stdin: `s` starts
//! the proxy, a bare `Enter` stops it, `q` quits. Exit codes: `0` on a
//! clean `q`, `1` on EOF (stdin closed from under us, e.g. piped input
//! running dry), `2` if starting or stopping ever surfaces an error.

use std::{
    io::{self, BufRead, Write},
    sync::Arc,
};

use tracing::error;

use crate::proxy::Proxy;

pub fn run(proxy: Arc<Proxy>) -> i32 {
    match run_loop(&proxy) {
        Ok(code) => code,
        Err(err) => {
            error!("{:?}", err);
            2
        }
    }
}

fn run_loop(proxy: &Arc<Proxy>) -> anyhow::Result<i32> {
    let stdin = io::stdin();
    print_prompt();
    let mut line = String::new();
    loop {
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(1);
        }
        match line.trim() {
            "s" => {
                if proxy.is_running() {
                    println!("already running");
                } else {
                    proxy.start()?;
                }
            }
            "q" => return Ok(0),
            "" => proxy.stop(),
            other => println!("unrecognized command: {other:?} (s: start, <enter>: stop, q: quit)"),
        }
        print_prompt();
    }
}

fn print_prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}
