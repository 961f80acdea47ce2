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
/// proxy is an intercepting TCP proxy for the PostgreSQL wire protocol.
/// It relays client/server traffic unchanged while logging a decoded
/// transcript of the frontend messages that pass through it.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libproxy::Args::parse();

    if args.version {
        println!("proxy {}", VERSION);
        return Ok(());
    }

    libproxy::run(args)
}
