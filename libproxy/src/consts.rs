// Copyright 2023 Google LLC
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

use std::time;

/// Longest any single blocking wait (readiness poll, resource wait, data
/// signal wait, paused-task wait) is allowed to run before it re-checks
/// the owning task's stop flag.
pub const MAX_RESPONSE: time::Duration = time::Duration::from_millis(500);

/// Size of a single page handed out by the pager.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages the pager keeps in its free list (32 MiB default).
pub const CACHE_SIZE: usize = 8192;

/// Lanes per transfer line: lane 0 is the sender, lane 1 is the logger.
pub const LANE_COUNT: usize = 2;

/// Upper bound on bytes moved through a single line in one write/read pass.
pub const ONE_TIME_MAX: usize = 65536;

/// Scratch buffer size a receiver reads into before handing bytes to the
/// conveyor.
pub const RECV_BUF_SIZE: usize = 8192;

/// Largest protocol message the logger will buffer before giving up on it.
pub const MAX_DATA_SIZE: usize = 1024 * 1024;

/// Supervisor tick rate.
pub const SUPERVISOR_PERIOD: time::Duration = time::Duration::from_millis(100);

/// Default listening port when none is given on the command line.
pub const DEFAULT_LISTEN_PORT: u16 = 54321;

/// Default backend host:port when none is given on the command line.
pub const DEFAULT_BACKEND_HOST: &str = "127.0.0.1";
pub const DEFAULT_BACKEND_PORT: u16 = 5432;

/// Directory (relative to the working directory) transcripts are written
/// under when `--log-file` does not override it.
pub const DEFAULT_LOG_DIR: &str = "logs";
