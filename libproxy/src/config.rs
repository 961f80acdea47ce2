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

use std::{
    fs,
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::{consts, Args};

/// Fully resolved configuration the proxy runs with. Built by layering
/// [`FileConfig`] over [`ProxyConfig::default`] and then CLI flags over
/// that, matching the precedence `config::read_config` uses elsewhere in
/// this codebase.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub backend_addr: SocketAddr,
    pub page_size: usize,
    pub cache_size: usize,
    pub lane_cnt: usize,
    pub threading_level: usize,
    pub log_dir: PathBuf,
    /// Whether the supervisor may drop an arbitrary peer as a last resort
    /// when every page is outstanding and releasing the resource waiter
    /// alone didn't free any. Off by default; the source this was ported
    /// from left the equivalent branch commented out.
    pub drop_random_peer_on_exhaustion: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], consts::DEFAULT_LISTEN_PORT)),
            backend_addr: SocketAddr::from((
                consts::DEFAULT_BACKEND_HOST.parse::<std::net::IpAddr>().expect("valid default backend host"),
                consts::DEFAULT_BACKEND_PORT,
            )),
            page_size: consts::PAGE_SIZE,
            cache_size: consts::CACHE_SIZE,
            lane_cnt: consts::LANE_COUNT,
            threading_level: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            log_dir: PathBuf::from(consts::DEFAULT_LOG_DIR),
            drop_random_peer_on_exhaustion: false,
        }
    }
}

/// The optional-everything shape a TOML config file may declare. Only
/// fields actually present in the file override the default; everything
/// else is left untouched by [`ProxyConfig::load`].
#[derive(Deserialize, Default, Debug, Clone)]
pub struct FileConfig {
    pub listen_port: Option<u16>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub page_size: Option<usize>,
    pub cache_size: Option<usize>,
    pub lane_cnt: Option<usize>,
    pub threading_level: Option<usize>,
    pub log_dir: Option<PathBuf>,
    pub drop_random_peer_on_exhaustion: Option<bool>,
}

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<FileConfig> {
    match config_file {
        Some(path) => {
            info!("parsing explicitly passed in config ({})", path);
            let raw = fs::read_to_string(path).context("reading config toml")?;
            toml::from_str(&raw).context("parsing config file")
        }
        None => Ok(FileConfig::default()),
    }
}

impl ProxyConfig {
    /// Layers built-in defaults, an optional TOML file, then CLI flags,
    /// in that order of increasing precedence.
    pub fn load(args: &Args) -> anyhow::Result<ProxyConfig> {
        let mut cfg = ProxyConfig::default();
        let file = read_config(&args.config_file)?;

        let mut listen_port = file.listen_port.unwrap_or(consts::DEFAULT_LISTEN_PORT);
        let mut server_host = file.server_host.unwrap_or_else(|| consts::DEFAULT_BACKEND_HOST.to_string());
        let mut server_port = file.server_port.unwrap_or(consts::DEFAULT_BACKEND_PORT);
        if let Some(v) = file.page_size {
            cfg.page_size = v;
        }
        if let Some(v) = file.cache_size {
            cfg.cache_size = v;
        }
        if let Some(v) = file.lane_cnt {
            cfg.lane_cnt = v;
        }
        if let Some(v) = file.threading_level {
            cfg.threading_level = v;
        }
        if let Some(v) = file.log_dir {
            cfg.log_dir = v;
        }
        if let Some(v) = file.drop_random_peer_on_exhaustion {
            cfg.drop_random_peer_on_exhaustion = v;
        }

        if let Some(p) = args.port {
            listen_port = p;
        }
        if let Some(h) = args.server_host.clone() {
            server_host = h;
        }
        if let Some(p) = args.server_port {
            server_port = p;
        }
        if let Some(path) = args.log_dir.clone() {
            cfg.log_dir = PathBuf::from(path);
        }

        cfg.listen_addr = SocketAddr::from(([0, 0, 0, 0], listen_port));
        cfg.backend_addr = (server_host.as_str(), server_port)
            .to_socket_addrs()
            .with_context(|| format!("resolving backend address {}:{}", server_host, server_port))?
            .next()
            .with_context(|| format!("no addresses found for {}:{}", server_host, server_port))?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn defaults_have_expected_ports() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.listen_addr.port(), consts::DEFAULT_LISTEN_PORT);
        assert_eq!(cfg.backend_addr.port(), consts::DEFAULT_BACKEND_PORT);
    }

    #[test]
    #[timeout(30000)]
    fn file_config_parses() -> anyhow::Result<()> {
        let cases = vec![
            r#"listen_port = 6000"#,
            r#"
            server_host = "db.internal"
            server_port = 6543
            "#,
            r#"drop_random_peer_on_exhaustion = true"#,
        ];
        for case in cases {
            let _: FileConfig = toml::from_str(case)?;
        }
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn cli_overrides_file_overrides_default() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("proxy.toml");
        fs::write(&path, "listen_port = 7000\nserver_port = 7001\n")?;

        let args = Args {
            log_file: None,
            log_dir: None,
            verbose: 0,
            config_file: Some(path.to_string_lossy().into_owned()),
            port: Some(8000),
            server_host: None,
            server_port: None,
            version: false,
        };
        let cfg = ProxyConfig::load(&args)?;
        assert_eq!(cfg.listen_addr.port(), 8000);
        assert_eq!(cfg.backend_addr.port(), 7001);
        Ok(())
    }
}
