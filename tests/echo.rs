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

//! End-to-end: a real `Proxy` in front of a loopback echo backend.

use std::{
    fs,
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread,
    time::Duration,
};

use libproxy::{config::ProxyConfig, proxy::Proxy};
use ntest::timeout;

fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Accepts one connection and echoes whatever it reads back verbatim.
fn spawn_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut buf = [0u8; 4096];
            while let Ok(n) = stream.read(&mut buf) {
                if n == 0 || stream.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    });
    addr
}

fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr) {
            return stream;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("proxy never started accepting at {addr}");
}

#[test]
#[timeout(30000)]
fn echo_through_logs_byte_counts_on_both_sides() {
    let backend_addr = spawn_echo_backend();
    let listen_addr = free_addr();
    let log_dir = tempfile::tempdir().unwrap();

    let cfg = ProxyConfig {
        listen_addr,
        backend_addr,
        page_size: 4096,
        cache_size: 64,
        lane_cnt: 2,
        threading_level: 1,
        log_dir: log_dir.path().to_path_buf(),
        drop_random_peer_on_exhaustion: false,
    };
    let proxy = Arc::new(Proxy::new(cfg).unwrap());
    proxy.start().unwrap();

    // A real simple-query frame ('Q' SELECT 1;) rather than arbitrary
    // bytes, so the client-side decoding logger has something valid to
    // decode instead of tripping its out-of-sync path.
    let query: [u8; 15] = [0x51, 0x00, 0x00, 0x00, 0x0E, b'S', b'E', b'L', b'E', b'C', b'T', b' ', b'1', b';', 0x00];

    let mut client = connect_with_retry(listen_addr);
    client.write_all(&query).unwrap();
    let mut reply = [0u8; 15];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, query);
    drop(client);

    // Give the loggers a moment to pick the chunk up off their lane.
    thread::sleep(Duration::from_millis(300));
    proxy.stop();

    let client_log = fs::read_to_string(log_dir.path().join("from_clients_0.log")).unwrap();
    assert!(client_log.contains("[simple query]  SELECT 1;"), "client log was: {client_log}");

    let server_log = fs::read_to_string(log_dir.path().join("to_clients_0.log")).unwrap();
    assert!(server_log.contains("15 bytes transferred"), "server log was: {server_log}");
}
