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

//! Thin wrapper around `mio::Poll`. One `Reactor` exists per readiness
//! domain — the connector, client receivers, server receivers, client
//! senders and server senders each own one, mirroring the five
//! `epoll_create` calls a hand-rolled epoll wrapper would need. Every
//! `poll` call is bounded by `max_response` so a stopped task's wait
//! never blocks longer than one supervisor tick before re-checking the
//! stop flag.

use std::{io, time::Duration};

use mio::{event::Source, Events, Interest, Poll, Token};

use crate::{consts::MAX_RESPONSE, task::TaskControl};

pub struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    pub fn new(max_events: usize) -> io::Result<Self> {
        Ok(Reactor { poll: Poll::new()?, events: Events::with_capacity(max_events) })
    }

    pub fn register(&self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister(&self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister(&self, source: &mut dyn Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Blocks up to `min(timeout, max_response)`, then returns the
    /// tokens that became ready (empty on a plain timeout). Callers loop
    /// this against their own `TaskControl::tick()` rather than passing
    /// an unbounded timeout, so a stop request is never more than one
    /// `max_response` away from being noticed.
    pub fn poll(&mut self, timeout: Duration) -> io::Result<Vec<Token>> {
        let bounded = timeout.min(MAX_RESPONSE);
        match self.poll.poll(&mut self.events, Some(bounded)) {
            Ok(()) => Ok(self.events.iter().map(|e| e.token()).collect()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Polls repeatedly until at least one token is ready or `control`
    /// signals the task should stop.
    pub fn poll_until_ready_or_stopped(&mut self, control: &TaskControl) -> io::Result<Vec<Token>> {
        loop {
            if control.is_stopped() {
                return Ok(Vec::new());
            }
            let ready = self.poll(MAX_RESPONSE)?;
            if !ready.is_empty() {
                return Ok(ready);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::{TcpListener, TcpStream};
    use std::net::TcpListener as StdListener;

    #[test]
    fn register_and_poll_sees_connectable_socket() {
        let std_listener = StdListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let mut listener = TcpListener::from_std(std_listener);

        let mut reactor = Reactor::new(8).unwrap();
        reactor.register(&mut listener, Token(0), Interest::READABLE).unwrap();

        let _client = TcpStream::connect(addr).unwrap();

        let ready = reactor.poll(Duration::from_secs(2)).unwrap();
        assert!(ready.contains(&Token(0)));
    }

    #[test]
    fn poll_until_ready_or_stopped_returns_immediately_when_already_stopped() {
        let control = TaskControl::new();
        control.stop();
        let mut reactor = Reactor::new(4).unwrap();
        let ready = reactor.poll_until_ready_or_stopped(&control).unwrap();
        assert!(ready.is_empty());
    }
}
