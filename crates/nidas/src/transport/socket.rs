// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! [`Socket`]: a TCP [`IOChannel`] with configured keep-alive (§4.5),
//! carrying `hdds::transport::tcp::connection::ConnectionState`'s state
//! machine shape over from RTPS connection management to NIDAS's simpler
//! single-stream-per-socket model.

use std::io::{self, Read as _, Write as _};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};

use super::iochannel::{ConnectionRequester, IOChannel};

/// Connection state machine shared by [`Socket`] and the framed stream
/// wrapper around it (§4.5 Reconnection).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_operational(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Keep-alive tuning applied to the underlying socket (§4.5: "a TCP stream
/// with a configured keep-alive").
#[derive(Debug, Clone, Copy)]
pub struct SocketConfig {
    pub keepalive_time: Duration,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            keepalive_time: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A TCP-backed [`IOChannel`]. Constructed either from an already-accepted
/// stream (server side) or by dialing a peer address (client side).
pub struct Socket {
    stream: Option<TcpStream>,
    remote_addr: SocketAddr,
    config: SocketConfig,
    state: ConnectionState,
    state_changed_at: Instant,
}

impl Socket {
    /// Wraps an already-connected stream (e.g. from `TcpListener::accept`).
    pub fn from_accepted(stream: TcpStream, config: SocketConfig) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        Self::apply_keepalive(&stream, &config)?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: Some(stream),
            remote_addr,
            config,
            state: ConnectionState::Connected,
            state_changed_at: Instant::now(),
        })
    }

    /// Prepares a channel that dials `remote_addr` on
    /// [`IOChannel::request_connection`].
    pub fn dial(remote_addr: SocketAddr, config: SocketConfig) -> Self {
        Self {
            stream: None,
            remote_addr,
            config,
            state: ConnectionState::Idle,
            state_changed_at: Instant::now(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    fn apply_keepalive(stream: &TcpStream, config: &SocketConfig) -> io::Result<()> {
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_time)
            .with_interval(config.keepalive_interval);
        sock_ref.set_tcp_keepalive(&keepalive)
    }
}

impl IOChannel for Socket {
    fn request_connection(&mut self, requester: &dyn ConnectionRequester) -> io::Result<()> {
        if self.stream.is_some() {
            requester.connected();
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);
        match TcpStream::connect_timeout(&self.remote_addr, self.config.connect_timeout) {
            Ok(stream) => {
                Self::apply_keepalive(&stream, &self.config)?;
                stream.set_nonblocking(true)?;
                self.stream = Some(stream);
                self.set_state(ConnectionState::Connected);
                requester.connected();
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                Err(e)
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not connected"))?;
        match stream.read(buf) {
            Ok(0) => {
                self.set_state(ConnectionState::Reconnecting);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.set_state(ConnectionState::Reconnecting);
                Err(e)
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not connected"))?;
        match stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.set_state(ConnectionState::Reconnecting);
                Err(e)
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.set_state(ConnectionState::Closing);
        if let Some(stream) = self.stream.take() {
            stream.shutdown(std::net::Shutdown::Both).ok();
        }
        self.set_state(ConnectionState::Closed);
        Ok(())
    }

    fn name(&self) -> String {
        format!("socket://{}", self.remote_addr)
    }

    fn clone_channel(&self) -> Box<dyn IOChannel> {
        Box::new(Socket::dial(self.remote_addr, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    struct NoopRequester;
    impl ConnectionRequester for NoopRequester {}

    #[test]
    fn dial_and_accept_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client_thread = std::thread::spawn(move || {
            let mut client = Socket::dial(addr, SocketConfig::default());
            client.request_connection(&NoopRequester).unwrap();
            assert_eq!(client.state(), ConnectionState::Connected);
            client.write(b"hello").unwrap();
            client
        });

        let (accepted, _) = listener.accept().unwrap();
        let mut server = Socket::from_accepted(accepted, SocketConfig::default()).unwrap();
        assert_eq!(server.state(), ConnectionState::Connected);

        let mut buf = [0u8; 16];
        let mut total = 0;
        for _ in 0..100 {
            match server.read(&mut buf[total..]) {
                Ok(0) => std::thread::sleep(Duration::from_millis(5)),
                Ok(n) => {
                    total += n;
                    if total >= 5 {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        assert_eq!(&buf[..5], b"hello");
        client_thread.join().unwrap();
    }

    #[test]
    fn read_without_connecting_errors() {
        let mut socket = Socket::dial("127.0.0.1:1".parse().unwrap(), SocketConfig::default());
        let mut buf = [0u8; 4];
        assert!(socket.read(&mut buf).is_err());
    }
}
