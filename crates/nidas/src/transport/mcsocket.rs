// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Multicast rendezvous discovery (§4.5/§6): a pair (requester, accepter)
//! that exchange one UDP datagram to agree on a direct TCP connection,
//! giving zero-configuration discovery between a DSM and the server.
//! Multicast group join is grounded on
//! `hdds::transport::multicast::join_multicast_group`; the datagram
//! exchange and resulting handoff to a TCP socket are grounded on
//! `original_source/dsm/class/McSocketRequesterOutput.h` and
//! `McSocketAccepterOutput.h`, with the wire shape of the datagram taken
//! from `hdds::discovery_server::protocol`'s length-prefixed message
//! convention adapted to §6's fixed 10-byte layout.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};

use super::iochannel::{ConnectionRequester, IOChannel};
use super::socket::{Socket, SocketConfig};

/// Rendezvous datagram (§6): `{ listen_port: u16 BE, pseudo_port: u32 BE,
/// num_multicasts: u32 BE }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousDatagram {
    pub listen_port: u16,
    pub pseudo_port: u32,
    pub num_multicasts: u32,
}

const DATAGRAM_LEN: usize = 2 + 4 + 4;

impl RendezvousDatagram {
    pub fn encode(&self) -> [u8; DATAGRAM_LEN] {
        let mut buf = [0u8; DATAGRAM_LEN];
        BigEndian::write_u16(&mut buf[0..2], self.listen_port);
        BigEndian::write_u32(&mut buf[2..6], self.pseudo_port);
        BigEndian::write_u32(&mut buf[6..10], self.num_multicasts);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < DATAGRAM_LEN {
            return None;
        }
        Some(Self {
            listen_port: BigEndian::read_u16(&buf[0..2]),
            pseudo_port: BigEndian::read_u32(&buf[2..6]),
            num_multicasts: BigEndian::read_u32(&buf[6..10]),
        })
    }
}

fn bind_multicast_socket(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

/// Requester half: opens a TCP listen socket of its own, then advertises it
/// over multicast at 1 Hz until an accepter dials in (§4.5 step 2).
pub struct McSocketRequester {
    group: Ipv4Addr,
    rendezvous_port: u16,
    pseudo_port: u32,
    retransmit_interval: Duration,
}

impl McSocketRequester {
    pub fn new(group: Ipv4Addr, rendezvous_port: u16, pseudo_port: u32) -> Self {
        Self {
            group,
            rendezvous_port,
            pseudo_port,
            retransmit_interval: Duration::from_secs(1),
        }
    }

    /// Binds a listen socket, advertises it over the multicast group at 1
    /// Hz, and blocks until an accepter dials in or `cancel` is observed.
    /// Retransmits indefinitely until cancelled (§4.5 Retries).
    pub fn rendezvous(&self, cancel: &AtomicBool) -> io::Result<TcpStream> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        listener.set_nonblocking(true)?;
        let listen_port = listener.local_addr()?.port();

        let datagram = RendezvousDatagram {
            listen_port,
            pseudo_port: self.pseudo_port,
            num_multicasts: 1,
        };
        let encoded = datagram.encode();

        let sender = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        sender.set_multicast_ttl_v4(8)?;
        let dest: SocketAddr = (self.group, self.rendezvous_port).into();

        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "rendezvous cancelled"));
            }
            sender.send_to(&encoded, dest)?;

            match listener.accept() {
                Ok((stream, _)) => return Ok(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(self.retransmit_interval);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Accepter half: joins the multicast group, waits for a requester's
/// datagram, then dials the advertised listen port directly (§4.5 step 3).
/// Duplicate datagrams after the first successful connect are accepted and
/// closed immediately (§4.5: "duplicate responses are accepted and then
/// closed by the accepter").
pub struct McSocketAccepter {
    group: Ipv4Addr,
    rendezvous_port: u16,
}

impl McSocketAccepter {
    pub fn new(group: Ipv4Addr, rendezvous_port: u16) -> Self {
        Self {
            group,
            rendezvous_port,
        }
    }

    pub fn rendezvous(&self, cancel: &AtomicBool) -> io::Result<TcpStream> {
        let socket = bind_multicast_socket(self.group, self.rendezvous_port)?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        let mut buf = [0u8; 64];
        let primary = loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "rendezvous cancelled"));
            }
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let Some(datagram) = RendezvousDatagram::decode(&buf[..n]) else {
                        continue;
                    };
                    let requester_addr: SocketAddr = (from.ip(), datagram.listen_port).into();
                    break TcpStream::connect(requester_addr)?;
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => return Err(e),
            }
        };

        self.drain_duplicates(&socket, &mut buf);
        Ok(primary)
    }

    /// After the primary connection is established, a requester may still
    /// retransmit its datagram once more before it notices the TCP
    /// connection come up; any resulting duplicate connection is accepted
    /// and immediately closed (§4.5: "duplicate responses are accepted and
    /// then closed by the accepter").
    fn drain_duplicates(&self, socket: &UdpSocket, buf: &mut [u8]) {
        let deadline = Instant::now() + Duration::from_millis(750);
        if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(100))) {
            log::warn!("failed to lower rendezvous read timeout while draining duplicates: {e}");
            return;
        }
        while Instant::now() < deadline {
            match socket.recv_from(buf) {
                Ok((n, from)) => {
                    let Some(datagram) = RendezvousDatagram::decode(&buf[..n]) else {
                        continue;
                    };
                    let requester_addr: SocketAddr = (from.ip(), datagram.listen_port).into();
                    if let Ok(dup) = TcpStream::connect(requester_addr) {
                        let _ = dup.shutdown(std::net::Shutdown::Both);
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
                Err(_) => break,
            }
        }
    }
}

/// Which half of the rendezvous protocol a [`McSocket`] re-runs when it has
/// no live connection yet (needed so [`IOChannel::clone_channel`] can hand
/// back a channel able to reconnect on its own, not just a dangling socket).
#[derive(Debug, Clone, Copy)]
pub enum McSocketRole {
    Requester { pseudo_port: u32 },
    Accepter,
}

/// [`IOChannel`] produced by a multicast rendezvous (§4.5 step 2/3): once
/// connected it behaves exactly like [`Socket`], just discovered via
/// multicast instead of a configured address. Retains enough state (group,
/// port, role, keep-alive config) to re-run the rendezvous from scratch if
/// the connection drops and the stream asks for a fresh channel.
pub struct McSocket {
    group: Ipv4Addr,
    rendezvous_port: u16,
    role: McSocketRole,
    config: SocketConfig,
    inner: Option<Socket>,
}

impl McSocket {
    /// Wraps a stream a rendezvous has already produced.
    pub fn from_stream(
        stream: TcpStream,
        group: Ipv4Addr,
        rendezvous_port: u16,
        role: McSocketRole,
        config: SocketConfig,
    ) -> io::Result<Self> {
        Ok(Self {
            group,
            rendezvous_port,
            role,
            config,
            inner: Some(Socket::from_accepted(stream, config)?),
        })
    }

    /// Builds a channel with no live connection; its first
    /// `request_connection` call performs the rendezvous itself.
    pub fn pending(group: Ipv4Addr, rendezvous_port: u16, role: McSocketRole, config: SocketConfig) -> Self {
        Self {
            group,
            rendezvous_port,
            role,
            config,
            inner: None,
        }
    }

    fn rendezvous(&self, cancel: &AtomicBool) -> io::Result<TcpStream> {
        match self.role {
            McSocketRole::Requester { pseudo_port } => {
                McSocketRequester::new(self.group, self.rendezvous_port, pseudo_port).rendezvous(cancel)
            }
            McSocketRole::Accepter => McSocketAccepter::new(self.group, self.rendezvous_port).rendezvous(cancel),
        }
    }
}

impl IOChannel for McSocket {
    fn request_connection(&mut self, requester: &dyn ConnectionRequester) -> io::Result<()> {
        if let Some(inner) = self.inner.as_mut() {
            return inner.request_connection(requester);
        }
        let cancel = AtomicBool::new(false);
        let stream = self.rendezvous(&cancel)?;
        let mut socket = Socket::from_accepted(stream, self.config)?;
        socket.request_connection(requester)?;
        self.inner = Some(socket);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "mcsocket not connected"))?
            .read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "mcsocket not connected"))?
            .write(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.close(),
            None => Ok(()),
        }
    }

    fn name(&self) -> String {
        match &self.inner {
            Some(inner) => format!("mcsocket({})", inner.name()),
            None => format!("mcsocket(pending, group={}:{})", self.group, self.rendezvous_port),
        }
    }

    fn clone_channel(&self) -> Box<dyn IOChannel> {
        Box::new(McSocket::pending(self.group, self.rendezvous_port, self.role, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_round_trips_through_wire_layout() {
        let d = RendezvousDatagram {
            listen_port: 40123,
            pseudo_port: 7,
            num_multicasts: 3,
        };
        let encoded = d.encode();
        assert_eq!(encoded.len(), DATAGRAM_LEN);
        let decoded = RendezvousDatagram::decode(&encoded).unwrap();
        assert_eq!(decoded, d);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(RendezvousDatagram::decode(&[0u8; 4]).is_none());
    }

    #[test]
    fn requester_honors_cancellation() {
        let requester = McSocketRequester::new(Ipv4Addr::new(239, 0, 0, 10), 50999, 1);
        let cancel = AtomicBool::new(true);
        let result = requester.rendezvous(&cancel);
        assert!(result.is_err());
    }
}
