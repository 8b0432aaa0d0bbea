//! Out-of-band control link between the two peers.
//!
//! The link is only used for coordination records, never for the benchmarked traffic. Every
//! operation blocks until the full record went through or the link failed; there is no
//! timeout and no retry at this layer.

use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read, Write},
    net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
};

use tracing::debug;

use crate::{config::ConnectionType, error::ChannelError};

/// A byte stream layered over a connection-manager connection.
pub trait CmLink: Read + Write + Send {
    fn disconnect(&mut self) -> io::Result<()>;
}

/// Items that arrive in batches but are consumed one at a time, oldest first.
///
/// A connection-manager link polls its completion queues in batches; every completion past
/// the first belongs to a later record and has to wait here.
#[derive(Debug)]
pub struct Backlog<T> {
    queue: VecDeque<T>,
}

impl<T> Backlog<T> {
    pub fn new() -> Self {
        Backlog {
            queue: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Hands out the oldest buffered item. `refill` only runs once nothing is buffered and
    /// appends whatever it found; `None` means it found nothing.
    pub fn next_with<E>(
        &mut self,
        refill: impl FnOnce(&mut VecDeque<T>) -> Result<(), E>,
    ) -> Result<Option<T>, E> {
        if self.queue.is_empty() {
            refill(&mut self.queue)?;
        }

        Ok(self.queue.pop_front())
    }
}

impl<T> Default for Backlog<T> {
    fn default() -> Self {
        Backlog::new()
    }
}

enum Binding {
    Socket(TcpStream),
    ConnectionManager(Box<dyn CmLink>),
}

pub struct ControlChannel {
    binding: Binding,
    peer: String,
}

impl ControlChannel {
    /// Opens a socket channel. The server blocks until one client connected.
    pub fn open(connection_type: &ConnectionType) -> Result<Self, ChannelError> {
        match *connection_type {
            ConnectionType::Server { port } => {
                let listener = Self::listen(port)?;
                Self::accept(&listener)
            }
            ConnectionType::Client { server_addr, port } => {
                Self::connect(SocketAddr::new(server_addr, port))
            }
        }
    }

    pub fn listen(port: u16) -> Result<TcpListener, ChannelError> {
        let socket_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);

        TcpListener::bind(socket_addr).map_err(|source| ChannelError::Bind {
            endpoint: socket_addr.to_string(),
            source,
        })
    }

    pub fn accept(listener: &TcpListener) -> Result<Self, ChannelError> {
        let endpoint = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unbound>".to_owned());

        let (stream, peer) = listener
            .accept()
            .map_err(|source| ChannelError::Accept { endpoint, source })?;

        debug!(%peer, "accepted control connection");

        Self::from_stream(stream, peer.to_string())
    }

    pub fn connect(socket_addr: SocketAddr) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect(socket_addr).map_err(|source| ChannelError::Connect {
            endpoint: socket_addr.to_string(),
            source,
        })?;

        debug!(peer = %socket_addr, "connected control channel");

        Self::from_stream(stream, socket_addr.to_string())
    }

    fn from_stream(stream: TcpStream, peer: String) -> Result<Self, ChannelError> {
        stream
            .set_nodelay(true)
            .map_err(|source| ChannelError::Io {
                op: "configure",
                source,
            })?;

        Ok(ControlChannel {
            binding: Binding::Socket(stream),
            peer,
        })
    }

    pub fn from_cm_link(link: Box<dyn CmLink>, peer: String) -> Self {
        ControlChannel {
            binding: Binding::ConnectionManager(link),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn send(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        let stream = self.stream();

        let mut written = 0;
        while written < bytes.len() {
            match stream.write(&bytes[written..]) {
                Ok(0) => {
                    return Err(ChannelError::Truncated {
                        transferred: written,
                        expected: bytes.len(),
                    })
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => return Err(ChannelError::Io { op: "send", source }),
            }
        }

        stream
            .flush()
            .map_err(|source| ChannelError::Io { op: "send", source })
    }

    pub fn receive(&mut self, exact_length: usize) -> Result<Vec<u8>, ChannelError> {
        let mut buffer = vec![0u8; exact_length];
        self.receive_into(&mut buffer)?;
        Ok(buffer)
    }

    pub fn receive_into(&mut self, buffer: &mut [u8]) -> Result<(), ChannelError> {
        let stream = self.stream();

        let mut filled = 0;
        while filled < buffer.len() {
            match stream.read(&mut buffer[filled..]) {
                Ok(0) => {
                    return Err(ChannelError::Truncated {
                        transferred: filled,
                        expected: buffer.len(),
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ChannelError::Io {
                        op: "receive",
                        source,
                    })
                }
            }
        }

        Ok(())
    }

    pub fn close(self) -> Result<(), ChannelError> {
        let result = match self.binding {
            Binding::Socket(stream) => match stream.shutdown(Shutdown::Both) {
                Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            Binding::ConnectionManager(mut link) => link.disconnect(),
        };

        result.map_err(|source| ChannelError::Io { op: "close", source })
    }

    fn stream(&mut self) -> &mut dyn ReadWrite {
        match &mut self.binding {
            Binding::Socket(stream) => stream,
            Binding::ConnectionManager(link) => link,
        }
    }
}

trait ReadWrite: Read + Write {}

impl<T: Read + Write + ?Sized> ReadWrite for T {}

#[cfg(test)]
pub(crate) mod tests {
    use std::{net::Ipv4Addr, thread};

    use super::*;

    /// Two connected socket channels over loopback, server side first.
    pub(crate) fn channel_pair() -> (ControlChannel, ControlChannel) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = ControlChannel::connect(addr).unwrap();
        let server = ControlChannel::accept(&listener).unwrap();

        (server, client)
    }

    #[test]
    fn transfers_exact_records_both_ways() {
        let (mut server, mut client) = channel_pair();

        client.send(b"hello server").unwrap();
        server.send(b"hi").unwrap();

        assert_eq!(server.receive(12).unwrap(), b"hello server");
        assert_eq!(client.receive(2).unwrap(), b"hi");
    }

    #[test]
    fn remote_close_mid_record_is_truncation() {
        let (mut server, mut client) = channel_pair();

        let sender = thread::spawn(move || {
            client.send(&[1, 2, 3]).unwrap();
            client.close().unwrap();
        });

        let err = server.receive(8).unwrap_err();
        sender.join().unwrap();

        match err {
            ChannelError::Truncated {
                transferred,
                expected,
            } => {
                assert_eq!(transferred, 3);
                assert_eq!(expected, 8);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn backlog_keeps_the_rest_of_a_batch() {
        let mut backlog = Backlog::new();
        let mut polls = 0;

        let mut next = |backlog: &mut Backlog<u32>, batch: &[u32]| {
            backlog
                .next_with(|queue| {
                    polls += 1;
                    queue.extend(batch);
                    Ok::<_, ()>(())
                })
                .unwrap()
        };

        // Two records completed before the first poll.
        assert_eq!(next(&mut backlog, &[1, 2]), Some(1));
        assert_eq!(backlog.len(), 1);
        assert_eq!(next(&mut backlog, &[9]), Some(2));
        assert!(backlog.is_empty());
        assert_eq!(next(&mut backlog, &[]), None);
        assert_eq!(next(&mut backlog, &[3]), Some(3));

        assert_eq!(polls, 3);
    }

    #[test]
    fn backlog_passes_refill_errors_through() {
        let mut backlog = Backlog::<u32>::new();
        assert_eq!(backlog.next_with(|_| Err("poll failed")), Err("poll failed"));

        let first = backlog
            .next_with(|queue| {
                queue.extend([4, 5]);
                Ok::<_, &str>(())
            })
            .unwrap();
        assert_eq!(first, Some(4));

        // Buffered items are served without polling again.
        assert_eq!(backlog.next_with(|_| Err("not polled")), Ok(Some(5)));
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(matches!(
            ControlChannel::connect(addr),
            Err(ChannelError::Connect { .. })
        ));
    }
}
