#![allow(dead_code)]

use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

use perftest::{
    channel::{CmLink, ControlChannel},
    config::{
        Config, ConnectionStyle, ConnectionType, Limits, OutputFormat, Role, RunLength, RunMode,
        TestKind, TransportMode, Units,
    },
    error::TransportError,
    handshake::PeerDestination,
    transport::{RawCounters, TransportResource},
    Session,
};

/// Elapsed time every scripted transfer reports.
pub const TRANSFER_TIME: Duration = Duration::from_millis(10);

/// Added to every queue-pair number by a second setup pass.
pub const REFRESH_OFFSET: u32 = 0x1000;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ControlLink,
    Create { num_qps: usize, role: Role },
    Connect { remote_qpns: Vec<u32> },
    Refresh,
    Prepare,
    RunTransfer { size: u64, length: RunLength },
    Destroy,
}

/// Records every call and answers with deterministic destinations and counters.
pub struct MockTransport {
    pub calls: Vec<Call>,
    pub gid: [u8; 16],
    /// Index of the `run_transfer` call that fails.
    pub fail_transfer_at: Option<usize>,
    /// Handed out as the connection-manager control link.
    pub link: Option<TcpStream>,
    qpn_base: u32,
    num_qps: usize,
    refreshed: bool,
    transfers: usize,
}

impl MockTransport {
    pub fn new(qpn_base: u32) -> Self {
        MockTransport {
            calls: Vec::new(),
            gid: [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
            fail_transfer_at: None,
            link: None,
            qpn_base,
            num_qps: 0,
            refreshed: false,
            transfers: 0,
        }
    }

    pub fn transfers(&self) -> Vec<(u64, RunLength)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::RunTransfer { size, length } => Some((*size, *length)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| wanted(call)).count()
    }

    pub fn destroyed(&self) -> bool {
        self.calls.contains(&Call::Destroy)
    }

    fn destinations(&self) -> Vec<PeerDestination> {
        let offset = if self.refreshed { REFRESH_OFFSET } else { 0 };

        (0..self.num_qps as u32)
            .map(|i| PeerDestination {
                lid: 1,
                out_reads: 1,
                qpn: self.qpn_base + offset + i,
                psn: i,
                rkey: 0x1000 + i,
                vaddr: 0x10_0000 * (i as u64 + 1),
                gid: self.gid,
                srqn: 0,
            })
            .collect()
    }
}

impl TransportResource for MockTransport {
    fn create(
        &mut self,
        num_qps: usize,
        role: Role,
    ) -> Result<Vec<PeerDestination>, TransportError> {
        self.calls.push(Call::Create { num_qps, role });
        self.num_qps = num_qps;
        Ok(self.destinations())
    }

    fn connect(&mut self, remote: &[PeerDestination]) -> Result<(), TransportError> {
        self.calls.push(Call::Connect {
            remote_qpns: remote.iter().map(|dest| dest.qpn).collect(),
        });
        Ok(())
    }

    fn refresh_destinations(&mut self) -> Result<Vec<PeerDestination>, TransportError> {
        self.calls.push(Call::Refresh);
        self.refreshed = true;
        Ok(self.destinations())
    }

    fn prepare(&mut self, _remote: &[PeerDestination]) -> Result<(), TransportError> {
        self.calls.push(Call::Prepare);
        Ok(())
    }

    fn run_transfer(
        &mut self,
        size: u64,
        length: RunLength,
    ) -> Result<RawCounters, TransportError> {
        self.calls.push(Call::RunTransfer { size, length });

        let index = self.transfers;
        self.transfers += 1;

        if self.fail_transfer_at == Some(index) {
            return Err(TransportError::Completion { status: 12 });
        }

        // Keeps unbounded runs from spinning flat out.
        thread::sleep(Duration::from_millis(1));

        let (messages, samples) = match length {
            RunLength::Iterations(n) => (
                n,
                (0..n).map(|i| Duration::from_micros(4 + i % 3)).collect(),
            ),
            RunLength::Duration(_) => (1000, Vec::new()),
        };

        Ok(RawCounters {
            size,
            messages,
            bytes: size * messages,
            elapsed: TRANSFER_TIME,
            samples,
        })
    }

    fn destroy(&mut self) -> Result<(), TransportError> {
        self.calls.push(Call::Destroy);
        Ok(())
    }

    fn control_link(
        &mut self,
        _connection_type: &ConnectionType,
    ) -> Result<Box<dyn CmLink>, TransportError> {
        self.calls.push(Call::ControlLink);

        let stream = self
            .link
            .take()
            .ok_or(TransportError::Unsupported("a second control link"))?;
        Ok(Box::new(StreamLink(stream)))
    }
}

/// A connection-manager link stand-in over a connected TCP stream.
struct StreamLink(TcpStream);

impl Read for StreamLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for StreamLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl CmLink for StreamLink {
    fn disconnect(&mut self) -> io::Result<()> {
        match self.0.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Connected loopback streams: (server, client).
pub fn stream_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

pub fn bandwidth_config(role: Role) -> Config {
    let connection_type = match role {
        Role::Server => ConnectionType::Server { port: 0 },
        Role::Client => ConnectionType::Client {
            server_addr: Ipv4Addr::LOCALHOST.into(),
            port: 0,
        },
    };

    Config {
        connection_type,
        connection_style: ConnectionStyle::Socket,
        transport_mode: TransportMode::Rc,
        test_kind: TestKind::Bandwidth,
        duplex: false,
        num_qps: 1,
        warm_up: false,
        run_mode: RunMode::Single { size: 65536 },
        run_length: RunLength::Iterations(1000),
        limits: Limits::default(),
        units: Units::MegaBytes,
        output: OutputFormat::Full,
        report_both: false,
    }
}

pub fn latency_config(role: Role) -> Config {
    Config {
        test_kind: TestKind::Latency,
        run_mode: RunMode::Single { size: 2 },
        ..bandwidth_config(role)
    }
}

/// Applies `tweak` to both peers' configs.
pub fn both(base: fn(Role) -> Config, tweak: impl Fn(&mut Config)) -> (Config, Config) {
    let mut server = base(Role::Server);
    let mut client = base(Role::Client);
    tweak(&mut server);
    tweak(&mut client);
    (server, client)
}

/// Connected control channels over loopback TCP: (server, client).
pub fn channel_pair() -> (ControlChannel, ControlChannel) {
    let listener = ControlChannel::listen(0).unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::scope(|s| {
        let accepting = s.spawn(|| ControlChannel::accept(&listener).unwrap());
        let client =
            ControlChannel::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).unwrap();
        (accepting.join().unwrap(), client)
    })
}

/// Sessions that already share a control channel: (server, client).
pub fn session_pair(server: Config, client: Config) -> (Session, Session) {
    let (server_channel, client_channel) = channel_pair();
    (
        Session::with_channel(server, server_channel),
        Session::with_channel(client, client_channel),
    )
}
