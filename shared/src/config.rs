use std::{fmt, net::IpAddr, time::Duration};

use crate::error::Error;

/// Largest exponent of the latency size sweep: sizes run from 2^1 to 2^23 bytes.
pub const SWEEP_MAX_EXPONENT: u32 = 23;

/// Fixed payload of an atomic operation.
pub const ATOMIC_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ConnectionType {
    Server { port: u16 },
    Client { server_addr: IpAddr, port: u16 },
}

impl ConnectionType {
    pub fn role(&self) -> Role {
        match self {
            ConnectionType::Server { .. } => Role::Server,
            ConnectionType::Client { .. } => Role::Client,
        }
    }

    pub fn port(&self) -> u16 {
        match *self {
            ConnectionType::Server { port } | ConnectionType::Client { port, .. } => port,
        }
    }
}

/// How the out-of-band control link is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStyle {
    /// Plain TCP stream; the client connects, the server accepts.
    Socket,
    /// Byte stream layered on a connection-manager handshake. Queue pairs are already
    /// connected once the channel is up.
    ConnectionManager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportMode {
    Rc = 0,
    Uc = 1,
    Xrc = 2,
    Dc = 3,
}

impl TransportMode {
    /// DC targets only learn their final queue-pair numbers after the first connect.
    pub fn requires_second_pass(self) -> bool {
        matches!(self, TransportMode::Dc)
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(TransportMode::Rc),
            1 => Some(TransportMode::Uc),
            2 => Some(TransportMode::Xrc),
            3 => Some(TransportMode::Dc),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TestKind {
    Latency = 0,
    Bandwidth = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Single { size: u64 },
    Sweep,
    Unbounded,
}

impl RunMode {
    pub(crate) fn wire_tag(&self) -> u8 {
        match self {
            RunMode::Single { .. } => 0,
            RunMode::Sweep => 1,
            RunMode::Unbounded => 2,
        }
    }
}

/// How long a single `run_transfer` call lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLength {
    Iterations(u64),
    Duration(Duration),
}

/// Performance floors. A `None` limit is never checked.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Limits {
    pub bw_gbps: Option<f64>,
    pub msg_rate_mpps: Option<f64>,
}

impl Limits {
    pub fn enabled(&self) -> bool {
        self.bw_gbps.is_some() || self.msg_rate_mpps.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Units {
    /// MB/sec with 1 MB = 2^20 bytes.
    #[default]
    MegaBytes,
    /// Gb/sec with 1 Gb = 10^9 bits.
    GigaBits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Full,
    Bandwidth,
    MessageRate,
    Latency,
}

/// Operation the verbs data path issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verb {
    /// RDMA write ping-pong.
    #[default]
    Write,
    FetchAndAdd,
    CompareAndSwap,
}

/// Which RDMA device to open and how deep to drive it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// First device in the list when unset.
    pub dev_name: Option<String>,
    pub ib_port: u8,
    /// Global routing is only used when set.
    pub gid_index: Option<i32>,
    /// Outstanding work requests per queue pair.
    pub tx_depth: u32,
    pub verb: Verb,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            dev_name: None,
            ib_port: 1,
            gid_index: None,
            tx_depth: 128,
            verb: Verb::Write,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub connection_type: ConnectionType,
    pub connection_style: ConnectionStyle,
    pub transport_mode: TransportMode,
    pub test_kind: TestKind,
    pub duplex: bool,
    pub num_qps: usize,
    pub warm_up: bool,
    pub run_mode: RunMode,
    pub run_length: RunLength,
    pub limits: Limits,
    pub units: Units,
    pub output: OutputFormat,
    pub report_both: bool,
}

impl Config {
    pub fn role(&self) -> Role {
        self.connection_type.role()
    }

    pub fn requires_second_pass(&self) -> bool {
        self.transport_mode.requires_second_pass()
    }

    /// XRC and DC need a separate initiator and target per logical queue pair.
    pub fn effective_qp_count(&self) -> usize {
        let paired = matches!(self.transport_mode, TransportMode::Xrc | TransportMode::Dc);
        let doubled = match self.test_kind {
            TestKind::Latency => paired,
            TestKind::Bandwidth => paired && self.duplex,
        };

        if doubled {
            self.num_qps * 2
        } else {
            self.num_qps
        }
    }

    /// Message sizes of the measured phase, in run order.
    pub fn sizes(&self) -> Vec<u64> {
        match self.run_mode {
            RunMode::Single { size } => vec![size],
            RunMode::Sweep => (1..=SWEEP_MAX_EXPONENT).map(|exp| 1u64 << exp).collect(),
            RunMode::Unbounded => vec![self.default_size()],
        }
    }

    fn default_size(&self) -> u64 {
        match self.test_kind {
            TestKind::Latency => 2,
            TestKind::Bandwidth => ATOMIC_SIZE,
        }
    }

    /// In half-duplex bandwidth tests only the client drives traffic.
    pub fn is_passive_side(&self) -> bool {
        self.test_kind == TestKind::Bandwidth && !self.duplex && self.role() == Role::Server
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.num_qps == 0 {
            return Err(Error::Config("at least one queue pair is required".into()));
        }

        match self.run_length {
            RunLength::Iterations(0) => {
                return Err(Error::Config("iteration count must be positive".into()))
            }
            RunLength::Duration(d) if d.is_zero() => {
                return Err(Error::Config("test duration must be positive".into()))
            }
            _ => {}
        }

        match (self.run_mode, self.test_kind) {
            (RunMode::Single { size: 0 }, _) => {
                return Err(Error::Config("message size must be positive".into()))
            }
            (RunMode::Sweep, TestKind::Bandwidth) => {
                return Err(Error::Config(
                    "size sweep is only available for latency tests".into(),
                ))
            }
            (RunMode::Unbounded, TestKind::Latency) => {
                return Err(Error::Config(
                    "unbounded runs are only available for bandwidth tests".into(),
                ))
            }
            _ => {}
        }

        if self.duplex && self.test_kind == TestKind::Latency {
            return Err(Error::Config("latency tests cannot run in duplex".into()));
        }

        for (name, limit) in [
            ("bandwidth", self.limits.bw_gbps),
            ("message rate", self.limits.msg_rate_mpps),
        ] {
            if let Some(value) = limit {
                if !value.is_finite() || value <= 0.0 {
                    return Err(Error::Config(format!(
                        "{name} limit must be a positive number, got {value}"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    pub(crate) fn bandwidth_config(role: Role) -> Config {
        let connection_type = match role {
            Role::Server => ConnectionType::Server { port: 18515 },
            Role::Client => ConnectionType::Client {
                server_addr: Ipv4Addr::LOCALHOST.into(),
                port: 18515,
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

    #[test]
    fn sweep_covers_two_to_eight_megabytes() {
        let mut config = bandwidth_config(Role::Client);
        config.test_kind = TestKind::Latency;
        config.run_mode = RunMode::Sweep;

        let sizes = config.sizes();
        assert_eq!(sizes.len(), 23);
        assert_eq!(sizes.first(), Some(&2));
        assert_eq!(sizes.last(), Some(&(1 << 23)));
        assert!(sizes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn dc_doubles_queue_pairs_only_when_duplex_for_bandwidth() {
        let mut config = bandwidth_config(Role::Server);
        config.transport_mode = TransportMode::Dc;
        config.num_qps = 2;
        assert_eq!(config.effective_qp_count(), 2);

        config.duplex = true;
        assert_eq!(config.effective_qp_count(), 4);
        assert!(config.requires_second_pass());

        config.transport_mode = TransportMode::Rc;
        assert_eq!(config.effective_qp_count(), 2);
        assert!(!config.requires_second_pass());
    }

    #[test]
    fn passive_side_is_half_duplex_bandwidth_server() {
        assert!(bandwidth_config(Role::Server).is_passive_side());
        assert!(!bandwidth_config(Role::Client).is_passive_side());

        let mut duplex = bandwidth_config(Role::Server);
        duplex.duplex = true;
        assert!(!duplex.is_passive_side());
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let mut config = bandwidth_config(Role::Client);
        config.num_qps = 0;
        assert!(config.validate().is_err());

        let mut config = bandwidth_config(Role::Client);
        config.run_mode = RunMode::Sweep;
        assert!(config.validate().is_err());

        let mut config = bandwidth_config(Role::Client);
        config.limits.bw_gbps = Some(-1.0);
        assert!(config.validate().is_err());

        let mut config = bandwidth_config(Role::Client);
        config.run_length = RunLength::Duration(Duration::ZERO);
        assert!(config.validate().is_err());

        assert!(bandwidth_config(Role::Client).validate().is_ok());
    }
}
