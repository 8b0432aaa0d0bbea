use std::{net::IpAddr, time::Duration};

use clap::{arg, command, Parser, ValueEnum};
use perftest::config::{
    Config, ConnectionStyle, ConnectionType, DeviceConfig, Limits, OutputFormat, RunLength,
    RunMode, TestKind, TransportMode, Units, Verb,
};

#[derive(Parser, Debug)]
#[command(version, about = "RDMA atomic bandwidth test", long_about = None)]
pub struct GlobalArgs {
    /// Server to connect to. Runs as the server when omitted.
    pub server_addr: Option<IpAddr>,
    #[arg(short, long, default_value_t = 18515)]
    pub port: u16,
    #[arg(short = 'd', long = "ib-dev")]
    pub dev: Option<String>,
    #[arg(short = 'i', long, default_value_t = 1)]
    pub ib_port: u8,
    #[arg(short = 'x', long)]
    pub gid_index: Option<i32>,
    #[arg(short = 'c', long, value_enum, ignore_case = true, default_value_t = Connection::Rc)]
    pub connection: Connection,
    /// Connect queue pairs through the RDMA connection manager.
    #[arg(short = 'R', long)]
    pub rdma_cm: bool,
    #[arg(short = 'A', long, value_enum, ignore_case = true, default_value_t = Atomic::FetchAndAdd)]
    pub atomic_type: Atomic,
    #[arg(short = 'q', long, default_value_t = 1)]
    pub qp: usize,
    #[arg(short = 't', long, default_value_t = 128)]
    pub tx_depth: u32,
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub iters: u64,
    /// Run for this many seconds instead of a fixed iteration count.
    #[arg(short = 'D', long)]
    pub duration: Option<u64>,
    /// Keep measuring and printing until interrupted.
    #[arg(long)]
    pub run_infinitely: bool,
    /// Both sides send at the same time.
    #[arg(short, long)]
    pub bidirectional: bool,
    #[arg(long)]
    pub no_warm_up: bool,
    /// Fail unless at least this many Gb/s were reached.
    #[arg(long)]
    pub bw_limit: Option<f64>,
    /// Fail unless at least this many million messages per second were reached.
    #[arg(long)]
    pub msg_rate_limit: Option<f64>,
    #[arg(long)]
    pub report_gbits: bool,
    /// Print the local and remote figures separately as well.
    #[arg(long)]
    pub report_both: bool,
    #[arg(long, value_enum)]
    pub output: Option<Output>,
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    #[value(name = "RC")]
    Rc,
    #[value(name = "XRC")]
    Xrc,
    #[value(name = "DC")]
    Dc,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atomic {
    #[value(name = "FETCH_AND_ADD")]
    FetchAndAdd,
    #[value(name = "CMP_AND_SWAP")]
    CompareAndSwap,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    Bandwidth,
    MessageRate,
}

impl From<Connection> for TransportMode {
    fn from(connection: Connection) -> Self {
        match connection {
            Connection::Rc => TransportMode::Rc,
            Connection::Xrc => TransportMode::Xrc,
            Connection::Dc => TransportMode::Dc,
        }
    }
}

impl From<Atomic> for Verb {
    fn from(atomic: Atomic) -> Self {
        match atomic {
            Atomic::FetchAndAdd => Verb::FetchAndAdd,
            Atomic::CompareAndSwap => Verb::CompareAndSwap,
        }
    }
}

impl GlobalArgs {
    pub fn into_config(self) -> (Config, DeviceConfig) {
        let connection_type = match self.server_addr {
            Some(server_addr) => ConnectionType::Client {
                server_addr,
                port: self.port,
            },
            None => ConnectionType::Server { port: self.port },
        };

        let config = Config {
            connection_type,
            connection_style: if self.rdma_cm {
                ConnectionStyle::ConnectionManager
            } else {
                ConnectionStyle::Socket
            },
            transport_mode: self.connection.into(),
            test_kind: TestKind::Bandwidth,
            duplex: self.bidirectional,
            num_qps: self.qp,
            warm_up: !self.no_warm_up,
            run_mode: if self.run_infinitely {
                RunMode::Unbounded
            } else {
                RunMode::Single {
                    size: perftest::config::ATOMIC_SIZE,
                }
            },
            run_length: match self.duration {
                Some(secs) => RunLength::Duration(Duration::from_secs(secs)),
                None => RunLength::Iterations(self.iters),
            },
            limits: Limits {
                bw_gbps: self.bw_limit,
                msg_rate_mpps: self.msg_rate_limit,
            },
            units: if self.report_gbits {
                Units::GigaBits
            } else {
                Units::MegaBytes
            },
            output: match self.output {
                Some(Output::Bandwidth) => OutputFormat::Bandwidth,
                Some(Output::MessageRate) => OutputFormat::MessageRate,
                None => OutputFormat::Full,
            },
            report_both: self.report_both,
        };

        let device = DeviceConfig {
            dev_name: self.dev,
            ib_port: self.ib_port,
            gid_index: self.gid_index,
            tx_depth: self.tx_depth,
            verb: self.atomic_type.into(),
        };

        (config, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_a_half_duplex_fetch_and_add_server() {
        let (config, device) = GlobalArgs::parse_from(["atomic_bw"]).into_config();

        assert!(config.is_passive_side());
        assert_eq!(config.run_mode, RunMode::Single { size: 8 });
        assert_eq!(device.verb, Verb::FetchAndAdd);
        assert_eq!(device.tx_depth, 128);
        assert!(!config.limits.enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn limits_and_units_reach_the_config() {
        let (config, device) = GlobalArgs::parse_from([
            "atomic_bw",
            "-A",
            "cmp_and_swap",
            "-q",
            "2",
            "-b",
            "--bw-limit",
            "1.5",
            "--report-gbits",
            "--output",
            "message-rate",
            "192.168.1.2",
        ])
        .into_config();

        assert_eq!(device.verb, Verb::CompareAndSwap);
        assert_eq!(config.num_qps, 2);
        assert!(config.duplex);
        assert_eq!(config.limits.bw_gbps, Some(1.5));
        assert_eq!(config.units, Units::GigaBits);
        assert_eq!(config.output, OutputFormat::MessageRate);
        assert!(matches!(config.connection_type, ConnectionType::Client { .. }));
    }
}
