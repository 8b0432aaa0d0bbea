use std::{net::IpAddr, time::Duration};

use clap::{arg, command, Parser, ValueEnum};
use perftest::config::{
    Config, ConnectionStyle, ConnectionType, DeviceConfig, Limits, OutputFormat, RunLength,
    RunMode, TestKind, TransportMode, Units, Verb,
};

#[derive(Parser, Debug)]
#[command(version, about = "RDMA write latency test", long_about = None)]
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
    #[arg(short, long, default_value_t = 2)]
    pub size: u64,
    /// Run sizes from 2 up to 2^23 bytes.
    #[arg(short, long)]
    pub all: bool,
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub iters: u64,
    /// Run each size for this many seconds instead of a fixed iteration count.
    #[arg(short = 'D', long)]
    pub duration: Option<u64>,
    /// Print only the average latency.
    #[arg(long)]
    pub output_latency: bool,
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    #[value(name = "RC")]
    Rc,
    #[value(name = "UC")]
    Uc,
    #[value(name = "XRC")]
    Xrc,
    #[value(name = "DC")]
    Dc,
}

impl From<Connection> for TransportMode {
    fn from(connection: Connection) -> Self {
        match connection {
            Connection::Rc => TransportMode::Rc,
            Connection::Uc => TransportMode::Uc,
            Connection::Xrc => TransportMode::Xrc,
            Connection::Dc => TransportMode::Dc,
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
            test_kind: TestKind::Latency,
            duplex: false,
            num_qps: 1,
            warm_up: false,
            run_mode: if self.all {
                RunMode::Sweep
            } else {
                RunMode::Single { size: self.size }
            },
            run_length: match self.duration {
                Some(secs) => RunLength::Duration(Duration::from_secs(secs)),
                None => RunLength::Iterations(self.iters),
            },
            limits: Limits::default(),
            units: Units::MegaBytes,
            output: if self.output_latency {
                OutputFormat::Latency
            } else {
                OutputFormat::Full
            },
            report_both: false,
        };

        let device = DeviceConfig {
            dev_name: self.dev,
            ib_port: self.ib_port,
            gid_index: self.gid_index,
            verb: Verb::Write,
            ..DeviceConfig::default()
        };

        (config, device)
    }
}
