use derivative::Derivative;
use tracing::{debug, info};

use crate::{
    channel::ControlChannel,
    config::{Config, ConnectionStyle, ConnectionType, OutputFormat, Role},
    error::{ChannelError, Error, HandshakeError},
    handshake::{self, PeerDestination, VersionInfo},
    setup::SetupState,
    transport::TransportResource,
};

/// Process-wide context of one benchmark run.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Session {
    config: Config,
    #[derivative(Debug = "ignore")]
    channel: ControlChannel,
    pub(crate) state: SetupState,
    pub(crate) remote_version: Option<VersionInfo>,
    pub(crate) reports_enabled: bool,
    pub(crate) local: Vec<PeerDestination>,
    pub(crate) remote: Vec<PeerDestination>,
    pub(crate) synchronized: bool,
}

impl Session {
    /// Opens the control channel for the configured style. The server blocks until the
    /// client shows up.
    pub fn open<T: TransportResource>(config: Config, transport: &mut T) -> Result<Self, Error> {
        config.validate()?;

        if config.role() == Role::Server && config.output == OutputFormat::Full {
            println!();
            println!("************************************");
            println!("* Waiting for client to connect... *");
            println!("************************************");
        }

        let channel = match config.connection_style {
            ConnectionStyle::Socket => ControlChannel::open(&config.connection_type)?,
            ConnectionStyle::ConnectionManager => {
                let link = transport
                    .control_link(&config.connection_type)
                    .map_err(Error::transport("create connection manager channel"))?;
                ControlChannel::from_cm_link(link, peer_name(&config.connection_type))
            }
        };

        info!(peer = channel.peer(), role = %config.role(), "control channel established");

        Ok(Session::with_channel(config, channel))
    }

    /// Wraps a channel that is already connected.
    pub fn with_channel(config: Config, channel: ControlChannel) -> Self {
        Session {
            config,
            channel,
            state: SetupState::ChannelEstablished,
            remote_version: None,
            reports_enabled: false,
            local: Vec::new(),
            remote: Vec::new(),
            synchronized: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.config.role()
    }

    pub fn state(&self) -> SetupState {
        self.state
    }

    pub fn remote_version(&self) -> Option<&VersionInfo> {
        self.remote_version.as_ref()
    }

    /// Whether bandwidth reports travel between the peers.
    pub fn reports_enabled(&self) -> bool {
        self.reports_enabled
    }

    pub fn local_destinations(&self) -> &[PeerDestination] {
        &self.local
    }

    pub fn remote_destinations(&self) -> &[PeerDestination] {
        &self.remote
    }

    pub(crate) fn channel(&mut self) -> &mut ControlChannel {
        &mut self.channel
    }

    /// One round trip of record 0 that only aligns the peers.
    pub fn barrier(&mut self) -> Result<(), HandshakeError> {
        let token = self.local.first().copied().unwrap_or_default();
        handshake::barrier(&mut self.channel, &token)
    }

    /// Final barrier, then closes the control channel.
    pub fn close_connection(mut self) -> Result<(), Error> {
        self.barrier()?;
        debug!("closing control channel");
        self.close().map_err(Error::from)
    }

    pub fn close(self) -> Result<(), ChannelError> {
        self.channel.close()
    }
}

fn peer_name(connection_type: &ConnectionType) -> String {
    match connection_type {
        ConnectionType::Server { port } => format!("cm:*:{port}"),
        ConnectionType::Client { server_addr, port } => format!("cm:{server_addr}:{port}"),
    }
}
