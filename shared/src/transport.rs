use std::time::Duration;

use crate::{
    channel::CmLink,
    config::{ConnectionType, Role, RunLength},
    error::TransportError,
    handshake::PeerDestination,
};

/// Raw output of one `run_transfer` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCounters {
    pub size: u64,
    /// Completed messages (iterations).
    pub messages: u64,
    pub bytes: u64,
    pub elapsed: Duration,
    /// Per-iteration round-trip times, filled by latency transfers only.
    pub samples: Vec<Duration>,
}

/// The data path driven by the engine: queue pairs, memory and completions.
pub trait TransportResource {
    /// Creates `num_qps` queue pairs and describes each one.
    fn create(
        &mut self,
        num_qps: usize,
        role: Role,
    ) -> Result<Vec<PeerDestination>, TransportError>;

    /// Moves the local queue pairs to ready-to-send against the remote ones.
    fn connect(&mut self, remote: &[PeerDestination]) -> Result<(), TransportError>;

    /// Describes the queue pairs again once transport-level identifiers are final.
    fn refresh_destinations(&mut self) -> Result<Vec<PeerDestination>, TransportError> {
        Err(TransportError::Unsupported("a second setup pass"))
    }

    /// Builds the work requests aimed at the remote buffers.
    fn prepare(&mut self, _remote: &[PeerDestination]) -> Result<(), TransportError> {
        Ok(())
    }

    fn run_transfer(&mut self, size: u64, length: RunLength) -> Result<RawCounters, TransportError>;

    fn destroy(&mut self) -> Result<(), TransportError>;

    /// Opens a control link over the connection manager.
    fn control_link(
        &mut self,
        _connection_type: &ConnectionType,
    ) -> Result<Box<dyn CmLink>, TransportError> {
        Err(TransportError::Unsupported("a connection-manager control channel"))
    }
}
