//! Connection setup as an explicit state machine.
//!
//! ```text
//! Init -> ChannelEstablished -> VersionExchanged -> ResourcesAllocated
//!      -> DestinationsExchanged -> TransportConnected [-> DestinationsExchanged
//!      -> TransportConnected] -> Ready -> (rendezvous barrier)
//! ```
//!
//! The bracketed second pass only runs for transport modes that learn their final queue-pair
//! numbers after the first connect. Destinations are always exchanged one queue pair at a
//! time in increasing index order; both peers rely on that order.

use tracing::{debug, trace, warn};

use crate::{
    config::{ConnectionStyle, OutputFormat},
    error::{Error, TransportError},
    handshake::{self, PeerDestination, SessionParams, VersionInfo},
    session::Session,
    transport::TransportResource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Init,
    ChannelEstablished,
    VersionExchanged,
    ResourcesAllocated,
    DestinationsExchanged,
    TransportConnected,
    Ready,
}

pub struct ConnectionSetup<'a, T> {
    session: &'a mut Session,
    transport: &'a mut T,
}

impl<'a, T: TransportResource> ConnectionSetup<'a, T> {
    pub fn new(session: &'a mut Session, transport: &'a mut T) -> Self {
        ConnectionSetup { session, transport }
    }

    pub fn state(&self) -> SetupState {
        self.session.state
    }

    /// Drives every transition up to the rendezvous barrier.
    pub fn run(mut self) -> Result<(), Error> {
        self.exchange_versions()?;
        self.allocate_resources()?;
        self.exchange_destinations()?;
        self.connect_transport()?;

        if self.session.config().requires_second_pass() {
            self.second_pass()?;
        }

        self.make_ready()?;
        self.rendezvous()
    }

    pub fn exchange_versions(&mut self) -> Result<(), Error> {
        self.expect(SetupState::ChannelEstablished)?;

        let local = VersionInfo::local();
        let remote = handshake::exchange_version(self.session.channel(), &local)?;

        let compatible = local.reports_compatible(&remote);
        if !compatible {
            warn!(
                local = local.as_str(),
                remote = remote.as_str(),
                "incompatible peer version, results will not be exchanged"
            );
        }

        self.session.reports_enabled = compatible;
        self.session.remote_version = Some(remote);

        let params = SessionParams::from_config(self.session.config());
        let remote_params = handshake::exchange(self.session.channel(), &params)?;
        params.verify(&remote_params)?;

        self.advance(SetupState::VersionExchanged);
        Ok(())
    }

    pub fn allocate_resources(&mut self) -> Result<(), Error> {
        self.expect(SetupState::VersionExchanged)?;

        let num_qps = self.session.config().effective_qp_count();
        let local = self
            .transport
            .create(num_qps, self.session.role())
            .map_err(Error::transport("create transport resources"))?;

        self.session.local = checked_destinations(local, num_qps, "create transport resources")?;

        self.advance(SetupState::ResourcesAllocated);
        Ok(())
    }

    pub fn exchange_destinations(&mut self) -> Result<(), Error> {
        self.expect(SetupState::ResourcesAllocated)?;

        self.exchange_all()?;

        self.advance(SetupState::DestinationsExchanged);
        Ok(())
    }

    pub fn connect_transport(&mut self) -> Result<(), Error> {
        self.expect(SetupState::DestinationsExchanged)?;

        match self.session.config().connection_style {
            ConnectionStyle::Socket => {
                check_gid_compatibility(&self.session.local[0], &self.session.remote[0])?;

                self.transport
                    .connect(&self.session.remote)
                    .map_err(Error::transport("connect queue pairs"))?;
            }
            ConnectionStyle::ConnectionManager => {
                debug!("queue pairs already connected by the connection manager");
            }
        }

        self.advance(SetupState::TransportConnected);
        Ok(())
    }

    /// Re-describes and re-exchanges every queue pair after the first connect.
    pub fn second_pass(&mut self) -> Result<(), Error> {
        self.expect(SetupState::TransportConnected)?;

        let num_qps = self.session.local.len();
        let local = self
            .transport
            .refresh_destinations()
            .map_err(Error::transport("refresh queue pair destinations"))?;

        self.session.local =
            checked_destinations(local, num_qps, "refresh queue pair destinations")?;

        self.exchange_all()?;
        self.advance(SetupState::DestinationsExchanged);

        self.advance(SetupState::TransportConnected);
        Ok(())
    }

    pub fn make_ready(&mut self) -> Result<(), Error> {
        self.expect(SetupState::TransportConnected)?;

        if self.session.config().output == OutputFormat::Full {
            for dest in &self.session.local {
                println!(" local address: {dest}");
            }
            for dest in &self.session.remote {
                println!(" remote address: {dest}");
            }
        }

        self.transport
            .prepare(&self.session.remote)
            .map_err(Error::transport("prepare work requests"))?;

        self.advance(SetupState::Ready);
        Ok(())
    }

    /// Both peers have their queue pairs ready to receive once this returns.
    pub fn rendezvous(&mut self) -> Result<(), Error> {
        self.expect(SetupState::Ready)?;

        self.session.barrier()?;
        self.session.synchronized = true;

        debug!("peers synchronized, entering measured phase");
        Ok(())
    }

    fn exchange_all(&mut self) -> Result<(), Error> {
        let local = self.session.local.clone();
        let mut remote = Vec::with_capacity(local.len());

        for (index, dest) in local.iter().enumerate() {
            let peer = handshake::exchange(self.session.channel(), dest)?;
            trace!(qp = index, local = ?dest, remote = ?peer, "exchanged destination");
            remote.push(peer);
        }

        self.session.remote = remote;
        Ok(())
    }

    fn expect(&self, expected: SetupState) -> Result<(), Error> {
        let actual = self.session.state;
        if actual == expected {
            Ok(())
        } else {
            Err(Error::OutOfOrder { expected, actual })
        }
    }

    fn advance(&mut self, next: SetupState) {
        debug!(from = ?self.session.state, to = ?next, "setup transition");
        self.session.state = next;
    }
}

fn checked_destinations(
    local: Vec<PeerDestination>,
    expected: usize,
    step: &'static str,
) -> Result<Vec<PeerDestination>, Error> {
    if local.len() != expected {
        return Err(Error::Transport {
            step,
            source: TransportError::Other(format!(
                "expected {expected} queue pair destinations, got {}",
                local.len()
            )),
        });
    }

    Ok(local)
}

/// Mixed address families cannot be bridged by the fabric.
pub fn check_gid_compatibility(
    local: &PeerDestination,
    remote: &PeerDestination,
) -> Result<(), Error> {
    let (local, remote) = (local.gid_kind(), remote.gid_kind());

    if local != remote {
        return Err(Error::Incompatible {
            local: local.name(),
            remote: remote.name(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn mixed_gid_families_are_incompatible() {
        let v4 = PeerDestination {
            gid: Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped().octets(),
            ..Default::default()
        };
        let v6 = PeerDestination::default();

        let err = check_gid_compatibility(&v4, &v6).unwrap_err();
        assert!(matches!(
            err,
            Error::Incompatible {
                local: "IPv4",
                remote: "IPv6"
            }
        ));

        assert!(check_gid_compatibility(&v4, &v4).is_ok());
        assert!(check_gid_compatibility(&v6, &v6).is_ok());
    }
}
