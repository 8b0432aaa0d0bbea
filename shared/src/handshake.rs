//! Fixed-size record exchange over the control channel.
//!
//! Every record has a fixed, big-endian wire layout shared by both peers. An exchange always
//! sends the local record first and then reads the remote one; the stream is full duplex and
//! the records are small, so both peers may send at the same time without blocking.

use tracing::trace;
use zerocopy::{
    byteorder::{BigEndian, U32},
    AsBytes, FromBytes, FromZeroes,
};

use crate::{
    channel::ControlChannel,
    config::{Config, RunMode, TestKind, TransportMode},
    error::HandshakeError,
};

pub mod destination;

pub use destination::{GidKind, PeerDestination};

/// Protocol version announced to the peer.
pub const VERSION: &str = "6.22";

/// Oldest version that exchanges complete bandwidth reports.
pub const MIN_REPORT_VERSION: (u16, u16) = (5, 33);

const VERSION_LEN: usize = 16;

/// A fixed-length record with an agreed wire layout.
pub trait Record: Sized {
    const NAME: &'static str;

    type Wire: AsBytes + FromBytes;

    fn to_wire(&self) -> Self::Wire;

    fn from_wire(wire: Self::Wire) -> Result<Self, HandshakeError>;
}

/// Sends `local`, then waits for the peer's record of the same type.
pub fn exchange<R: Record>(channel: &mut ControlChannel, local: &R) -> Result<R, HandshakeError> {
    let wire = local.to_wire();

    channel
        .send(wire.as_bytes())
        .map_err(|source| HandshakeError::Channel {
            record: R::NAME,
            source,
        })?;

    let mut remote = R::Wire::new_zeroed();
    channel
        .receive_into(remote.as_bytes_mut())
        .map_err(|source| HandshakeError::Channel {
            record: R::NAME,
            source,
        })?;

    trace!(record = R::NAME, "exchanged record");

    R::from_wire(remote)
}

/// A round trip that only aligns the two peers; the received record is dropped.
pub fn barrier(
    channel: &mut ControlChannel,
    token: &PeerDestination,
) -> Result<(), HandshakeError> {
    exchange(channel, token).map(drop)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    text: String,
}

impl VersionInfo {
    pub fn local() -> Self {
        VersionInfo {
            text: VERSION.to_owned(),
        }
    }

    pub fn new(text: impl Into<String>) -> Self {
        VersionInfo { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// `major.minor`, ignoring anything after the minor number.
    pub fn parse(&self) -> Option<(u16, u16)> {
        let mut parts = self.text.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts
            .next()
            .map(|minor| {
                let digits: String = minor.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().ok()
            })
            .unwrap_or(Some(0))?;

        Some((major, minor))
    }

    /// Both sides evaluate this with the roles swapped and must come to the same answer.
    pub fn reports_compatible(&self, remote: &VersionInfo) -> bool {
        match (self.parse(), remote.parse()) {
            (Some(local), Some(remote)) => {
                local.0 == remote.0 && local.min(remote) >= MIN_REPORT_VERSION
            }
            _ => false,
        }
    }
}

#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct VersionWire([u8; VERSION_LEN]);

impl Record for VersionInfo {
    const NAME: &'static str = "version";

    type Wire = VersionWire;

    fn to_wire(&self) -> VersionWire {
        let mut raw = [0u8; VERSION_LEN];
        let bytes = self.text.as_bytes();
        let len = bytes.len().min(VERSION_LEN - 1);
        raw[..len].copy_from_slice(&bytes[..len]);
        VersionWire(raw)
    }

    fn from_wire(wire: VersionWire) -> Result<Self, HandshakeError> {
        let end = wire.0.iter().position(|b| *b == 0).unwrap_or(VERSION_LEN);

        let text = std::str::from_utf8(&wire.0[..end]).map_err(|e| HandshakeError::Malformed {
            record: Self::NAME,
            reason: e.to_string(),
        })?;

        if text.is_empty() {
            return Err(HandshakeError::Malformed {
                record: Self::NAME,
                reason: "empty version string".into(),
            });
        }

        Ok(VersionInfo::new(text))
    }
}

/// Runs the one version exchange of a session.
pub fn exchange_version(
    channel: &mut ControlChannel,
    local: &VersionInfo,
) -> Result<VersionInfo, HandshakeError> {
    exchange(channel, local)
}

/// The parameters both peers must agree on before any queue pair is described.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub qp_count: u32,
    pub duplex: bool,
    pub test_kind: TestKind,
    pub transport_mode: TransportMode,
    pub run_mode: u8,
}

impl SessionParams {
    pub fn from_config(config: &Config) -> Self {
        SessionParams {
            qp_count: config.effective_qp_count() as u32,
            duplex: config.duplex,
            test_kind: config.test_kind,
            transport_mode: config.transport_mode,
            run_mode: config.run_mode.wire_tag(),
        }
    }

    pub fn verify(&self, remote: &SessionParams) -> Result<(), HandshakeError> {
        fn mismatch(
            field: &'static str,
            local: impl ToString,
            remote: impl ToString,
        ) -> HandshakeError {
            HandshakeError::ParameterMismatch {
                field,
                local: local.to_string(),
                remote: remote.to_string(),
            }
        }

        if self.qp_count != remote.qp_count {
            return Err(mismatch("queue pairs", self.qp_count, remote.qp_count));
        }
        if self.duplex != remote.duplex {
            return Err(mismatch("duplex", self.duplex, remote.duplex));
        }
        if self.test_kind != remote.test_kind {
            return Err(mismatch(
                "test kind",
                format!("{:?}", self.test_kind),
                format!("{:?}", remote.test_kind),
            ));
        }
        if self.transport_mode != remote.transport_mode {
            return Err(mismatch(
                "transport mode",
                format!("{:?}", self.transport_mode),
                format!("{:?}", remote.transport_mode),
            ));
        }
        if self.run_mode != remote.run_mode {
            return Err(mismatch("run mode", self.run_mode, remote.run_mode));
        }

        Ok(())
    }
}

#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct SessionParamsWire {
    qp_count: U32<BigEndian>,
    duplex: u8,
    test_kind: u8,
    transport_mode: u8,
    run_mode: u8,
}

impl Record for SessionParams {
    const NAME: &'static str = "session parameters";

    type Wire = SessionParamsWire;

    fn to_wire(&self) -> SessionParamsWire {
        SessionParamsWire {
            qp_count: U32::new(self.qp_count),
            duplex: self.duplex as u8,
            test_kind: self.test_kind as u8,
            transport_mode: self.transport_mode as u8,
            run_mode: self.run_mode,
        }
    }

    fn from_wire(wire: SessionParamsWire) -> Result<Self, HandshakeError> {
        let malformed = |reason: String| HandshakeError::Malformed {
            record: Self::NAME,
            reason,
        };

        let test_kind = match wire.test_kind {
            0 => TestKind::Latency,
            1 => TestKind::Bandwidth,
            other => return Err(malformed(format!("unknown test kind {other}"))),
        };

        let transport_mode = TransportMode::from_wire(wire.transport_mode)
            .ok_or_else(|| malformed(format!("unknown transport mode {}", wire.transport_mode)))?;

        if wire.run_mode > RunMode::Unbounded.wire_tag() {
            return Err(malformed(format!("unknown run mode {}", wire.run_mode)));
        }

        Ok(SessionParams {
            qp_count: wire.qp_count.get(),
            duplex: wire.duplex != 0,
            test_kind,
            transport_mode,
            run_mode: wire.run_mode,
        })
    }
}
