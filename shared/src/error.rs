use std::io;

use thiserror::Error;

use crate::setup::SetupState;

/// Exit code when no eligible RDMA device was found.
pub const EXIT_NO_DEVICE: u8 = 7;
/// Exit code for every other fatal condition.
pub const EXIT_FAILURE: u8 = 1;

/// Failures of the out-of-band control link. None of these are retried.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unable to bind control channel on {endpoint}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("unable to accept a control connection on {endpoint}")]
    Accept {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("unable to connect the control channel to {endpoint}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("control channel closed after {transferred} of {expected} bytes")]
    Truncated { transferred: usize, expected: usize },
    #[error("control channel {op} failed")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to exchange {record} with the remote peer")]
    Channel {
        record: &'static str,
        #[source]
        source: ChannelError,
    },
    #[error("malformed {record} from the remote peer: {reason}")]
    Malformed {
        record: &'static str,
        reason: String,
    },
    #[error("remote peer runs with {field} = {remote}, local side uses {local}")]
    ParameterMismatch {
        field: &'static str,
        local: String,
        remote: String,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unable to find the Infiniband/RoCE device")]
    NoDevice,
    #[error("{0} is not supported by this transport")]
    Unsupported(&'static str),
    #[error("{call} failed")]
    Verbs {
        call: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("work completion failed with status {status}")]
    Completion { status: u32 },
    #[error("{0}")]
    Other(String),
}

/// The transfers completed, the figures did not meet the configured floor.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{metric} result {achieved:.2} is below the {metric} limit {limit:.2}")]
pub struct ThresholdFailure {
    pub metric: &'static str,
    pub achieved: f64,
    pub limit: f64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("found incompatibility issue with GID types (local {local}, remote {remote})")]
    Incompatible {
        local: &'static str,
        remote: &'static str,
    },
    #[error("{step}: {source}")]
    Transport {
        step: &'static str,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Threshold(#[from] ThresholdFailure),
    #[error("unable to write results")]
    Output(#[source] io::Error),
    #[error("connection setup expected state {expected:?}, found {actual:?}")]
    OutOfOrder {
        expected: SetupState,
        actual: SetupState,
    },
}

impl Error {
    pub fn transport(step: &'static str) -> impl FnOnce(TransportError) -> Error {
        move |source| Error::Transport { step, source }
    }

    /// What the user can do about it, if anything.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::Incompatible { .. } => Some("Please try to use a different IP version."),
            Error::Transport {
                source: TransportError::NoDevice,
                ..
            } => Some("Check that an RDMA device is present and the verbs feature is enabled."),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Transport {
                source: TransportError::NoDevice,
                ..
            } => EXIT_NO_DEVICE,
            _ => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_has_its_own_exit_code() {
        let err = Error::transport("open device")(TransportError::NoDevice);
        assert_eq!(err.exit_code(), EXIT_NO_DEVICE);

        let err = Error::from(ThresholdFailure {
            metric: "BW",
            achieved: 1.0,
            limit: 2.0,
        });
        assert_eq!(err.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn gid_mismatch_suggests_other_ip_version() {
        let err = Error::Incompatible {
            local: "IPv4",
            remote: "IPv6",
        };
        assert!(err.remediation().unwrap().contains("IP version"));
    }
}
