use tracing::debug;

use crate::{
    config::{RunLength, RunMode, TestKind},
    error::Error,
    report::{BandwidthReport, LatencyReport},
    session::Session,
    setup::SetupState,
    transport::TransportResource,
};

/// Iterations of the discarded warm-up transfer.
pub const WARM_UP_ITERATIONS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    Bandwidth(BandwidthReport),
    Latency(LatencyReport),
}

/// Runs the measured phase once both peers passed the rendezvous barrier.
pub struct IterationController<'a, T> {
    session: &'a mut Session,
    transport: &'a mut T,
}

impl<'a, T: TransportResource> IterationController<'a, T> {
    pub fn new(session: &'a mut Session, transport: &'a mut T) -> Self {
        IterationController { session, transport }
    }

    /// Every measurement is handed to `sink` as soon as it exists. Unbounded runs only
    /// return with the error that stopped them.
    pub fn run(&mut self, mut sink: impl FnMut(&Measurement)) -> Result<Vec<Measurement>, Error> {
        if !self.session.synchronized {
            return Err(Error::OutOfOrder {
                expected: SetupState::Ready,
                actual: self.session.state(),
            });
        }

        let config = self.session.config().clone();

        if config.is_passive_side() {
            debug!("half duplex server, the client drives the traffic");
            return Ok(Vec::new());
        }

        let sizes = config.sizes();

        if config.run_mode == RunMode::Unbounded {
            return self.run_unbounded(sizes[0], config.run_length, config.duplex, sink);
        }

        if config.warm_up {
            let length = warm_up_length(config.run_length);
            debug!(size = sizes[0], ?length, "warming up");
            self.transport
                .run_transfer(sizes[0], length)
                .map_err(Error::transport("warm up"))?;
        }

        let mut measurements = Vec::with_capacity(sizes.len());

        for (index, &size) in sizes.iter().enumerate() {
            if config.duplex && index == 0 {
                self.session.barrier()?;
            }

            debug!(size, "measuring");

            let counters = self
                .transport
                .run_transfer(size, config.run_length)
                .map_err(Error::transport("run measured transfer"))?;

            let measurement = match config.test_kind {
                TestKind::Latency => Measurement::Latency(LatencyReport::from_counters(&counters)),
                TestKind::Bandwidth => Measurement::Bandwidth(BandwidthReport::from(&counters)),
            };

            sink(&measurement);
            measurements.push(measurement);
        }

        Ok(measurements)
    }

    fn run_unbounded(
        &mut self,
        size: u64,
        length: RunLength,
        duplex: bool,
        mut sink: impl FnMut(&Measurement),
    ) -> Result<Vec<Measurement>, Error> {
        if duplex {
            self.session.barrier()?;
        }

        loop {
            let counters = self
                .transport
                .run_transfer(size, length)
                .map_err(Error::transport("run transfer"))?;

            sink(&Measurement::Bandwidth(BandwidthReport::from(&counters)));
        }
    }
}

fn warm_up_length(length: RunLength) -> RunLength {
    match length {
        RunLength::Iterations(n) => RunLength::Iterations(n.min(WARM_UP_ITERATIONS)),
        RunLength::Duration(_) => RunLength::Iterations(WARM_UP_ITERATIONS),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn warm_up_never_exceeds_measured_run() {
        assert_eq!(
            warm_up_length(RunLength::Iterations(10)),
            RunLength::Iterations(10)
        );
        assert_eq!(
            warm_up_length(RunLength::Iterations(1_000_000)),
            RunLength::Iterations(WARM_UP_ITERATIONS)
        );
        assert_eq!(
            warm_up_length(RunLength::Duration(Duration::from_secs(5))),
            RunLength::Iterations(WARM_UP_ITERATIONS)
        );
    }
}
