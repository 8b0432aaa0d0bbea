//! Turns raw counters into bandwidth, message-rate and latency figures.

use std::{ops::Add, time::Duration};

use zerocopy::{
    byteorder::{BigEndian, U64},
    AsBytes, FromBytes, FromZeroes,
};

use crate::{
    config::{Limits, Units},
    error::{Error, HandshakeError, ThresholdFailure},
    handshake::{self, Record},
    session::Session,
    setup::SetupState,
    transport::RawCounters,
};

pub mod format;

const MEBIBYTE: f64 = (1u64 << 20) as f64;
const MEGABYTE: f64 = 1e6;

/// Measured outcome of one bandwidth run. Never changed once produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BandwidthReport {
    pub size: u64,
    pub messages: u64,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl From<&RawCounters> for BandwidthReport {
    fn from(counters: &RawCounters) -> Self {
        BandwidthReport {
            size: counters.size,
            messages: counters.messages,
            bytes: counters.bytes,
            elapsed: counters.elapsed,
        }
    }
}

#[derive(AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct BandwidthReportWire {
    size: U64<BigEndian>,
    messages: U64<BigEndian>,
    bytes: U64<BigEndian>,
    elapsed_nanos: U64<BigEndian>,
}

impl Record for BandwidthReport {
    const NAME: &'static str = "bandwidth report";

    type Wire = BandwidthReportWire;

    fn to_wire(&self) -> BandwidthReportWire {
        BandwidthReportWire {
            size: U64::new(self.size),
            messages: U64::new(self.messages),
            bytes: U64::new(self.bytes),
            elapsed_nanos: U64::new(u64::try_from(self.elapsed.as_nanos()).unwrap_or(u64::MAX)),
        }
    }

    fn from_wire(wire: BandwidthReportWire) -> Result<Self, HandshakeError> {
        let report = BandwidthReport {
            size: wire.size.get(),
            messages: wire.messages.get(),
            bytes: wire.bytes.get(),
            elapsed: Duration::from_nanos(wire.elapsed_nanos.get()),
        };

        if report.messages > 0 && report.elapsed.is_zero() {
            return Err(HandshakeError::Malformed {
                record: Self::NAME,
                reason: format!("{} messages in zero time", report.messages),
            });
        }

        Ok(report)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BandwidthFigures {
    pub mb_per_sec: f64,
    pub gbit_per_sec: f64,
    pub msg_rate_mpps: f64,
}

impl Add for BandwidthFigures {
    type Output = BandwidthFigures;

    fn add(self, rhs: Self) -> Self::Output {
        BandwidthFigures {
            mb_per_sec: self.mb_per_sec + rhs.mb_per_sec,
            gbit_per_sec: self.gbit_per_sec + rhs.gbit_per_sec,
            msg_rate_mpps: self.msg_rate_mpps + rhs.msg_rate_mpps,
        }
    }
}

/// Figures of a run measured against its own elapsed time. An empty report yields zeros.
pub fn compute_bandwidth(report: &BandwidthReport, units: Units) -> BandwidthFigures {
    let secs = report.elapsed.as_nanos() as f64 / 1e9;
    if secs == 0.0 {
        return BandwidthFigures::default();
    }

    let bytes_per_sec = report.bytes as f64 / secs;
    let megabyte = match units {
        Units::MegaBytes => MEBIBYTE,
        Units::GigaBits => MEGABYTE,
    };

    BandwidthFigures {
        mb_per_sec: bytes_per_sec / megabyte,
        gbit_per_sec: bytes_per_sec * 8.0 / 1e9,
        msg_rate_mpps: report.messages as f64 / secs / 1e6,
    }
}

/// Local and remote figures of a duplex run. Each direction uses its own peer's clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedReport {
    pub local: BandwidthFigures,
    pub remote: Option<BandwidthFigures>,
    pub total: BandwidthFigures,
}

impl CombinedReport {
    pub fn local_only(local: &BandwidthReport, units: Units) -> Self {
        let local = compute_bandwidth(local, units);

        CombinedReport {
            local,
            remote: None,
            total: local,
        }
    }
}

pub fn combine_duplex(
    local: &BandwidthReport,
    remote: &BandwidthReport,
    units: Units,
) -> CombinedReport {
    let local = compute_bandwidth(local, units);
    let remote = compute_bandwidth(remote, units);

    CombinedReport {
        local,
        remote: Some(remote),
        total: local + remote,
    }
}

/// Swaps reports with the peer. Without a compatible peer version nothing is sent and only
/// the local report comes back.
pub fn xchg_reports(
    session: &mut Session,
    local: &BandwidthReport,
) -> Result<(BandwidthReport, Option<BandwidthReport>), Error> {
    if session.remote_version().is_none() {
        return Err(Error::OutOfOrder {
            expected: SetupState::VersionExchanged,
            actual: session.state(),
        });
    }

    if !session.reports_enabled() {
        return Ok((*local, None));
    }

    let remote = handshake::exchange(session.channel(), local)?;
    Ok((*local, Some(remote)))
}

pub fn is_bw_limit_passed(figures: &BandwidthFigures, limits: &Limits) -> bool {
    limits
        .bw_gbps
        .map_or(true, |limit| figures.gbit_per_sec >= limit)
}

pub fn is_msgrate_limit_passed(figures: &BandwidthFigures, limits: &Limits) -> bool {
    limits
        .msg_rate_mpps
        .map_or(true, |limit| figures.msg_rate_mpps >= limit)
}

/// Fails when limit checking is on and either floor was missed.
pub fn check_limits(figures: &BandwidthFigures, limits: &Limits) -> Result<(), ThresholdFailure> {
    if !is_bw_limit_passed(figures, limits) {
        return Err(ThresholdFailure {
            metric: "BW",
            achieved: figures.gbit_per_sec,
            limit: limits.bw_gbps.unwrap_or_default(),
        });
    }

    if !is_msgrate_limit_passed(figures, limits) {
        return Err(ThresholdFailure {
            metric: "Msg rate",
            achieved: figures.msg_rate_mpps,
            limit: limits.msg_rate_mpps.unwrap_or_default(),
        });
    }

    Ok(())
}

/// Distribution of one-way latencies, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub min: f64,
    pub max: f64,
    pub typical: f64,
    pub stdev: f64,
    pub p99: f64,
    pub p99_9: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyReport {
    pub size: u64,
    pub iterations: u64,
    pub average: f64,
    /// Missing for duration-based runs, which only track the average.
    pub stats: Option<LatencyStats>,
}

impl LatencyReport {
    /// Samples are round trips; a ping-pong one-way latency is half of that.
    pub fn from_counters(counters: &RawCounters) -> Self {
        if counters.samples.is_empty() {
            let average = if counters.messages == 0 {
                0.0
            } else {
                micros(counters.elapsed) / counters.messages as f64 / 2.0
            };

            return LatencyReport {
                size: counters.size,
                iterations: counters.messages,
                average,
                stats: None,
            };
        }

        let mut one_way: Vec<f64> = counters.samples.iter().map(|rtt| micros(*rtt) / 2.0).collect();
        one_way.sort_by(f64::total_cmp);

        let n = one_way.len();
        let average = one_way.iter().sum::<f64>() / n as f64;
        let variance = one_way.iter().map(|v| (v - average).powi(2)).sum::<f64>() / n as f64;

        LatencyReport {
            size: counters.size,
            iterations: n as u64,
            average,
            stats: Some(LatencyStats {
                min: one_way[0],
                max: one_way[n - 1],
                typical: one_way[n / 2],
                stdev: variance.sqrt(),
                p99: percentile(&one_way, 0.99),
                p99_9: percentile(&one_way, 0.999),
            }),
        }
    }
}

fn micros(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1e3
}

fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    let rank = (sorted.len() as f64 * fraction).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(bytes: u64, messages: u64, elapsed: Duration) -> BandwidthReport {
        BandwidthReport {
            size: 65536,
            messages,
            bytes,
            elapsed,
        }
    }

    fn assert_close(a: f64, b: f64) {
        let scale = a.abs().max(b.abs()).max(1.0);
        assert!((a - b).abs() <= scale * 1e-12, "{a} != {b}");
    }

    #[test]
    fn one_gibibyte_per_second() {
        let figures = compute_bandwidth(
            &report(1 << 30, 16384, Duration::from_secs(1)),
            Units::MegaBytes,
        );

        assert_close(figures.mb_per_sec, 1024.0);
        assert_close(figures.gbit_per_sec, 8.589934592);
        assert_close(figures.msg_rate_mpps, 0.016384);
    }

    #[test]
    fn decimal_units_use_powers_of_ten() {
        let figures = compute_bandwidth(
            &report(1_000_000, 1, Duration::from_millis(500)),
            Units::GigaBits,
        );

        assert_close(figures.mb_per_sec, 2.0);
        assert_close(figures.gbit_per_sec, 0.016);
    }

    #[test]
    fn empty_report_has_zero_figures() {
        let figures = compute_bandwidth(&BandwidthReport::default(), Units::MegaBytes);
        assert_eq!(figures, BandwidthFigures::default());
    }

    #[test]
    fn bandwidth_is_scale_invariant() {
        bolero::check!()
            .with_type::<(u32, u32, u16)>()
            .cloned()
            .for_each(|(bytes, nanos, messages)| {
                let bytes = bytes as u64 + 1;
                let nanos = nanos as u64 + 1;
                let messages = messages as u64;

                let single = report(bytes, messages, Duration::from_nanos(nanos));
                let double = report(bytes * 2, messages * 2, Duration::from_nanos(nanos * 2));

                for units in [Units::MegaBytes, Units::GigaBits] {
                    let a = compute_bandwidth(&single, units);
                    let b = compute_bandwidth(&double, units);
                    assert_close(a.mb_per_sec, b.mb_per_sec);
                    assert_close(a.gbit_per_sec, b.gbit_per_sec);
                    assert_close(a.msg_rate_mpps, b.msg_rate_mpps);
                }
            });
    }

    #[test]
    fn duplex_total_is_sum_of_directions() {
        bolero::check!()
            .with_type::<(u32, u32, u32, u32)>()
            .cloned()
            .for_each(|(local_bytes, local_nanos, remote_bytes, remote_nanos)| {
                let local_elapsed = Duration::from_nanos(local_nanos as u64 + 1);
                let remote_elapsed = Duration::from_nanos(remote_nanos as u64 + 1);
                let local = report(local_bytes as u64 + 1, 10, local_elapsed);
                let remote = report(remote_bytes as u64 + 1, 20, remote_elapsed);

                let combined = combine_duplex(&local, &remote, Units::MegaBytes);
                let expected = compute_bandwidth(&local, Units::MegaBytes)
                    + compute_bandwidth(&remote, Units::MegaBytes);

                assert_eq!(combined.total, expected);
                assert_eq!(combined.local, compute_bandwidth(&local, Units::MegaBytes));
                assert_eq!(combined.remote, Some(compute_bandwidth(&remote, Units::MegaBytes)));
            });
    }

    #[test]
    fn bandwidth_floor_above_result_fails() {
        let figures = compute_bandwidth(
            &report(1 << 30, 16384, Duration::from_secs(1)),
            Units::MegaBytes,
        );

        let limits = Limits {
            bw_gbps: Some(100.0),
            msg_rate_mpps: None,
        };
        assert!(!is_bw_limit_passed(&figures, &limits));
        assert!(is_msgrate_limit_passed(&figures, &limits));

        let failure = check_limits(&figures, &limits).unwrap_err();
        assert_eq!(failure.metric, "BW");
        assert_eq!(failure.limit, 100.0);

        let limits = Limits {
            bw_gbps: Some(1.0),
            msg_rate_mpps: Some(1.0),
        };
        assert_eq!(check_limits(&figures, &limits).unwrap_err().metric, "Msg rate");

        assert!(check_limits(&figures, &Limits::default()).is_ok());
    }

    #[test]
    fn latency_statistics_halve_round_trips() {
        let counters = RawCounters {
            size: 2,
            messages: 100,
            bytes: 200,
            elapsed: Duration::from_micros(1000),
            samples: (1..=100).map(|us| Duration::from_micros(us * 2)).collect(),
        };

        let latency = LatencyReport::from_counters(&counters);
        let stats = latency.stats.unwrap();

        assert_eq!(latency.iterations, 100);
        assert_close(latency.average, 50.5);
        assert_close(stats.min, 1.0);
        assert_close(stats.max, 100.0);
        assert_close(stats.typical, 51.0);
        assert_close(stats.p99, 99.0);
        assert_close(stats.p99_9, 100.0);
    }

    #[test]
    fn duration_runs_report_only_the_average() {
        let counters = RawCounters {
            size: 64,
            messages: 500,
            bytes: 32000,
            elapsed: Duration::from_millis(1),
            samples: Vec::new(),
        };

        let latency = LatencyReport::from_counters(&counters);
        assert!(latency.stats.is_none());
        assert_close(latency.average, 1.0);
    }

    #[test]
    fn report_wire_rejects_messages_without_time() {
        let wire = report(1, 1, Duration::ZERO).to_wire();
        assert!(BandwidthReport::from_wire(wire).is_err());

        let original = report(4096, 2, Duration::from_nanos(1234));
        assert_eq!(BandwidthReport::from_wire(original.to_wire()).unwrap(), original);
    }
}
