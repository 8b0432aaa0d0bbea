//! One complete benchmark: setup, measured phase, result exchange and teardown.

use std::io::{self, Write};

use tracing::{debug, info, warn};

use crate::{
    config::{Config, DeviceConfig, OutputFormat, Role, RunMode, TestKind},
    error::{Error, TransportError},
    iteration::{IterationController, Measurement},
    report::{
        check_limits, combine_duplex,
        format::{bw_header, bw_row, lat_header, lat_row, RESULT_LINE},
        xchg_reports, BandwidthReport, CombinedReport,
    },
    session::Session,
    setup::ConnectionSetup,
    transport::TransportResource,
};

/// What a finished run measured, as seen from this peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    /// Measurements this peer produced itself. Empty on a half-duplex server.
    pub measurements: Vec<Measurement>,
    /// The peer's report, when one was exchanged.
    pub remote: Option<BandwidthReport>,
    /// Figures the thresholds are checked against.
    pub result: Option<CombinedReport>,
}

/// A run that got through its measured phase, with the result table it has yet to print.
struct Finished {
    outcome: Outcome,
    table: Vec<String>,
}

/// Runs the whole benchmark against `transport` and tears everything down afterwards.
pub fn run<T: TransportResource>(config: Config, transport: &mut T) -> Result<Outcome, Error> {
    match Session::open(config, transport) {
        Ok(session) => run_session(session, transport),
        Err(err) => {
            destroy_quietly(transport);
            Err(err)
        }
    }
}

/// Same as [`run`] over a control channel that is already up, printing to stdout.
pub fn run_session<T: TransportResource>(
    session: Session,
    transport: &mut T,
) -> Result<Outcome, Error> {
    run_session_to(session, transport, &mut io::stdout())
}

/// Same as [`run_session`], writing results to `out`.
///
/// The result table is only written once the closing barrier and the teardown went through,
/// so a failed run prints nothing but the interim lines of an unbounded run. Threshold checks
/// come last.
pub fn run_session_to<T: TransportResource, W: Write>(
    mut session: Session,
    transport: &mut T,
    out: &mut W,
) -> Result<Outcome, Error> {
    let limits = session.config().limits;

    let finished = match execute(&mut session, transport, out) {
        Ok(finished) => finished,
        Err(err) => {
            abort(session, transport);
            return Err(err);
        }
    };

    if let Err(err) = session.close_connection() {
        destroy_quietly(transport);
        return Err(err);
    }

    transport
        .destroy()
        .map_err(Error::transport("destroy transport resources"))?;

    for line in &finished.table {
        writeln!(out, "{line}").map_err(Error::Output)?;
    }

    let outcome = finished.outcome;

    if limits.enabled() {
        if let Some(result) = &outcome.result {
            check_limits(&result.total, &limits)?;
        }
    }

    Ok(outcome)
}

/// Runs the benchmark on the RDMA device described by `device`.
#[cfg(feature = "verbs")]
pub fn run_on_device(config: Config, device: DeviceConfig) -> Result<Outcome, Error> {
    let mut transport = crate::rdma_controller::IbResource::open(device, &config)
        .map_err(Error::transport("open device"))?;

    run(config, &mut transport)
}

/// Without verbs support there is never a device to run on.
#[cfg(not(feature = "verbs"))]
pub fn run_on_device(_config: Config, device: DeviceConfig) -> Result<Outcome, Error> {
    debug!(?device, "built without verbs support");
    Err(Error::transport("open device")(TransportError::NoDevice))
}

fn execute<T: TransportResource, W: Write>(
    session: &mut Session,
    transport: &mut T,
    out: &mut W,
) -> Result<Finished, Error> {
    ConnectionSetup::new(session, transport).run()?;

    let config = session.config().clone();

    match config.test_kind {
        TestKind::Latency => latency(session, transport, &config),
        TestKind::Bandwidth if config.is_passive_side() => passive_bandwidth(session, &config),
        TestKind::Bandwidth => bandwidth(session, transport, &config, out),
    }
}

fn latency<T: TransportResource>(
    session: &mut Session,
    transport: &mut T,
    config: &Config,
) -> Result<Finished, Error> {
    let full = config.output == OutputFormat::Full;

    let measurements = IterationController::new(session, transport).run(|_| {})?;

    let mut table = Vec::with_capacity(measurements.len() + 3);
    if full {
        table.push(RESULT_LINE.to_owned());
        table.push(lat_header(config.run_length));
    }

    table.extend(measurements.iter().filter_map(|measurement| match measurement {
        Measurement::Latency(report) => Some(lat_row(report, config)),
        Measurement::Bandwidth(_) => None,
    }));

    if full {
        table.push(RESULT_LINE.to_owned());
    }

    Ok(Finished {
        outcome: Outcome {
            measurements,
            ..Outcome::default()
        },
        table,
    })
}

/// The half-duplex server only waits for the client and prints what it measured.
fn passive_bandwidth(session: &mut Session, config: &Config) -> Result<Finished, Error> {
    session.barrier()?;
    let (_, remote) = xchg_reports(session, &BandwidthReport::default())?;

    let mut table = Vec::new();
    if config.output == OutputFormat::Full {
        table.push(RESULT_LINE.to_owned());
        table.push(bw_header(config.units));
    }

    let result = match &remote {
        Some(report) => {
            let result = CombinedReport::local_only(report, config.units);
            table.push(bw_row(report, &result.total, config));
            Some(result)
        }
        None => {
            info!("results are reported on the client side");
            None
        }
    };

    if config.output == OutputFormat::Full {
        table.push(RESULT_LINE.to_owned());
    }

    Ok(Finished {
        outcome: Outcome {
            measurements: Vec::new(),
            remote,
            result,
        },
        table,
    })
}

fn bandwidth<T: TransportResource, W: Write>(
    session: &mut Session,
    transport: &mut T,
    config: &Config,
    out: &mut W,
) -> Result<Finished, Error> {
    let full = config.output == OutputFormat::Full;
    let unbounded = config.run_mode == RunMode::Unbounded;

    if unbounded && full {
        writeln!(out, "{RESULT_LINE}").map_err(Error::Output)?;
        writeln!(out, "{}", bw_header(config.units)).map_err(Error::Output)?;
    }

    let measurements = IterationController::new(session, transport).run(|measurement| {
        if let (true, Measurement::Bandwidth(report)) = (unbounded, measurement) {
            let result = CombinedReport::local_only(report, config.units);
            if let Err(err) = writeln!(out, "{}", bw_row(report, &result.total, config)) {
                warn!(%err, "printing an interim result failed");
            }
        }
    })?;

    let Some(Measurement::Bandwidth(local)) = measurements.last().copied() else {
        return Err(Error::Transport {
            step: "run measured transfer",
            source: TransportError::Other("no bandwidth measurement was produced".into()),
        });
    };

    let mut remote = None;
    let mut result = CombinedReport::local_only(&local, config.units);

    if config.duplex {
        let (_, peer) = xchg_reports(session, &local)?;
        if let Some(peer) = peer {
            result = combine_duplex(&local, &peer, config.units);
        }
        remote = peer;
    } else if config.role() == Role::Client {
        session.barrier()?;
        xchg_reports(session, &local)?;
        debug!("handed results to the passive server");
    }

    // Unbounded runs printed their header up front.
    let mut table = Vec::new();
    if full && !unbounded {
        table.push(RESULT_LINE.to_owned());
        table.push(bw_header(config.units));
    }

    table.push(bw_row(&local, &result.total, config));

    if config.report_both {
        table.extend(both_tables(&local, remote.as_ref(), &result, config));
    }

    if full {
        table.push(RESULT_LINE.to_owned());
    }

    Ok(Finished {
        outcome: Outcome {
            measurements,
            remote,
            result: Some(result),
        },
        table,
    })
}

fn both_tables(
    local: &BandwidthReport,
    remote: Option<&BandwidthReport>,
    result: &CombinedReport,
    config: &Config,
) -> Vec<String> {
    let mut lines = vec![
        " local results:".to_owned(),
        bw_row(local, &result.local, config),
    ];

    match (remote, result.remote) {
        (Some(report), Some(figures)) => {
            lines.push(" remote results:".to_owned());
            lines.push(bw_row(report, &figures, config));
        }
        _ => lines.push(" remote results: unavailable".to_owned()),
    }

    lines
}

fn abort<T: TransportResource>(session: Session, transport: &mut T) {
    if let Err(err) = session.close() {
        warn!(%err, "closing the control channel failed");
    }

    destroy_quietly(transport);
}

fn destroy_quietly<T: TransportResource>(transport: &mut T) {
    if let Err(err) = transport.destroy() {
        warn!(%err, "tearing down transport resources failed");
    }
}
