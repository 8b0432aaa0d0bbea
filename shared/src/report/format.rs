//! Result tables in the layout perftest users expect.

use crate::config::{Config, OutputFormat, RunLength, Units};

use super::{BandwidthFigures, BandwidthReport, LatencyReport};

pub const RESULT_LINE: &str =
    "---------------------------------------------------------------------------------------";

pub fn bw_header(units: Units) -> String {
    let unit = match units {
        Units::MegaBytes => "MB/sec",
        Units::GigaBits => "Gb/sec",
    };

    format!(" #bytes     #iterations    BW average[{unit}]   MsgRate[Mpps]")
}

pub fn headline_bandwidth(figures: &BandwidthFigures, units: Units) -> f64 {
    match units {
        Units::MegaBytes => figures.mb_per_sec,
        Units::GigaBits => figures.gbit_per_sec,
    }
}

pub fn bw_row(report: &BandwidthReport, figures: &BandwidthFigures, config: &Config) -> String {
    let bandwidth = headline_bandwidth(figures, config.units);

    match config.output {
        OutputFormat::Full => format!(
            " {:<7}    {:<7}          {:<7.2}            {:<7.6}",
            report.size, report.messages, bandwidth, figures.msg_rate_mpps
        ),
        OutputFormat::Bandwidth | OutputFormat::Latency => format!("{bandwidth:.2}"),
        OutputFormat::MessageRate => format!("{:.6}", figures.msg_rate_mpps),
    }
}

pub fn lat_header(run_length: RunLength) -> String {
    match run_length {
        RunLength::Iterations(_) => concat!(
            " #bytes #iterations    t_min[usec]    t_max[usec]  t_typical[usec]",
            "    t_avg[usec]    t_stdev[usec]   99% percentile[usec]   99.9% percentile[usec]"
        )
        .to_owned(),
        RunLength::Duration(_) => " #bytes        #iterations       t_avg[usec]".to_owned(),
    }
}

pub fn lat_row(report: &LatencyReport, config: &Config) -> String {
    if config.output != OutputFormat::Full {
        return format!("{:.2}", report.average);
    }

    match report.stats {
        Some(stats) => format!(
            concat!(
                " {:<7} {:<10}     {:<7.2}        {:<7.2}      {:<7.2}",
                "          {:<7.2}        {:<7.2}\t\t{:<7.2}\t\t\t{:<7.2}",
            ),
            report.size,
            report.iterations,
            stats.min,
            stats.max,
            stats.typical,
            report.average,
            stats.stdev,
            stats.p99,
            stats.p99_9
        ),
        None => format!(
            " {:<7}       {:<10}        {:<7.2}",
            report.size, report.iterations, report.average
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::{tests::bandwidth_config, Role},
        report::compute_bandwidth,
    };

    #[test]
    fn headline_only_outputs_print_one_number() {
        let mut config = bandwidth_config(Role::Client);
        let report = BandwidthReport {
            size: 65536,
            messages: 1000,
            bytes: 65536 * 1000,
            elapsed: Duration::from_millis(10),
        };
        let figures = compute_bandwidth(&report, config.units);

        config.output = OutputFormat::Bandwidth;
        assert_eq!(bw_row(&report, &figures, &config), "6250.00");

        config.output = OutputFormat::MessageRate;
        assert_eq!(bw_row(&report, &figures, &config), "0.100000");

        config.output = OutputFormat::Full;
        let row = bw_row(&report, &figures, &config);
        assert!(row.starts_with(" 65536"));
        assert!(row.contains("6250.00"));
    }

    #[test]
    fn header_names_configured_unit() {
        assert!(bw_header(Units::GigaBits).contains("Gb/sec"));
        assert!(bw_header(Units::MegaBytes).contains("MB/sec"));
        assert!(lat_header(RunLength::Iterations(1)).contains("99.9% percentile"));
    }
}
