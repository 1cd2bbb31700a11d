//! This module implements the definition of the command line app.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Arg, Command, value_parser};
use cumulus_metrics::MetricInterval;
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Cumulus maintains cumulative counters stored in SQLite.";

pub fn make_app() -> Command {
    Command::new("cumulus")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .env("CUMULUS_CONFIG")
                .value_parser(value_parser!(PathBuf))
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Run the periodic resummarization")
                .after_help(
                    "This runs the configured periodic jobs in the foreground until it's \
                     interrupted.  Jobs that are due run at startup, the remaining ones after \
                     every day boundary in UTC.",
                ),
        )
        .subcommand(
            Command::new("resummarize")
                .about("Merge every key of a counter into coarser buckets")
                .after_help(
                    "This merges all rows of the counter that fall into the same bucket of \
                     the given interval into one row.  Totals are unchanged, but sums over \
                     ranges shorter than the interval are no longer available afterwards.  \
                     The run is guarded by a lock, so it is skipped while another process \
                     resummarizes the same counter.",
                )
                .arg(
                    Arg::new("counter")
                        .value_name("COUNTER")
                        .required(true)
                        .help("The name of the counter."),
                )
                .arg(
                    Arg::new("interval")
                        .long("interval")
                        .short('i')
                        .value_name("INTERVAL")
                        .default_value("daily")
                        .value_parser(value_parser!(MetricInterval))
                        .help("The target interval: hourly, daily, weekly, monthly or yearly."),
                )
                .arg(
                    Arg::new("from")
                        .long("from")
                        .value_name("TIMESTAMP")
                        .value_parser(value_parser!(DateTime<Utc>))
                        .help("Only buckets at or after the one containing this RFC 3339 timestamp."),
                )
                .arg(
                    Arg::new("to")
                        .long("to")
                        .value_name("TIMESTAMP")
                        .value_parser(value_parser!(DateTime<Utc>))
                        .help("Only rows before this RFC 3339 timestamp."),
                )
                .arg(
                    Arg::new("workers")
                        .long("workers")
                        .short('w')
                        .value_name("COUNT")
                        .value_parser(value_parser!(usize))
                        .help("Number of concurrent workers, defaults to the pipeline config."),
                ),
        )
        .subcommand(
            Command::new("reconstruct")
                .about("Recompute drifted cumulative amounts")
                .after_help(
                    "This walks all rows of one subject's counter in time order and rewrites \
                     every cumulative amount that does not equal the sum of the deltas up to \
                     that row.  Running it again on healed rows changes nothing.",
                )
                .arg(
                    Arg::new("counter")
                        .value_name("COUNTER")
                        .required(true)
                        .help("The name of the counter."),
                )
                .arg(
                    Arg::new("type")
                        .long("type")
                        .value_name("UUID")
                        .required(true)
                        .value_parser(value_parser!(Uuid))
                        .help("The type of the subject."),
                )
                .arg(
                    Arg::new("subject")
                        .long("subject")
                        .value_name("UUID")
                        .required(true)
                        .value_parser(value_parser!(Uuid))
                        .help("The subject whose rows are healed."),
                ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_is_valid() {
        make_app().debug_assert();
    }

    #[test]
    fn test_resummarize_args() {
        let matches = make_app()
            .try_get_matches_from([
                "cumulus",
                "--config",
                "/etc/cumulus",
                "resummarize",
                "page.views",
                "--interval",
                "monthly",
                "--from",
                "2024-05-01T00:00:00Z",
            ])
            .unwrap();

        assert_eq!(
            matches.get_one::<PathBuf>("config"),
            Some(&PathBuf::from("/etc/cumulus"))
        );

        let (name, matches) = matches.subcommand().unwrap();
        assert_eq!(name, "resummarize");
        assert_eq!(
            matches.get_one::<String>("counter").map(String::as_str),
            Some("page.views")
        );
        assert_eq!(
            matches.get_one::<MetricInterval>("interval"),
            Some(&MetricInterval::Monthly)
        );
        assert!(matches.get_one::<DateTime<Utc>>("from").is_some());
        assert!(matches.get_one::<DateTime<Utc>>("to").is_none());
    }

    #[test]
    fn test_rejects_unknown_interval() {
        let result =
            make_app().try_get_matches_from(["cumulus", "resummarize", "views", "-i", "minutely"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_reconstruct_requires_subject() {
        let result = make_app().try_get_matches_from([
            "cumulus",
            "reconstruct",
            "views",
            "--type",
            "67e55044-10b1-426f-9247-bb680e5fe0c8",
        ]);
        assert!(result.is_err());
    }
}
