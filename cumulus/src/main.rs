//! The cumulus binary runs maintenance of the cumulative counter store.
//!
//! Counters are written by the applications embedding `cumulus-metrics`. This binary covers the
//! work that runs beside them:
//!
//!  - `run`: resummarizes the configured counters once a day until interrupted.
//!  - `resummarize`: merges every key of one counter into coarser buckets.
//!  - `reconstruct`: recomputes drifted cumulative amounts of one subject.
//!
//! Configuration is read from `config.yml` in the folder passed with `--config`.

mod cli;
mod cliapp;
mod config;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            cumulus_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
