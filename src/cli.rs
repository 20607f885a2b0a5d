// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Command line and logging setup, shared by the coordinator and the
//! workers it re-execs.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::error::{OptError, Result};

/// Distributed auto-tuner: searches compiler-flag space for the build with
/// the fastest, numerically acceptable benchmark time.
#[derive(Debug, Parser)]
#[command(name = "optsearch", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    pub conf: PathBuf,

    /// Log output file; a per-rank suffix is appended.
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Lower the log level to debug.
    #[arg(short, long)]
    pub debug: bool,

    /// Enable all logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Number of worker processes to spawn.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub workers: usize,

    /// Internal: run as the worker with this rank (spawned by the
    /// coordinator, speaking the farm protocol on stdin/stdout).
    #[arg(long, hide = true)]
    pub worker_rank: Option<usize>,
}

/// Install the global tracing subscriber. With `-o FILE`, rank `r` logs to
/// `FILE-r`; otherwise logs go to stderr (stdout carries the protocol on
/// workers and the final result on the coordinator).
pub fn init_logging(cli: &Cli, rank: usize) -> Result<()> {
    let level = if cli.verbose {
        "trace"
    } else if cli.debug {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_new(level)
        .map_err(|e| OptError::config(format!("bad log filter: {e}")))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match &cli.out {
        Some(path) => {
            let mut name = path.as_os_str().to_os_string();
            name.push(format!("-{rank}"));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&name)
                .map_err(|e| {
                    OptError::config(format!("cannot open log file {name:?}: {e}"))
                })?;
            builder.with_writer(Arc::new(file)).init();
        }
        None => {
            builder.with_writer(std::io::stderr).init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_options_parse() {
        let cli = Cli::parse_from(["optsearch", "-c", "conf.yaml", "-d", "-n", "4"]);
        assert_eq!(cli.conf, PathBuf::from("conf.yaml"));
        assert!(cli.debug);
        assert!(!cli.verbose);
        assert_eq!(cli.workers, 4);
        assert_eq!(cli.worker_rank, None);

        let cli = Cli::parse_from([
            "optsearch",
            "--conf",
            "c.yaml",
            "--verbose",
            "--out",
            "run.log",
            "--worker-rank",
            "2",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.out, Some(PathBuf::from("run.log")));
        assert_eq!(cli.worker_rank, Some(2));
    }

    #[test]
    fn conf_is_required() {
        assert!(Cli::try_parse_from(["optsearch"]).is_err());
    }

    #[test]
    fn workers_default_to_one() {
        let cli = Cli::parse_from(["optsearch", "-c", "conf.yaml"]);
        assert_eq!(cli.workers, 1);
    }
}
