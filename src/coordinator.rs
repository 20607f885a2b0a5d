// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process bootstrap for the coordinator (rank 0): register signals, build
//! the optimiser, spawn the workers, run the farm, and wind everything
//! down with a final checkpoint.
//!
//! Workers are instances of this same executable, re-exec'd with
//! `--worker-rank R` and the same configuration path; each rank parses the
//! configuration itself.

use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::cli::Cli;
use crate::config::SearchConfig;
use crate::error::{OptError, Result};
use crate::optimiser::{Optimiser, DB_FILE};
use crate::signal::{self, StopFlag};
use crate::taskfarm::master::{Master, WorkerHandle};

fn spawn_workers(cli: &Cli) -> Result<Vec<WorkerHandle>> {
    let exe = std::env::current_exe()?;
    (1..=cli.workers)
        .map(|rank| {
            let mut command = Command::new(&exe);
            command
                .arg("--worker-rank")
                .arg(rank.to_string())
                .arg("--conf")
                .arg(&cli.conf)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped());
            if cli.debug {
                command.arg("--debug");
            }
            if cli.verbose {
                command.arg("--verbose");
            }
            if let Some(out) = &cli.out {
                command.arg("--out").arg(out);
            }
            let child = command.spawn().map_err(|e| {
                OptError::task_farm(format!("could not spawn worker rank {rank}: {e}"))
            })?;
            debug!(rank, pid = child.id(), "worker spawned");
            WorkerHandle::new(rank, child)
        })
        .collect()
}

/// Run a whole search as the coordinator.
///
/// Returns cleanly both on convergence and on a signal-driven stop; either
/// way the last checkpoint has been written and the best flags printed.
pub fn run(cli: &Cli, config: SearchConfig) -> Result<()> {
    signal::register_stop_signals(&config.quit_signal)?;
    info!(signal = %config.quit_signal, "got quit signal");

    let stop = StopFlag::new();
    let mut optimiser = Optimiser::new(&config, Path::new(DB_FILE), stop.clone())?;

    let workers = spawn_workers(cli)?;
    let mut master = Master::new(workers, stop.clone())?;

    // Populate the work queue, then hand control to the farm; it returns
    // once the search has stopped and every worker has acknowledged.
    optimiser.start()?;
    master.run(&mut optimiser)?;

    optimiser.finish()
}
