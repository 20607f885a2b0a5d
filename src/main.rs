// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use optsearch::cli::{self, Cli};
use optsearch::config::SearchConfig;
use optsearch::signal::{self, StopFlag};
use optsearch::{coordinator, taskfarm};

fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = SearchConfig::from_file(&cli.conf)?;
    match cli.worker_rank {
        Some(rank) => {
            // Workers observe the same quit signal as the coordinator so
            // an allocation-wide signal stops everyone.
            signal::register_stop_signals(&config.quit_signal)?;
            taskfarm::worker::run(rank, &config, StopFlag::new())?;
        }
        None => coordinator::run(cli, config)?,
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let rank = cli.worker_rank.unwrap_or(0);
    if let Err(e) = cli::init_logging(&cli, rank) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("optsearch: {e:#}");
            ExitCode::FAILURE
        }
    }
}
