// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker side of the farm: receive a flags string, clean, build, test
//! and benchmark under it, report the fitness, repeat until STOP.
//!
//! Workers speak the framed protocol on stdin/stdout; their logs go to
//! stderr (or the per-rank log file). The scripts' own stdout is discarded
//! by the executor, so it cannot corrupt the protocol stream.

use std::io::{self, Read, Write};

use tracing::{debug, info, trace};

use super::exec::Evaluator;
use super::message::{self, Message, Sequence};
use crate::config::SearchConfig;
use crate::error::{OptError, Result};
use crate::signal::StopFlag;

/// Run the worker loop over the given streams until STOP, EOF or a stop
/// flag. Split out from [`run`] so it can be driven over in-memory pipes.
pub fn run_loop(
    rank: usize,
    config: &SearchConfig,
    stop: StopFlag,
    reader: &mut impl Read,
    writer: &mut impl Write,
) -> Result<()> {
    let evaluator = Evaluator::new(config, stop.clone());
    let mut seq = Sequence::new();
    loop {
        if stop.is_set() {
            debug!(rank, "stop flag set; worker winding down");
            break;
        }
        trace!(rank, "waiting for work");
        let (header, msg) = match message::read_message(reader) {
            Ok(decoded) => decoded,
            Err(e) => {
                if stop.is_set() {
                    break;
                }
                return Err(e);
            }
        };
        match msg {
            Message::Stop => {
                debug!(rank, seq = header.seq, "told to stop work by master");
                break;
            }
            Message::Work { uid, command } => {
                debug!(rank, uid, seq = header.seq, command = %command, "received work");
                let fitness = evaluator.evaluate(&command);
                if stop.is_set() {
                    // A result computed under a stop request is stale;
                    // the master tolerates never hearing back.
                    trace!(rank, "told to stop while running tests; dropping results");
                    break;
                }
                trace!(rank, uid, fitness, "sending fitness back to master");
                message::send_result(writer, seq.next(), uid, fitness)?;
            }
            Message::Result { .. } => {
                return Err(OptError::protocol(format!(
                    "rank {rank}: unexpected RESULT from master (seq #{})",
                    header.seq
                )));
            }
        }
    }
    Ok(())
}

/// Worker entry point: the protocol runs over this process's stdin/stdout.
pub fn run(rank: usize, config: &SearchConfig, stop: StopFlag) -> Result<()> {
    info!(rank, "worker started");
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = stdin.lock();
    let mut writer = stdout.lock();
    let result = run_loop(rank, config, stop, &mut reader, &mut writer);
    info!(rank, "worker finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn config() -> SearchConfig {
        SearchConfig {
            quit_signal: "SIGUSR1".into(),
            clean_script: "true".into(),
            build_script: "true".into(),
            accuracy_test: "true".into(),
            performance_test: "true".into(),
            timeout: 5,
            benchmark_timeout: 5,
            benchmark_repeats: 1,
            epsilon: 5.0,
            compiler: Default::default(),
        }
    }

    #[test]
    fn worker_evaluates_work_and_stops_on_stop() {
        let mut incoming = Vec::new();
        message::send_work(&mut incoming, 1, 4, "-O2").unwrap();
        message::send_stop(&mut incoming, 2).unwrap();

        let mut outgoing = Vec::new();
        run_loop(
            1,
            &config(),
            StopFlag::new(),
            &mut Cursor::new(incoming),
            &mut outgoing,
        )
        .unwrap();

        let (_, msg) = message::read_message(&mut Cursor::new(outgoing)).unwrap();
        match msg {
            Message::Result { uid, fitness } => {
                assert_eq!(uid, 4);
                assert!(fitness < f64::MAX);
            }
            other => panic!("expected a RESULT, got {other:?}"),
        }
    }

    #[test]
    fn failing_scripts_report_the_sentinel_fitness() {
        let mut cfg = config();
        cfg.build_script = "exit 1".into();

        let mut incoming = Vec::new();
        message::send_work(&mut incoming, 1, 0, "").unwrap();
        message::send_stop(&mut incoming, 2).unwrap();

        let mut outgoing = Vec::new();
        run_loop(
            2,
            &cfg,
            StopFlag::new(),
            &mut Cursor::new(incoming),
            &mut outgoing,
        )
        .unwrap();

        let (_, msg) = message::read_message(&mut Cursor::new(outgoing)).unwrap();
        assert_eq!(
            msg,
            Message::Result {
                uid: 0,
                fitness: f64::MAX
            }
        );
    }

    #[test]
    fn a_set_stop_flag_drops_the_result() {
        let mut incoming = Vec::new();
        message::send_work(&mut incoming, 1, 0, "").unwrap();

        let stop = StopFlag::new();
        stop.set();
        let mut outgoing = Vec::new();
        run_loop(
            3,
            &config(),
            stop,
            &mut Cursor::new(incoming),
            &mut outgoing,
        )
        .unwrap();
        assert!(outgoing.is_empty());
    }

    #[test]
    fn unexpected_results_from_the_master_are_fatal() {
        let mut incoming = Vec::new();
        message::send_result(&mut incoming, 1, 0, 1.0).unwrap();
        let mut outgoing = Vec::new();
        let err = run_loop(
            4,
            &config(),
            StopFlag::new(),
            &mut Cursor::new(incoming),
            &mut outgoing,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unexpected RESULT"));
    }
}
