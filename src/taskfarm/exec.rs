// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Child-process execution on the worker side.
//!
//! Every user script runs as `FLAGS="<flags>" <script>` under `sh -c`, in
//! its own process group so that a timeout can kill the whole tree. A
//! candidate is evaluated as the prologue `clean -> build -> accuracy-test`
//! followed by the repeated benchmark; any failure anywhere yields the
//! largest finite double as the fitness. User-script failures never crash
//! the worker.

use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::config::SearchConfig;
use crate::error::Result;
use crate::signal::StopFlag;
use crate::stats::{epsilon_band, mean, sample_std_dev};

const SHELL: &str = "/bin/sh";

/// What happened to a spawned command.
#[derive(Debug, Clone, Copy)]
pub struct CommandOutcome {
    /// The exit status, or -1 when the command was killed (by the timeout
    /// or any signal) or dumped core.
    pub status: i32,
    /// Wall-clock seconds from spawn to exit.
    pub elapsed: f64,
}

fn kill_process_group(pid: u32) {
    // Compilers fork; killing only the direct child leaves the real work
    // running. Failure here means the group is already gone.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

/// Run `command` under the shell with a wall-clock `timeout`.
///
/// The parent polls for exit with an exponential backoff from 10 ms to
/// 1000 ms. On overrun the whole process group gets SIGKILL and the status
/// is -1. A final SIGKILL to the group reaps stragglers either way.
pub fn run_command(command: &str, timeout: Duration) -> Result<CommandOutcome> {
    trace!(command, ?timeout, "spawning command");
    let mut child = Command::new(SHELL)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .process_group(0)
        .spawn()?;
    let pid = child.id();
    let started = Instant::now();
    let mut delay = Duration::from_millis(10);
    const MAX_DELAY: Duration = Duration::from_millis(1000);

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if started.elapsed() >= timeout {
                    info!(command, "timeout after {:?}: killing pgid {}", timeout, pid);
                    kill_process_group(pid);
                    // Reap so the -1 below reflects the kill, not a zombie.
                    let _ = child.wait();
                    break None;
                }
                std::thread::sleep(delay.min(timeout.saturating_sub(started.elapsed())));
                delay = (delay * 2).min(MAX_DELAY);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                kill_process_group(pid);
                return Err(e.into());
            }
        }
    };
    kill_process_group(pid);

    let elapsed = started.elapsed().as_secs_f64();
    let status = match status {
        // A signalled or dumped child has no exit code.
        Some(status) => status.code().unwrap_or(-1),
        None => -1,
    };
    debug!(command, status, elapsed, "command finished");
    Ok(CommandOutcome { status, elapsed })
}

/// Outcome of the sample-window check after each benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SampleVerdict {
    /// Keep benchmarking.
    Continue,
    /// Enough mutually-consistent samples; stop early.
    Settled,
    /// Scatter exceeds the permitted band; the measurement is worthless.
    OutOfBand,
}

/// Compare the sample deviation against the epsilon band. Early success
/// needs more than five samples, all inside the band.
pub(crate) fn assess_samples(samples: &[f64], epsilon_pct: f64) -> SampleVerdict {
    let deviation = sample_std_dev(samples);
    let band = epsilon_band(samples, epsilon_pct);
    if deviation > band {
        return SampleVerdict::OutOfBand;
    }
    if samples.len() > 5 {
        return SampleVerdict::Settled;
    }
    SampleVerdict::Continue
}

/// Runs the prologue and benchmark for one candidate flags string.
pub struct Evaluator<'a> {
    config: &'a SearchConfig,
    stop: StopFlag,
}

impl<'a> Evaluator<'a> {
    pub fn new(config: &'a SearchConfig, stop: StopFlag) -> Evaluator<'a> {
        Evaluator { config, stop }
    }

    fn command_for(&self, flags: &str, script: &str) -> String {
        format!("FLAGS=\"{flags}\" {script}")
    }

    /// Evaluate one candidate: prologue, then the repeated benchmark.
    /// Every failure mode maps to the largest finite double.
    pub fn evaluate(&self, flags: &str) -> f64 {
        if self.prologue(flags) {
            self.benchmark(flags)
        } else {
            f64::MAX
        }
    }

    /// `clean -> build -> accuracy-test`, in that order, each under the
    /// per-step timeout. The first non-zero exit aborts the rest.
    fn prologue(&self, flags: &str) -> bool {
        let timeout = Duration::from_secs(self.config.timeout);
        for script in [
            &self.config.clean_script,
            &self.config.build_script,
            &self.config.accuracy_test,
        ] {
            if self.stop.is_set() {
                return false;
            }
            let command = self.command_for(flags, script);
            debug!(command = %command, "prologue step");
            match run_command(&command, timeout) {
                Ok(outcome) if outcome.status == 0 => {}
                Ok(outcome) => {
                    info!(
                        command = %command,
                        status = outcome.status,
                        "prologue step failed (non-zero exit status)"
                    );
                    return false;
                }
                Err(e) => {
                    error!(command = %command, error = %e, "could not run prologue step");
                    return false;
                }
            }
        }
        true
    }

    /// Repeat the benchmark until the sample window settles inside the
    /// epsilon band, the configured repetition limit is reached, or
    /// anything goes wrong. Reports the mean of the samples taken.
    fn benchmark(&self, flags: &str) -> f64 {
        // An unset repeat count defaults upstream; zero means the user
        // intended a single run.
        let repeats = if self.config.benchmark_repeats == 0 {
            1
        } else {
            self.config.benchmark_repeats
        };
        let timeout = Duration::from_secs(self.config.benchmark_timeout);
        let command = self.command_for(flags, &self.config.performance_test);
        debug!(command = %command, repeats, "benchmark");

        let mut samples = Vec::with_capacity(repeats as usize);
        for _ in 0..repeats {
            if self.stop.is_set() {
                break;
            }
            match run_command(&command, timeout) {
                Ok(outcome) if outcome.status == 0 => {
                    samples.push(outcome.elapsed);
                    match assess_samples(&samples, self.config.epsilon) {
                        SampleVerdict::OutOfBand => {
                            warn!(
                                deviation = sample_std_dev(&samples),
                                band = epsilon_band(&samples, self.config.epsilon),
                                "benchmark deviation outside the permitted band"
                            );
                            return f64::MAX;
                        }
                        SampleVerdict::Settled => {
                            debug!(
                                runs = samples.len(),
                                "deviation stayed within expected error; stopping early"
                            );
                            break;
                        }
                        SampleVerdict::Continue => {}
                    }
                }
                Ok(outcome) => {
                    info!(
                        command = %command,
                        status = outcome.status,
                        "benchmark failed (non-zero exit status or timeout)"
                    );
                    return f64::MAX;
                }
                Err(e) => {
                    error!(command = %command, error = %e, "could not run benchmark");
                    return f64::MAX;
                }
            }
        }
        if samples.is_empty() {
            return f64::MAX;
        }
        mean(&samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn exit_status_is_reported() {
        let ok = run_command("true", Duration::from_secs(5)).unwrap();
        assert_eq!(ok.status, 0);
        let failed = run_command("exit 3", Duration::from_secs(5)).unwrap();
        assert_eq!(failed.status, 3);
    }

    #[test]
    fn elapsed_time_is_measured() {
        let outcome = run_command("sleep 0.1", Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.status, 0);
        assert!(outcome.elapsed >= 0.1);
        assert!(outcome.elapsed < 5.0);
    }

    #[test]
    fn overrunning_commands_are_killed() {
        let started = Instant::now();
        let outcome = run_command("sleep 30", Duration::from_millis(200)).unwrap();
        assert_eq!(outcome.status, -1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    fn script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        format!("sh {}", path.display())
    }

    fn config(clean: String, build: String, accuracy: String, perf: String) -> SearchConfig {
        SearchConfig {
            quit_signal: "SIGUSR1".into(),
            clean_script: clean,
            build_script: build,
            accuracy_test: accuracy,
            performance_test: perf,
            timeout: 5,
            benchmark_timeout: 5,
            benchmark_repeats: 20,
            epsilon: 5.0,
            compiler: Default::default(),
        }
    }

    #[test]
    fn failed_build_short_circuits_the_prologue() {
        let dir = tempfile::tempdir().unwrap();
        let accuracy = script(
            dir.path(),
            "accuracy.sh",
            &format!("touch {}/ran-accuracy", dir.path().display()),
        );
        let perf = script(
            dir.path(),
            "perf.sh",
            &format!("touch {}/ran-perf", dir.path().display()),
        );
        let config = config("true".into(), "exit 1".into(), accuracy, perf);

        let evaluator = Evaluator::new(&config, StopFlag::new());
        let fitness = evaluator.evaluate("-O2");
        assert_eq!(fitness, f64::MAX);
        // Neither the accuracy test nor the benchmark may have run.
        assert!(!dir.path().join("ran-accuracy").exists());
        assert!(!dir.path().join("ran-perf").exists());
    }

    #[test]
    fn scripts_see_the_flags() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("flags-seen");
        let build = format!("sh -c 'echo \"$FLAGS\" > {}'", marker.display());
        let config = config("true".into(), build, "true".into(), "true".into());
        let evaluator = Evaluator::new(&config, StopFlag::new());
        let fitness = evaluator.evaluate("-funroll-loops -O2");
        assert!(fitness < f64::MAX);
        let seen = std::fs::read_to_string(marker).unwrap();
        assert_eq!(seen.trim(), "-funroll-loops -O2");
    }

    #[test]
    fn zero_repeats_still_runs_the_benchmark_once() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let perf = format!("sh -c 'echo run >> {}'", counter.display());
        let mut config = config("true".into(), "true".into(), "true".into(), perf);
        config.benchmark_repeats = 0;

        let evaluator = Evaluator::new(&config, StopFlag::new());
        let fitness = evaluator.evaluate("");
        assert!(fitness < f64::MAX);
        let runs = std::fs::read_to_string(counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[test]
    fn sample_window_settles_after_six_consistent_runs() {
        let timings = [1.00, 1.01, 0.99, 1.00, 1.00, 1.01];
        let mut samples = Vec::new();
        for (i, t) in timings.iter().enumerate() {
            samples.push(*t);
            let verdict = assess_samples(&samples, 5.0);
            if i < 5 {
                assert_eq!(verdict, SampleVerdict::Continue, "sample {}", i + 1);
            } else {
                assert_eq!(verdict, SampleVerdict::Settled);
            }
        }
        assert_relative_eq!(mean(&samples), 1.001_666_6, epsilon = 1e-6);
    }

    #[test]
    fn scattered_samples_are_rejected() {
        // Second sample is far outside 5% of the sum.
        let samples = [1.0, 3.0];
        assert_eq!(assess_samples(&samples, 5.0), SampleVerdict::OutOfBand);
    }
}
