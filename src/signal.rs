// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative stop: a signal handler whose only job is to set a flag.
//!
//! Batch schedulers announce the end of an allocation with a signal
//! (`sbatch --signal`, Torque's `signal=` resource). The handler here does
//! nothing that is not async-signal-safe; every loop in the coordinator and
//! the workers checks [`StopFlag::is_set`] at its natural boundaries and
//! winds down cleanly, checkpointing on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{OptError, Result};

/// Set from the signal handler; never cleared within a run.
static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop_signal(signo: libc::c_int) {
    // Async-signal-safe: a single atomic store and nothing else.
    let _ = signo;
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Shared stop flag. Cloning hands out another handle to the same flag;
/// the process-wide signal state is folded into every handle.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> StopFlag {
        StopFlag::default()
    }

    /// Whether a stop has been requested, by signal or programmatically.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst) || SIGNALLED.load(Ordering::SeqCst)
    }

    /// Request a stop programmatically.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Translate a signal name (with or without the `SIG` prefix) into its
/// number. Only signals that make sense for a clean stop are accepted.
pub fn signum_for_name(name: &str) -> Result<libc::c_int> {
    match name {
        "SIGQUIT" | "QUIT" => Ok(libc::SIGQUIT),
        "SIGINT" | "INT" => Ok(libc::SIGINT),
        "SIGUSR1" | "USR1" => Ok(libc::SIGUSR1),
        "SIGUSR2" | "USR2" => Ok(libc::SIGUSR2),
        "SIGSTOP" | "STOP" => Ok(libc::SIGSTOP),
        "SIGCONT" | "CONT" => Ok(libc::SIGCONT),
        _ => Err(OptError::config(format!(
            "invalid quit-signal '{name}': use SIGQUIT, SIGINT, SIGUSR1, SIGUSR2, SIGSTOP or SIGCONT"
        ))),
    }
}

fn install(signum: libc::c_int) -> std::io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_stop_signal as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = 0;
        if libc::sigaction(signum, &action, std::ptr::null_mut()) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Register the configured quit signal plus `SIGCONT` and `SIGINT`.
///
/// SLURM is inconsistent in obeying `--signal` but is hard-coded to send
/// SIGCONT before SIGTERM, so SIGCONT is always bound; SIGINT keeps an
/// interactive ^C clean. Failure to bind the configured signal is fatal;
/// failure on the two extras only warrants a warning.
pub fn register_stop_signals(quit_signal: &str) -> Result<()> {
    let signum = signum_for_name(quit_signal)?;
    install(signum).map_err(|e| {
        OptError::config(format!(
            "unable to register signal handler for {quit_signal}: {e}"
        ))
    })?;
    info!(signal = quit_signal, "stop signal registered");
    for (extra, name) in [(libc::SIGCONT, "SIGCONT"), (libc::SIGINT, "SIGINT")] {
        if extra == signum {
            continue;
        }
        if let Err(e) = install(extra) {
            warn!("unable to register signal handler for {name}: {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names_parse_with_and_without_prefix() {
        assert_eq!(signum_for_name("SIGUSR1").unwrap(), libc::SIGUSR1);
        assert_eq!(signum_for_name("USR1").unwrap(), libc::SIGUSR1);
        assert_eq!(signum_for_name("SIGCONT").unwrap(), libc::SIGCONT);
        assert_eq!(signum_for_name("QUIT").unwrap(), libc::SIGQUIT);
    }

    #[test]
    fn unknown_signal_names_are_rejected() {
        assert!(signum_for_name("SIGKILL").is_err());
        assert!(signum_for_name("sigusr1").is_err());
        assert!(signum_for_name("").is_err());
    }

    #[test]
    fn flags_are_shared_between_clones() {
        let flag = StopFlag::new();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.set();
        assert!(other.is_set());
        // Independent flags stay independent.
        assert!(!StopFlag::new().is_set());
    }
}
