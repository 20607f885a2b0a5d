// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The master side of the farm: dispatch work, collect results, and wind
//! the workers down cleanly once a stop is requested.

use std::os::fd::AsRawFd;
use std::process::{Child, ChildStdin, ChildStdout};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::message::{self, Message, Sequence};
use super::{FitnessSink, WorkItem, WorkerState};
use crate::error::{OptError, Result};
use crate::signal::StopFlag;

/// How long to wait for a result when there is nothing else to do.
const IDLE_WAIT: Duration = Duration::from_secs(10);

/// Polling interval while waiting for busy workers to drain on stop.
const STOP_WAIT: Duration = Duration::from_secs(1);

/// One spawned worker process and its pipes.
#[derive(Debug)]
pub struct WorkerHandle {
    rank: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: ChildStdout,
    state: WorkerState,
    working_on: Option<WorkItem>,
}

impl WorkerHandle {
    /// Wrap a freshly spawned worker. The child must have been spawned
    /// with piped stdin and stdout.
    pub fn new(rank: usize, mut child: Child) -> Result<WorkerHandle> {
        let stdin = child.stdin.take().ok_or_else(|| {
            OptError::task_farm(format!("worker rank {rank} was spawned without piped stdin"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            OptError::task_farm(format!("worker rank {rank} was spawned without piped stdout"))
        })?;
        Ok(WorkerHandle {
            rank,
            child,
            stdin: Some(stdin),
            stdout,
            state: WorkerState::Waiting,
            working_on: None,
        })
    }
}

/// Master state: the workers, their in-flight items, and the send sequence.
#[derive(Debug)]
pub struct Master {
    workers: Vec<WorkerHandle>,
    seq: Sequence,
    stop: StopFlag,
}

impl Master {
    /// At least one worker is required; a farm with none is a
    /// configuration error, not something to limp along with.
    pub fn new(workers: Vec<WorkerHandle>, stop: StopFlag) -> Result<Master> {
        if workers.is_empty() {
            return Err(OptError::config(
                "cannot start the task farm without at least one worker",
            ));
        }
        Ok(Master {
            workers,
            seq: Sequence::new(),
            stop,
        })
    }

    /// Drive the farm until the sink reports that the search is over and
    /// every worker has acknowledged its STOP.
    ///
    /// Results may arrive in any order; each is attributed through the
    /// per-worker in-flight item, not through anything in the message.
    pub fn run(&mut self, sink: &mut dyn FitnessSink) -> Result<()> {
        info!(workers = self.workers.len(), "task farm starting");
        loop {
            let stopping = self.stop.is_set() || sink.stopping();
            if stopping {
                // Idle workers can be told to stop immediately; busy ones
                // are drained below. A worker that never reports back is a
                // known hang, mitigated by the external quit signal.
                for w in 0..self.workers.len() {
                    if self.workers[w].state == WorkerState::Waiting {
                        self.send_stop(w)?;
                    }
                }
                if self
                    .workers
                    .iter()
                    .all(|worker| worker.state == WorkerState::Stopped)
                {
                    debug!("all workers stopped; leaving the dispatch loop");
                    break;
                }
            } else {
                while let Some(w) = self.next_idle() {
                    match sink.next_work() {
                        Some(item) => self.dispatch(w, item)?,
                        None => break,
                    }
                }
            }

            let wait = if stopping { STOP_WAIT } else { IDLE_WAIT };
            if let Some(w) = self.poll_ready(wait)? {
                let (uid, fitness) = self.receive_result(w)?;
                sink.report_fitness(uid, fitness, 0)?;
            }
        }
        self.shutdown()
    }

    fn next_idle(&self) -> Option<usize> {
        self.workers
            .iter()
            .position(|worker| worker.state == WorkerState::Waiting && worker.working_on.is_none())
    }

    fn dispatch(&mut self, w: usize, item: WorkItem) -> Result<()> {
        let seq = self.seq.next();
        let worker = &mut self.workers[w];
        if let Some(old) = &worker.working_on {
            warn!(
                rank = worker.rank,
                uid = old.uid,
                "worker already had an item in flight; it is about to be lost"
            );
        }
        trace!(rank = worker.rank, uid = item.uid, seq, "sending work");
        let stdin = worker.stdin.as_mut().ok_or_else(|| {
            OptError::task_farm(format!("worker rank {} has no open pipe", worker.rank))
        })?;
        message::send_work(stdin, seq, item.uid, &item.command)?;
        worker.working_on = Some(item);
        worker.state = WorkerState::Busy;
        Ok(())
    }

    fn send_stop(&mut self, w: usize) -> Result<()> {
        let seq = self.seq.next();
        let worker = &mut self.workers[w];
        trace!(rank = worker.rank, seq, "sending stop");
        if let Some(stdin) = worker.stdin.as_mut() {
            message::send_stop(stdin, seq)?;
        }
        worker.working_on = None;
        worker.state = WorkerState::Stopped;
        Ok(())
    }

    /// Wait up to `timeout` for any busy worker's pipe to become readable.
    fn poll_ready(&self, timeout: Duration) -> Result<Option<usize>> {
        let busy: Vec<(usize, i32)> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, worker)| worker.state == WorkerState::Busy)
            .map(|(i, worker)| (i, worker.stdout.as_raw_fd()))
            .collect();
        if busy.is_empty() {
            // Nothing can arrive; just sleep briefly and let the caller
            // re-check the queue and the stop flag.
            std::thread::sleep(timeout.min(Duration::from_secs(1)));
            return Ok(None);
        }
        let mut fds: Vec<libc::pollfd> = busy
            .iter()
            .map(|&(_, fd)| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let rc = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout.as_millis() as libc::c_int,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                // A signal landed; the caller re-checks the stop flag.
                return Ok(None);
            }
            return Err(err.into());
        }
        if rc == 0 {
            return Ok(None);
        }
        for (slot, fd) in fds.iter().zip(&busy) {
            if slot.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                return Ok(Some(fd.0));
            }
        }
        Ok(None)
    }

    /// Read the RESULT a ready worker sent and free its in-flight item.
    fn receive_result(&mut self, w: usize) -> Result<(u32, f64)> {
        let worker = &mut self.workers[w];
        let (header, msg) = message::read_message(&mut worker.stdout)
            .map_err(|e| OptError::protocol(format!("rank {}: {e}", worker.rank)))?;
        let Message::Result { uid, fitness } = msg else {
            return Err(OptError::protocol(format!(
                "unexpected message type {} from rank {} (seq #{})",
                header.msg_type, worker.rank, header.seq
            )));
        };
        debug!(rank = worker.rank, uid, fitness, "received fitness");
        worker.state = WorkerState::Waiting;
        match worker.working_on.take() {
            Some(item) => {
                if item.uid != uid {
                    warn!(
                        rank = worker.rank,
                        sent = item.uid,
                        got = uid,
                        "result uid does not match the dispatched item"
                    );
                }
                Ok((item.uid, fitness))
            }
            None => {
                error!(
                    rank = worker.rank,
                    fitness, "received a fitness from a worker with nothing in flight"
                );
                Ok((uid, fitness))
            }
        }
    }

    /// Stop any stragglers and reap the worker processes.
    fn shutdown(&mut self) -> Result<()> {
        debug!("shutting down workers");
        for w in 0..self.workers.len() {
            if self.workers[w].state != WorkerState::Stopped {
                if let Err(e) = self.send_stop(w) {
                    warn!(rank = self.workers[w].rank, error = %e, "could not stop worker");
                }
            }
        }
        for worker in &mut self.workers {
            // Closing stdin unblocks a worker waiting for a message.
            drop(worker.stdin.take());
            match worker.child.wait() {
                Ok(status) => debug!(rank = worker.rank, %status, "worker exited"),
                Err(e) => warn!(rank = worker.rank, error = %e, "could not reap worker"),
            }
        }
        info!("task farm stopped");
        Ok(())
    }
}
