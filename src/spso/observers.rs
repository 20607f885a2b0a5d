// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed event listeners for the swarm engine.
//!
//! The registry is fixed at compile time: [`SwarmEvent::GlobalBestUpdate`]
//! and [`SwarmEvent::Stop`] are dispatched; registrations for the other two
//! events are accepted (so callers need not care which build they run
//! against) but never fire.

use tracing::{debug, error, warn};

use super::{Fitness, Position};
use crate::error::Result;

/// The events an observer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmEvent {
    /// The global best position improved.
    GlobalBestUpdate,
    /// A particle moved. Accepted but never dispatched.
    ParticleMove,
    /// A position received a fitness. Accepted but never dispatched.
    PositionFitness,
    /// The engine decided (or was told) to stop searching.
    Stop,
}

/// Why the engine stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The last few global-best improvements were all within experimental
    /// error of one another.
    Converged,
    /// Too many fitness reports in a row failed to improve the best.
    NoMovement,
    /// An external request, e.g. the configured quit signal.
    External,
}

impl StopReason {
    /// Whether the stop was the search's own decision rather than the
    /// operator's.
    pub fn is_convergence(self) -> bool {
        matches!(self, StopReason::Converged | StopReason::NoMovement)
    }
}

/// Snapshot of the global-best record handed to observers.
#[derive(Debug, Clone)]
pub struct BestRecord {
    /// Owned copy of the best position seen so far.
    pub position: Position,
    /// Best fitness so far.
    pub current: Fitness,
    /// The best before that.
    pub previous: Fitness,
    /// And the one before that.
    pub previous_previous: Fitness,
    /// Consecutive non-improving reports.
    pub no_movement: i64,
    /// Set once the engine has stopped.
    pub stop_reason: Option<StopReason>,
    /// Words drawn from the PRNG so far; checkpointed for analysis.
    pub prng_iteration: u64,
}

/// An interface every swarm observer implements.
pub trait SwarmObserver {
    /// Called when the subscribed event fires, with a snapshot of the
    /// global-best record.
    fn notify(&mut self, event: SwarmEvent, best: &BestRecord) -> Result<()>;
}

/// Per-event observer lists, notified in registration order.
#[derive(Default)]
pub struct ObserverRegistry {
    global_best: Vec<Box<dyn SwarmObserver>>,
    stop: Vec<Box<dyn SwarmObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for `event`. Registrations for events that are
    /// not dispatched are accepted and dropped with a warning, matching the
    /// behaviour callers have always seen.
    pub fn register(&mut self, event: SwarmEvent, observer: Box<dyn SwarmObserver>) {
        match event {
            SwarmEvent::GlobalBestUpdate => self.global_best.push(observer),
            SwarmEvent::Stop => self.stop.push(observer),
            SwarmEvent::ParticleMove | SwarmEvent::PositionFitness => {
                warn!(?event, "observers for this event are never notified");
            }
        }
    }

    /// Notify every observer registered for `event`. Observer failures are
    /// logged, not propagated: a broken listener must not stop the search.
    pub fn notify(&mut self, event: SwarmEvent, best: &BestRecord) {
        let list = match event {
            SwarmEvent::GlobalBestUpdate => &mut self.global_best,
            SwarmEvent::Stop => &mut self.stop,
            SwarmEvent::ParticleMove | SwarmEvent::PositionFitness => {
                debug!(?event, "no dispatch for this event");
                return;
            }
        };
        for observer in list.iter_mut() {
            if let Err(e) = observer.notify(event, best) {
                error!(?event, error = %e, "swarm observer failed");
            }
        }
    }
}
