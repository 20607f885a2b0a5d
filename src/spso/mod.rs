// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Standard Particle Swarm Optimisation over a discrete flag lattice
//!
//! The search space is a product of integer [`Dimension`]s, one per compiler
//! flag. A [`Particle`] is a candidate solution trajectory: its current
//! [`Position`], a [`Velocity`] (really a displacement), and the best
//! position it has personally seen. The [`Swarm`](Swarm) is the fixed set of
//! particles; a single global neighbourhood informs all of them.
//!
//! The update rules follow Clerc's SPSO description
//! (<https://hal.archives-ouvertes.fr/file/index/docid/764996/filename/SPSO_descriptions.pdf>)
//! specialised for integer dimensions with periodic boundary confinement;
//! see [`engine::Spso`].

mod engine;
mod observers;

pub use engine::{Spso, Step, NO_MOVEMENT_THRESHOLD, OMEGA, SIGMA};
pub use observers::{BestRecord, ObserverRegistry, StopReason, SwarmEvent, SwarmObserver};

use crate::error::{OptError, Result};

/// The largest search space we are prepared to hold in memory.
pub const MAX_DIMENSIONS: usize = 4096;

/// Fitness values are benchmark wall-clock times; smaller is better, and
/// `f64::MAX` is the conventional "evaluation failed" value.
pub type Fitness = f64;

/// One integer axis of the search space. Valid values lie in `[min, max)`.
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    /// Matches the uid of the flag this dimension corresponds to.
    pub uid: i64,
    /// E.g. `loop-tile-size`; mainly for debugging and the store schema.
    pub name: String,
    /// Inclusive lower bound.
    pub min: i64,
    /// Exclusive upper bound.
    pub max: i64,
}

impl Dimension {
    /// Construct a dimension, insisting on a non-empty value range.
    pub fn new(uid: i64, name: impl Into<String>, min: i64, max: i64) -> Result<Dimension> {
        if max <= min {
            return Err(OptError::invalid_parameter(format!(
                "dimension {uid} has empty range [{min}, {max})"
            )));
        }
        Ok(Dimension {
            uid,
            name: name.into(),
            min,
            max,
        })
    }
}

/// A set of values, one per dimension: a point in the search space.
/// Positions are compared (and persisted) by content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position(pub Vec<i64>);

/// A signed displacement with one component per dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Velocity(pub Vec<i64>);

/// A candidate solution trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    /// Index of the particle within the swarm.
    pub uid: u32,
    pub position: Position,
    pub velocity: Velocity,
    /// Best position this particle has personally visited.
    pub best_position: Position,
    /// Smallest fitness ever observed at `best_position`.
    pub best_fitness: Fitness,
}

/// The fixed, ordered collection of particles. Particle `uid`s are their
/// indices and never change after construction.
#[derive(Debug, Clone)]
pub struct Swarm {
    particles: Vec<Particle>,
}

impl Swarm {
    /// Assemble a swarm from restored particles (uids must equal indices).
    pub fn from_particles(particles: Vec<Particle>) -> Result<Swarm> {
        for (i, p) in particles.iter().enumerate() {
            if p.uid as usize != i {
                return Err(OptError::invalid_parameter(format!(
                    "particle uid {} found at swarm index {}",
                    p.uid, i
                )));
            }
        }
        Ok(Swarm { particles })
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn get(&self, uid: u32) -> Option<&Particle> {
        self.particles.get(uid as usize)
    }

    pub fn get_mut(&mut self, uid: u32) -> Option<&mut Particle> {
        self.particles.get_mut(uid as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Particle> {
        self.particles.iter()
    }
}
