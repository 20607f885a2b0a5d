// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The SPSO engine proper: swarm state, the velocity/position update, the
//! stopping criteria and the global-best record.
//!
//! The engine never blocks and never evaluates anything itself. `start`
//! hands back the uids to enqueue; each fitness report comes in through
//! [`Spso::update_particle`], which either moves the particle and asks for
//! it to be re-enqueued or declares the search over.

use rand::Rng;
use tracing::{debug, info, trace, warn};

use super::observers::{BestRecord, ObserverRegistry, StopReason, SwarmEvent, SwarmObserver};
use super::{Dimension, Fitness, Particle, Position, Swarm, Velocity, MAX_DIMENSIONS};
use crate::error::{OptError, Result};
use crate::random::{Well512a, DEFAULT_SEED_WORD};

/// "A bit beyond": how far past the attractors the centre of gravity is
/// placed. From Clerc's work on PSO stagnation.
pub const SIGMA: f64 = 1.193;

/// Inertia weight applied to the previous velocity.
pub const OMEGA: f64 = 0.721;

/// Fitness evaluations without improvement before the search is declared
/// converged. An arbitrary choice that has worked well in practice.
pub const NO_MOVEMENT_THRESHOLD: i64 = 200;

/// What the engine wants done with a particle after a fitness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The particle moved; enqueue it for evaluation at its new position.
    Requeue(u32),
    /// A stopping criterion fired; no further work for this particle.
    Stopped,
}

/// The Standard Particle Swarm Optimisation engine, specialised for integer
/// dimensions with a single global neighbourhood.
pub struct Spso {
    dimensions: Vec<Dimension>,
    swarm: Swarm,
    best_position: Position,
    best_fitness: Fitness,
    previous_best_fitness: Fitness,
    previous_previous_best_fitness: Fitness,
    epsilon: f64,
    no_movement: i64,
    stop: Option<StopReason>,
    observers: ObserverRegistry,
    rng: Well512a,
}

impl Spso {
    /// Create a fresh engine with the default seed. Swarm size is `D + 1`.
    pub fn new(dimensions: Vec<Dimension>, epsilon: f64) -> Result<Spso> {
        Spso::with_seed(dimensions, epsilon, DEFAULT_SEED_WORD)
    }

    /// Create a fresh engine seeded from a single word.
    ///
    /// Each particle starts at a uniformly random position with an
    /// independent random previous-best. Velocities start at zero: random
    /// initial velocities were suggested in the literature but tended to
    /// push the swarm out of the space before any fitness arrived.
    pub fn with_seed(dimensions: Vec<Dimension>, epsilon: f64, seed_word: u32) -> Result<Spso> {
        Spso::check_dimensions(&dimensions)?;
        let mut rng = Well512a::from_word(seed_word);
        let n = dimensions.len();
        let particles = (0..(n as u32 + 1))
            .map(|uid| {
                let mut position = Vec::with_capacity(n);
                let mut best = Vec::with_capacity(n);
                for dim in &dimensions {
                    position.push(rng.uniform_int(dim.min, dim.max - 1));
                    best.push(rng.uniform_int(dim.min, dim.max - 1));
                }
                Particle {
                    uid,
                    position: Position(position),
                    velocity: Velocity(vec![0; n]),
                    best_position: Position(best),
                    best_fitness: f64::MAX,
                }
            })
            .collect();
        let best_position = Spso::random_position(&dimensions, &mut rng);
        Ok(Spso {
            dimensions,
            swarm: Swarm::from_particles(particles)?,
            best_position,
            best_fitness: f64::MAX,
            // -1 rather than MAX so that a failed very first evaluation
            // cannot satisfy the convergence deltas.
            previous_best_fitness: -1.0,
            previous_previous_best_fitness: -1.0,
            epsilon,
            no_movement: 0,
            stop: None,
            observers: ObserverRegistry::new(),
            rng,
        })
    }

    /// Restore the engine from a checkpointed swarm and global-best record.
    ///
    /// The generator is re-seeded from the persisted seed word but the
    /// stream is not re-advanced: the asynchronous farm makes bit-identical
    /// replay impossible anyway, so resumed searches are equivalent, not
    /// identical.
    #[allow(clippy::too_many_arguments)]
    pub fn from_previous(
        dimensions: Vec<Dimension>,
        swarm: Swarm,
        epsilon: f64,
        best: Option<(Position, Fitness)>,
        previous_best_fitness: Fitness,
        previous_previous_best_fitness: Fitness,
        no_movement: i64,
        seed_word: u32,
    ) -> Result<Spso> {
        Spso::check_dimensions(&dimensions)?;
        for particle in swarm.iter() {
            if particle.position.0.len() != dimensions.len() {
                return Err(OptError::invalid_parameter(format!(
                    "restored particle {} has {} components, expected {}",
                    particle.uid,
                    particle.position.0.len(),
                    dimensions.len()
                )));
            }
        }
        let mut rng = Well512a::from_word(seed_word);
        let (best_position, best_fitness, previous, previous_previous) = match best {
            Some((position, fitness)) => (
                position,
                fitness,
                previous_best_fitness,
                previous_previous_best_fitness,
            ),
            None => (
                Spso::random_position(&dimensions, &mut rng),
                f64::MAX,
                f64::MAX,
                f64::MAX,
            ),
        };
        Ok(Spso {
            dimensions,
            swarm,
            best_position,
            best_fitness,
            previous_best_fitness: previous,
            previous_previous_best_fitness: previous_previous,
            epsilon,
            no_movement,
            stop: None,
            observers: ObserverRegistry::new(),
            rng,
        })
    }

    fn check_dimensions(dimensions: &[Dimension]) -> Result<()> {
        if dimensions.is_empty() || dimensions.len() >= MAX_DIMENSIONS {
            return Err(OptError::invalid_parameter(format!(
                "search space must have between 1 and {} dimensions, got {}",
                MAX_DIMENSIONS - 1,
                dimensions.len()
            )));
        }
        Ok(())
    }

    fn random_position(dimensions: &[Dimension], rng: &mut Well512a) -> Position {
        Position(
            dimensions
                .iter()
                .map(|dim| rng.uniform_int(dim.min, dim.max - 1))
                .collect(),
        )
    }

    /// Register an observer for a swarm event.
    pub fn register_observer(&mut self, event: SwarmEvent, observer: Box<dyn SwarmObserver>) {
        self.observers.register(event, observer);
    }

    /// The uids to enqueue to start (or restart) the search. Evaluation is
    /// asynchronous; this returns immediately.
    pub fn start(&self) -> Vec<u32> {
        trace!("starting search over {} particles", self.swarm.len());
        self.swarm.iter().map(|p| p.uid).collect()
    }

    /// Feed a fitness report back into the swarm.
    ///
    /// `visits` is how many times this position had been assessed before;
    /// `known_positions` how many distinct positions exist so far. Both
    /// drive the random-jump rule for over-visited positions.
    pub fn update_particle(
        &mut self,
        uid: u32,
        fitness: Fitness,
        visits: i64,
        known_positions: i64,
    ) -> Result<Step> {
        trace!(uid, fitness, "updating particle");
        let particle = self
            .swarm
            .get_mut(uid)
            .ok_or_else(|| OptError::invalid_parameter(format!("no particle with uid {uid}")))?;
        if fitness < particle.best_fitness {
            particle.best_fitness = fitness;
            particle.best_position = particle.position.clone();
        }
        let position = particle.position.clone();
        if self.should_stop(fitness, &position) {
            return Ok(Step::Stopped);
        }
        let Spso {
            dimensions,
            swarm,
            best_position,
            rng,
            ..
        } = self;
        let particle = swarm
            .get_mut(uid)
            .ok_or_else(|| OptError::invalid_parameter(format!("no particle with uid {uid}")))?;
        Spso::move_particle(dimensions, rng, best_position, particle, visits, known_positions);
        Ok(Step::Requeue(uid))
    }

    /// Check the stopping criteria for a just-reported fitness, updating the
    /// global-best record and the no-movement counter on the way.
    ///
    /// Progress smaller than the experimental error is not progress: once
    /// the last few global-best improvements all sit within two standard
    /// deviations of one another, or nothing has improved for
    /// [`NO_MOVEMENT_THRESHOLD`] reports, the search stops.
    fn should_stop(&mut self, fitness: Fitness, position: &Position) -> bool {
        trace!(
            "assessing fitness {:.6e} against current best {:.6e}",
            fitness,
            self.best_fitness
        );
        if self.stop.is_some() {
            debug!("stopping, so not checking for convergence");
            return true;
        }

        if fitness >= self.best_fitness {
            self.no_movement += 1;
            debug!(
                counter = self.no_movement,
                "fitness {:.6e} does not improve on {:.6e}", fitness, self.best_fitness
            );
            if self.no_movement >= NO_MOVEMENT_THRESHOLD {
                info!(
                    "converged on best fitness {:.6e} after {} reports without movement",
                    self.best_fitness, self.no_movement
                );
                self.trigger_stop(StopReason::NoMovement);
            }
            return self.stop.is_some();
        }

        self.no_movement = 0;
        self.update_global_best(fitness, position);
        // fitness is a mean; epsilon is the % of it representing expected
        // experimental scatter.
        let two_sigma = fitness * (self.epsilon / 100.0) * 2.0;
        if (self.previous_previous_best_fitness - self.previous_best_fitness).abs() < two_sigma
            && (self.previous_best_fitness - self.best_fitness).abs() < two_sigma
            && (self.best_fitness - fitness).abs() < two_sigma
        {
            info!("converged on best fitness {:.6e}", fitness);
            self.trigger_stop(StopReason::Converged);
        }
        self.stop.is_some()
    }

    /// Shift the global-best triple. Only called with a strictly improving
    /// fitness.
    fn update_global_best(&mut self, fitness: Fitness, position: &Position) {
        if self.best_fitness > fitness {
            debug!("updating global best fitness to {:.6e}", fitness);
            self.previous_previous_best_fitness = self.previous_best_fitness;
            self.previous_best_fitness = self.best_fitness;
            self.best_fitness = fitness;
            self.best_position = position.clone();
            let record = self.best();
            self.observers.notify(SwarmEvent::GlobalBestUpdate, &record);
        }
    }

    fn trigger_stop(&mut self, reason: StopReason) {
        if self.stop.is_some() {
            return;
        }
        self.stop = Some(reason);
        let record = self.best();
        self.observers.notify(SwarmEvent::Stop, &record);
    }

    /// Ask the engine to stop. Takes effect at the next report; work already
    /// in flight in the farm finishes on its own.
    pub fn request_stop(&mut self) {
        trace!("external stop requested");
        self.trigger_stop(StopReason::External);
    }

    /// Whether a stop has been decided or requested.
    pub fn is_stopping(&self) -> bool {
        self.stop.is_some()
    }

    /// Snapshot of the global-best record.
    pub fn best(&self) -> BestRecord {
        BestRecord {
            position: self.best_position.clone(),
            current: self.best_fitness,
            previous: self.previous_best_fitness,
            previous_previous: self.previous_previous_best_fitness,
            no_movement: self.no_movement,
            stop_reason: self.stop,
            prng_iteration: self.rng.iteration(),
        }
    }

    pub fn particle(&self, uid: u32) -> Option<&Particle> {
        self.swarm.get(uid)
    }

    pub fn swarm(&self) -> &Swarm {
        &self.swarm
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn no_movement_counter(&self) -> i64 {
        self.no_movement
    }

    /// Words drawn from the generator so far.
    pub fn rng_iteration(&self) -> u64 {
        self.rng.iteration()
    }

    /// Compute a new velocity and position for one particle.
    ///
    /// The centre of gravity G combines the current position, a point a bit
    /// beyond the personal best, and the global best (Clerc eq. 3.10, or
    /// 3.13 when the particle *is* the global best, where the social term
    /// degenerates). A random point is drawn from the bounding cube of the
    /// hypersphere around G intersected with the search space, inertia is
    /// applied, and the result is folded back into the space with periodic
    /// boundary conditions and a per-particle dampening factor.
    fn move_particle(
        dimensions: &[Dimension],
        rng: &mut Well512a,
        global_best: &Position,
        particle: &mut Particle,
        visits: i64,
        known_positions: i64,
    ) {
        let n = dimensions.len();
        if visits > 0 {
            debug!(
                uid = particle.uid,
                visits, "particle sat on an already-visited position"
            );
        }

        // Visiting a point much more often than the average warrants a
        // random jump: more than 2*max(1, visits/known_positions) visits,
        // with probability one half.
        let known = known_positions.max(1);
        let max_visits = (2 * visits / known).max(2);
        if visits > max_visits && rng.uniform_int(0, 1) == 1 {
            warn!(
                uid = particle.uid,
                "just visited a frequently (>{max_visits} times) visited position; moving to a random point"
            );
            for (i, dim) in dimensions.iter().enumerate() {
                particle.position.0[i] = rng.uniform_int(dim.min, dim.max - 1);
                particle.velocity.0[i] = rng.uniform_int(dim.min, dim.max - 1);
            }
            return;
        }

        let is_best = particle.best_position == *global_best;

        let mut gravity = vec![0.0f64; n];
        let mut sum_sq = 0.0f64;
        for (i, dim) in dimensions.iter().enumerate() {
            let x = particle.position.0[i] as f64;
            let l = particle.best_position.0[i] as f64;
            let p = global_best.0[i] as f64;
            // Doubles throughout: sigma times an int can overflow an int,
            // and a long would lose bits under sigma anyway.
            let g = if is_best {
                x + SIGMA * (l - x) / 2.0
            } else {
                x + SIGMA * ((p + l - 2.0 * x) / 3.0)
            };
            let g = g.clamp(dim.min as f64, dim.max as f64);
            sum_sq += (g - x) * (g - x);
            gravity[i] = g;
        }
        // If G lands on a boundary the hypersphere may poke out of the
        // space; the draw below is clamped to the intersection.
        let radius = sum_sq.sqrt().floor();
        trace!(
            uid = particle.uid,
            radius,
            "hypersphere radius (sum of squares {sum_sq:.6e})"
        );

        let mut x_dash = vec![0i64; n];
        for (i, dim) in dimensions.iter().enumerate() {
            let lo = ((gravity[i] - radius).max(dim.min as f64).floor() as i64)
                .clamp(dim.min, dim.max - 1);
            let hi = ((gravity[i] + radius).min((dim.max - 1) as f64).floor() as i64)
                .clamp(dim.min, dim.max - 1);
            x_dash[i] = rng.uniform_int(lo.min(hi), lo.max(hi));
        }

        let dampen: f64 = rng.random();
        trace!(uid = particle.uid, dampen, "dampening factor");
        for (i, dim) in dimensions.iter().enumerate() {
            let x = particle.position.0[i] as f64;
            let v = particle.velocity.0[i] as f64;
            let lo = dim.min as f64;
            let hi = dim.max as f64;
            let mut new_v = OMEGA * v + x_dash[i] as f64 - x;
            let mut new_x = OMEGA * v + x_dash[i] as f64;

            // Periodic boundary conditions, an idea borrowed from molecular
            // dynamics, keep the particle inside the space; the dampening
            // stops it bouncing between the walls forever.
            let mut folds = 0u32;
            while new_x > hi || new_x < lo {
                if folds > 64 {
                    warn!(
                        uid = particle.uid,
                        "boundary folding is not settling; using random values instead"
                    );
                    new_x = rng.uniform_int(dim.min, dim.max - 1) as f64;
                    new_v = rng.uniform_int(dim.min, dim.max - 1) as f64;
                    break;
                }
                folds += 1;
                if new_x > hi {
                    new_x = lo + (new_x - hi) % (hi - lo);
                } else {
                    new_x = hi - (lo - new_x) % (hi - lo);
                }
                new_x *= dampen;
                new_v = new_x - x;
            }

            particle.position.0[i] = (new_x as i64).clamp(dim.min, dim.max - 1);
            particle.velocity.0[i] = new_v as i64;
            trace!(
                uid = particle.uid,
                dim = dim.uid,
                position = particle.position.0[i],
                velocity = particle.velocity.0[i],
                "moved"
            );
        }
    }
}
