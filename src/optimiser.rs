// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Optimiser glue
//!
//! Maps compiler flags onto search dimensions, renders positions back into
//! flags strings, and marshals fitness between the task farm, the SPSO
//! engine and the store. Checkpointing lives here too: the scalar state
//! needed for a resume is written after every report and again from the
//! engine's global-best and stop events.

use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;

use tracing::{debug, error, info, trace, warn};

use crate::config::{Flag, FlagKind, SearchConfig};
use crate::error::{OptError, Result};
use crate::signal::StopFlag;
use crate::spso::{
    BestRecord, Dimension, Position, Spso, Step, StopReason, SwarmEvent, SwarmObserver,
};
use crate::store::{Opening, Store};
use crate::taskfarm::{FitnessSink, WorkItem, WorkQueue};

/// Name of the store file, created in the working directory.
pub const DB_FILE: &str = "optsearch.sqlite";

/// Build one search dimension per flag.
///
/// On-off flags span `{0, 1}`; list flags index their value table; range
/// flags span `[min, max]` inclusive. A range whose configured `max` is not
/// above its `min` gets a guessed upper bound so the search can proceed,
/// but the configuration needs fixing.
pub fn dimensions_for_flags(flags: &[Flag]) -> Result<Vec<Dimension>> {
    flags
        .iter()
        .map(|flag| {
            let (min, max) = match &flag.kind {
                FlagKind::OnOff { .. } => (0, 2),
                FlagKind::List { values, .. } => (0, values.len() as i64),
                FlagKind::Range {
                    min, max, default, ..
                } => {
                    if *max <= *min {
                        let substitute = match default {
                            Some(d) if *d > *min => 2 * d,
                            _ => 100,
                        };
                        warn!(
                            flag = %flag.name,
                            "range flag has max <= min; guessing an upper bound of {substitute} \
                             (the configuration should be corrected)"
                        );
                        (*min, substitute + 1)
                    } else {
                        (*min, max + 1)
                    }
                }
            };
            Dimension::new(flag.uid, flag.name.clone(), min, max)
        })
        .collect()
}

/// Writes the resumable scalar state: the three historical best fitnesses,
/// the best position (and its id), the no-movement counter and the PRNG
/// iteration count. The swarm is *not* re-persisted here; every particle
/// update already wrote it.
fn write_checkpoint(store: &Store, best: &BestRecord) -> Result<()> {
    store.set_previous_previous_best(best.previous_previous)?;
    store.set_previous_best(best.previous)?;
    store.store_current_best(&best.position, best.current)?;
    store.set_no_movement_counter(best.no_movement)?;
    store.set_prng_iteration(best.prng_iteration)?;
    Ok(())
}

/// Checkpoints on every global-best improvement.
struct CheckpointObserver {
    store: Rc<Store>,
}

impl SwarmObserver for CheckpointObserver {
    fn notify(&mut self, _event: SwarmEvent, best: &BestRecord) -> Result<()> {
        write_checkpoint(&self.store, best)
    }
}

/// Marks the store converged when the engine stops of its own accord, and
/// takes a final checkpoint either way.
struct StopObserver {
    store: Rc<Store>,
}

impl SwarmObserver for StopObserver {
    fn notify(&mut self, _event: SwarmEvent, best: &BestRecord) -> Result<()> {
        if best.stop_reason.is_some_and(StopReason::is_convergence) {
            self.store.set_converged(true)?;
        }
        write_checkpoint(&self.store, best)
    }
}

/// The coordinator-side glue object: engine, store and work queue.
pub struct Optimiser {
    flags: Vec<Flag>,
    dimensions: Vec<Dimension>,
    spso: Spso,
    store: Rc<Store>,
    queue: WorkQueue,
    stop: StopFlag,
    finished: bool,
}

impl Optimiser {
    /// Open (or resume) the store at `db_path` and build the engine.
    pub fn new(config: &SearchConfig, db_path: &Path, stop: StopFlag) -> Result<Optimiser> {
        let flags = config.flags()?;
        let dimensions = dimensions_for_flags(&flags)?;
        if dimensions.is_empty() {
            return Err(OptError::config(
                "the search space has no dimensions; configure at least one compiler flag",
            ));
        }
        info!(
            "from {} flags, search space has {} dimensions",
            flags.len(),
            dimensions.len()
        );

        let (store, opening) = Store::open(db_path, &dimensions, &flags)?;
        let store = Rc::new(store);

        let mut spso = match opening {
            Opening::Fresh => {
                store.set_prng_seed(crate::random::DEFAULT_SEED_WORD)?;
                Spso::new(dimensions.clone(), config.epsilon)?
            }
            Opening::Resumed => Optimiser::resume(config, &store, &dimensions)?,
        };

        spso.register_observer(
            SwarmEvent::GlobalBestUpdate,
            Box::new(CheckpointObserver {
                store: store.clone(),
            }),
        );
        spso.register_observer(
            SwarmEvent::Stop,
            Box::new(StopObserver {
                store: store.clone(),
            }),
        );

        Ok(Optimiser {
            flags,
            dimensions,
            spso,
            store,
            queue: WorkQueue::new(),
            stop,
            finished: false,
        })
    }

    /// Rebuild the engine from persisted state.
    fn resume(config: &SearchConfig, store: &Store, dimensions: &[Dimension]) -> Result<Spso> {
        if store.converged()? {
            info!("store records a converged search; it will pick up where it stopped");
        }
        let seed = store
            .prng_seed()?
            .unwrap_or(crate::random::DEFAULT_SEED_WORD);
        let swarm = store.load_swarm()?;
        if swarm.len() != dimensions.len() + 1 {
            warn!(
                "store holds {} particles but the swarm needs {}; starting a fresh swarm",
                swarm.len(),
                dimensions.len() + 1
            );
            return Spso::with_seed(dimensions.to_vec(), config.epsilon, seed);
        }
        let best = store.load_current_best()?;
        let previous_best = store.previous_best()?;
        let previous_previous_best = store.previous_previous_best()?;
        let no_movement = store.no_movement_counter()?;
        debug!(
            "resuming with bests {:.6e} / {:.6e} / {:.6e}, {} reports without movement, \
             PRNG iteration {}",
            best.as_ref().map(|(_, f)| *f).unwrap_or(f64::MAX),
            previous_best,
            previous_previous_best,
            no_movement,
            store.prng_iteration()?
        );
        Spso::from_previous(
            dimensions.to_vec(),
            swarm,
            config.epsilon,
            best,
            previous_best,
            previous_previous_best,
            no_movement,
            seed,
        )
    }

    /// Enqueue an evaluation for every particle. Returns immediately; the
    /// task farm does the evaluating.
    pub fn start(&mut self) -> Result<()> {
        for uid in self.spso.start() {
            self.submit(uid)?;
        }
        Ok(())
    }

    /// Either short-circuit a particle whose position is already known, or
    /// render and queue it for evaluation.
    fn submit(&mut self, uid: u32) -> Result<()> {
        match self.short_circuit_or_enqueue(uid)? {
            Some((fitness, visits)) => self.report_fitness(uid, fitness, visits),
            None => Ok(()),
        }
    }

    /// If the particle's position already has a trustworthy fitness in the
    /// store (recorded, finite, seen more than once), hand that back
    /// instead of burning a worker on it. Otherwise queue a work item.
    fn short_circuit_or_enqueue(&mut self, uid: u32) -> Result<Option<(f64, i64)>> {
        if self.stopping() {
            debug!(uid, "not queueing more work while stopping");
            return Ok(None);
        }
        let Some(particle) = self.spso.particle(uid) else {
            error!(uid, "no such particle to enqueue");
            return Ok(None);
        };
        let position = particle.position.clone();
        if let Some(id) = self.store.find_position(&position)? {
            let visits = self.store.position_visits(id)?;
            if visits > 1 {
                if let Some(fitness) = self.store.position_fitness(id)? {
                    if fitness < f64::MAX {
                        debug!(
                            uid,
                            visits, "position already evaluated; replaying the stored fitness"
                        );
                        return Ok(Some((fitness, visits)));
                    }
                }
            }
        }
        let command = self.render_position(&position);
        trace!(uid, command = %command, "queueing work item");
        self.queue.push(WorkItem { uid, command });
        Ok(None)
    }

    /// Render one dimension's value as a command-line fragment. Returns the
    /// empty string for anything out of range; empty fragments are never
    /// handed to a compiler.
    fn fragment(&self, index: usize, value: i64) -> String {
        let flag = &self.flags[index];
        let dimension = &self.dimensions[index];
        match &flag.kind {
            FlagKind::OnOff { off_prefix } => match value {
                1 => format!("{}{}", flag.prefix, flag.name),
                0 => format!("{}{}", off_prefix, flag.name),
                _ => {
                    debug!(flag = %flag.name, value, "value out of range");
                    String::new()
                }
            },
            FlagKind::List { separator, values } => {
                let Some(separator) = separator else {
                    error!(
                        "check your YAML: list flag '{}' has no separator",
                        flag.name
                    );
                    return String::new();
                };
                match usize::try_from(value).ok().and_then(|v| values.get(v)) {
                    Some(item) => {
                        format!("{}{}{}{}", flag.prefix, flag.name, separator, item)
                    }
                    None => {
                        debug!(flag = %flag.name, value, "value out of range");
                        String::new()
                    }
                }
            }
            FlagKind::Range { separator, .. } => {
                let Some(separator) = separator else {
                    error!(
                        "check your YAML: range flag '{}' has no separator",
                        flag.name
                    );
                    return String::new();
                };
                if value >= dimension.min && value < dimension.max {
                    format!("{}{}{}{}", flag.prefix, flag.name, separator, value)
                } else {
                    debug!(flag = %flag.name, value, "value out of range");
                    String::new()
                }
            }
        }
    }

    /// Render a whole position as the space-separated non-empty fragments.
    pub fn render_position(&self, position: &Position) -> String {
        let fragments: Vec<String> = position
            .0
            .iter()
            .enumerate()
            .map(|(i, &value)| self.fragment(i, value))
            .filter(|fragment| !fragment.is_empty())
            .collect();
        fragments.join(" ")
    }

    /// Persist the resumable scalars and log the best answer so far.
    pub fn checkpoint(&self) -> Result<()> {
        let best = self.spso.best();
        write_checkpoint(&self.store, &best)?;
        info!(
            "best answer so far: fitness {:.6e}, flags: {}",
            best.current,
            self.render_position(&best.position)
        );
        Ok(())
    }

    /// Wind the search down: stop the engine, checkpoint, and print the
    /// best flags found.
    pub fn finish(&mut self) -> Result<()> {
        if !self.finished {
            self.finished = true;
            self.spso.request_stop();
        }
        self.checkpoint()?;
        let best = self.spso.best();
        let flags = self.render_position(&best.position);
        println!(
            "Best answer so far:\n\tFitness: {:.6e}\n\tFlags:\n{}",
            best.current, flags
        );
        Ok(())
    }

    /// The engine's view of the best record (for callers and tests).
    pub fn best(&self) -> BestRecord {
        self.spso.best()
    }

    /// The store handle (read-only use).
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn particle_position(&self, uid: u32) -> Option<Position> {
        self.spso.particle(uid).map(|p| p.position.clone())
    }
}

impl FitnessSink for Optimiser {
    /// A fitness came back for `uid`: feed the engine, persist the moved
    /// particle, attribute the fitness to the position that was actually
    /// evaluated, checkpoint, and queue the follow-up evaluation.
    ///
    /// Store failures while persisting a particle are recorded but do not
    /// kill the run; singleton (checkpoint) failures do.
    fn report_fitness(&mut self, uid: u32, fitness: f64, visits: i64) -> Result<()> {
        let mut pending = VecDeque::from([(uid, fitness, visits)]);
        while let Some((uid, fitness, visits)) = pending.pop_front() {
            trace!(uid, fitness, visits, "received fitness");
            if self.finished {
                debug!("ignoring reported fitness as we are stopping");
                return Ok(());
            }
            let Some(evaluated) = self.particle_position(uid) else {
                error!(uid, "fitness reported for an unknown particle");
                return Ok(());
            };
            let known_positions = match self.store.position_count() {
                Ok(count) => count,
                Err(e) => {
                    error!(error = %e, "could not count known positions");
                    0
                }
            };
            let step = self
                .spso
                .update_particle(uid, fitness, visits, known_positions)?;

            if let Some(particle) = self.spso.particle(uid) {
                if let Err(e) = self.store.update_particle(particle) {
                    error!(uid, error = %e, "could not persist particle");
                }
            }
            match self.store.store_position(&evaluated) {
                Ok(id) => {
                    if let Err(e) = self.store.update_position_fitness(id, fitness) {
                        error!(id, error = %e, "could not record position fitness");
                    }
                }
                Err(e) => error!(error = %e, "could not intern evaluated position"),
            }

            self.checkpoint()?;

            if let Step::Requeue(uid) = step {
                if let Some(replay) = self.short_circuit_or_enqueue(uid)? {
                    pending.push_back((uid, replay.0, replay.1));
                }
            }
        }
        Ok(())
    }

    fn next_work(&mut self) -> Option<WorkItem> {
        self.queue.pop()
    }

    fn stopping(&self) -> bool {
        self.finished || self.stop.is_set() || self.spso.is_stopping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlagRecord;

    fn flags() -> Vec<Flag> {
        let records: Vec<FlagRecord> = serde_yaml::from_str(
            r#"
- name: unroll-loops
  type: on-off
  prefix: "-f"
  off-prefix: "-fno-"
- name: max-unroll-times
  type: range
  prefix: "--param "
  separator: "="
  min: 2
  max: 8
- name: fp-contract
  type: list
  prefix: "-f"
  separator: "="
  values: ["off", "on", "fast"]
"#,
        )
        .unwrap();
        Flag::from_records(&records).unwrap()
    }

    fn test_config(epsilon: f64) -> SearchConfig {
        SearchConfig {
            quit_signal: "SIGUSR1".into(),
            clean_script: "true".into(),
            build_script: "true".into(),
            accuracy_test: "true".into(),
            performance_test: "true".into(),
            timeout: 5,
            benchmark_timeout: 5,
            benchmark_repeats: 1,
            epsilon,
            compiler: crate::config::CompilerConfig {
                name: Some("gcc".into()),
                version: None,
                flags: serde_yaml::from_str(
                    r#"
- name: unroll-loops
  type: on-off
  prefix: "-f"
  off-prefix: "-fno-"
- name: max-unroll-times
  type: range
  prefix: "--param "
  separator: "="
  min: 2
  max: 8
- name: fp-contract
  type: list
  prefix: "-f"
  separator: "="
  values: ["off", "on", "fast"]
"#,
                )
                .unwrap(),
            },
        }
    }

    #[test]
    fn dimensions_follow_the_flag_types() {
        let dims = dimensions_for_flags(&flags()).unwrap();
        assert_eq!(dims[0].min, 0);
        assert_eq!(dims[0].max, 2);
        assert_eq!(dims[1].min, 2);
        assert_eq!(dims[1].max, 9); // inclusive 8 becomes exclusive 9
        assert_eq!(dims[2].min, 0);
        assert_eq!(dims[2].max, 3);
    }

    #[test]
    fn broken_range_bounds_get_the_heuristic() {
        let records: Vec<FlagRecord> = serde_yaml::from_str(
            r#"
- name: with-default
  type: range
  prefix: "-f"
  separator: "="
  min: 4
  max: 4
  default: 16
- name: without-default
  type: range
  prefix: "-f"
  separator: "="
  min: 0
  max: -1
"#,
        )
        .unwrap();
        let dims = dimensions_for_flags(&Flag::from_records(&records).unwrap()).unwrap();
        // The guessed upper bounds are inclusive flag maxima, so the
        // exclusive dimension bound is one above, as for configured ranges.
        assert_eq!((dims[0].min, dims[0].max), (4, 33));
        assert_eq!((dims[1].min, dims[1].max), (0, 101));
    }

    fn optimiser(dir: &std::path::Path, epsilon: f64) -> Optimiser {
        let config = test_config(epsilon);
        Optimiser::new(&config, &dir.join(DB_FILE), StopFlag::new()).unwrap()
    }

    #[test]
    fn fragments_render_per_flag_type() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimiser(dir.path(), 5.0);

        assert_eq!(opt.fragment(0, 1), "-funroll-loops");
        assert_eq!(opt.fragment(0, 0), "-fno-unroll-loops");
        assert_eq!(opt.fragment(0, 2), "");

        assert_eq!(opt.fragment(1, 4), "--param max-unroll-times=4");
        assert_eq!(opt.fragment(1, 8), "--param max-unroll-times=8");
        assert_eq!(opt.fragment(1, 9), "");
        assert_eq!(opt.fragment(1, 1), "");

        assert_eq!(opt.fragment(2, 0), "-ffp-contract=off");
        assert_eq!(opt.fragment(2, 2), "-ffp-contract=fast");
        assert_eq!(opt.fragment(2, 3), "");
    }

    #[test]
    fn every_in_range_value_renders_uniquely() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimiser(dir.path(), 5.0);
        for (i, dim) in opt.dimensions.iter().enumerate() {
            let mut seen = std::collections::HashSet::new();
            for value in dim.min..dim.max {
                let fragment = opt.fragment(i, value);
                assert!(!fragment.is_empty(), "dim {i} value {value}");
                assert!(seen.insert(fragment), "dim {i} value {value} not unique");
            }
        }
    }

    #[test]
    fn rendered_positions_recover_their_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let opt = optimiser(dir.path(), 5.0);
        let position = Position(vec![0, 5, 2]);
        let rendered = opt.render_position(&position);
        assert_eq!(
            rendered,
            "-fno-unroll-loops --param max-unroll-times=5 -ffp-contract=fast"
        );
        // Each fragment is recoverable from the joined string.
        for (i, &value) in position.0.iter().enumerate() {
            assert!(rendered.contains(&opt.fragment(i, value)));
        }
    }

    #[test]
    fn start_queues_every_particle() {
        let dir = tempfile::tempdir().unwrap();
        let mut opt = optimiser(dir.path(), 5.0);
        opt.start().unwrap();
        let expected = opt.dimensions.len() + 1;
        let mut uids = Vec::new();
        while let Some(item) = opt.next_work() {
            uids.push(item.uid);
        }
        assert_eq!(uids.len(), expected);
        uids.sort_unstable();
        uids.dedup();
        assert_eq!(uids.len(), expected);
    }

    #[test]
    fn reports_move_particles_and_requeue_them() {
        let dir = tempfile::tempdir().unwrap();
        let mut opt = optimiser(dir.path(), 0.001);
        opt.start().unwrap();
        let item = opt.next_work().unwrap();
        let queued_before = opt.queue.len();
        opt.report_fitness(item.uid, 10.0, 0).unwrap();
        // The particle went back into the queue (or was replayed, which
        // also ends in a queued item while fitnesses stay unique).
        assert!(opt.queue.len() >= queued_before);
        let best = opt.best();
        assert_eq!(best.current, 10.0);
        // The store saw the checkpoint.
        assert_eq!(opt.store().current_best().unwrap(), 10.0);
        assert!(opt.store().best_position_id().unwrap().is_some());
    }

    #[test]
    fn resume_restores_the_checkpointed_record() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join(DB_FILE);
        let config = test_config(0.001);

        let before;
        let best_pos_id_before;
        {
            let mut opt = Optimiser::new(&config, &db, StopFlag::new()).unwrap();
            opt.start().unwrap();
            // Drive the farm by hand: strictly improving fitnesses first,
            // then two regressions to give the counter something to count.
            let mut fitness = 1000.0;
            for _ in 0..8 {
                let Some(item) = opt.next_work() else { break };
                opt.report_fitness(item.uid, fitness, 0).unwrap();
                fitness -= 50.0;
            }
            for _ in 0..2 {
                let Some(item) = opt.next_work() else { break };
                opt.report_fitness(item.uid, 5000.0, 0).unwrap();
            }
            before = opt.best();
            assert!(before.no_movement > 0);
            assert!(before.previous_previous < f64::MAX);
            best_pos_id_before = opt.store().best_position_id().unwrap().unwrap();
        }

        let opt = Optimiser::new(&config, &db, StopFlag::new()).unwrap();
        let after = opt.best();
        assert_eq!(after.current, before.current);
        assert_eq!(after.previous, before.previous);
        assert_eq!(after.previous_previous, before.previous_previous);
        assert_eq!(after.no_movement, before.no_movement);
        assert_eq!(after.position, before.position);
        assert_eq!(
            opt.store().best_position_id().unwrap().unwrap(),
            best_pos_id_before
        );
    }

    #[test]
    fn short_circuit_replays_known_positions() {
        let dir = tempfile::tempdir().unwrap();
        let mut opt = optimiser(dir.path(), 0.001);
        opt.start().unwrap();
        let item = opt.next_work().unwrap();
        let position = opt.particle_position(item.uid).unwrap();

        // Make the position look well-known: interned twice with a real
        // fitness recorded.
        let id = opt.store().store_position(&position).unwrap();
        opt.store().store_position(&position).unwrap();
        opt.store().update_position_fitness(id, 7.5).unwrap();

        let replay = opt.short_circuit_or_enqueue(item.uid).unwrap();
        assert_eq!(replay.map(|(f, _)| f), Some(7.5));

        // A recorded fitness of exactly zero is a legitimate measurement,
        // not a sentinel, and must still be replayed.
        opt.store().update_position_fitness(id, 0.0).unwrap();
        let replay = opt.short_circuit_or_enqueue(item.uid).unwrap();
        assert_eq!(replay.map(|(f, _)| f), Some(0.0));

        // The sentinel itself is never replayed; the position goes back to
        // the farm instead.
        opt.store().update_position_fitness(id, f64::MAX).unwrap();
        assert_eq!(opt.short_circuit_or_enqueue(item.uid).unwrap(), None);
    }

    #[test]
    fn a_flat_fitness_landscape_marks_the_store_converged() {
        let dir = tempfile::tempdir().unwrap();
        let mut opt = optimiser(dir.path(), 5.0);
        opt.start().unwrap();
        let mut reports = 0;
        while let Some(item) = opt.next_work() {
            reports += 1;
            assert!(reports < 10_000, "search failed to stop");
            opt.report_fitness(item.uid, 1000.0, 0).unwrap();
        }
        assert!(opt.stopping());
        assert!(opt.store().converged().unwrap());
        assert_eq!(opt.best().current, 1000.0);
        assert_eq!(
            opt.store().no_movement_counter().unwrap(),
            crate::spso::NO_MOVEMENT_THRESHOLD
        );
    }

    #[test]
    fn finished_optimiser_ignores_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut opt = optimiser(dir.path(), 5.0);
        opt.start().unwrap();
        opt.finish().unwrap();
        assert!(opt.stopping());
        let best = opt.best();
        opt.report_fitness(0, 0.5, 0).unwrap();
        // Nothing changed.
        assert_eq!(opt.best().current, best.current);
    }
}
