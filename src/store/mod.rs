// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # Durable persistence
//!
//! Everything the search learns goes into one SQLite file: the search space,
//! every position and velocity ever tried (interned by content), the swarm,
//! append-only history tables for post-hoc analysis, and a handful of scalar
//! singletons that make a clean resume possible.
//!
//! Only the coordinator touches the store; workers never see it. Positions
//! and velocities get one column per dimension, named after the dimension,
//! so the file is directly queryable with ordinary SQL afterwards. All
//! values go through bound parameters; only identifiers (the dimension
//! names) are interpolated, quoted.

use std::path::Path;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::{debug, error, info, warn};

use crate::config::Flag;
use crate::error::{OptError, Result};
use crate::spso::{Dimension, Particle, Position, Swarm, Velocity};

/// Singleton keys in the `singleton` (integer) table.
pub const PRNG_SEED: &str = "PRNG_SEED";
pub const PRNG_ITER: &str = "PRNG_ITER";
pub const CONVERGED: &str = "CONVERGED";
pub const BEST_POS: &str = "BEST_POS";
pub const NO_MOVEMENT_COUNTER: &str = "NO_MOVEMENT_COUNTER";

/// Singleton keys in the `real_singleton` table.
pub const PREV_PREV_BEST: &str = "PREV_PREV_BEST";
pub const PREV_BEST: &str = "PREV_BEST";
pub const CURR_BEST: &str = "CURR_BEST";

/// Whether opening the store found previous state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opening {
    /// A brand new store; the schema was just created.
    Fresh,
    /// An existing store whose dimensions matched; resume from it.
    Resumed,
}

/// Handle to the SQLite store, bound to one search space.
pub struct Store {
    conn: Connection,
    dimensions: Vec<Dimension>,
    /// `"a", "b", ...` - quoted dimension columns in uid order.
    columns: String,
    /// `"a" = ? AND "b" = ? ...` - content-match clause in the same order.
    match_clause: String,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl Store {
    /// Open (or create) the store at `path` for the given search space.
    ///
    /// A pre-existing file means a previous run to resume from; its
    /// persisted dimensions must match `dimensions` exactly, otherwise the
    /// file belongs to some other search and using it would corrupt both.
    pub fn open(path: &Path, dimensions: &[Dimension], flags: &[Flag]) -> Result<(Store, Opening)> {
        let exists = path.exists();
        if exists && !path.is_file() {
            return Err(OptError::store(format!(
                "{} exists but is not a regular file",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        let store = Store::bind(conn, dimensions);
        let opening = if exists {
            store.verify_dimensions()?;
            debug!(path = %path.display(), "found existing store; resuming");
            Opening::Resumed
        } else {
            store.create_schema()?;
            store.store_search_space(flags)?;
            debug!(path = %path.display(), "new store initialised");
            Opening::Fresh
        };
        // Write-ahead logging with frequent checkpoints and full fsync: a
        // crash must never cost more than the statement in flight.
        store.conn.pragma_update(None, "journal_mode", "WAL")?;
        store.conn.pragma_update(None, "wal_autocheckpoint", 3)?;
        store.conn.pragma_update(None, "synchronous", "FULL")?;
        Ok((store, opening))
    }

    /// In-memory store, mainly for tests.
    pub fn open_in_memory(dimensions: &[Dimension], flags: &[Flag]) -> Result<Store> {
        let conn = Connection::open_in_memory()?;
        let store = Store::bind(conn, dimensions);
        store.create_schema()?;
        store.store_search_space(flags)?;
        Ok(store)
    }

    fn bind(conn: Connection, dimensions: &[Dimension]) -> Store {
        let columns = dimensions
            .iter()
            .map(|d| quote_ident(&d.name))
            .collect::<Vec<_>>()
            .join(", ");
        let match_clause = dimensions
            .iter()
            .map(|d| format!("{} = ?", quote_ident(&d.name)))
            .collect::<Vec<_>>()
            .join(" AND ");
        Store {
            conn,
            dimensions: dimensions.to_vec(),
            columns,
            match_clause,
        }
    }

    fn create_schema(&self) -> Result<()> {
        let dim_columns = self
            .dimensions
            .iter()
            .map(|d| format!("{} INTEGER NOT NULL", quote_ident(&d.name)))
            .collect::<Vec<_>>()
            .join(", ");
        let schema = format!(
            "CREATE TABLE flag (id INTEGER NOT NULL UNIQUE, name TEXT NOT NULL, \
             type INTEGER NOT NULL, PRIMARY KEY (id));\n\
             CREATE TABLE dimension (id INTEGER NOT NULL UNIQUE, name TEXT NOT NULL, \
             min INTEGER NOT NULL, max INTEGER NOT NULL, PRIMARY KEY (id), \
             FOREIGN KEY (name) REFERENCES flag(name));\n\
             CREATE TABLE position (id INTEGER NOT NULL UNIQUE, fitness REAL, {dim_columns}, \
             visits INTEGER, PRIMARY KEY (id));\n\
             CREATE TABLE velocity (id INTEGER NOT NULL UNIQUE, {dim_columns}, \
             count INTEGER NOT NULL, PRIMARY KEY (id));\n\
             CREATE TABLE particle (id INTEGER NOT NULL UNIQUE, positionID INTEGER NOT NULL, \
             velocityID INTEGER NOT NULL, bestPositionID INTEGER, \
             FOREIGN KEY (positionID) REFERENCES position(id), \
             FOREIGN KEY (velocityID) REFERENCES velocity(id), \
             FOREIGN KEY (bestPositionID) REFERENCES position(id), PRIMARY KEY (id));\n\
             CREATE TABLE particle_history (timestamp DATETIME DEFAULT CURRENT_TIMESTAMP NOT NULL, \
             particleID INTEGER NOT NULL, positionID INTEGER NOT NULL, \
             velocityID INTEGER NOT NULL, bestPositionID INTEGER NOT NULL, \
             FOREIGN KEY (particleID) REFERENCES particle(id), \
             FOREIGN KEY (positionID) REFERENCES position(id), \
             FOREIGN KEY (velocityID) REFERENCES velocity(id), \
             FOREIGN KEY (bestPositionID) REFERENCES position(id));\n\
             CREATE TABLE global_best_history (timestamp DATETIME DEFAULT CURRENT_TIMESTAMP NOT NULL, \
             positionID INTEGER NOT NULL, \
             FOREIGN KEY (positionID) REFERENCES position(id));\n\
             CREATE TABLE singleton (what TEXT NOT NULL, value INTEGER);\n\
             INSERT INTO singleton VALUES('{PRNG_SEED}', NULL);\n\
             INSERT INTO singleton VALUES('{PRNG_ITER}', NULL);\n\
             INSERT INTO singleton VALUES('{CONVERGED}', 0);\n\
             INSERT INTO singleton VALUES('{BEST_POS}', NULL);\n\
             INSERT INTO singleton VALUES('{NO_MOVEMENT_COUNTER}', 0);\n\
             CREATE TABLE real_singleton (what TEXT NOT NULL, value REAL);\n\
             INSERT INTO real_singleton VALUES('{PREV_PREV_BEST}', NULL);\n\
             INSERT INTO real_singleton VALUES('{PREV_BEST}', NULL);\n\
             INSERT INTO real_singleton VALUES('{CURR_BEST}', NULL);\n\
             CREATE INDEX 'dimension_name' ON 'dimension'('name');\n\
             CREATE INDEX 'global_best_history_positionID' ON 'global_best_history'('positionID');\n\
             CREATE INDEX 'particle_bestPositionID' ON 'particle'('bestPositionID');\n\
             CREATE INDEX 'particle_velocityID' ON 'particle'('velocityID');\n\
             CREATE INDEX 'particle_positionID' ON 'particle'('positionID');\n\
             CREATE INDEX 'particle_history_positionID' ON 'particle_history'('positionID');\n\
             CREATE INDEX 'particle_history_particleID' ON 'particle_history'('particleID');\n\
             CREATE INDEX 'particle_history_velocityID' ON 'particle_history'('velocityID');\n\
             CREATE INDEX 'particle_history_bestPositionID' ON 'particle_history'('bestPositionID');"
        );
        self.conn.execute_batch(&schema).map_err(|e| {
            error!(error = %e, "could not create store schema");
            OptError::from(e)
        })
    }

    fn store_search_space(&self, flags: &[Flag]) -> Result<()> {
        for flag in flags {
            self.exec(
                "INSERT INTO flag (id, name, type) VALUES (?1, ?2, ?3)",
                params![flag.uid, flag.name, flag.type_tag()],
            )?;
        }
        for dim in &self.dimensions {
            self.exec(
                "INSERT INTO dimension (id, name, min, max) VALUES (?1, ?2, ?3, ?4)",
                params![dim.uid, dim.name, dim.min, dim.max],
            )?;
        }
        Ok(())
    }

    /// Confirm that every persisted dimension matches the current search
    /// space by `(uid, name, min, max)`. A mismatch is fatal: the file
    /// records a different search.
    pub fn verify_dimensions(&self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, min, max FROM dimension ORDER BY id")?;
        let stored = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if stored.len() != self.dimensions.len() {
            return Err(OptError::store(format!(
                "store has {} dimensions, the configuration has {}",
                stored.len(),
                self.dimensions.len()
            )));
        }
        for (dim, (uid, name, min, max)) in self.dimensions.iter().zip(stored) {
            if dim.uid != uid || dim.name != name || dim.min != min || dim.max != max {
                return Err(OptError::store(format!(
                    "stored dimension ({uid}, '{name}', {min}, {max}) does not match \
                     configured ({}, '{}', {}, {})",
                    dim.uid, dim.name, dim.min, dim.max
                )));
            }
        }
        Ok(())
    }

    fn exec(&self, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
        self.conn.execute(sql, params).map_err(|e| {
            error!(statement = sql, error = %e, "SQL error");
            OptError::from(e)
        })
    }

    // ---- position / velocity interning -------------------------------

    /// Find the id of a position with exactly these components.
    pub fn find_position(&self, position: &Position) -> Result<Option<i64>> {
        let sql = format!("SELECT id FROM position WHERE {}", self.match_clause);
        let id = self
            .conn
            .query_row(&sql, params_from_iter(position.0.iter()), |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(id)
    }

    /// Intern a position: an existing row with the same content gets its
    /// visit counter bumped, otherwise a new row starts at one visit.
    /// Either way the id identifies this content for the rest of the run.
    pub fn store_position(&self, position: &Position) -> Result<i64> {
        if let Some(id) = self.find_position(position)? {
            debug!(id, "position already interned; incrementing visits");
            self.exec(
                "UPDATE position SET visits = visits + 1 WHERE id = ?1",
                params![id],
            )?;
            return Ok(id);
        }
        let placeholders = vec!["?"; self.dimensions.len()].join(", ");
        let sql = format!(
            "INSERT INTO position ({}, visits) VALUES ({placeholders}, 1)",
            self.columns
        );
        self.conn
            .execute(&sql, params_from_iter(position.0.iter()))
            .map_err(|e| {
                error!(statement = %sql, error = %e, "could not insert position");
                OptError::from(e)
            })?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Find the id of a velocity with exactly these components.
    pub fn find_velocity(&self, velocity: &Velocity) -> Result<Option<i64>> {
        let sql = format!("SELECT id FROM velocity WHERE {}", self.match_clause);
        let id = self
            .conn
            .query_row(&sql, params_from_iter(velocity.0.iter()), |row| {
                row.get::<_, i64>(0)
            })
            .optional()?;
        Ok(id)
    }

    /// Intern a velocity, analogously to [`Store::store_position`].
    pub fn store_velocity(&self, velocity: &Velocity) -> Result<i64> {
        if let Some(id) = self.find_velocity(velocity)? {
            debug!(id, "velocity already interned; incrementing count");
            self.exec(
                "UPDATE velocity SET count = count + 1 WHERE id = ?1",
                params![id],
            )?;
            return Ok(id);
        }
        let placeholders = vec!["?"; self.dimensions.len()].join(", ");
        let sql = format!(
            "INSERT INTO velocity ({}, count) VALUES ({placeholders}, 1)",
            self.columns
        );
        self.conn
            .execute(&sql, params_from_iter(velocity.0.iter()))
            .map_err(|e| {
                error!(statement = %sql, error = %e, "could not insert velocity");
                OptError::from(e)
            })?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Number of distinct positions seen so far.
    pub fn position_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(id) FROM position", [], |row| row.get(0))?)
    }

    pub fn position_visits(&self, id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT visits FROM position WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?)
    }

    /// The recorded fitness for a position, if any.
    pub fn position_fitness(&self, id: i64) -> Result<Option<f64>> {
        Ok(self.conn.query_row(
            "SELECT fitness FROM position WHERE id = ?1",
            params![id],
            |row| row.get::<_, Option<f64>>(0),
        )?)
    }

    /// Overwrite a position's fitness. Fitness is noisy, so the latest
    /// observation always wins.
    pub fn update_position_fitness(&self, id: i64, fitness: f64) -> Result<()> {
        self.exec(
            "UPDATE position SET fitness = ?1 WHERE id = ?2",
            params![fitness, id],
        )?;
        Ok(())
    }

    /// Load a position's components back out by id.
    pub fn load_position(&self, id: i64) -> Result<Position> {
        let sql = format!("SELECT {} FROM position WHERE id = ?1", self.columns);
        let components = self.conn.query_row(&sql, params![id], |row| {
            (0..self.dimensions.len())
                .map(|i| row.get::<_, i64>(i))
                .collect::<std::result::Result<Vec<_>, _>>()
        })?;
        Ok(Position(components))
    }

    /// Load a velocity's components back out by id.
    pub fn load_velocity(&self, id: i64) -> Result<Velocity> {
        let sql = format!("SELECT {} FROM velocity WHERE id = ?1", self.columns);
        let components = self.conn.query_row(&sql, params![id], |row| {
            (0..self.dimensions.len())
                .map(|i| row.get::<_, i64>(i))
                .collect::<std::result::Result<Vec<_>, _>>()
        })?;
        Ok(Velocity(components))
    }

    // ---- particles ---------------------------------------------------

    pub fn particle_known(&self, uid: u32) -> Result<bool> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM particle WHERE id = ?1",
                params![uid],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(id.is_some())
    }

    /// Persist a particle for the first time. A particle that already has a
    /// row is handed to [`Store::update_particle`] instead.
    pub fn store_particle(&self, particle: &Particle) -> Result<()> {
        if self.particle_known(particle.uid)? {
            warn!(
                uid = particle.uid,
                "particle already in the store; updating instead"
            );
            return self.update_particle(particle);
        }
        let best_id = self.store_position(&particle.best_position)?;
        self.update_position_fitness(best_id, particle.best_fitness)?;
        let pos_id = self.store_position(&particle.position)?;
        let vel_id = self.store_velocity(&particle.velocity)?;
        self.exec(
            "INSERT INTO particle (id, positionID, velocityID, bestPositionID) \
             VALUES (?1, ?2, ?3, ?4)",
            params![particle.uid, pos_id, vel_id, best_id],
        )?;
        self.append_particle_history(particle.uid, pos_id, vel_id, best_id)?;
        Ok(())
    }

    /// Re-intern a particle's current position, velocity and previous best
    /// and point its row at them. A history row is appended only when the
    /// position id actually changed, i.e. when the particle moved.
    pub fn update_particle(&self, particle: &Particle) -> Result<()> {
        if !self.particle_known(particle.uid)? {
            warn!(uid = particle.uid, "particle not yet in the store");
            return self.store_particle(particle);
        }
        let old_pos_id: i64 = self.conn.query_row(
            "SELECT positionID FROM particle WHERE id = ?1",
            params![particle.uid],
            |row| row.get(0),
        )?;
        let best_id = self.store_position(&particle.best_position)?;
        self.update_position_fitness(best_id, particle.best_fitness)?;
        let pos_id = self.store_position(&particle.position)?;
        let vel_id = self.store_velocity(&particle.velocity)?;
        self.exec(
            "UPDATE particle SET positionID = ?1, velocityID = ?2, bestPositionID = ?3 \
             WHERE id = ?4",
            params![pos_id, vel_id, best_id, particle.uid],
        )?;
        if pos_id != old_pos_id {
            self.append_particle_history(particle.uid, pos_id, vel_id, best_id)?;
        }
        Ok(())
    }

    fn append_particle_history(
        &self,
        uid: u32,
        pos_id: i64,
        vel_id: i64,
        best_id: i64,
    ) -> Result<()> {
        self.exec(
            "INSERT INTO particle_history (particleID, positionID, velocityID, bestPositionID) \
             VALUES (?1, ?2, ?3, ?4)",
            params![uid, pos_id, vel_id, best_id],
        )?;
        Ok(())
    }

    /// Rebuild one particle from its persisted foreign keys.
    pub fn load_particle(&self, uid: u32) -> Result<Particle> {
        let (pos_id, vel_id, best_id): (i64, i64, Option<i64>) = self.conn.query_row(
            "SELECT positionID, velocityID, bestPositionID FROM particle WHERE id = ?1",
            params![uid],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let position = self.load_position(pos_id)?;
        let velocity = self.load_velocity(vel_id)?;
        let (best_position, best_fitness) = match best_id {
            Some(id) => (
                self.load_position(id)?,
                self.position_fitness(id)?.unwrap_or(f64::MAX),
            ),
            None => (position.clone(), f64::MAX),
        };
        Ok(Particle {
            uid,
            position,
            velocity,
            best_position,
            best_fitness,
        })
    }

    /// Rebuild the whole swarm. Particles are stored with their uid as row
    /// id, so the swarm order is the row order.
    pub fn load_swarm(&self) -> Result<Swarm> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM particle", [], |row| row.get(0))?;
        let particles = (0..count as u32)
            .map(|uid| self.load_particle(uid))
            .collect::<Result<Vec<_>>>()?;
        Swarm::from_particles(particles)
    }

    // ---- singletons --------------------------------------------------

    fn singleton(&self, what: &str) -> Result<Option<i64>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM singleton WHERE what = ?1",
                params![what],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .map_err(|e| {
                error!(key = what, error = %e, "could not read singleton");
                OptError::from(e)
            })?;
        Ok(value.flatten())
    }

    fn set_singleton(&self, what: &str, value: i64) -> Result<()> {
        self.exec(
            "UPDATE singleton SET value = ?1 WHERE what = ?2",
            params![value, what],
        )?;
        Ok(())
    }

    /// Real-valued singleton with the "unknown" convention: a missing or
    /// non-positive value reads back as the largest finite double.
    fn real_singleton(&self, what: &str) -> Result<f64> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM real_singleton WHERE what = ?1",
                params![what],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()
            .map_err(|e| {
                error!(key = what, error = %e, "could not read real singleton");
                OptError::from(e)
            })?
            .flatten();
        Ok(match value {
            Some(v) if v > 0.0 => v,
            _ => f64::MAX,
        })
    }

    fn set_real_singleton(&self, what: &str, value: f64) -> Result<()> {
        self.exec(
            "UPDATE real_singleton SET value = ?1 WHERE what = ?2",
            params![value, what],
        )?;
        Ok(())
    }

    pub fn prng_seed(&self) -> Result<Option<u32>> {
        Ok(self.singleton(PRNG_SEED)?.map(|v| v as u32))
    }

    pub fn set_prng_seed(&self, seed: u32) -> Result<()> {
        self.set_singleton(PRNG_SEED, i64::from(seed))
    }

    pub fn prng_iteration(&self) -> Result<u64> {
        Ok(self.singleton(PRNG_ITER)?.unwrap_or(0).max(0) as u64)
    }

    pub fn set_prng_iteration(&self, iteration: u64) -> Result<()> {
        self.set_singleton(PRNG_ITER, iteration as i64)
    }

    pub fn converged(&self) -> Result<bool> {
        Ok(self.singleton(CONVERGED)? == Some(1))
    }

    pub fn set_converged(&self, converged: bool) -> Result<()> {
        self.set_singleton(CONVERGED, i64::from(converged))
    }

    pub fn no_movement_counter(&self) -> Result<i64> {
        Ok(self.singleton(NO_MOVEMENT_COUNTER)?.unwrap_or(0))
    }

    pub fn set_no_movement_counter(&self, counter: i64) -> Result<()> {
        self.set_singleton(NO_MOVEMENT_COUNTER, counter)
    }

    pub fn best_position_id(&self) -> Result<Option<i64>> {
        self.singleton(BEST_POS)
    }

    pub fn previous_best(&self) -> Result<f64> {
        self.real_singleton(PREV_BEST)
    }

    pub fn set_previous_best(&self, fitness: f64) -> Result<()> {
        self.set_real_singleton(PREV_BEST, fitness)
    }

    pub fn previous_previous_best(&self) -> Result<f64> {
        self.real_singleton(PREV_PREV_BEST)
    }

    pub fn set_previous_previous_best(&self, fitness: f64) -> Result<()> {
        self.set_real_singleton(PREV_PREV_BEST, fitness)
    }

    pub fn current_best(&self) -> Result<f64> {
        self.real_singleton(CURR_BEST)
    }

    // ---- global best -------------------------------------------------

    /// Persist the current best: intern the position, record its fitness,
    /// and when the best position actually changed, repoint `BEST_POS` and
    /// append to the global-best history.
    pub fn store_current_best(&self, position: &Position, fitness: f64) -> Result<i64> {
        let id = self.store_position(position)?;
        self.set_real_singleton(CURR_BEST, fitness)?;
        self.update_position_fitness(id, fitness)?;
        if self.best_position_id()? != Some(id) {
            debug!(id, fitness, "current best position moved");
            self.set_singleton(BEST_POS, id)?;
            self.exec(
                "INSERT INTO global_best_history (positionID) VALUES (?1)",
                params![id],
            )?;
        }
        Ok(id)
    }

    /// The persisted current best, if one exists. Falls back to the lowest
    /// recorded position fitness when the singletons are unusable.
    pub fn load_current_best(&self) -> Result<Option<(Position, f64)>> {
        if let Some(id) = self.best_position_id()? {
            let position = self.load_position(id)?;
            let fitness = self.current_best()?;
            return Ok(Some((position, fitness)));
        }
        warn!("no BEST_POS singleton; falling back to the best recorded fitness");
        let row = self
            .conn
            .query_row(
                "SELECT id, fitness FROM position WHERE fitness IS NOT NULL \
                 ORDER BY fitness ASC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()?;
        match row {
            Some((id, fitness)) => {
                let fitness = if fitness > 0.0 {
                    fitness
                } else {
                    warn!("no usable fitness recovered for the global best");
                    f64::MAX
                };
                Ok(Some((self.load_position(id)?, fitness)))
            }
            None => Ok(None),
        }
    }

    /// Rows in the global-best history, oldest first.
    pub fn global_best_history(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT positionID FROM global_best_history ORDER BY rowid")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    #[cfg(test)]
    fn particle_history_len(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM particle_history", [], |row| {
                row.get(0)
            })?)
    }

    /// Close the store, checkpointing the WAL.
    pub fn close(self) -> Result<()> {
        info!("closing store");
        self.conn
            .close()
            .map_err(|(_, e)| OptError::from(e))
    }
}
