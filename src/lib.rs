// Copyright 2018-2026 optsearch developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! # OptSearch
//!
//! A distributed auto-tuner for compiler flags. A coordinator process runs
//! a Standard Particle Swarm Optimisation over the discrete space spanned
//! by the configured flags; worker processes compile and run the target
//! benchmark under each candidate flag set and report its wall-clock time
//! as the fitness. Everything the search learns is persisted to SQLite so
//! an interrupted run resumes from its last checkpoint.
//!
//! The pieces:
//!
//! - [`config`] - the YAML run configuration and the compiler flag model
//! - [`random`] - the WELL512a generator behind every stochastic choice
//! - [`spso`] - the swarm engine: state, update rules, stopping criteria
//! - [`store`] - durable SQLite persistence and checkpoint scalars
//! - [`taskfarm`] - the master/worker evaluation pipeline
//! - [`optimiser`] - glue: flags to dimensions, rendering, checkpointing
//! - [`coordinator`] - process bootstrap and lifecycle
//!
//! The binary runs both roles: plain invocations become the coordinator,
//! which re-execs itself with `--worker-rank` for each worker.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod optimiser;
pub mod random;
pub mod signal;
pub mod spso;
pub mod stats;
pub mod store;
pub mod taskfarm;

pub use config::SearchConfig;
pub use error::{OptError, Result};
pub use optimiser::Optimiser;
pub use spso::Spso;
pub use store::Store;
