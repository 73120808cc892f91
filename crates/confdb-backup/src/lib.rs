//! The backup and restore engine of confdb.
//!
//! A backup document describes a desired state: object classes with their
//! dependencies, followed by instances with values. The engine reconciles
//! the live database onto that description: undesired instances go away in
//! reverse topological order, desired ones are added or updated in
//! topological order, and bounded retry loops absorb the cascades that
//! dependencies and late-appearing parents cause along the way.

use confdb_store::Database;
use confdb_types::{Error as DbError, Oid};

/// The deletion planner.
pub mod delete;
/// Desired-state descriptors, family linking and topological ordering.
pub mod desired;
/// The backup document codec (backup and filter forms).
pub mod document;
/// Error-related type definitions.
pub mod error;
/// The backup operations surface.
pub mod ops;
/// The convergent restore loop.
pub mod restore;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::Error;

/// Tunables of the reconciliation engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound on outer reconciliation passes before the engine
    /// declares a dependency loop.
    pub max_passes: u32,
    /// Subtree whose instances mirror remote agents; they are managed out
    /// of band and never enter backup documents.
    pub agent_subtree: Oid,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            max_passes: 10,
            agent_subtree: Oid::new("/agent").expect("literal identifier"),
        }
    }
}

/// Capability to resynchronise the live mirror with remote agents.
///
/// The restore loop invokes it between passes whenever a change may have
/// fired dependency edges, so that the next pass converges against fresh
/// truth instead of a stale mirror.
pub trait AgentSync {
    /// Refreshes the live mirror under `prefix`.
    fn sync(&mut self, db: &mut Database, prefix: &Oid) -> Result<(), DbError>;
}

/// The do-nothing synchroniser, for databases without attached agents.
#[derive(Debug, Default)]
pub struct NoAgents;

impl AgentSync for NoAgents {
    fn sync(&mut self, _db: &mut Database, _prefix: &Oid) -> Result<(), DbError> {
        Ok(())
    }
}
