//! Rule memory: persistence, retrieval, reflection and lifecycle.
//!
//! Rules are lessons distilled from judged trials. Each belongs to a family
//! (normalized trigger + applies-to + run) whose versions increase strictly.
//! Retrieval stamps usage, correct outcomes verify the rules consulted, and
//! incorrect outcomes penalize them until they are deprecated. Run-scoped
//! rules can be consolidated into the global pool (run 0, `global|`
//! provenance), optionally behind a replay validation gate.
//!
//! All counter updates are single SQL statements, so concurrent ad hoc
//! activity against the same rule rows never loses an increment.

pub mod evolution;
mod ledger;
pub mod reflection;
pub mod retrieval;
mod schema;
mod store;
mod types;

pub use evolution::{ConsolidationOutcome, EvolutionOutcome, MemoryEvolver, ValidationReport};
pub use ledger::TrialLedger;
pub use reflection::{ParseSource, ParsedReflection, ReflectionContext, DEFAULT_TRIGGER};
pub use retrieval::{relevance, rerank_by_feature, retrieve};
pub use schema::{get_schema_version, initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::{RuleStore, SqliteStore, Store};
pub use types::*;
