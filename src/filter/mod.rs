//! Filter cases, rules, actions, the rule-walking state machine and the
//! six-phase orchestrator.

mod actions;
mod case;
mod data;
mod machine;
mod phases;

pub use actions::{Action, ActionResult, LocalReply, ValueTemplate};
pub use case::{FilterCase, FilterCaseId, FilterRule};
pub use data::{DataSource, Extractor, FilterData, FilterDataId};
pub use machine::{CaseOutcome, Continuation, Engine};
pub use phases::{ExchangeOutcome, Phase, PhaseTable, PhaseTables};
