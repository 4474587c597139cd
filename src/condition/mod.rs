//! Condition compilation and evaluation.
//!
//! Configuration-time: [`compile_condition`] walks the declarative tree,
//! interns every referenced symbol and selects one specialized [`Operator`]
//! variant per operand-kind pair. Runtime: `Operator::eval` is a pure
//! boolean function over the per-exchange value store.

mod compiler;
mod operator;

pub use compiler::{compile_condition, CompiledCondition, RequiredIndices};
pub use operator::{HeaderRef, Operator};
