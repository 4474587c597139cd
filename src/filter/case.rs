//! Arena types for compiled rule-sets.

use std::collections::HashMap;

use crate::condition::{Operator, RequiredIndices};
use crate::context::ValueIndex;

use super::actions::Action;
use super::data::FilterDataId;

/// Dense handle into the filter-case arena in [`RootConfig`].
///
/// [`RootConfig`]: crate::context::RootConfig
pub type FilterCaseId = u16;

/// One (condition, action list) pair.
#[derive(Debug)]
pub struct FilterRule {
    pub name: String,
    /// `None`: the rule never matches and processing continues with the
    /// next rule
    pub condition: Option<Operator>,
    /// Everything the condition needs materialized before evaluation
    pub required: RequiredIndices,
    pub actions: Vec<Action>,
}

/// A named, ordered rule-set.
#[derive(Debug)]
pub struct FilterCase {
    pub name: String,
    pub rules: Vec<FilterRule>,
    /// Which extraction recipes fill a given variable, in declaration order
    pub data_for_var: HashMap<ValueIndex, Vec<FilterDataId>>,
}
