//! Immutable per-configuration state ([`RootConfig`]) and mutable
//! per-exchange state ([`RunState`]).

mod root;
mod run;

pub use root::{
    ApiContextMatchers, RegexId, RootBuilder, RootConfig, ScramblingKey, ScramblingProfile,
    ValueIndex,
};
pub use run::{ApiContext, NetworkOrigin, RunState};
