//! Ordered string-modifier chains.
//!
//! A modify-header or modify-json-body action pipes its value through a
//! chain of modifiers, each consuming the previous output. Lookup-style
//! modifiers (table lookup, scrambling) can miss; what happens then is the
//! per-modifier miss policy, checked in order: substitute a default value,
//! keep the value as-is, or abort into a fallback rule-set.

mod scramble;
mod search_replace;

pub use scramble::ScrambleDirection;
pub use search_replace::SearchReplace;

use std::collections::HashMap;
use tracing::{debug, trace};

use crate::config::{FqdnTransform, MissPolicyConfig, ModifierConfig, TableKind};
use crate::context::{RootBuilder, RootConfig, RunState};
use crate::error::{CompileError, ModifierFailure};
use crate::filter::{FilterCaseId, ValueTemplate};
use crate::message::Exchange;

/// A chain abort: the failure reason plus the fallback rule-set the
/// failing modifier named, if any.
#[derive(Debug)]
pub struct ChainAbort {
    pub reason: ModifierFailure,
    pub fallback: Option<FilterCaseId>,
}

/// What a failing lookup-style modifier does, resolved at compile time.
#[derive(Debug, Clone, Default)]
pub struct MissPolicy {
    default_value: Option<String>,
    do_nothing: bool,
    fallback: Option<FilterCaseId>,
}

impl MissPolicy {
    fn compile(
        config: &MissPolicyConfig,
        case_index: &HashMap<String, FilterCaseId>,
    ) -> Result<Self, CompileError> {
        let fallback = config
            .fc_unsuccessful
            .as_deref()
            .map(|name| {
                case_index
                    .get(name)
                    .copied()
                    .ok_or_else(|| CompileError::UnknownFilterCase(name.to_string()))
            })
            .transpose()?;
        Ok(Self {
            default_value: config.default_value.clone(),
            do_nothing: config.do_nothing,
            fallback,
        })
    }
}

/// One compiled modifier.
#[derive(Debug, Clone)]
pub enum Modifier {
    ToUpper,
    ToLower,
    Prepend(ValueTemplate),
    Append(ValueTemplate),
    SearchReplace(SearchReplace),
    TableLookup {
        table: String,
        kind: TableKind,
        transform: FqdnTransform,
        on_miss: MissPolicy,
    },
    Scramble {
        direction: ScrambleDirection,
        transform: FqdnTransform,
        on_miss: MissPolicy,
    },
}

impl Modifier {
    pub fn compile_chain(
        configs: &[ModifierConfig],
        builder: &mut RootBuilder,
        case_index: &HashMap<String, FilterCaseId>,
    ) -> Result<Vec<Modifier>, CompileError> {
        configs
            .iter()
            .map(|c| Modifier::compile(c, builder, case_index))
            .collect()
    }

    fn compile(
        config: &ModifierConfig,
        builder: &mut RootBuilder,
        case_index: &HashMap<String, FilterCaseId>,
    ) -> Result<Modifier, CompileError> {
        Ok(match config {
            ModifierConfig::ToUpper => Modifier::ToUpper,
            ModifierConfig::ToLower => Modifier::ToLower,
            ModifierConfig::Prepend(v) => Modifier::Prepend(ValueTemplate::compile(v, builder)?),
            ModifierConfig::Append(v) => Modifier::Append(ValueTemplate::compile(v, builder)?),
            ModifierConfig::SearchAndReplace {
                search,
                replace,
                regex,
                full_match,
                case_sensitive,
                from_end,
                replace_all,
            } => Modifier::SearchReplace(SearchReplace::compile(
                search,
                replace,
                *regex,
                *full_match,
                *case_sensitive,
                *from_end,
                *replace_all,
            )?),
            ModifierConfig::TableLookup { table, kind, transform, on_miss } => {
                Modifier::TableLookup {
                    table: table.clone(),
                    kind: *kind,
                    // Mapping tables are keyed by whole FQDN unless told
                    // otherwise.
                    transform: transform.unwrap_or(FqdnTransform::OnlyFqdn),
                    on_miss: MissPolicy::compile(on_miss, case_index)?,
                }
            }
            ModifierConfig::Scramble { transform, on_miss } => Modifier::Scramble {
                direction: ScrambleDirection::Scramble,
                transform: transform.unwrap_or(FqdnTransform::OnlyLabel),
                on_miss: MissPolicy::compile(on_miss, case_index)?,
            },
            ModifierConfig::Descramble { transform, on_miss } => Modifier::Scramble {
                direction: ScrambleDirection::Descramble,
                transform: transform.unwrap_or(FqdnTransform::OnlyLabel),
                on_miss: MissPolicy::compile(on_miss, case_index)?,
            },
        })
    }
}

/// Run a value through a modifier chain.
///
/// An IP-address value is a no-op for FQDN modifiers, not a failure. Any
/// other lookup failure consults the modifier's miss policy; only a policy
/// with neither a default value nor `do_nothing` aborts the chain.
pub fn apply_chain(
    modifiers: &[Modifier],
    input: &str,
    root: &RootConfig,
    run: &RunState,
    exchange: &Exchange<'_>,
) -> Result<String, ChainAbort> {
    let mut value = input.to_string();
    for modifier in modifiers {
        value = match modifier {
            Modifier::ToUpper => value.to_uppercase(),
            Modifier::ToLower => value.to_lowercase(),
            Modifier::Prepend(template) => {
                let mut out = template.render(root, run, exchange);
                out.push_str(&value);
                out
            }
            Modifier::Append(template) => {
                let mut out = value;
                out.push_str(&template.render(root, run, exchange));
                out
            }
            Modifier::SearchReplace(sr) => sr.apply(&value),
            Modifier::TableLookup { table, kind, transform, on_miss } => {
                settle(table_lookup(table, *kind, *transform, &value, root), value, on_miss)?
            }
            Modifier::Scramble { direction, transform, on_miss } => settle(
                scramble::apply(*direction, *transform, &value, root, run),
                value,
                on_miss,
            )?,
        };
    }
    Ok(value)
}

/// Apply the miss policy to a fallible modifier's result.
fn settle(
    result: Result<String, ModifierFailure>,
    current: String,
    on_miss: &MissPolicy,
) -> Result<String, ChainAbort> {
    match result {
        Ok(out) => Ok(out),
        Err(ModifierFailure::FqdnIsIp) => {
            trace!("value is an IP address, leaving unmodified");
            Ok(current)
        }
        Err(reason) => {
            if let Some(default) = &on_miss.default_value {
                debug!(%reason, default = %default, "modifier missed, substituting default");
                return Ok(default.clone());
            }
            if on_miss.do_nothing {
                debug!(%reason, "modifier missed, keeping value");
                return Ok(current);
            }
            Err(ChainAbort { reason, fallback: on_miss.fallback })
        }
    }
}

fn table_lookup(
    table: &str,
    kind: TableKind,
    transform: FqdnTransform,
    value: &str,
    root: &RootConfig,
) -> Result<String, ModifierFailure> {
    let lookup = |key: &str| -> Option<String> {
        match kind {
            TableKind::KeyValue => root.kv_table(table)?.get(key).cloned(),
            TableKind::KeyListValue => root.klv_table(table)?.get(key).map(|v| v.join(",")),
        }
    };
    match transform {
        FqdnTransform::OnlyFqdn => {
            lookup(value).ok_or_else(|| ModifierFailure::LookupMiss(value.to_string()))
        }
        FqdnTransform::OnlyLabel => {
            let (stem, suffix) = root.split_plmn_suffix(value);
            let (label, rest) = match stem.find('.') {
                Some(pos) => (&stem[..pos], &stem[pos..]),
                None => (stem, ""),
            };
            let mapped =
                lookup(label).ok_or_else(|| ModifierFailure::LookupMiss(label.to_string()))?;
            Ok(format!("{}{}{}", mapped, rest, suffix.unwrap_or("")))
        }
    }
}
