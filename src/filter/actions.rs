//! Compiled actions and their execution.
//!
//! Actions run strictly in declaration order once a rule matched. Their
//! result drives the state machine: continue, jump to another rule-set,
//! leave the phase, terminate the exchange with a local reply, or pause for
//! an asynchronous lookup.

use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ActionConfig, IfExists, LogLevel, LookupServiceKind, ReplyFormat, ValueTemplateConfig};
use crate::context::{RootBuilder, RootConfig, RunState, ValueIndex};
use crate::error::{CompileError, ModifierFailure};
use crate::message::{Direction, Exchange};
use crate::modifier::{apply_chain, Modifier};

use super::case::FilterCaseId;

/// A value-producing term of an action or modifier.
#[derive(Debug, Clone)]
pub enum ValueTemplate {
    Const(ValueIndex),
    Var(ValueIndex),
    /// Read live from the side currently being processed
    Header(ValueIndex),
}

impl ValueTemplate {
    pub fn compile(
        config: &ValueTemplateConfig,
        builder: &mut RootBuilder,
    ) -> Result<Self, CompileError> {
        Ok(match config {
            ValueTemplateConfig::TermString(s) => {
                ValueTemplate::Const(builder.intern_const(Value::String(s.clone()))?)
            }
            ValueTemplateConfig::TermNumber(n) => {
                let json = serde_json::Number::from_f64(*n).map(Value::Number).ok_or_else(
                    || CompileError::InvalidCondition(format!("non-finite number: {n}")),
                )?;
                ValueTemplate::Const(builder.intern_const(json)?)
            }
            ValueTemplateConfig::TermBoolean(b) => {
                ValueTemplate::Const(builder.intern_const(Value::Bool(*b))?)
            }
            ValueTemplateConfig::TermVar(name) => ValueTemplate::Var(builder.intern_var(name)?),
            ValueTemplateConfig::TermHeader(name) => {
                ValueTemplate::Header(builder.intern_header(name)?)
            }
        })
    }

    /// Render as a string. Unset variables render as "".
    pub fn render(&self, root: &RootConfig, run: &RunState, exchange: &Exchange<'_>) -> String {
        match self {
            ValueTemplate::Const(idx) => json_to_string(root.const_value(*idx)),
            ValueTemplate::Var(idx) => json_to_string(run.var_value(*idx)),
            ValueTemplate::Header(idx) => exchange
                .headers(run.direction())
                .get(root.header_name(*idx))
                .join(","),
        }
    }

    /// The JSON value itself; used by variable assignment.
    pub fn value(&self, root: &RootConfig, run: &RunState, exchange: &Exchange<'_>) -> Value {
        match self {
            ValueTemplate::Const(idx) => root.const_value(*idx).clone(),
            ValueTemplate::Var(idx) => run.var_value(*idx).clone(),
            ValueTemplate::Header(idx) => Value::String(
                exchange
                    .headers(run.direction())
                    .get(root.header_name(*idx))
                    .join(","),
            ),
        }
    }
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A synthesized terminal reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReply {
    pub status: u16,
    pub title: String,
    pub format: ReplyFormat,
}

/// What one executed action tells the state machine to do next.
#[derive(Debug)]
pub enum ActionResult {
    /// Continue with the next action / rule
    Next,
    /// Abandon this rule-set, restart at another one
    GotoFc(FilterCaseId),
    /// Terminate rule processing for this phase
    Exit,
    /// A terminal reply was sent; no further phases run
    StopIteration(Option<LocalReply>),
    /// An external lookup was issued; freeze and resume later
    PauseIteration {
        service: LookupServiceKind,
        query: String,
        destination_var: ValueIndex,
        fc_unsuccessful: Option<FilterCaseId>,
    },
}

/// A compiled action.
#[derive(Debug)]
pub enum Action {
    AddHeader {
        header: ValueIndex,
        value: ValueTemplate,
        if_exists: IfExists,
    },
    RemoveHeader {
        header: ValueIndex,
    },
    ModifyHeader {
        header: ValueIndex,
        replace: Option<ValueTemplate>,
        modifiers: Vec<Modifier>,
        fc_unsuccessful: Option<FilterCaseId>,
    },
    ModifyQueryParam {
        param: ValueIndex,
        value: ValueTemplate,
    },
    ModifyVariable {
        var: ValueIndex,
        value: ValueTemplate,
    },
    ModifyJsonBody {
        pointer: String,
        replace: Option<ValueTemplate>,
        modifiers: Vec<Modifier>,
        fc_unsuccessful: Option<FilterCaseId>,
    },
    Reject {
        status: u16,
        title: String,
        format: ReplyFormat,
    },
    Drop,
    Log {
        level: LogLevel,
        text: Vec<ValueTemplate>,
    },
    RouteToPool {
        pool: ValueTemplate,
    },
    ExitFilterCase,
    GotoFilterCase(FilterCaseId),
    Lookup {
        service: LookupServiceKind,
        source_var: ValueIndex,
        destination_var: ValueIndex,
        fc_unsuccessful: Option<FilterCaseId>,
    },
}

impl Action {
    pub fn compile(
        config: &ActionConfig,
        builder: &mut RootBuilder,
        case_index: &HashMap<String, FilterCaseId>,
    ) -> Result<Self, CompileError> {
        let resolve_fc = |name: &Option<String>| -> Result<Option<FilterCaseId>, CompileError> {
            name.as_ref()
                .map(|n| {
                    case_index
                        .get(n)
                        .copied()
                        .ok_or_else(|| CompileError::UnknownFilterCase(n.clone()))
                })
                .transpose()
        };

        Ok(match config {
            ActionConfig::AddHeader { name, value, if_exists } => Action::AddHeader {
                header: builder.intern_header(name)?,
                value: ValueTemplate::compile(value, builder)?,
                if_exists: *if_exists,
            },
            ActionConfig::RemoveHeader { name } => {
                Action::RemoveHeader { header: builder.intern_header(name)? }
            }
            ActionConfig::ModifyHeader { name, replace_value, modifiers, fc_unsuccessful } => {
                Action::ModifyHeader {
                    header: builder.intern_header(name)?,
                    replace: replace_value
                        .as_ref()
                        .map(|v| ValueTemplate::compile(v, builder))
                        .transpose()?,
                    modifiers: Modifier::compile_chain(modifiers, builder, case_index)?,
                    fc_unsuccessful: resolve_fc(fc_unsuccessful)?,
                }
            }
            ActionConfig::ModifyQueryParam { name, value } => Action::ModifyQueryParam {
                param: builder.intern_query_param(name)?,
                value: ValueTemplate::compile(value, builder)?,
            },
            ActionConfig::ModifyVariable { name, value } => Action::ModifyVariable {
                var: builder.intern_var(name)?,
                value: ValueTemplate::compile(value, builder)?,
            },
            ActionConfig::ModifyJsonBody { pointer, replace_value, modifiers, fc_unsuccessful } => {
                Action::ModifyJsonBody {
                    pointer: pointer.clone(),
                    replace: replace_value
                        .as_ref()
                        .map(|v| ValueTemplate::compile(v, builder))
                        .transpose()?,
                    modifiers: Modifier::compile_chain(modifiers, builder, case_index)?,
                    fc_unsuccessful: resolve_fc(fc_unsuccessful)?,
                }
            }
            ActionConfig::RejectMessage { status, title, format } => {
                Action::Reject { status: *status, title: title.clone(), format: *format }
            }
            ActionConfig::DropMessage => Action::Drop,
            ActionConfig::Log { level, text } => Action::Log {
                level: *level,
                text: text
                    .iter()
                    .map(|t| ValueTemplate::compile(t, builder))
                    .collect::<Result<_, _>>()?,
            },
            ActionConfig::RouteToPool { pool } => {
                Action::RouteToPool { pool: ValueTemplate::compile(pool, builder)? }
            }
            ActionConfig::ExitFilterCase => Action::ExitFilterCase,
            ActionConfig::GotoFilterCase { name } => Action::GotoFilterCase(
                case_index
                    .get(name)
                    .copied()
                    .ok_or_else(|| CompileError::UnknownFilterCase(name.clone()))?,
            ),
            ActionConfig::Lookup { service, source_var, destination_var, fc_unsuccessful } => {
                Action::Lookup {
                    service: *service,
                    source_var: builder.intern_var(source_var)?,
                    destination_var: builder.intern_var(destination_var)?,
                    fc_unsuccessful: resolve_fc(fc_unsuccessful)?,
                }
            }
        })
    }

    pub fn execute(
        &self,
        root: &RootConfig,
        run: &mut RunState,
        exchange: &mut Exchange<'_>,
        current_case: FilterCaseId,
    ) -> ActionResult {
        match self {
            Action::AddHeader { header, value, if_exists } => {
                let name = root.header_name(*header);
                let direction = run.direction();
                let exists = exchange.headers(direction).contains(name);
                let rendered = value.render(root, run, exchange);
                match (exists, if_exists) {
                    (true, IfExists::NoAction) => {}
                    (true, IfExists::Replace) => {
                        exchange.headers_mut(direction).set(name, &rendered);
                        run.mark_headers_changed();
                    }
                    _ => {
                        exchange.headers_mut(direction).add(name, &rendered);
                        run.mark_headers_changed();
                    }
                }
                ActionResult::Next
            }
            Action::RemoveHeader { header } => {
                let direction = run.direction();
                exchange.headers_mut(direction).remove(root.header_name(*header));
                run.mark_headers_changed();
                ActionResult::Next
            }
            Action::ModifyHeader { header, replace, modifiers, fc_unsuccessful } => {
                let name = root.header_name(*header).to_string();
                let direction = run.direction();
                if !exchange.headers(direction).contains(&name) {
                    trace!(header = %name, "modify_header: header absent, no-op");
                    return ActionResult::Next;
                }
                let input = match replace {
                    Some(template) => template.render(root, run, exchange),
                    None => exchange.headers(direction).get(&name).join(","),
                };
                match apply_chain(modifiers, &input, root, run, exchange) {
                    Ok(output) => {
                        exchange.headers_mut(direction).set(&name, &output);
                        run.mark_headers_changed();
                        ActionResult::Next
                    }
                    Err(abort) => {
                        self.handle_modifier_failure(
                            abort.reason,
                            abort.fallback.or(*fc_unsuccessful),
                            false,
                            run,
                        )
                    }
                }
            }
            Action::ModifyQueryParam { param, value } => {
                let rendered = value.render(root, run, exchange);
                let name = root.query_param_name(*param).to_string();
                rewrite_query_param(exchange, &name, &rendered);
                run.set_query_param_value(*param, &rendered);
                run.mark_headers_changed();
                ActionResult::Next
            }
            Action::ModifyVariable { var, value } => {
                let new = value.value(root, run, exchange);
                run.update_var(*var, new, current_case);
                ActionResult::Next
            }
            Action::ModifyJsonBody { pointer, replace, modifiers, fc_unsuccessful } => {
                let direction = run.direction();
                let mut body_json = match exchange.body(direction).as_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "modify_json_body: malformed body");
                        return ActionResult::StopIteration(Some(malformed_body_reply(direction)));
                    }
                };
                let current = match body_json.pointer(pointer) {
                    Some(v) => v.clone(),
                    None => {
                        trace!(pointer, "modify_json_body: pointer not found, no-op");
                        return ActionResult::Next;
                    }
                };
                let input = match replace {
                    Some(template) => template.render(root, run, exchange),
                    None => json_to_string(&current),
                };
                match apply_chain(modifiers, &input, root, run, exchange) {
                    Ok(output) => {
                        if let Some(slot) = body_json.pointer_mut(pointer) {
                            *slot = Value::String(output);
                        }
                        exchange.body_mut(direction).set_from_json(&body_json);
                        ActionResult::Next
                    }
                    Err(abort) => self.handle_modifier_failure(
                        abort.reason,
                        abort.fallback.or(*fc_unsuccessful),
                        true,
                        run,
                    ),
                }
            }
            Action::Reject { status, title, format } => {
                debug!(status, title = %title, "reject action");
                ActionResult::StopIteration(Some(LocalReply {
                    status: *status,
                    title: title.clone(),
                    format: *format,
                }))
            }
            Action::Drop => {
                debug!("drop action");
                ActionResult::StopIteration(None)
            }
            Action::Log { level, text } => {
                let message: String =
                    text.iter().map(|t| t.render(root, run, exchange)).collect();
                match level {
                    LogLevel::Trace => trace!("{}", message),
                    LogLevel::Debug => debug!("{}", message),
                    LogLevel::Info => info!("{}", message),
                    LogLevel::Warn => warn!("{}", message),
                    LogLevel::Error => error!("{}", message),
                }
                ActionResult::Next
            }
            Action::RouteToPool { pool } => {
                let pool = pool.render(root, run, exchange);
                debug!(pool = %pool, "route selected");
                run.set_selected_pool(&pool);
                ActionResult::Exit
            }
            Action::ExitFilterCase => ActionResult::Exit,
            Action::GotoFilterCase(target) => ActionResult::GotoFc(*target),
            Action::Lookup { service, source_var, destination_var, fc_unsuccessful } => {
                let query = json_to_string(run.var_value(*source_var));
                ActionResult::PauseIteration {
                    service: *service,
                    query,
                    destination_var: *destination_var,
                    fc_unsuccessful: *fc_unsuccessful,
                }
            }
        }
    }

    fn handle_modifier_failure(
        &self,
        reason: ModifierFailure,
        fallback: Option<FilterCaseId>,
        is_body: bool,
        run: &RunState,
    ) -> ActionResult {
        if let Some(target) = fallback {
            debug!(%reason, target, "modifier chain failed, redirecting");
            return ActionResult::GotoFc(target);
        }
        if is_body {
            warn!(%reason, "modifier chain failed on body, terminal reply");
            ActionResult::StopIteration(Some(malformed_body_reply(run.direction())))
        } else {
            // No fallback: header modification degrades to a no-op.
            debug!(%reason, "modifier chain failed, header left unmodified");
            ActionResult::Next
        }
    }
}

/// 400 toward the client for request-side trouble, 500 for response-side.
/// The asymmetry is deliberate: a request the proxy cannot process is the
/// client's mistake, a response it cannot process is an upstream failure.
fn malformed_body_reply(direction: Direction) -> LocalReply {
    match direction {
        Direction::Request => LocalReply {
            status: 400,
            title: "Bad Request".to_string(),
            format: ReplyFormat::ProblemJson,
        },
        Direction::Response => LocalReply {
            status: 500,
            title: "Internal Server Error".to_string(),
            format: ReplyFormat::ProblemJson,
        },
    }
}

/// Set or append one query parameter in the request `:path`.
fn rewrite_query_param(exchange: &mut Exchange<'_>, name: &str, value: &str) {
    let path = exchange
        .headers(Direction::Request)
        .get(":path")
        .into_iter()
        .next()
        .unwrap_or_default();

    let (base, query) = match path.split_once('?') {
        Some((base, query)) => (base.to_string(), query.to_string()),
        None => (path.clone(), String::new()),
    };

    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (k, v) = p.split_once('=').unwrap_or((p, ""));
            (k.to_string(), v.to_string())
        })
        .collect();

    match pairs.iter_mut().find(|(k, _)| k == name) {
        Some(pair) => pair.1 = value.to_string(),
        None => pairs.push((name.to_string(), value.to_string())),
    }

    let rebuilt: Vec<String> = pairs.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
    let new_path = format!("{}?{}", base, rebuilt.join("&"));
    exchange.headers_mut(Direction::Request).set(":path", &new_path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HeaderMap, MemoryBody, MemoryHeaderMap};

    #[test]
    fn test_rewrite_query_param() {
        let mut req = MemoryHeaderMap::new();
        req.set(":path", "/nnrf-disc/v1/nf-instances?target-nf-type=AMF&limit=2");
        let mut resp = MemoryHeaderMap::new();
        let (mut rb, mut sb) = (MemoryBody::empty(), MemoryBody::empty());
        let mut exchange = Exchange {
            request_headers: &mut req,
            response_headers: &mut resp,
            request_body: &mut rb,
            response_body: &mut sb,
        };

        rewrite_query_param(&mut exchange, "target-nf-type", "CHF");
        assert_eq!(
            exchange.headers(Direction::Request).get(":path")[0],
            "/nnrf-disc/v1/nf-instances?target-nf-type=CHF&limit=2"
        );

        rewrite_query_param(&mut exchange, "requester-nf-type", "SMF");
        assert_eq!(
            exchange.headers(Direction::Request).get(":path")[0],
            "/nnrf-disc/v1/nf-instances?target-nf-type=CHF&limit=2&requester-nf-type=SMF"
        );
    }
}
