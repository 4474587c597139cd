//! The filter-case state machine.
//!
//! Walks the rules of one rule-set: materializes exactly what the next
//! rule's condition needs (LoadFilterData), evaluates the compiled
//! predicate, executes the action list of a matching rule and follows the
//! control flow its results dictate. Pausing for an asynchronous lookup
//! yields an explicit [`Continuation`] value; nothing inside the engine
//! retains paused state.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::LookupServiceKind;
use crate::context::{RootConfig, RunState, ValueIndex};
use crate::message::{Direction, Exchange};

use super::actions::{ActionResult, LocalReply};
use super::case::{FilterCaseId, FilterRule};
use super::phases::Phase;

/// Outcome of running (part of) one rule-set.
#[derive(Debug)]
pub enum CaseOutcome {
    /// Rules exhausted or an exit action ran; the pipeline continues
    Continue,
    /// A terminal reply was produced; no further rule processing
    StopIteration(Option<LocalReply>),
    /// Frozen awaiting an external lookup
    Paused(PausedCase),
}

/// Where a paused rule-set resumes, plus what it is waiting for.
#[derive(Debug)]
pub struct PausedCase {
    pub(crate) case: FilterCaseId,
    pub(crate) rule: usize,
    pub(crate) next_action: usize,
    pub(crate) destination_var: ValueIndex,
    pub(crate) fc_unsuccessful: Option<FilterCaseId>,
    pub service: LookupServiceKind,
    pub query: String,
}

/// Resumable cursor across the whole phase pipeline. Handed to the host on
/// pause and back to [`Engine::resume`]; dropping it cancels cleanly.
#[derive(Debug)]
pub struct Continuation {
    pub(crate) phase: Phase,
    /// Position within the phase's start-case list
    pub(crate) phase_case_pos: usize,
    pub(crate) case: FilterCaseId,
    pub(crate) rule: usize,
    pub(crate) next_action: usize,
    pub(crate) destination_var: ValueIndex,
    pub(crate) fc_unsuccessful: Option<FilterCaseId>,
}

impl Continuation {
    pub fn phase(&self) -> Phase {
        self.phase
    }
}

/// The rule engine: a frozen [`RootConfig`] plus the walking logic.
#[derive(Debug, Clone)]
pub struct Engine {
    root: Arc<RootConfig>,
}

impl Engine {
    pub fn new(root: Arc<RootConfig>) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &RootConfig {
        &self.root
    }

    /// Resolve a start case by plain name or, for topology hiding cases, by
    /// the (roaming partner, service case, name) triple.
    fn resolve_case(&self, name: &str, run: &RunState) -> Option<FilterCaseId> {
        self.root.filter_case_id(name).or_else(|| {
            let partner = run.roaming_partner()?;
            let service_case = run.service_case()?;
            self.root.topology_case_id(partner, service_case, name)
        })
    }

    /// Run one rule-set by name. A missing rule-set is a
    /// configuration-shape case, not an error: log and continue.
    pub fn run_case_by_name(
        &self,
        name: &str,
        run: &mut RunState,
        exchange: &mut Exchange<'_>,
    ) -> CaseOutcome {
        match self.resolve_case(name, run) {
            Some(id) => self.run_case(id, 0, 0, run, exchange),
            None => {
                warn!(filter_case = name, "start filter case not found, continuing");
                CaseOutcome::Continue
            }
        }
    }

    /// Run a rule-set from a given rule/action cursor (0,0 = the start).
    pub(crate) fn run_case(
        &self,
        mut case_id: FilterCaseId,
        start_rule: usize,
        start_action: usize,
        run: &mut RunState,
        exchange: &mut Exchange<'_>,
    ) -> CaseOutcome {
        let mut rule_idx = start_rule;
        // Non-zero only on the resume path: skip load/eval and continue
        // mid-action-list.
        let mut action_cursor = if start_action > 0 { Some(start_action) } else { None };

        'case: loop {
            let case = self.root.filter_case(case_id);
            debug!(filter_case = %case.name, rule = rule_idx, "processing filter case");

            while rule_idx < case.rules.len() {
                let rule = &case.rules[rule_idx];

                let matched = match action_cursor {
                    Some(_) => true,
                    None => {
                        self.load_filter_data(case_id, rule, run, exchange);
                        match &rule.condition {
                            Some(op) => op.eval(&self.root, run, exchange),
                            // A rule without a condition continues
                            // immediately.
                            None => false,
                        }
                    }
                };

                if matched {
                    trace!(rule = %rule.name, "rule matched");
                    let start = action_cursor.take().unwrap_or(0);
                    for (offset, action) in rule.actions[start..].iter().enumerate() {
                        let action_idx = start + offset;
                        match action.execute(&self.root, run, exchange, case_id) {
                            ActionResult::Next => {}
                            ActionResult::GotoFc(target) => {
                                debug!(
                                    from = %case.name,
                                    to = %self.root.filter_case(target).name,
                                    "goto filter case"
                                );
                                case_id = target;
                                rule_idx = 0;
                                continue 'case;
                            }
                            ActionResult::Exit => return CaseOutcome::Continue,
                            ActionResult::StopIteration(reply) => {
                                return CaseOutcome::StopIteration(reply)
                            }
                            ActionResult::PauseIteration {
                                service,
                                query,
                                destination_var,
                                fc_unsuccessful,
                            } => {
                                return CaseOutcome::Paused(PausedCase {
                                    case: case_id,
                                    rule: rule_idx,
                                    next_action: action_idx + 1,
                                    destination_var,
                                    fc_unsuccessful,
                                    service,
                                    query,
                                })
                            }
                        }
                    }
                }

                rule_idx += 1;
            }

            // Rules exhausted with nothing terminal.
            return CaseOutcome::Continue;
        }
    }

    /// Guarantee that everything the rule's condition references is
    /// materialized in RunState.
    fn load_filter_data(
        &self,
        case_id: FilterCaseId,
        rule: &FilterRule,
        run: &mut RunState,
        exchange: &Exchange<'_>,
    ) {
        // Required headers are always re-read fresh: a prior rule may have
        // mutated them.
        for direction in [Direction::Request, Direction::Response] {
            for &idx in &rule.required.headers[direction.idx()] {
                run.materialize_header(&self.root, exchange, direction, idx);
            }
        }

        if rule.required.api_context {
            run.ensure_api_context(&self.root, exchange);
        }

        // Dependency-driven lazy refresh: run this case's extraction
        // recipes for a required variable unless this exact case already
        // wrote it and no header changed since.
        let case = self.root.filter_case(case_id);
        for &var in &rule.required.vars {
            let fresh =
                run.var_last_writer(var) == Some(case_id) && !run.var_stale(var);
            if fresh {
                continue;
            }
            match case.data_for_var.get(&var) {
                Some(data_ids) => {
                    for &id in data_ids {
                        self.root.filter_data(id).apply(&self.root, run, exchange, case_id);
                    }
                }
                None => {
                    // No recipe in this case: whatever an earlier case left
                    // there (or null) is what the condition sees.
                    trace!(var, "required variable has no filter data in this case");
                }
            }
        }

        for &param in &rule.required.query_params {
            run.materialize_query_param(&self.root, exchange, param);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::context::{NetworkOrigin, RootConfig};
    use crate::message::{HeaderMap, MemoryBody, MemoryHeaderMap};
    use serde_json::json;

    fn engine(yaml: &str) -> Engine {
        let config = ProxyConfig::from_yaml(yaml).unwrap();
        Engine::new(RootConfig::from_config(&config).unwrap())
    }

    struct Mess {
        req: MemoryHeaderMap,
        resp: MemoryHeaderMap,
        req_body: MemoryBody,
        resp_body: MemoryBody,
    }

    impl Mess {
        fn new(path: &str) -> Self {
            let mut req = MemoryHeaderMap::new();
            req.set(":method", "GET");
            req.set(":path", path);
            Self {
                req,
                resp: MemoryHeaderMap::new(),
                req_body: MemoryBody::empty(),
                resp_body: MemoryBody::empty(),
            }
        }

        fn exchange(&mut self) -> Exchange<'_> {
            Exchange {
                request_headers: &mut self.req,
                response_headers: &mut self.resp,
                request_body: &mut self.req_body,
                response_body: &mut self.resp_body,
            }
        }
    }

    const MCC_CASE: &str = r#"
filter_cases:
  - name: sc_mcc
    filter_data:
      - name: mcc_from_path
        source: path
        extractor_regex: "mcc(?P<mcc>\\d{3})"
    filter_rules:
      - name: mark_mcc_262
        condition:
          op_equals:
            left:
              term_var: mcc
            right:
              term_string: "262"
        actions:
          - add_header:
              name: x-mcc-match
              value:
                term_string: "yes"
"#;

    #[test]
    fn test_lazy_extraction_and_action() {
        let engine = engine(MCC_CASE);
        let root = engine.root();
        let mut run = RunState::new(root, NetworkOrigin::Internal, None);
        let mut mess = Mess::new("/namf-comm/v1/mcc262/contexts");
        let mut exchange = mess.exchange();

        let outcome = engine.run_case_by_name("sc_mcc", &mut run, &mut exchange);
        assert!(matches!(outcome, CaseOutcome::Continue));
        drop(exchange);
        assert_eq!(mess.req.get("x-mcc-match"), vec!["yes"]);
    }

    #[test]
    fn test_missing_case_continues() {
        let engine = engine(MCC_CASE);
        let root = engine.root();
        let mut run = RunState::new(root, NetworkOrigin::Internal, None);
        let mut mess = Mess::new("/x");
        let mut exchange = mess.exchange();

        let outcome = engine.run_case_by_name("does_not_exist", &mut run, &mut exchange);
        assert!(matches!(outcome, CaseOutcome::Continue));
    }

    #[test]
    fn test_conditionless_rule_continues() {
        let engine = engine(
            r#"
filter_cases:
  - name: sc1
    filter_rules:
      - name: disabled_rule
        actions:
          - reject_message:
              status: 403
              title: forbidden
      - name: always
        condition:
          term_boolean: true
        actions:
          - add_header:
              name: x-reached
              value:
                term_string: "1"
"#,
        );
        let root = engine.root();
        let mut run = RunState::new(root, NetworkOrigin::Internal, None);
        let mut mess = Mess::new("/x");
        let mut exchange = mess.exchange();

        // The conditionless rule's reject must never fire.
        let outcome = engine.run_case_by_name("sc1", &mut run, &mut exchange);
        assert!(matches!(outcome, CaseOutcome::Continue));
        drop(exchange);
        assert_eq!(mess.req.get("x-reached"), vec!["1"]);
    }

    #[test]
    fn test_goto_and_stop() {
        let engine = engine(
            r#"
filter_cases:
  - name: entry
    filter_rules:
      - name: jump
        condition:
          term_boolean: true
        actions:
          - goto_filter_case:
              name: blocker
          - add_header:
              name: x-never
              value:
                term_string: "1"
  - name: blocker
    filter_rules:
      - name: block
        condition:
          term_boolean: true
        actions:
          - reject_message:
              status: 403
              title: Forbidden
"#,
        );
        let root = engine.root();
        let mut run = RunState::new(root, NetworkOrigin::External, Some("rp_A"));
        let mut mess = Mess::new("/x");
        let mut exchange = mess.exchange();

        let outcome = engine.run_case_by_name("entry", &mut run, &mut exchange);
        match outcome {
            CaseOutcome::StopIteration(Some(reply)) => {
                assert_eq!(reply.status, 403);
                assert_eq!(reply.title, "Forbidden");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        drop(exchange);
        // Actions after a goto never run.
        assert!(mess.req.get("x-never").is_empty());
    }

    #[test]
    fn test_load_filter_data_idempotent() {
        let engine = engine(MCC_CASE);
        let root = engine.root();
        let mut run = RunState::new(root, NetworkOrigin::Internal, None);
        let mut mess = Mess::new("/namf-comm/v1/mcc262/contexts");
        let exchange = mess.exchange();

        let case_id = root.filter_case_id("sc_mcc").unwrap();
        let rule = &root.filter_case(case_id).rules[0];
        engine.load_filter_data(case_id, rule, &mut run, &exchange);
        let mcc = root.var_index("mcc").unwrap();
        let first = run.var_value(mcc).clone();
        let first_epoch = run.headers_epoch();

        // Unchanged headers, already written by this case: identical state.
        engine.load_filter_data(case_id, rule, &mut run, &exchange);
        assert_eq!(run.var_value(mcc), &first);
        assert_eq!(run.headers_epoch(), first_epoch);
        assert_eq!(first, json!("262"));
    }

    #[test]
    fn test_header_mutation_triggers_refresh() {
        let engine = engine(
            r#"
filter_cases:
  - name: sc1
    filter_data:
      - name: host_from_header
        source:
          header:
            name: x-host
        variable_name: host
    filter_rules:
      - name: rewrite
        condition:
          op_equals:
            left:
              term_var: host
            right:
              term_string: original
        actions:
          - modify_header:
              name: x-host
              replace_value:
                term_string: rewritten
      - name: check_rewritten
        condition:
          op_equals:
            left:
              term_var: host
            right:
              term_string: rewritten
        actions:
          - add_header:
              name: x-saw-rewrite
              value:
                term_string: "1"
"#,
        );
        let root = engine.root();
        let mut run = RunState::new(root, NetworkOrigin::Internal, None);
        let mut mess = Mess::new("/x");
        mess.req.set("x-host", "original");
        let mut exchange = mess.exchange();

        let outcome = engine.run_case_by_name("sc1", &mut run, &mut exchange);
        assert!(matches!(outcome, CaseOutcome::Continue));
        drop(exchange);
        // The second rule saw the value the first rule wrote.
        assert_eq!(mess.req.get("x-saw-rewrite"), vec!["1"]);
    }
}
