//! The six-phase screening pipeline and its start-case tables.
//!
//! A request traverses in-request screening, routing and out-request
//! screening; the matching response traverses in-response screening,
//! response routing and out-response screening. Each phase selects its
//! start rule-sets from a table keyed either by network origin (phases
//! 1, 2, 5, 6) or by the upstream pool the routing phase picked
//! (phases 3 and 4).

use tracing::{debug, warn};

use crate::config::{PhaseTableConfig, PhasesConfig};
use crate::context::{NetworkOrigin, RunState};
use crate::lookup::LookupRequest;
use crate::message::{Direction, Exchange};

use super::actions::LocalReply;
use super::machine::{CaseOutcome, Continuation, Engine, PausedCase};

/// The six pipeline phases, in traversal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    InRequestScreening,
    Routing,
    OutRequestScreening,
    InResponseScreening,
    ResponseRouting,
    OutResponseScreening,
}

impl Phase {
    pub fn number(&self) -> u8 {
        match self {
            Phase::InRequestScreening => 1,
            Phase::Routing => 2,
            Phase::OutRequestScreening => 3,
            Phase::InResponseScreening => 4,
            Phase::ResponseRouting => 5,
            Phase::OutResponseScreening => 6,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Phase::InRequestScreening => "in_request_screening",
            Phase::Routing => "routing",
            Phase::OutRequestScreening => "out_request_screening",
            Phase::InResponseScreening => "in_response_screening",
            Phase::ResponseRouting => "response_routing",
            Phase::OutResponseScreening => "out_response_screening",
        }
    }
}

const REQUEST_PHASES: [Phase; 3] = [
    Phase::InRequestScreening,
    Phase::Routing,
    Phase::OutRequestScreening,
];

const RESPONSE_PHASES: [Phase; 3] = [
    Phase::InResponseScreening,
    Phase::ResponseRouting,
    Phase::OutResponseScreening,
];

/// Start-case names for one phase.
#[derive(Debug, Default)]
pub struct PhaseTable {
    own_network: Vec<String>,
    external_default: Vec<String>,
    per_roaming_partner: std::collections::HashMap<String, Vec<String>>,
    per_pool: std::collections::HashMap<String, Vec<String>>,
}

impl PhaseTable {
    fn from_config(config: &PhaseTableConfig) -> Self {
        Self {
            own_network: config.own_network.clone(),
            external_default: config.external_default.clone(),
            per_roaming_partner: config.per_roaming_partner.clone(),
            per_pool: config.per_pool.clone(),
        }
    }

    /// Start cases for an origin-keyed phase. An external peer with a
    /// dedicated entry overrides the external default.
    pub fn start_cases_by_origin(
        &self,
        origin: NetworkOrigin,
        roaming_partner: Option<&str>,
    ) -> &[String] {
        match origin {
            NetworkOrigin::Internal => &self.own_network,
            NetworkOrigin::External => roaming_partner
                .and_then(|rp| self.per_roaming_partner.get(rp))
                .map(Vec::as_slice)
                .unwrap_or(&self.external_default),
        }
    }

    /// Start cases for a pool-keyed phase. No pool selected, or a pool
    /// with no entry, means nothing to run.
    pub fn start_cases_by_pool(&self, pool: Option<&str>) -> &[String] {
        pool.and_then(|p| self.per_pool.get(p))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// All six phase tables, frozen at load time.
#[derive(Debug, Default)]
pub struct PhaseTables {
    in_request_screening: PhaseTable,
    routing: PhaseTable,
    out_request_screening: PhaseTable,
    in_response_screening: PhaseTable,
    response_routing: PhaseTable,
    out_response_screening: PhaseTable,
}

impl PhaseTables {
    pub fn from_config(config: &PhasesConfig) -> Self {
        Self {
            in_request_screening: PhaseTable::from_config(&config.in_request_screening),
            routing: PhaseTable::from_config(&config.routing),
            out_request_screening: PhaseTable::from_config(&config.out_request_screening),
            in_response_screening: PhaseTable::from_config(&config.in_response_screening),
            response_routing: PhaseTable::from_config(&config.response_routing),
            out_response_screening: PhaseTable::from_config(&config.out_response_screening),
        }
    }

    pub fn table(&self, phase: Phase) -> &PhaseTable {
        match phase {
            Phase::InRequestScreening => &self.in_request_screening,
            Phase::Routing => &self.routing,
            Phase::OutRequestScreening => &self.out_request_screening,
            Phase::InResponseScreening => &self.in_response_screening,
            Phase::ResponseRouting => &self.response_routing,
            Phase::OutResponseScreening => &self.out_response_screening,
        }
    }
}

/// What the pipeline driver hands back to the host.
#[derive(Debug)]
pub enum ExchangeOutcome {
    /// All phases of this side ran; forward the message
    Continue,
    /// A terminal reply: answer locally, do not forward
    LocalReply(Option<LocalReply>),
    /// Awaiting an external lookup. Issue `request`, then call
    /// [`Engine::resume`] with the result and the continuation.
    Paused {
        continuation: Continuation,
        request: LookupRequest,
    },
}

impl Engine {
    /// Run the request side, phases 1 through 3.
    pub fn process_request(
        &self,
        run: &mut RunState,
        exchange: &mut Exchange<'_>,
    ) -> ExchangeOutcome {
        run.set_direction(Direction::Request);
        self.run_phases(&REQUEST_PHASES, 0, 0, run, exchange)
    }

    /// Run the response side. Starts at the phase a terminal request-side
    /// outcome pinned, or at in-response screening by default.
    pub fn process_response(
        &self,
        run: &mut RunState,
        exchange: &mut Exchange<'_>,
    ) -> ExchangeOutcome {
        run.set_direction(Direction::Response);
        let start = RESPONSE_PHASES
            .iter()
            .position(|p| *p == run.response_start_phase())
            .unwrap_or(0);
        self.run_phases(&RESPONSE_PHASES, start, 0, run, exchange)
    }

    /// Feed a lookup result back into a paused pipeline and drive it on.
    /// On failure the rule's fallback rule-set takes over when one is
    /// configured; otherwise the destination variable is cleared and the
    /// action list continues.
    pub fn resume(
        &self,
        continuation: Continuation,
        result: Result<serde_json::Value, crate::error::LookupError>,
        run: &mut RunState,
        exchange: &mut Exchange<'_>,
    ) -> ExchangeOutcome {
        let Continuation {
            phase,
            phase_case_pos,
            case,
            rule,
            next_action,
            destination_var,
            fc_unsuccessful,
        } = continuation;

        let side: &[Phase] = if REQUEST_PHASES.contains(&phase) {
            &REQUEST_PHASES
        } else {
            &RESPONSE_PHASES
        };
        let phase_pos = side.iter().position(|p| *p == phase).unwrap_or(0);

        let outcome = match result {
            Ok(value) => {
                run.update_var(destination_var, value, case);
                self.run_case(case, rule, next_action, run, exchange)
            }
            Err(err) => {
                warn!(error = %err, "lookup failed");
                match fc_unsuccessful {
                    Some(target) => self.run_case(target, 0, 0, run, exchange),
                    None => {
                        run.update_var(destination_var, serde_json::Value::String(String::new()), case);
                        self.run_case(case, rule, next_action, run, exchange)
                    }
                }
            }
        };

        match self.settle(phase, phase_case_pos, outcome, run) {
            Settled::Done(done) => done,
            // The interrupted phase's remaining start cases, then the rest
            // of the side.
            Settled::NextCase => {
                self.run_phases(side, phase_pos, phase_case_pos + 1, run, exchange)
            }
        }
    }

    fn run_phases(
        &self,
        side: &[Phase],
        start_phase: usize,
        start_case: usize,
        run: &mut RunState,
        exchange: &mut Exchange<'_>,
    ) -> ExchangeOutcome {
        for (phase_pos, &phase) in side.iter().enumerate().skip(start_phase) {
            let table = self.root().phase_table(phase);
            let starts: Vec<String> = match phase {
                Phase::OutRequestScreening | Phase::InResponseScreening => table
                    .start_cases_by_pool(run.selected_pool())
                    .to_vec(),
                _ => table
                    .start_cases_by_origin(run.origin(), run.roaming_partner())
                    .to_vec(),
            };

            let first = if phase_pos == start_phase { start_case } else { 0 };
            for (case_pos, name) in starts.iter().enumerate().skip(first) {
                debug!(phase = phase.label(), filter_case = %name, "starting phase case");
                let outcome = self.run_case_by_name(name, run, exchange);
                match self.settle(phase, case_pos, outcome, run) {
                    Settled::Done(done) => return done,
                    Settled::NextCase => {}
                }
            }
        }
        ExchangeOutcome::Continue
    }

    /// Map a case outcome into what the phase loop does next, applying
    /// the response-start pinning a request-side terminal demands.
    fn settle(
        &self,
        phase: Phase,
        case_pos: usize,
        outcome: CaseOutcome,
        run: &mut RunState,
    ) -> Settled {
        match outcome {
            CaseOutcome::Continue => Settled::NextCase,
            CaseOutcome::StopIteration(reply) => {
                // A reply generated before routing skips response routing;
                // one generated during routing still gets it.
                match phase {
                    Phase::InRequestScreening => {
                        run.set_response_start_phase(Phase::OutResponseScreening)
                    }
                    Phase::Routing => run.set_response_start_phase(Phase::ResponseRouting),
                    _ => {}
                }
                Settled::Done(ExchangeOutcome::LocalReply(reply))
            }
            CaseOutcome::Paused(paused) => {
                let PausedCase {
                    case,
                    rule,
                    next_action,
                    destination_var,
                    fc_unsuccessful,
                    service,
                    query,
                } = paused;
                Settled::Done(ExchangeOutcome::Paused {
                    continuation: Continuation {
                        phase,
                        phase_case_pos: case_pos,
                        case,
                        rule,
                        next_action,
                        destination_var,
                        fc_unsuccessful,
                    },
                    request: LookupRequest { service, query },
                })
            }
        }
    }
}

enum Settled {
    Done(ExchangeOutcome),
    NextCase,
}
