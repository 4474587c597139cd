//! Per-exchange value store.
//!
//! One `RunState` lives for the whole request/response exchange. It holds
//! the materialized header/query/variable values addressed by the indices
//! interned in [`RootConfig`], with last-writer bookkeeping so filter cases
//! know which variables they still have to fill.

use serde_json::Value;
use tracing::trace;

use super::root::{RootConfig, ValueIndex};
use crate::filter::{FilterCaseId, Phase};
use crate::message::{Direction, Exchange};

/// Whether the exchange entered from the own (internal) network or from a
/// roaming partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkOrigin {
    Internal,
    External,
}

/// Lazily classified request API context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiContext {
    pub api_name: String,
    pub api_version: String,
    pub resource: String,
}

/// Mutable state of one in-flight exchange. Exclusively owned by the task
/// processing the exchange; never shared.
#[derive(Debug)]
pub struct RunState {
    /// Materialized header values, indexed [direction][header index].
    /// `None` = not materialized or absent; distinguished via the live map.
    header_values: [Vec<Option<Vec<String>>>; 2],
    /// Whether the header was present in the live map at materialization.
    header_present: [Vec<bool>; 2],
    query_param_values: Vec<Option<String>>,
    var_values: Vec<Value>,
    var_last_writer: Vec<Option<FilterCaseId>>,
    /// Header epoch at which each variable was last written (0 = never)
    var_write_epoch: Vec<u64>,
    direction: Direction,
    origin: NetworkOrigin,
    roaming_partner: Option<String>,
    service_case: Option<String>,
    selected_pool: Option<String>,
    /// `None` = not classified yet
    api_context: Option<Option<ApiContext>>,
    /// Incremented whenever an action mutates live headers; variable
    /// extraction compares its write epoch against this to decide whether a
    /// refresh is due
    headers_epoch: u64,
    response_start_phase: Phase,
}

impl RunState {
    pub fn new(root: &RootConfig, origin: NetworkOrigin, roaming_partner: Option<&str>) -> Self {
        let headers = root.header_count();
        Self {
            header_values: [vec![None; headers], vec![None; headers]],
            header_present: [vec![false; headers], vec![false; headers]],
            query_param_values: vec![None; root.query_param_count()],
            var_values: vec![Value::Null; root.var_count()],
            var_last_writer: vec![None; root.var_count()],
            var_write_epoch: vec![0; root.var_count()],
            direction: Direction::Request,
            origin,
            roaming_partner: roaming_partner.map(str::to_string),
            service_case: None,
            selected_pool: None,
            api_context: None,
            headers_epoch: 1,
            response_start_phase: Phase::InResponseScreening,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Flip to response-side processing. Header materializations stay valid;
    /// variables survive the whole exchange by design.
    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn origin(&self) -> NetworkOrigin {
        self.origin
    }

    pub fn roaming_partner(&self) -> Option<&str> {
        self.roaming_partner.as_deref()
    }

    pub fn service_case(&self) -> Option<&str> {
        self.service_case.as_deref()
    }

    pub fn set_service_case(&mut self, name: &str) {
        self.service_case = Some(name.to_string());
    }

    pub fn selected_pool(&self) -> Option<&str> {
        self.selected_pool.as_deref()
    }

    pub fn set_selected_pool(&mut self, pool: &str) {
        self.selected_pool = Some(pool.to_string());
    }

    pub fn response_start_phase(&self) -> Phase {
        self.response_start_phase
    }

    pub fn set_response_start_phase(&mut self, phase: Phase) {
        self.response_start_phase = phase;
    }

    // ---- headers ------------------------------------------------------

    /// Materialized values of a header; empty slice when absent or not yet
    /// materialized.
    pub fn header_value(&self, direction: Direction, idx: ValueIndex) -> &[String] {
        self.header_values[direction.idx()][idx as usize]
            .as_deref()
            .unwrap_or(&[])
    }

    /// Whether the header existed in the live map when last materialized.
    pub fn has_header_value(&self, direction: Direction, idx: ValueIndex) -> bool {
        self.header_present[direction.idx()][idx as usize]
    }

    /// Absent headers and headers whose every value is empty count the same.
    pub fn header_value_is_empty(&self, direction: Direction, idx: ValueIndex) -> bool {
        !self.has_header_value(direction, idx)
            || self.header_value(direction, idx).iter().all(|v| v.is_empty())
    }

    /// All values joined with "," — the form `equals` compares against.
    pub fn header_value_joined(&self, direction: Direction, idx: ValueIndex) -> String {
        self.header_value(direction, idx).join(",")
    }

    /// Re-read one header fresh from the live map.
    pub fn materialize_header(
        &mut self,
        root: &RootConfig,
        exchange: &Exchange<'_>,
        direction: Direction,
        idx: ValueIndex,
    ) {
        let name = root.header_name(idx);
        let raw = exchange.headers(direction).get(name);
        let present = !raw.is_empty();
        let values = split_header_values(name, &raw);
        self.header_present[direction.idx()][idx as usize] = present;
        self.header_values[direction.idx()][idx as usize] =
            if present { Some(values) } else { None };
    }

    /// Marks materialized header state stale after a mutating action.
    pub fn mark_headers_changed(&mut self) {
        self.headers_epoch += 1;
    }

    pub fn headers_epoch(&self) -> u64 {
        self.headers_epoch
    }

    /// Whether a variable's last extraction predates the latest header
    /// mutation.
    pub fn var_stale(&self, idx: ValueIndex) -> bool {
        self.var_write_epoch.get(idx as usize).copied().unwrap_or(0) < self.headers_epoch
    }

    // ---- query parameters ---------------------------------------------

    pub fn query_param_value(&self, idx: ValueIndex) -> Option<&str> {
        self.query_param_values[idx as usize].as_deref()
    }

    pub fn has_query_param_value(&self, idx: ValueIndex) -> bool {
        self.query_param_values[idx as usize].is_some()
    }

    /// Parse the request `:path` for one query parameter if not yet
    /// populated.
    pub fn materialize_query_param(
        &mut self,
        root: &RootConfig,
        exchange: &Exchange<'_>,
        idx: ValueIndex,
    ) {
        if self.query_param_values[idx as usize].is_some() {
            return;
        }
        let path = exchange
            .headers(Direction::Request)
            .get(":path")
            .into_iter()
            .next()
            .unwrap_or_default();
        let wanted = root.query_param_name(idx);
        self.query_param_values[idx as usize] = parse_query_param(&path, wanted);
    }

    pub fn set_query_param_value(&mut self, idx: ValueIndex, value: &str) {
        self.query_param_values[idx as usize] = Some(value.to_string());
    }

    // ---- variables ----------------------------------------------------

    /// Variable by index; `Null` when unset or out of grown range.
    pub fn var_value(&self, idx: ValueIndex) -> &Value {
        self.var_values.get(idx as usize).unwrap_or(&Value::Null)
    }

    /// `None` = never written.
    pub fn var_last_writer(&self, idx: ValueIndex) -> Option<FilterCaseId> {
        self.var_last_writer.get(idx as usize).copied().flatten()
    }

    pub fn var_is_set(&self, idx: ValueIndex) -> bool {
        self.var_last_writer(idx).is_some()
    }

    /// A variable is empty when never set, or set to an empty
    /// string/array/object. Numbers, booleans and an explicitly written
    /// `null` are never empty.
    pub fn var_is_empty(&self, idx: ValueIndex) -> bool {
        if !self.var_is_set(idx) {
            return true;
        }
        match self.var_value(idx) {
            Value::String(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        }
    }

    /// Unconditional write, growing the store if `idx` is beyond the sized
    /// range.
    pub fn update_var(&mut self, idx: ValueIndex, value: Value, writer: FilterCaseId) {
        let slot = idx as usize;
        if slot >= self.var_values.len() {
            self.var_values.resize(slot + 1, Value::Null);
            self.var_last_writer.resize(slot + 1, None);
            self.var_write_epoch.resize(slot + 1, 0);
        }
        trace!(var = idx, ?value, writer, "variable updated");
        self.var_values[slot] = value;
        self.var_last_writer[slot] = Some(writer);
        self.var_write_epoch[slot] = self.headers_epoch;
    }

    /// Write policy used when filter data produces a value: only overwrite
    /// when the new value is a non-empty string or a boolean, or the
    /// destination was never written.
    pub fn update_var_if_meaningful(
        &mut self,
        idx: ValueIndex,
        value: Value,
        writer: FilterCaseId,
    ) {
        let overwrite = match &value {
            Value::String(s) => !s.is_empty(),
            Value::Bool(_) => true,
            _ => false,
        };
        if overwrite || !self.var_is_set(idx) {
            self.update_var(idx, value, writer);
        } else {
            // Keep the old value but record that this case refreshed it.
            let slot = idx as usize;
            if slot < self.var_last_writer.len() {
                self.var_last_writer[slot] = Some(writer);
                self.var_write_epoch[slot] = self.headers_epoch;
            }
        }
    }

    // ---- API context --------------------------------------------------

    /// Classify the request path into an API context once per exchange.
    pub fn ensure_api_context(&mut self, root: &RootConfig, exchange: &Exchange<'_>) {
        if self.api_context.is_some() {
            return;
        }
        let path = exchange
            .headers(Direction::Request)
            .get(":path")
            .into_iter()
            .next()
            .unwrap_or_default();
        let path = path.split('?').next().unwrap_or("");
        let matchers = root.api_matchers();

        let context = matchers
            .nf_api
            .captures(path)
            .map(|caps| ApiContext {
                api_name: caps.name("apiName").map_or("", |m| m.as_str()).to_string(),
                api_version: caps.name("apiVersion").map_or("", |m| m.as_str()).to_string(),
                resource: caps.name("resource").map_or("", |m| m.as_str()).to_string(),
            })
            .or_else(|| {
                matchers.bootstrapping.captures(path).map(|caps| ApiContext {
                    api_name: caps.name("apiName").map_or("", |m| m.as_str()).to_string(),
                    api_version: String::new(),
                    resource: String::new(),
                })
            })
            .or_else(|| {
                matchers.oauth2.captures(path).map(|caps| ApiContext {
                    api_name: caps.name("apiName").map_or("", |m| m.as_str()).to_string(),
                    api_version: String::new(),
                    resource: String::new(),
                })
            });

        self.api_context = Some(context);
    }

    /// The classified API name; empty until classification ran or when the
    /// path matched no known shape.
    pub fn api_name(&self) -> &str {
        match &self.api_context {
            Some(Some(ctx)) => &ctx.api_name,
            _ => "",
        }
    }

    pub fn api_context(&self) -> Option<&ApiContext> {
        self.api_context.as_ref().and_then(|c| c.as_ref())
    }
}

/// Split a raw header value list into elements on ",". `set-cookie` is the
/// one header whose values legitimately contain commas and stays unsplit.
pub fn split_header_values(name: &str, raw: &[String]) -> Vec<String> {
    if name.eq_ignore_ascii_case("set-cookie") {
        return raw.to_vec();
    }
    raw.iter()
        .flat_map(|v| v.split(','))
        .map(|v| v.to_string())
        .collect()
}

fn parse_query_param(path: &str, wanted: &str) -> Option<String> {
    let query = path.split_once('?')?.1;
    let query = query.split('#').next().unwrap_or(query);
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == wanted {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::message::{HeaderMap, MemoryBody, MemoryHeaderMap};

    fn empty_exchange() -> (MemoryHeaderMap, MemoryHeaderMap, MemoryBody, MemoryBody) {
        (MemoryHeaderMap::new(), MemoryHeaderMap::new(), MemoryBody::empty(), MemoryBody::empty())
    }

    #[test]
    fn test_var_emptiness_semantics() {
        let root = RootConfig::from_config(&ProxyConfig::default()).unwrap();
        let mut run = RunState::new(&root, NetworkOrigin::Internal, None);

        // unset reads as null and is empty
        assert_eq!(run.var_value(0), &Value::Null);
        assert!(run.var_is_empty(0));
        assert!(!run.var_is_set(0));

        run.update_var(0, Value::String(String::new()), 0);
        assert!(run.var_is_empty(0));
        assert!(run.var_is_set(0));

        run.update_var(0, Value::Bool(false), 0);
        assert!(!run.var_is_empty(0));

        // an explicitly written null is set but not empty
        run.update_var(0, Value::Null, 0);
        assert!(run.var_is_set(0));
        assert!(!run.var_is_empty(0));
    }

    #[test]
    fn test_var_store_grows() {
        let root = RootConfig::from_config(&ProxyConfig::default()).unwrap();
        let mut run = RunState::new(&root, NetworkOrigin::Internal, None);
        run.update_var(7, Value::String("late".into()), 3);
        assert_eq!(run.var_value(7), &Value::String("late".into()));
        assert_eq!(run.var_last_writer(7), Some(3));
    }

    #[test]
    fn test_meaningful_update_keeps_old_value() {
        let root = RootConfig::from_config(&ProxyConfig::default()).unwrap();
        let mut run = RunState::new(&root, NetworkOrigin::Internal, None);

        run.update_var(0, Value::String("262".into()), 1);
        run.update_var_if_meaningful(0, Value::String(String::new()), 2);
        assert_eq!(run.var_value(0), &Value::String("262".into()));
        // but the writer advanced, so case 2 will not re-run extraction
        assert_eq!(run.var_last_writer(0), Some(2));
    }

    #[test]
    fn test_split_header_values() {
        let raw = vec!["33.1.1.1, 10.2.3.4".to_string(), "9.9.9.9".to_string()];
        let split = split_header_values("x-forwarded-for", &raw);
        assert_eq!(split, vec!["33.1.1.1", " 10.2.3.4", "9.9.9.9"]);

        let cookie = vec!["a=1; Expires=Wed, 21 Oct 2015".to_string()];
        assert_eq!(split_header_values("set-cookie", &cookie), cookie);
    }

    #[test]
    fn test_query_param_parsing() {
        assert_eq!(
            parse_query_param("/nnrf-disc/v1/nf-instances?target-nf-type=CHF&limit=2", "target-nf-type"),
            Some("CHF".to_string())
        );
        assert_eq!(parse_query_param("/nnrf-disc/v1/nf-instances", "limit"), None);
        assert_eq!(
            parse_query_param("/x?flag&limit=2", "flag"),
            Some(String::new())
        );
    }

    #[test]
    fn test_api_context_classification() {
        let root = RootConfig::from_config(&ProxyConfig::default()).unwrap();
        let mut run = RunState::new(&root, NetworkOrigin::External, Some("rp_A"));

        let (mut req, mut resp, mut req_body, mut resp_body) = empty_exchange();
        req.set(":path", "/nausf-auth/v1/ue-authentications?x=1");
        let exchange = Exchange {
            request_headers: &mut req,
            response_headers: &mut resp,
            request_body: &mut req_body,
            response_body: &mut resp_body,
        };

        assert_eq!(run.api_name(), "");
        run.ensure_api_context(&root, &exchange);
        assert_eq!(run.api_name(), "nausf-auth");
        let ctx = run.api_context().unwrap();
        assert_eq!(ctx.api_version, "v1");
        assert_eq!(ctx.resource, "ue-authentications");
    }
}
