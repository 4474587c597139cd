//! Configuration-time symbol tables and the compiled, frozen root state.
//!
//! All interning happens while a [`RootBuilder`] is exclusively owned during
//! configuration compilation. The frozen [`RootConfig`] has no interning API
//! at all; it is shared read-only (via `Arc`) by every concurrently
//! processed exchange.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::condition::compile_condition;
use crate::config::{FilterCaseConfig, ProxyConfig, ScramblingProfileConfig};
use crate::error::CompileError;
use crate::filter::{Action, FilterCase, FilterCaseId, FilterData, FilterDataId, FilterRule};
use crate::filter::{PhaseTable, PhaseTables};

/// Dense per-namespace handle for an interned name or constant.
pub type ValueIndex = u16;

/// Handle into the precompiled-regex cache.
pub type RegexId = u16;

/// One interning namespace: name -> index and back.
#[derive(Debug, Default)]
struct SymbolTable {
    names: Vec<String>,
    index: HashMap<String, ValueIndex>,
    /// Lowercase keys before lookup/insert (header names)
    case_insensitive: bool,
}

impl SymbolTable {
    fn case_insensitive() -> Self {
        Self { case_insensitive: true, ..Self::default() }
    }

    fn intern(&mut self, name: &str) -> Result<ValueIndex, CompileError> {
        let key = if self.case_insensitive {
            name.to_ascii_lowercase()
        } else {
            name.to_string()
        };
        if let Some(&idx) = self.index.get(&key) {
            return Ok(idx);
        }
        let idx = ValueIndex::try_from(self.names.len())
            .map_err(|_| CompileError::SymbolOverflow(ValueIndex::MAX as usize))?;
        self.names.push(key.clone());
        self.index.insert(key, idx);
        Ok(idx)
    }

    fn lookup(&self, name: &str) -> Option<ValueIndex> {
        if self.case_insensitive {
            self.index.get(&name.to_ascii_lowercase()).copied()
        } else {
            self.index.get(name).copied()
        }
    }

    fn name(&self, idx: ValueIndex) -> &str {
        &self.names[idx as usize]
    }

    fn len(&self) -> usize {
        self.names.len()
    }
}

/// AES-256-GCM key material for one generation prefix.
#[derive(Clone)]
pub struct ScramblingKey {
    /// 5-character prefix carried on the first scrambled label
    pub generation: String,
    pub key: [u8; 32],
    pub iv: [u8; 12],
}

impl std::fmt::Debug for ScramblingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("ScramblingKey")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// All key generations configured for one roaming partner.
#[derive(Debug, Clone)]
pub struct ScramblingProfile {
    keys: Vec<ScramblingKey>,
    active: usize,
    by_generation: HashMap<String, usize>,
}

impl ScramblingProfile {
    fn from_config(config: &ScramblingProfileConfig) -> Result<Self, CompileError> {
        let invalid = |reason: &str| CompileError::InvalidScramblingProfile {
            partner: config.roaming_partner.clone(),
            reason: reason.to_string(),
        };

        let mut keys = Vec::with_capacity(config.keys.len());
        let mut by_generation = HashMap::new();
        for key_config in &config.keys {
            let key_bytes = decode_hex(&key_config.key)
                .ok_or_else(|| invalid("key is not valid hex"))?;
            let iv_bytes = decode_hex(&key_config.iv)
                .ok_or_else(|| invalid("iv is not valid hex"))?;
            let key: [u8; 32] = key_bytes
                .try_into()
                .map_err(|_| invalid("key must be 32 bytes"))?;
            let iv: [u8; 12] = iv_bytes
                .try_into()
                .map_err(|_| invalid("iv must be 12 bytes"))?;
            by_generation.insert(key_config.generation.clone(), keys.len());
            keys.push(ScramblingKey { generation: key_config.generation.clone(), key, iv });
        }
        let active = *by_generation
            .get(&config.active_generation)
            .ok_or_else(|| invalid("active generation has no key material"))?;
        Ok(Self { keys, active, by_generation })
    }

    /// The key used when scrambling.
    pub fn active_key(&self) -> &ScramblingKey {
        &self.keys[self.active]
    }

    /// Resolve a generation prefix found on a scrambled label.
    pub fn key_for_generation(&self, generation: &str) -> Option<&ScramblingKey> {
        self.by_generation.get(generation).map(|&i| &self.keys[i])
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    data_encoding::HEXLOWER_PERMISSIVE.decode(s.as_bytes()).ok()
}

/// Precompiled classifiers for the request API context.
#[derive(Debug)]
pub struct ApiContextMatchers {
    /// Normal NF API: `/{apiRoot}/{apiName}/{apiVersion}/{resource}`
    pub nf_api: Regex,
    pub bootstrapping: Regex,
    pub oauth2: Regex,
}

impl ApiContextMatchers {
    fn new() -> Self {
        // These patterns are fixed, not configuration input.
        Self {
            nf_api: Regex::new(r".*/(?P<apiName>[^/]+)/(?P<apiVersion>v\d)/(?P<resource>.*)")
                .unwrap(),
            bootstrapping: Regex::new(r".*/(?P<apiName>bootstrapping)$").unwrap(),
            oauth2: Regex::new(r".*/(?P<apiName>oauth2)/token$").unwrap(),
        }
    }
}

/// Mutable interning state, alive only during compilation.
#[derive(Debug, Default)]
pub struct RootBuilder {
    const_values: Vec<Value>,
    headers: SymbolTable,
    query_params: SymbolTable,
    variables: SymbolTable,
    regexes: Vec<Regex>,
    regex_index: HashMap<String, RegexId>,
}

impl RootBuilder {
    pub fn new() -> Self {
        Self { headers: SymbolTable::case_insensitive(), ..Self::default() }
    }

    /// Intern a constant, deduplicating by JSON equality.
    pub fn intern_const(&mut self, value: Value) -> Result<ValueIndex, CompileError> {
        if let Some(pos) = self.const_values.iter().position(|v| *v == value) {
            return Ok(pos as ValueIndex);
        }
        let idx = ValueIndex::try_from(self.const_values.len())
            .map_err(|_| CompileError::SymbolOverflow(ValueIndex::MAX as usize))?;
        self.const_values.push(value);
        Ok(idx)
    }

    /// Intern a header name; case-insensitive.
    pub fn intern_header(&mut self, name: &str) -> Result<ValueIndex, CompileError> {
        self.headers.intern(name)
    }

    pub fn intern_query_param(&mut self, name: &str) -> Result<ValueIndex, CompileError> {
        self.query_params.intern(name)
    }

    pub fn intern_var(&mut self, name: &str) -> Result<ValueIndex, CompileError> {
        self.variables.intern(name)
    }

    /// Read an interned constant back during compilation.
    pub fn const_value(&self, idx: ValueIndex) -> &Value {
        &self.const_values[idx as usize]
    }

    /// Compile (or reuse) a regex.
    pub fn intern_regex(&mut self, pattern: &str) -> Result<RegexId, CompileError> {
        if let Some(&id) = self.regex_index.get(pattern) {
            return Ok(id);
        }
        let regex = Regex::new(pattern).map_err(|source| CompileError::InvalidRegex {
            pattern: pattern.to_string(),
            source,
        })?;
        let id = RegexId::try_from(self.regexes.len())
            .map_err(|_| CompileError::SymbolOverflow(RegexId::MAX as usize))?;
        self.regexes.push(regex);
        self.regex_index.insert(pattern.to_string(), id);
        Ok(id)
    }
}

/// Frozen per-configuration state shared by all exchanges.
#[derive(Debug)]
pub struct RootConfig {
    name: Option<String>,
    own_fqdn: Option<String>,
    const_values: Vec<Value>,
    headers: SymbolTable,
    query_params: SymbolTable,
    variables: SymbolTable,
    regexes: Vec<Regex>,
    kv_tables: HashMap<String, HashMap<String, String>>,
    klv_tables: HashMap<String, HashMap<String, Vec<String>>>,
    scrambling: HashMap<String, ScramblingProfile>,
    pub(crate) filter_data: Vec<FilterData>,
    pub(crate) filter_cases: Vec<FilterCase>,
    case_index: HashMap<String, FilterCaseId>,
    /// (roaming partner, service case, name) -> filter case
    topology_index: HashMap<(String, String, String), FilterCaseId>,
    pub(crate) phases: PhaseTables,
    api_matchers: ApiContextMatchers,
    plmn_suffix: Regex,
}

impl RootConfig {
    /// Compile a validated configuration into its executable form.
    pub fn from_config(config: &ProxyConfig) -> Result<Arc<Self>, CompileError> {
        let mut builder = RootBuilder::new();

        // Case ids follow declaration order so goto targets resolve in one
        // pass regardless of ordering.
        let mut case_index = HashMap::new();
        for (pos, case) in config.filter_cases.iter().enumerate() {
            case_index.insert(case.name.clone(), pos as FilterCaseId);
        }

        let mut filter_data = Vec::new();
        let mut filter_cases = Vec::with_capacity(config.filter_cases.len());
        for case_config in &config.filter_cases {
            let case = Self::compile_case(case_config, &mut builder, &case_index, &mut filter_data)?;
            filter_cases.push(case);
        }

        let mut topology_index = HashMap::new();
        for topo in &config.topology_cases {
            let id = *case_index
                .get(&topo.filter_case)
                .ok_or_else(|| CompileError::UnknownFilterCase(topo.filter_case.clone()))?;
            topology_index.insert(
                (topo.roaming_partner.clone(), topo.service_case.clone(), topo.name.clone()),
                id,
            );
        }

        let mut scrambling = HashMap::new();
        for profile in &config.scrambling_profiles {
            scrambling.insert(
                profile.roaming_partner.clone(),
                ScramblingProfile::from_config(profile)?,
            );
        }

        let phases = PhaseTables::from_config(&config.filter_phases);

        let root = Self {
            name: config.name.clone(),
            own_fqdn: config.own_fqdn.clone(),
            const_values: builder.const_values,
            headers: builder.headers,
            query_params: builder.query_params,
            variables: builder.variables,
            regexes: builder.regexes,
            kv_tables: config.kv_tables.clone(),
            klv_tables: config.klv_tables.clone(),
            scrambling,
            filter_data,
            filter_cases,
            case_index,
            topology_index,
            phases,
            api_matchers: ApiContextMatchers::new(),
            plmn_suffix: Regex::new(
                r"(?i)^(?P<label>.*?)(?P<plmn>\.5gc\.mnc\d{3}\.mcc\d{3}\.3gppnetwork\.org)$",
            )
            .unwrap(),
        };

        debug!(
            name = root.name.as_deref().unwrap_or("-"),
            filter_cases = root.filter_cases.len(),
            variables = root.variables.len(),
            headers = root.headers.len(),
            consts = root.const_values.len(),
            "configuration compiled"
        );

        Ok(Arc::new(root))
    }

    fn compile_case(
        case_config: &FilterCaseConfig,
        builder: &mut RootBuilder,
        case_index: &HashMap<String, FilterCaseId>,
        filter_data: &mut Vec<FilterData>,
    ) -> Result<FilterCase, CompileError> {
        let mut data_for_var: HashMap<ValueIndex, Vec<FilterDataId>> = HashMap::new();
        for data_config in &case_config.filter_data {
            let data = FilterData::compile(data_config, builder)?;
            let id = FilterDataId::try_from(filter_data.len())
                .map_err(|_| CompileError::SymbolOverflow(FilterDataId::MAX as usize))?;
            for var in data.produced_vars() {
                data_for_var.entry(var).or_default().push(id);
            }
            filter_data.push(data);
        }

        let mut rules = Vec::with_capacity(case_config.filter_rules.len());
        for rule_config in &case_config.filter_rules {
            let compiled = rule_config
                .condition
                .as_ref()
                .map(|c| compile_condition(c, builder))
                .transpose()?;

            let mut actions = Vec::with_capacity(rule_config.actions.len());
            for action_config in &rule_config.actions {
                actions.push(Action::compile(action_config, builder, case_index).map_err(
                    |e| match e {
                        CompileError::InvalidAction { reason, .. } => CompileError::InvalidAction {
                            rule: rule_config.name.clone(),
                            reason,
                        },
                        other => other,
                    },
                )?);
            }

            let (condition, required) = match compiled {
                Some(c) => (Some(c.op), c.required),
                None => (None, Default::default()),
            };

            rules.push(FilterRule {
                name: rule_config.name.clone(),
                condition,
                required,
                actions,
            });
        }

        Ok(FilterCase { name: case_config.name.clone(), rules, data_for_var })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn own_fqdn(&self) -> Option<&str> {
        self.own_fqdn.as_deref()
    }

    /// Constant by index. Out of range is a broken compile invariant and
    /// panics.
    pub fn const_value(&self, idx: ValueIndex) -> &Value {
        &self.const_values[idx as usize]
    }

    pub fn header_name(&self, idx: ValueIndex) -> &str {
        self.headers.name(idx)
    }

    pub fn query_param_name(&self, idx: ValueIndex) -> &str {
        self.query_params.name(idx)
    }

    pub fn var_name(&self, idx: ValueIndex) -> &str {
        self.variables.name(idx)
    }

    pub fn var_index(&self, name: &str) -> Option<ValueIndex> {
        self.variables.lookup(name)
    }

    pub fn header_index(&self, name: &str) -> Option<ValueIndex> {
        self.headers.lookup(name)
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    pub fn query_param_count(&self) -> usize {
        self.query_params.len()
    }

    pub fn var_count(&self) -> usize {
        self.variables.len()
    }

    pub fn regex(&self, id: RegexId) -> &Regex {
        &self.regexes[id as usize]
    }

    pub fn kv_table(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.kv_tables.get(name)
    }

    pub fn klv_table(&self, name: &str) -> Option<&HashMap<String, Vec<String>>> {
        self.klv_tables.get(name)
    }

    pub fn scrambling_profile(&self, roaming_partner: &str) -> Option<&ScramblingProfile> {
        self.scrambling.get(roaming_partner)
    }

    /// Resolve a rule-set by plain name.
    pub fn filter_case_id(&self, name: &str) -> Option<FilterCaseId> {
        self.case_index.get(name).copied()
    }

    /// Resolve a topology hiding/unhiding rule-set by its addressing triple.
    pub fn topology_case_id(
        &self,
        roaming_partner: &str,
        service_case: &str,
        name: &str,
    ) -> Option<FilterCaseId> {
        self.topology_index
            .get(&(roaming_partner.to_string(), service_case.to_string(), name.to_string()))
            .copied()
    }

    pub fn filter_case(&self, id: FilterCaseId) -> &FilterCase {
        &self.filter_cases[id as usize]
    }

    pub fn filter_data(&self, id: FilterDataId) -> &FilterData {
        &self.filter_data[id as usize]
    }

    pub fn phase_table(&self, phase: crate::filter::Phase) -> &PhaseTable {
        self.phases.table(phase)
    }

    pub fn api_matchers(&self) -> &ApiContextMatchers {
        &self.api_matchers
    }

    /// Splits `fqdn` into (leading part, PLMN suffix) if it carries the 3GPP
    /// `.5gc.mncNNN.mccNNN.3gppnetwork.org` suffix.
    pub fn split_plmn_suffix<'a>(&self, fqdn: &'a str) -> (&'a str, Option<&'a str>) {
        match self.plmn_suffix.captures(fqdn) {
            Some(caps) => {
                let label = caps.name("label").map_or("", |m| m.as_str());
                let plmn = caps.name("plmn").map(|m| m.as_str());
                (label, plmn)
            }
            None => (fqdn, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_stable() {
        let mut builder = RootBuilder::new();
        let a = builder.intern_var("mcc").unwrap();
        let b = builder.intern_var("mnc").unwrap();
        let again = builder.intern_var("mcc").unwrap();
        assert_eq!(a, again);
        assert_ne!(a, b);
    }

    #[test]
    fn test_header_interning_case_insensitive() {
        let mut builder = RootBuilder::new();
        let a = builder.intern_header("X-Forwarded-For").unwrap();
        let b = builder.intern_header("x-forwarded-for").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_const_dedup() {
        let mut builder = RootBuilder::new();
        let a = builder.intern_const(Value::String("262".into())).unwrap();
        let b = builder.intern_const(Value::String("262".into())).unwrap();
        let c = builder.intern_const(serde_json::json!(262)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_regex_cache_reuses() {
        let mut builder = RootBuilder::new();
        let a = builder.intern_regex(r"(?P<supi>imsi-\d+)").unwrap();
        let b = builder.intern_regex(r"(?P<supi>imsi-\d+)").unwrap();
        assert_eq!(a, b);
        assert!(builder.intern_regex(r"(unclosed").is_err());
    }

    #[test]
    fn test_plmn_suffix_split() {
        let config = ProxyConfig::default();
        let root = RootConfig::from_config(&config).unwrap();

        let (label, plmn) =
            root.split_plmn_suffix("chfsim1.5gc.mnc123.mcc456.3gppnetwork.org");
        assert_eq!(label, "chfsim1");
        assert_eq!(plmn, Some(".5gc.mnc123.mcc456.3gppnetwork.org"));

        let (label, plmn) = root.split_plmn_suffix("nrf.example.com");
        assert_eq!(label, "nrf.example.com");
        assert_eq!(plmn, None);

        // Case-insensitive suffix match
        let (_, plmn) = root.split_plmn_suffix("a.5GC.MNC012.MCC345.3gppNetwork.ORG");
        assert!(plmn.is_some());
    }
}
