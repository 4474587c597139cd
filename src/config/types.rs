//! Parsed filter-configuration model.
//!
//! These types mirror the declarative screening configuration as it arrives
//! from the management plane: named filter cases holding filter data
//! (variable extraction recipes) and filter rules (condition + actions),
//! phase tables, lookup tables and scrambling key material. Compilation into
//! the executable form happens in [`crate::context::RootConfig`].

use serde::Deserialize;
use std::collections::HashMap;

/// Top-level screening/routing configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    /// Node name, for logging only
    #[serde(default)]
    pub name: Option<String>,
    /// This node's own FQDN
    #[serde(default)]
    pub own_fqdn: Option<String>,
    /// Named rule-sets
    #[serde(default)]
    pub filter_cases: Vec<FilterCaseConfig>,
    /// Start-case selection per processing phase
    #[serde(default)]
    pub filter_phases: PhasesConfig,
    /// Topology hiding/unhiding cases addressed by (partner, service case, name)
    #[serde(default)]
    pub topology_cases: Vec<TopologyCaseConfig>,
    /// Key -> value lookup tables
    #[serde(default)]
    pub kv_tables: HashMap<String, HashMap<String, String>>,
    /// Key -> list-of-values lookup tables
    #[serde(default)]
    pub klv_tables: HashMap<String, HashMap<String, Vec<String>>>,
    /// Per-roaming-partner scrambling key material
    #[serde(default)]
    pub scrambling_profiles: Vec<ScramblingProfileConfig>,
}

/// A named, ordered rule-set.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterCaseConfig {
    pub name: String,
    /// Variable extraction recipes owned by this case
    #[serde(default)]
    pub filter_data: Vec<FilterDataConfig>,
    #[serde(default)]
    pub filter_rules: Vec<FilterRuleConfig>,
}

/// How to fill one or more variables from a message source.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterDataConfig {
    pub name: String,
    pub source: DataSourceConfig,
    /// Direct assignment target; mutually exclusive with `extractor_regex`
    #[serde(default)]
    pub variable_name: Option<String>,
    /// Regex whose named capture groups become variables
    #[serde(default)]
    pub extractor_regex: Option<String>,
}

/// Where filter data reads from.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceConfig {
    /// The request `:path` pseudo-header
    Path,
    /// A header of the side currently being processed
    Header { name: String },
    RequestBodyJsonPointer { pointer: String },
    ResponseBodyJsonPointer { pointer: String },
}

/// One (condition, actions) pair.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterRuleConfig {
    pub name: String,
    /// Absent condition means the rule never matches and just continues
    #[serde(default)]
    pub condition: Option<ConditionConfig>,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

/// Declarative condition tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionConfig {
    TermBoolean(bool),
    OpAnd { args: Vec<ConditionConfig> },
    OpOr { args: Vec<ConditionConfig> },
    OpNot { arg: Box<ConditionConfig> },
    OpEquals { left: ValueConfig, right: ValueConfig },
    OpEqualsCaseInsensitive { left: ValueConfig, right: ValueConfig },
    OpExists { arg: ValueConfig },
    OpIsempty { arg: ValueConfig },
    OpIsinsubnet { arg: ValueConfig, network: String },
    OpIsvalidjson { body: BodySelector },
}

/// A typed operand of a condition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueConfig {
    TermString(String),
    TermNumber(f64),
    TermBoolean(bool),
    TermReqheader(String),
    TermRespheader(String),
    TermQueryparam(String),
    TermVar(String),
    TermApicontext(ApiContextField),
}

/// Fields of the lazily classified API context usable as operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiContextField {
    ApiName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodySelector {
    Request,
    Response,
}

/// Actions executed when a rule's condition matches.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionConfig {
    AddHeader {
        name: String,
        value: ValueTemplateConfig,
        #[serde(default)]
        if_exists: IfExists,
    },
    RemoveHeader {
        name: String,
    },
    ModifyHeader {
        name: String,
        #[serde(default)]
        replace_value: Option<ValueTemplateConfig>,
        #[serde(default)]
        modifiers: Vec<ModifierConfig>,
        #[serde(default)]
        fc_unsuccessful: Option<String>,
    },
    ModifyQueryParam {
        name: String,
        value: ValueTemplateConfig,
    },
    ModifyVariable {
        name: String,
        value: ValueTemplateConfig,
    },
    ModifyJsonBody {
        pointer: String,
        #[serde(default)]
        replace_value: Option<ValueTemplateConfig>,
        #[serde(default)]
        modifiers: Vec<ModifierConfig>,
        #[serde(default)]
        fc_unsuccessful: Option<String>,
    },
    RejectMessage {
        status: u16,
        title: String,
        #[serde(default)]
        format: ReplyFormat,
    },
    DropMessage,
    Log {
        #[serde(default)]
        level: LogLevel,
        #[serde(default)]
        text: Vec<ValueTemplateConfig>,
    },
    RouteToPool {
        pool: ValueTemplateConfig,
    },
    ExitFilterCase,
    GotoFilterCase {
        name: String,
    },
    Lookup {
        service: LookupServiceKind,
        source_var: String,
        destination_var: String,
        #[serde(default)]
        fc_unsuccessful: Option<String>,
    },
}

/// Value-producing term used by actions and prepend/append modifiers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueTemplateConfig {
    TermString(String),
    TermNumber(f64),
    TermBoolean(bool),
    TermVar(String),
    /// A header of the side currently being processed
    TermHeader(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IfExists {
    /// Append a further value
    #[default]
    Add,
    Replace,
    NoAction,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyFormat {
    #[default]
    ProblemJson,
    Text,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupServiceKind {
    /// Subscriber location (region) lookup
    Slf,
    /// NF discovery via NRF
    NfDiscovery,
}

/// Ordered string transformation applied by header/body/variable actions.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierConfig {
    ToUpper,
    ToLower,
    Prepend(ValueTemplateConfig),
    Append(ValueTemplateConfig),
    SearchAndReplace {
        search: String,
        replace: String,
        #[serde(default)]
        regex: bool,
        #[serde(default)]
        full_match: bool,
        #[serde(default = "default_true")]
        case_sensitive: bool,
        #[serde(default)]
        from_end: bool,
        #[serde(default)]
        replace_all: bool,
    },
    TableLookup {
        table: String,
        #[serde(default)]
        kind: TableKind,
        /// Defaults to whole-FQDN lookup
        #[serde(default)]
        transform: Option<FqdnTransform>,
        #[serde(flatten)]
        on_miss: MissPolicyConfig,
    },
    Scramble {
        /// Defaults to first-label scrambling
        #[serde(default)]
        transform: Option<FqdnTransform>,
        #[serde(flatten)]
        on_miss: MissPolicyConfig,
    },
    Descramble {
        #[serde(default)]
        transform: Option<FqdnTransform>,
        #[serde(flatten)]
        on_miss: MissPolicyConfig,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    #[default]
    KeyValue,
    /// klv table; the matched list is joined with ","
    KeyListValue,
}

/// Which part of an FQDN a lookup/scrambling modifier operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FqdnTransform {
    /// Whole FQDN at once
    OnlyFqdn,
    /// First label only; a trailing 3GPP PLMN suffix is preserved
    OnlyLabel,
}

/// What to do when a lookup misses or scrambling fails.
///
/// Checked in order: `default_value`, then `do_nothing`, then
/// `fc_unsuccessful` (jump to a fallback rule-set).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MissPolicyConfig {
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub do_nothing: bool,
    #[serde(default)]
    pub fc_unsuccessful: Option<String>,
}

/// Start-case tables for the six processing phases.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhasesConfig {
    #[serde(default)]
    pub in_request_screening: PhaseTableConfig,
    #[serde(default)]
    pub routing: PhaseTableConfig,
    #[serde(default)]
    pub out_request_screening: PhaseTableConfig,
    #[serde(default)]
    pub in_response_screening: PhaseTableConfig,
    #[serde(default)]
    pub response_routing: PhaseTableConfig,
    #[serde(default)]
    pub out_response_screening: PhaseTableConfig,
}

/// Start-case selection for one phase.
///
/// Edge phases select by origin network and roaming partner; the pool-facing
/// phases select by the pool chosen during routing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhaseTableConfig {
    /// Start cases when the origin is the own (internal) network
    #[serde(default)]
    pub own_network: Vec<String>,
    /// Default start cases for external-network origin
    #[serde(default)]
    pub external_default: Vec<String>,
    /// Per-roaming-partner overrides of the external default
    #[serde(default)]
    pub per_roaming_partner: HashMap<String, Vec<String>>,
    /// Start cases keyed by selected pool (out-request / in-response phases)
    #[serde(default)]
    pub per_pool: HashMap<String, Vec<String>>,
}

/// Addressable alias for a topology hiding/unhiding rule-set.
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyCaseConfig {
    pub roaming_partner: String,
    /// e.g. "nrf_disc", "nnrf_nfm"
    pub service_case: String,
    pub name: String,
    /// The filter case this triple resolves to
    pub filter_case: String,
}

/// Scrambling key material for one roaming partner.
#[derive(Debug, Clone, Deserialize)]
pub struct ScramblingProfileConfig {
    pub roaming_partner: String,
    /// Generation used when scrambling; descrambling accepts any configured
    /// generation
    pub active_generation: String,
    pub keys: Vec<ScramblingKeyConfig>,
}

/// One key generation: a 5-character prefix naming an AES-256 key + IV pair.
#[derive(Debug, Clone, Deserialize)]
pub struct ScramblingKeyConfig {
    pub generation: String,
    /// 32 bytes, hex encoded
    pub key: String,
    /// 12 bytes, hex encoded
    pub iv: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_yaml_shape() {
        let yaml = r#"
op_and:
  args:
    - op_equals:
        left:
          term_var: mcc
        right:
          term_string: "262"
    - op_isempty:
        arg:
          term_var: mnc
"#;
        let cond: ConditionConfig = crate::config::yaml_from_str(yaml).unwrap();
        match cond {
            ConditionConfig::OpAnd { args } => assert_eq!(args.len(), 2),
            other => panic!("unexpected condition: {:?}", other),
        }
    }

    #[test]
    fn test_modifier_defaults() {
        let yaml = r#"
search_and_replace:
  search: ".local"
  replace: ".example.org"
"#;
        let m: ModifierConfig = crate::config::yaml_from_str(yaml).unwrap();
        match m {
            ModifierConfig::SearchAndReplace { case_sensitive, replace_all, from_end, regex, .. } => {
                assert!(case_sensitive);
                assert!(!replace_all);
                assert!(!from_end);
                assert!(!regex);
            }
            other => panic!("unexpected modifier: {:?}", other),
        }
    }

    #[test]
    fn test_miss_policy_flatten() {
        let yaml = r#"
table_lookup:
  table: fqdn_mapping
  fc_unsuccessful: fc_mapping_failed
"#;
        let m: ModifierConfig = crate::config::yaml_from_str(yaml).unwrap();
        match m {
            ModifierConfig::TableLookup { table, on_miss, transform, .. } => {
                assert_eq!(table, "fqdn_mapping");
                assert!(transform.is_none());
                assert_eq!(on_miss.fc_unsuccessful.as_deref(), Some("fc_mapping_failed"));
                assert!(on_miss.default_value.is_none());
            }
            other => panic!("unexpected modifier: {:?}", other),
        }
    }
}
