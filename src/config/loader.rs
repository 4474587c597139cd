use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::*;

/// Deserialize YAML in the singleton-map representation, where an enum
/// variant is a one-entry mapping (`op_equals: {…}`) rather than a
/// `!op_equals` tag. The whole configuration grammar is written this way.
pub(crate) fn yaml_from_str<T>(input: &str) -> Result<T, serde_yaml::Error>
where
    T: serde::de::DeserializeOwned,
{
    serde_yaml::with::singleton_map_recursive::deserialize(serde_yaml::Deserializer::from_str(
        input,
    ))
}

impl ProxyConfig {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ProxyConfig =
            yaml_from_str(yaml).context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration shape before compilation.
    ///
    /// Everything rejected here is a management-plane mistake; conditions
    /// that the engine resolves to a safe default at runtime (missing start
    /// case, malformed CIDR) deliberately pass.
    pub fn validate(&self) -> Result<()> {
        // Filter case names are unique
        let mut case_names = HashSet::new();
        for case in &self.filter_cases {
            if !case_names.insert(case.name.as_str()) {
                anyhow::bail!("duplicate filter case name: {}", case.name);
            }
        }

        for case in &self.filter_cases {
            for data in &case.filter_data {
                match (&data.variable_name, &data.extractor_regex) {
                    (Some(_), Some(_)) | (None, None) => anyhow::bail!(
                        "filter data '{}' in case '{}' must set exactly one of \
                         variable_name and extractor_regex",
                        data.name,
                        case.name
                    ),
                    (None, Some(pattern)) => {
                        let re = regex::Regex::new(pattern).with_context(|| {
                            format!("filter data '{}': invalid extractor regex", data.name)
                        })?;
                        if re.capture_names().flatten().next().is_none() {
                            anyhow::bail!(
                                "filter data '{}': extractor regex has no named capture groups",
                                data.name
                            );
                        }
                    }
                    (Some(_), None) => {}
                }
            }

            for rule in &case.filter_rules {
                if let Some(condition) = &rule.condition {
                    validate_condition(condition)
                        .with_context(|| format!("rule '{}' in case '{}'", rule.name, case.name))?;
                }
                for action in &rule.actions {
                    self.validate_action(action, &case_names)
                        .with_context(|| format!("rule '{}' in case '{}'", rule.name, case.name))?;
                }
            }
        }

        for topo in &self.topology_cases {
            if !case_names.contains(topo.filter_case.as_str()) {
                anyhow::bail!(
                    "topology case ({}, {}, {}) references unknown filter case: {}",
                    topo.roaming_partner,
                    topo.service_case,
                    topo.name,
                    topo.filter_case
                );
            }
        }

        let mut partners = HashSet::new();
        for profile in &self.scrambling_profiles {
            if !partners.insert(profile.roaming_partner.as_str()) {
                anyhow::bail!(
                    "duplicate scrambling profile for roaming partner: {}",
                    profile.roaming_partner
                );
            }
            let mut generations = HashSet::new();
            for key in &profile.keys {
                if key.generation.len() != 5 {
                    anyhow::bail!(
                        "scrambling profile '{}': generation '{}' must be exactly 5 characters",
                        profile.roaming_partner,
                        key.generation
                    );
                }
                if !generations.insert(key.generation.as_str()) {
                    anyhow::bail!(
                        "scrambling profile '{}': duplicate generation '{}'",
                        profile.roaming_partner,
                        key.generation
                    );
                }
                if key.key.len() != 64 {
                    anyhow::bail!(
                        "scrambling profile '{}': key for generation '{}' must be 32 hex-encoded bytes",
                        profile.roaming_partner,
                        key.generation
                    );
                }
                if key.iv.len() != 24 {
                    anyhow::bail!(
                        "scrambling profile '{}': iv for generation '{}' must be 12 hex-encoded bytes",
                        profile.roaming_partner,
                        key.generation
                    );
                }
            }
            if !generations.contains(profile.active_generation.as_str()) {
                anyhow::bail!(
                    "scrambling profile '{}': active generation '{}' has no key material",
                    profile.roaming_partner,
                    profile.active_generation
                );
            }
        }

        info!(
            filter_cases = self.filter_cases.len(),
            scrambling_profiles = self.scrambling_profiles.len(),
            "configuration validated"
        );
        Ok(())
    }

    fn validate_action(&self, action: &ActionConfig, case_names: &HashSet<&str>) -> Result<()> {
        let check_fc = |target: &Option<String>| -> Result<()> {
            if let Some(name) = target {
                if !case_names.contains(name.as_str()) {
                    anyhow::bail!("fc_unsuccessful references unknown filter case: {}", name);
                }
            }
            Ok(())
        };

        match action {
            ActionConfig::GotoFilterCase { name } => {
                if !case_names.contains(name.as_str()) {
                    anyhow::bail!("goto_filter_case references unknown filter case: {}", name);
                }
            }
            ActionConfig::ModifyHeader { modifiers, fc_unsuccessful, .. }
            | ActionConfig::ModifyJsonBody { modifiers, fc_unsuccessful, .. } => {
                check_fc(fc_unsuccessful)?;
                for modifier in modifiers {
                    self.validate_modifier(modifier, case_names)?;
                }
            }
            ActionConfig::Lookup { fc_unsuccessful, .. } => check_fc(fc_unsuccessful)?,
            _ => {}
        }
        Ok(())
    }

    fn validate_modifier(&self, modifier: &ModifierConfig, case_names: &HashSet<&str>) -> Result<()> {
        match modifier {
            ModifierConfig::SearchAndReplace { search, regex: true, case_sensitive, .. } => {
                let pattern = if *case_sensitive {
                    search.clone()
                } else {
                    format!("(?i){}", search)
                };
                regex::Regex::new(&pattern)
                    .with_context(|| format!("invalid search_and_replace regex: {}", search))?;
            }
            ModifierConfig::TableLookup { table, kind, on_miss, .. } => {
                let known = match kind {
                    TableKind::KeyValue => self.kv_tables.contains_key(table),
                    TableKind::KeyListValue => self.klv_tables.contains_key(table),
                };
                if !known {
                    anyhow::bail!("table_lookup references unknown table: {}", table);
                }
                self.validate_miss_policy(on_miss, case_names)?;
            }
            ModifierConfig::Scramble { on_miss, .. } | ModifierConfig::Descramble { on_miss, .. } => {
                self.validate_miss_policy(on_miss, case_names)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn validate_miss_policy(&self, policy: &MissPolicyConfig, case_names: &HashSet<&str>) -> Result<()> {
        if let Some(name) = &policy.fc_unsuccessful {
            if !case_names.contains(name.as_str()) {
                anyhow::bail!("fc_unsuccessful references unknown filter case: {}", name);
            }
        }
        Ok(())
    }
}

/// Reject the condition shapes that are provably broken without any runtime
/// data: an equality between two literal constants of incompatible kinds can
/// only ever be a configuration mistake. Mismatches involving a
/// runtime-typed operand stay legal and evaluate to `false`.
fn validate_condition(condition: &ConditionConfig) -> Result<()> {
    match condition {
        ConditionConfig::OpAnd { args } | ConditionConfig::OpOr { args } => {
            if args.is_empty() {
                anyhow::bail!("and/or requires at least one argument");
            }
            for arg in args {
                validate_condition(arg)?;
            }
        }
        ConditionConfig::OpNot { arg } => validate_condition(arg)?,
        ConditionConfig::OpEquals { left, right } => {
            if let (Some(k1), Some(k2)) = (literal_kind(left), literal_kind(right)) {
                if k1 != k2 {
                    anyhow::bail!(
                        "op_equals between literal constants of incompatible kinds ({} vs {})",
                        k1,
                        k2
                    );
                }
            }
        }
        ConditionConfig::OpEqualsCaseInsensitive { left, right } => {
            for value in [left, right] {
                if matches!(literal_kind(value), Some(kind) if kind != "string") {
                    anyhow::bail!("op_equals_case_insensitive requires string-capable operands");
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn literal_kind(value: &ValueConfig) -> Option<&'static str> {
    match value {
        ValueConfig::TermString(_) => Some("string"),
        ValueConfig::TermNumber(_) => Some("number"),
        ValueConfig::TermBoolean(_) => Some("boolean"),
        _ => None,
    }
}
