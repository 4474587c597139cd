//! Compiled variable-extraction recipes.
//!
//! One `FilterData` fills one or more variables from a message source,
//! either by direct assignment or through the named capture groups of a
//! precompiled regex.

use serde_json::Value;
use tracing::trace;

use crate::config::{DataSourceConfig, FilterDataConfig};
use crate::context::{RegexId, RootBuilder, RootConfig, RunState, ValueIndex};
use crate::error::CompileError;
use crate::message::{Direction, Exchange};

use super::case::FilterCaseId;

/// Dense handle into the filter-data arena in [`RootConfig`].
pub type FilterDataId = u16;

#[derive(Debug, Clone)]
pub enum DataSource {
    /// The request `:path` pseudo-header
    Path,
    /// A header of the side currently being processed
    Header(ValueIndex),
    BodyJsonPointer { direction: Direction, pointer: String },
}

#[derive(Debug, Clone)]
pub enum Extractor {
    /// Assign the whole source value to one variable
    Variable(ValueIndex),
    /// Each named capture group fills the equally named variable
    Regex { regex: RegexId, groups: Vec<(String, ValueIndex)> },
}

#[derive(Debug, Clone)]
pub struct FilterData {
    pub name: String,
    pub source: DataSource,
    pub extractor: Extractor,
}

impl FilterData {
    pub fn compile(
        config: &FilterDataConfig,
        builder: &mut RootBuilder,
    ) -> Result<Self, CompileError> {
        let source = match &config.source {
            DataSourceConfig::Path => DataSource::Path,
            DataSourceConfig::Header { name } => DataSource::Header(builder.intern_header(name)?),
            DataSourceConfig::RequestBodyJsonPointer { pointer } => DataSource::BodyJsonPointer {
                direction: Direction::Request,
                pointer: pointer.clone(),
            },
            DataSourceConfig::ResponseBodyJsonPointer { pointer } => DataSource::BodyJsonPointer {
                direction: Direction::Response,
                pointer: pointer.clone(),
            },
        };

        let extractor = match (&config.variable_name, &config.extractor_regex) {
            (Some(var), None) => Extractor::Variable(builder.intern_var(var)?),
            (None, Some(pattern)) => {
                let regex = builder.intern_regex(pattern)?;
                // Capture-group names become variables now, at load time;
                // the frozen RootConfig never interns.
                let names: Vec<String> = regex::Regex::new(pattern)
                    .map_err(|source| CompileError::InvalidRegex {
                        pattern: pattern.clone(),
                        source,
                    })?
                    .capture_names()
                    .flatten()
                    .map(str::to_string)
                    .collect();
                let mut groups = Vec::with_capacity(names.len());
                for name in names {
                    let idx = builder.intern_var(&name)?;
                    groups.push((name, idx));
                }
                Extractor::Regex { regex, groups }
            }
            _ => {
                return Err(CompileError::InvalidCondition(format!(
                    "filter data '{}' must set exactly one extractor",
                    config.name
                )))
            }
        };

        Ok(Self { name: config.name.clone(), source, extractor })
    }

    /// Variables this recipe can fill.
    pub fn produced_vars(&self) -> Vec<ValueIndex> {
        match &self.extractor {
            Extractor::Variable(idx) => vec![*idx],
            Extractor::Regex { groups, .. } => groups.iter().map(|(_, idx)| *idx).collect(),
        }
    }

    /// Run the recipe against the live message. Idempotent for unchanged
    /// input: re-applying writes the same values.
    pub fn apply(
        &self,
        root: &RootConfig,
        run: &mut RunState,
        exchange: &Exchange<'_>,
        writer: FilterCaseId,
    ) {
        let source_value = self.read_source(root, run, exchange);
        trace!(data = %self.name, value = ?source_value, "applying filter data");

        match &self.extractor {
            Extractor::Variable(idx) => {
                // A null source reads as "".
                let value = match source_value {
                    Some(Value::Null) | None => Value::String(String::new()),
                    Some(v) => v,
                };
                run.update_var_if_meaningful(*idx, value, writer);
            }
            Extractor::Regex { regex, groups } => {
                let text = match &source_value {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                match root.regex(*regex).captures(&text) {
                    Some(caps) => {
                        for (name, idx) in groups {
                            let captured =
                                caps.name(name).map(|m| m.as_str()).unwrap_or_default();
                            run.update_var_if_meaningful(
                                *idx,
                                Value::String(captured.to_string()),
                                writer,
                            );
                        }
                    }
                    None => {
                        // A non-match only initializes still-null variables
                        // to "" so later conditions see them as set-empty.
                        for (_, idx) in groups {
                            if !run.var_is_set(*idx) {
                                run.update_var(*idx, Value::String(String::new()), writer);
                            }
                        }
                    }
                }
            }
        }
    }

    fn read_source(
        &self,
        root: &RootConfig,
        run: &RunState,
        exchange: &Exchange<'_>,
    ) -> Option<Value> {
        match &self.source {
            DataSource::Path => exchange
                .headers(Direction::Request)
                .get(":path")
                .into_iter()
                .next()
                .map(Value::String),
            DataSource::Header(idx) => {
                let name = root.header_name(*idx);
                let values = exchange.headers(run.direction()).get(name);
                if values.is_empty() {
                    None
                } else {
                    Some(Value::String(values.join(",")))
                }
            }
            DataSource::BodyJsonPointer { direction, pointer } => {
                exchange.body(*direction).read_pointer(pointer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::context::NetworkOrigin;
    use crate::message::{HeaderMap, MemoryBody, MemoryHeaderMap};
    use serde_json::json;

    fn compile_root(yaml: &str) -> std::sync::Arc<RootConfig> {
        let config = ProxyConfig::from_yaml(yaml).unwrap();
        RootConfig::from_config(&config).unwrap()
    }

    #[test]
    fn test_regex_extraction_from_path() {
        let root = compile_root(
            r#"
filter_cases:
  - name: sc1
    filter_data:
      - name: mcc_mnc_from_path
        source: path
        extractor_regex: "mcc(?P<mcc>\\d{3})\\.mnc(?P<mnc>\\d{2,3})"
"#,
        );
        let mut run = RunState::new(&root, NetworkOrigin::Internal, None);

        let mut req = MemoryHeaderMap::new();
        req.set(":path", "/nausf-auth/v1/mcc262.mnc012/ue-authentications");
        let mut resp = MemoryHeaderMap::new();
        let (mut rb, mut sb) = (MemoryBody::empty(), MemoryBody::empty());
        let exchange = Exchange {
            request_headers: &mut req,
            response_headers: &mut resp,
            request_body: &mut rb,
            response_body: &mut sb,
        };

        let data = root.filter_data(0);
        data.apply(&root, &mut run, &exchange, 0);

        let mcc = root.var_index("mcc").unwrap();
        let mnc = root.var_index("mnc").unwrap();
        assert_eq!(run.var_value(mcc), &json!("262"));
        assert_eq!(run.var_value(mnc), &json!("012"));
        assert_eq!(run.var_last_writer(mcc), Some(0));
    }

    #[test]
    fn test_non_match_initializes_to_empty() {
        let root = compile_root(
            r#"
filter_cases:
  - name: sc1
    filter_data:
      - name: supi
        source: path
        extractor_regex: "supi=(?P<supi>[^&]+)"
"#,
        );
        let mut run = RunState::new(&root, NetworkOrigin::Internal, None);

        let mut req = MemoryHeaderMap::new();
        req.set(":path", "/no-supi-here");
        let mut resp = MemoryHeaderMap::new();
        let (mut rb, mut sb) = (MemoryBody::empty(), MemoryBody::empty());
        let exchange = Exchange {
            request_headers: &mut req,
            response_headers: &mut resp,
            request_body: &mut rb,
            response_body: &mut sb,
        };

        root.filter_data(0).apply(&root, &mut run, &exchange, 0);

        let supi = root.var_index("supi").unwrap();
        assert!(run.var_is_set(supi));
        assert_eq!(run.var_value(supi), &json!(""));
    }

    #[test]
    fn test_body_pointer_source() {
        let root = compile_root(
            r#"
filter_cases:
  - name: sc1
    filter_data:
      - name: supi_from_body
        source:
          request_body_json_pointer:
            pointer: /subscriberIdentifier/supi
        variable_name: supi
"#,
        );
        let mut run = RunState::new(&root, NetworkOrigin::Internal, None);

        let mut req = MemoryHeaderMap::new();
        let mut resp = MemoryHeaderMap::new();
        let mut rb = MemoryBody::from_json(&json!({
            "subscriberIdentifier": { "supi": "imsi-262011234567890" }
        }));
        let mut sb = MemoryBody::empty();
        let exchange = Exchange {
            request_headers: &mut req,
            response_headers: &mut resp,
            request_body: &mut rb,
            response_body: &mut sb,
        };

        root.filter_data(0).apply(&root, &mut run, &exchange, 0);

        let supi = root.var_index("supi").unwrap();
        assert_eq!(run.var_value(supi), &json!("imsi-262011234567890"));
    }
}
