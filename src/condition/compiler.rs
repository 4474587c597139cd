//! Type-pair dispatch: from the declarative condition tree to the
//! specialized [`Operator`] variants.
//!
//! The compiler inspects the kind of both operands of a binary comparison
//! and instantiates the matching variant. Comparisons between structurally
//! incompatible kinds fold to a constant-`false` node: different dynamic
//! types are defined to never compare equal. Malformed CIDR literals fold
//! the same way instead of failing configuration load.

use ipnet::IpNet;
use serde_json::Value;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::warn;

use super::operator::{json_equals, HeaderRef, Operator};
use crate::config::{ConditionConfig, ValueConfig};
use crate::context::{RootBuilder, ValueIndex};
use crate::error::CompileError;
use crate::message::Direction;

/// A compiled condition plus everything its evaluation will need
/// materialized.
#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub op: Operator,
    pub required: RequiredIndices,
}

/// Indices discovered while compiling; the filter-case machine materializes
/// exactly these before evaluating the rule.
#[derive(Debug, Clone, Default)]
pub struct RequiredIndices {
    pub vars: BTreeSet<ValueIndex>,
    /// Per direction, [request, response]
    pub headers: [BTreeSet<ValueIndex>; 2],
    pub query_params: BTreeSet<ValueIndex>,
    pub api_context: bool,
}

impl RequiredIndices {
    pub fn merge(&mut self, other: &RequiredIndices) {
        self.vars.extend(&other.vars);
        for dir in 0..2 {
            self.headers[dir].extend(&other.headers[dir]);
        }
        self.query_params.extend(&other.query_params);
        self.api_context |= other.api_context;
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
            && self.headers.iter().all(BTreeSet::is_empty)
            && self.query_params.is_empty()
            && !self.api_context
    }
}

/// Lowered operand: symbol interned, requirement recorded.
#[derive(Debug, Clone)]
enum Operand {
    Const(ValueIndex, ConstKind),
    Header(HeaderRef, String),
    QueryParam(ValueIndex),
    Var(ValueIndex),
    ApiName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConstKind {
    String,
    Number,
    Boolean,
}

/// Compile one condition tree.
pub fn compile_condition(
    condition: &ConditionConfig,
    builder: &mut RootBuilder,
) -> Result<CompiledCondition, CompileError> {
    let mut required = RequiredIndices::default();
    let op = compile(condition, builder, &mut required, false)?;
    Ok(CompiledCondition { op, required })
}

fn compile(
    condition: &ConditionConfig,
    builder: &mut RootBuilder,
    required: &mut RequiredIndices,
    uppercase_consts: bool,
) -> Result<Operator, CompileError> {
    Ok(match condition {
        ConditionConfig::TermBoolean(true) => Operator::True,
        ConditionConfig::TermBoolean(false) => Operator::False,
        ConditionConfig::OpAnd { args } => {
            let compiled = args
                .iter()
                .map(|a| compile(a, builder, required, false))
                .collect::<Result<Vec<_>, _>>()?;
            Operator::And(compiled)
        }
        ConditionConfig::OpOr { args } => {
            let compiled = args
                .iter()
                .map(|a| compile(a, builder, required, false))
                .collect::<Result<Vec<_>, _>>()?;
            Operator::Or(compiled)
        }
        ConditionConfig::OpNot { arg } => {
            Operator::Not(Box::new(compile(arg, builder, required, false)?))
        }
        ConditionConfig::OpEquals { left, right } => {
            let left = lower(left, builder, required, false)?;
            let right = lower(right, builder, required, false)?;
            compile_equals(left, right, builder)?
        }
        ConditionConfig::OpEqualsCaseInsensitive { left, right } => {
            let left = lower(left, builder, required, true)?;
            let right = lower(right, builder, required, true)?;
            compile_equals_case_insensitive(left, right, builder)?
        }
        ConditionConfig::OpExists { arg } => {
            let operand = lower(arg, builder, required, uppercase_consts)?;
            compile_exists(operand)
        }
        ConditionConfig::OpIsempty { arg } => {
            let operand = lower(arg, builder, required, uppercase_consts)?;
            compile_is_empty(operand)
        }
        ConditionConfig::OpIsinsubnet { arg, network } => {
            let operand = lower(arg, builder, required, false)?;
            compile_is_in_subnet(operand, network, builder)
        }
        ConditionConfig::OpIsvalidjson { body } => Operator::IsValidJson {
            direction: match body {
                crate::config::BodySelector::Request => Direction::Request,
                crate::config::BodySelector::Response => Direction::Response,
            },
        },
    })
}

fn lower(
    value: &ValueConfig,
    builder: &mut RootBuilder,
    required: &mut RequiredIndices,
    uppercase: bool,
) -> Result<Operand, CompileError> {
    Ok(match value {
        ValueConfig::TermString(s) => {
            let stored = if uppercase { s.to_uppercase() } else { s.clone() };
            Operand::Const(builder.intern_const(Value::String(stored))?, ConstKind::String)
        }
        ValueConfig::TermNumber(n) => {
            let json = serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .ok_or_else(|| {
                    CompileError::InvalidCondition(format!("non-finite number constant: {n}"))
                })?;
            Operand::Const(builder.intern_const(json)?, ConstKind::Number)
        }
        ValueConfig::TermBoolean(b) => {
            Operand::Const(builder.intern_const(Value::Bool(*b))?, ConstKind::Boolean)
        }
        ValueConfig::TermReqheader(name) => {
            let idx = builder.intern_header(name)?;
            required.headers[Direction::Request.idx()].insert(idx);
            Operand::Header(HeaderRef { header: idx, direction: Direction::Request }, name.clone())
        }
        ValueConfig::TermRespheader(name) => {
            let idx = builder.intern_header(name)?;
            required.headers[Direction::Response.idx()].insert(idx);
            Operand::Header(HeaderRef { header: idx, direction: Direction::Response }, name.clone())
        }
        ValueConfig::TermQueryparam(name) => {
            let idx = builder.intern_query_param(name)?;
            required.query_params.insert(idx);
            Operand::QueryParam(idx)
        }
        ValueConfig::TermVar(name) => {
            let idx = builder.intern_var(name)?;
            required.vars.insert(idx);
            Operand::Var(idx)
        }
        ValueConfig::TermApicontext(_) => {
            required.api_context = true;
            Operand::ApiName
        }
    })
}

/// Operand order never affects the result, only which variant gets built;
/// normalize so each pair is handled once.
fn ordered(a: Operand, b: Operand) -> (Operand, Operand) {
    fn rank(op: &Operand) -> u8 {
        match op {
            Operand::Var(_) => 0,
            Operand::Header(..) => 1,
            Operand::QueryParam(_) => 2,
            Operand::ApiName => 3,
            Operand::Const(..) => 4,
        }
    }
    if rank(&a) <= rank(&b) {
        (a, b)
    } else {
        (b, a)
    }
}

fn compile_equals(
    a: Operand,
    b: Operand,
    builder: &mut RootBuilder,
) -> Result<Operator, CompileError> {
    use Operand::*;
    Ok(match ordered(a, b) {
        (Var(left), Var(right)) => Operator::EqualsVarVar { left, right },
        (Var(var), Header(header, _)) => Operator::EqualsVarHeader { var, header },
        (Var(var), QueryParam(param)) => Operator::EqualsVarQueryParam { var, param },
        (Var(var), ApiName) => Operator::EqualsVarApiName { var },
        (Var(var), Const(konst, _)) => Operator::EqualsVarConst { var, konst },
        (Header(left, _), Header(right, _)) => Operator::EqualsHeaderHeader { left, right },
        (Header(header, _), QueryParam(param)) => Operator::EqualsHeaderQueryParam { header, param },
        (Header(header, _), ApiName) => Operator::EqualsHeaderApiName { header },
        (Header(header, _), Const(konst, ConstKind::String)) => {
            Operator::EqualsHeaderConst { header, konst }
        }
        (QueryParam(left), QueryParam(right)) => {
            Operator::EqualsQueryParamQueryParam { left, right }
        }
        (QueryParam(param), ApiName) => Operator::EqualsQueryParamApiName { param },
        (QueryParam(param), Const(konst, ConstKind::String)) => {
            Operator::EqualsQueryParamConst { param, konst }
        }
        // The API context has exactly one name per exchange; comparing it
        // with itself is vacuously true.
        (ApiName, ApiName) => Operator::True,
        (ApiName, Const(konst, ConstKind::String)) => Operator::EqualsApiNameConst { konst },
        (Const(left, _), Const(right, _)) => {
            let equal = {
                let a = builder_const(builder, left);
                let b = builder_const(builder, right);
                json_equals(&a, &b)
            };
            if equal {
                Operator::True
            } else {
                Operator::False
            }
        }
        // String-valued operand against a number/boolean constant: different
        // dynamic types never compare equal.
        (Header(..) | QueryParam(_) | ApiName, Const(..)) => Operator::False,
        pair => {
            return Err(CompileError::InvalidCondition(format!(
                "unsupported equals operand pair: {pair:?}"
            )))
        }
    })
}

fn compile_equals_case_insensitive(
    a: Operand,
    b: Operand,
    builder: &mut RootBuilder,
) -> Result<Operator, CompileError> {
    use Operand::*;
    Ok(match ordered(a, b) {
        (Var(left), Var(right)) => Operator::CaseInsEqualsVarVar { left, right },
        (Var(var), Header(header, _)) => Operator::CaseInsEqualsVarHeader { var, header },
        (Var(var), QueryParam(param)) => Operator::CaseInsEqualsVarQueryParam { var, param },
        (Var(var), ApiName) => Operator::CaseInsEqualsVarApiName { var },
        (Var(var), Const(konst, ConstKind::String)) => {
            Operator::CaseInsEqualsVarConst { var, konst }
        }
        (Header(left, _), Header(right, _)) => Operator::CaseInsEqualsHeaderHeader { left, right },
        (Header(header, _), QueryParam(param)) => {
            Operator::CaseInsEqualsHeaderQueryParam { header, param }
        }
        (Header(header, _), ApiName) => Operator::CaseInsEqualsHeaderApiName { header },
        (Header(header, _), Const(konst, ConstKind::String)) => {
            Operator::CaseInsEqualsHeaderConst { header, konst }
        }
        (QueryParam(left), QueryParam(right)) => {
            Operator::CaseInsEqualsQueryParamQueryParam { left, right }
        }
        (QueryParam(param), ApiName) => Operator::CaseInsEqualsQueryParamApiName { param },
        (QueryParam(param), Const(konst, ConstKind::String)) => {
            Operator::CaseInsEqualsQueryParamConst { param, konst }
        }
        (ApiName, ApiName) => Operator::True,
        (ApiName, Const(konst, ConstKind::String)) => {
            Operator::CaseInsEqualsApiNameConst { konst }
        }
        (Const(left, ConstKind::String), Const(right, ConstKind::String)) => {
            // Both were interned uppercased.
            if left == right {
                Operator::True
            } else {
                let equal = builder_const(builder, left) == builder_const(builder, right);
                if equal {
                    Operator::True
                } else {
                    Operator::False
                }
            }
        }
        // Non-string constants cannot participate in a case-insensitive
        // string comparison.
        (_, Const(_, ConstKind::Number | ConstKind::Boolean)) => Operator::False,
        pair => {
            return Err(CompileError::InvalidCondition(format!(
                "unsupported case-insensitive equals operand pair: {pair:?}"
            )))
        }
    })
}

fn compile_exists(operand: Operand) -> Operator {
    match operand {
        // Literal constants are always present by construction.
        Operand::Const(..) => Operator::True,
        // So are the :method/:path pseudo-headers of a well-formed request.
        Operand::Header(_, name) if name.starts_with(':') => Operator::True,
        Operand::Header(header, _) => Operator::ExistsHeader { header },
        Operand::QueryParam(param) => Operator::ExistsQueryParam { param },
        Operand::Var(var) => Operator::ExistsVar { var },
        Operand::ApiName => Operator::ExistsApiName,
    }
}

fn compile_is_empty(operand: Operand) -> Operator {
    match operand {
        Operand::Const(..) => Operator::False,
        Operand::Header(_, name) if name.starts_with(':') => Operator::False,
        Operand::Header(header, _) => Operator::IsEmptyHeader { header },
        Operand::QueryParam(param) => Operator::IsEmptyQueryParam { param },
        Operand::Var(var) => Operator::IsEmptyVar { var },
        Operand::ApiName => Operator::IsEmptyApiName,
    }
}

fn compile_is_in_subnet(operand: Operand, network: &str, builder: &mut RootBuilder) -> Operator {
    let net: IpNet = match network.parse() {
        Ok(net) => net,
        Err(_) => {
            // Compatibility policy: a malformed CIDR never fails load.
            warn!(network, "malformed CIDR in is_in_subnet, condition is constant false");
            return Operator::False;
        }
    };
    match operand {
        Operand::Const(konst, ConstKind::String) => {
            // Constant address folds at compile time.
            match builder_const(builder, konst) {
                Value::String(s) => match s.trim().parse::<IpAddr>() {
                    Ok(addr) => {
                        let matches = match (addr, &net) {
                            (IpAddr::V4(_), IpNet::V4(_)) | (IpAddr::V6(_), IpNet::V6(_)) => {
                                net.contains(&addr)
                            }
                            _ => false,
                        };
                        if matches {
                            Operator::True
                        } else {
                            Operator::False
                        }
                    }
                    Err(_) => Operator::False,
                },
                _ => Operator::False,
            }
        }
        Operand::Const(..) | Operand::ApiName => Operator::False,
        Operand::Header(header, _) => Operator::IsInSubnetHeader { header, net },
        Operand::QueryParam(param) => Operator::IsInSubnetQueryParam { param, net },
        Operand::Var(var) => Operator::IsInSubnetVar { var, net },
    }
}

// Reading a constant back out of the builder during compilation. The
// builder has no public read API; keep the coupling in one place.
fn builder_const(builder: &mut RootBuilder, idx: ValueIndex) -> Value {
    builder.const_value(idx).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> RootBuilder {
        RootBuilder::new()
    }

    fn compile_one(yaml: &str, b: &mut RootBuilder) -> CompiledCondition {
        let config: ConditionConfig = crate::config::yaml_from_str(yaml).unwrap();
        compile_condition(&config, b).unwrap()
    }

    #[test]
    fn test_incompatible_kinds_fold_to_false() {
        let mut b = builder();
        let compiled = compile_one(
            r#"
op_equals:
  left:
    term_number: 1
  right:
    term_reqheader: content-length
"#,
            &mut b,
        );
        assert!(matches!(compiled.op, Operator::False));
    }

    #[test]
    fn test_operand_order_does_not_matter() {
        let mut b = builder();
        let forward = compile_one(
            r#"
op_equals:
  left:
    term_var: host
  right:
    term_reqheader: x-host
"#,
            &mut b,
        );
        let swapped = compile_one(
            r#"
op_equals:
  left:
    term_reqheader: x-host
  right:
    term_var: host
"#,
            &mut b,
        );
        assert!(matches!(forward.op, Operator::EqualsVarHeader { .. }));
        assert!(matches!(swapped.op, Operator::EqualsVarHeader { .. }));
    }

    #[test]
    fn test_const_const_folds() {
        let mut b = builder();
        let equal = compile_one(
            r#"
op_equals:
  left:
    term_string: abc
  right:
    term_string: abc
"#,
            &mut b,
        );
        assert!(matches!(equal.op, Operator::True));

        let unequal = compile_one(
            r#"
op_equals:
  left:
    term_number: 1
  right:
    term_number: 2
"#,
            &mut b,
        );
        assert!(matches!(unequal.op, Operator::False));
    }

    #[test]
    fn test_exists_on_literals_and_pseudo_headers() {
        let mut b = builder();
        let lit = compile_one("op_exists:\n  arg:\n    term_string: x", &mut b);
        assert!(matches!(lit.op, Operator::True));

        let pseudo = compile_one("op_exists:\n  arg:\n    term_reqheader: \":path\"", &mut b);
        assert!(matches!(pseudo.op, Operator::True));

        let pseudo_empty = compile_one("op_isempty:\n  arg:\n    term_reqheader: \":method\"", &mut b);
        assert!(matches!(pseudo_empty.op, Operator::False));

        let header = compile_one("op_exists:\n  arg:\n    term_reqheader: via", &mut b);
        assert!(matches!(header.op, Operator::ExistsHeader { .. }));
    }

    #[test]
    fn test_malformed_cidr_folds_to_false() {
        let mut b = builder();
        let compiled = compile_one(
            r#"
op_isinsubnet:
  arg:
    term_reqheader: x-forwarded-for
  network: "10.0.0.0/999"
"#,
            &mut b,
        );
        assert!(matches!(compiled.op, Operator::False));
    }

    #[test]
    fn test_constant_address_folds() {
        let mut b = builder();
        let inside = compile_one(
            r#"
op_isinsubnet:
  arg:
    term_string: "10.1.2.3"
  network: "10.0.0.0/8"
"#,
            &mut b,
        );
        assert!(matches!(inside.op, Operator::True));

        let family_mismatch = compile_one(
            r#"
op_isinsubnet:
  arg:
    term_string: "::1"
  network: "10.0.0.0/8"
"#,
            &mut b,
        );
        assert!(matches!(family_mismatch.op, Operator::False));
    }

    #[test]
    fn test_required_indices_discovered() {
        let mut b = builder();
        let compiled = compile_one(
            r#"
op_and:
  args:
    - op_equals:
        left:
          term_var: mcc
        right:
          term_string: "262"
    - op_exists:
        arg:
          term_queryparam: target-nf-type
    - op_equals:
        left:
          term_respheader: location
        right:
          term_apicontext: api_name
"#,
            &mut b,
        );
        assert_eq!(compiled.required.vars.len(), 1);
        assert_eq!(compiled.required.query_params.len(), 1);
        assert_eq!(compiled.required.headers[1].len(), 1);
        assert!(compiled.required.api_context);
    }

    #[test]
    fn test_case_insensitive_const_uppercased() {
        let mut b = builder();
        let compiled = compile_one(
            r#"
op_equals_case_insensitive:
  left:
    term_reqheader: x-flag
  right:
    term_string: "AbC"
"#,
            &mut b,
        );
        match compiled.op {
            Operator::CaseInsEqualsHeaderConst { konst, .. } => {
                assert_eq!(b.const_value(konst), &Value::String("ABC".into()));
            }
            other => panic!("unexpected operator: {:?}", other),
        }
    }
}
