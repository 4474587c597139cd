//! The compiled predicate tree.
//!
//! One exhaustive enum covers every operand-kind specialization the compiler
//! can select. Evaluation never allocates into RootConfig/RunState and never
//! mutates them; all values a node needs were materialized beforehand by the
//! filter-case machine.

use ipnet::IpNet;
use serde_json::Value;
use std::net::IpAddr;

use crate::context::{RootConfig, RunState, ValueIndex};
use crate::message::{Direction, Exchange};

/// A header operand: interned name plus which side it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRef {
    pub header: ValueIndex,
    pub direction: Direction,
}

/// A node in the compiled predicate tree.
#[derive(Debug, Clone)]
pub enum Operator {
    True,
    False,
    And(Vec<Operator>),
    Or(Vec<Operator>),
    Not(Box<Operator>),

    // equals, exact
    EqualsVarConst { var: ValueIndex, konst: ValueIndex },
    EqualsVarVar { left: ValueIndex, right: ValueIndex },
    EqualsVarHeader { var: ValueIndex, header: HeaderRef },
    EqualsVarQueryParam { var: ValueIndex, param: ValueIndex },
    EqualsVarApiName { var: ValueIndex },
    EqualsHeaderConst { header: HeaderRef, konst: ValueIndex },
    EqualsHeaderHeader { left: HeaderRef, right: HeaderRef },
    EqualsHeaderQueryParam { header: HeaderRef, param: ValueIndex },
    EqualsHeaderApiName { header: HeaderRef },
    EqualsQueryParamConst { param: ValueIndex, konst: ValueIndex },
    EqualsQueryParamQueryParam { left: ValueIndex, right: ValueIndex },
    EqualsQueryParamApiName { param: ValueIndex },
    EqualsApiNameConst { konst: ValueIndex },

    // equals, case-insensitive; string constants are interned uppercased
    CaseInsEqualsVarConst { var: ValueIndex, konst: ValueIndex },
    CaseInsEqualsVarVar { left: ValueIndex, right: ValueIndex },
    CaseInsEqualsVarHeader { var: ValueIndex, header: HeaderRef },
    CaseInsEqualsVarQueryParam { var: ValueIndex, param: ValueIndex },
    CaseInsEqualsVarApiName { var: ValueIndex },
    CaseInsEqualsHeaderConst { header: HeaderRef, konst: ValueIndex },
    /// Element-wise over the value lists, unlike the exact variant which
    /// compares the comma-joined form
    CaseInsEqualsHeaderHeader { left: HeaderRef, right: HeaderRef },
    CaseInsEqualsHeaderQueryParam { header: HeaderRef, param: ValueIndex },
    CaseInsEqualsHeaderApiName { header: HeaderRef },
    CaseInsEqualsQueryParamConst { param: ValueIndex, konst: ValueIndex },
    CaseInsEqualsQueryParamQueryParam { left: ValueIndex, right: ValueIndex },
    CaseInsEqualsQueryParamApiName { param: ValueIndex },
    CaseInsEqualsApiNameConst { konst: ValueIndex },

    ExistsVar { var: ValueIndex },
    ExistsHeader { header: HeaderRef },
    ExistsQueryParam { param: ValueIndex },
    ExistsApiName,

    IsEmptyVar { var: ValueIndex },
    IsEmptyHeader { header: HeaderRef },
    IsEmptyQueryParam { param: ValueIndex },
    IsEmptyApiName,

    IsInSubnetVar { var: ValueIndex, net: IpNet },
    /// True if any of the header's values is in the subnet
    IsInSubnetHeader { header: HeaderRef, net: IpNet },
    IsInSubnetQueryParam { param: ValueIndex, net: IpNet },

    IsValidJson { direction: Direction },
}

impl Operator {
    /// Evaluate against the materialized exchange state.
    pub fn eval(&self, root: &RootConfig, run: &RunState, exchange: &Exchange<'_>) -> bool {
        match self {
            Operator::True => true,
            Operator::False => false,
            Operator::And(args) => args.iter().all(|a| a.eval(root, run, exchange)),
            Operator::Or(args) => args.iter().any(|a| a.eval(root, run, exchange)),
            Operator::Not(arg) => !arg.eval(root, run, exchange),

            Operator::EqualsVarConst { var, konst } => {
                json_equals(run.var_value(*var), root.const_value(*konst))
            }
            Operator::EqualsVarVar { left, right } => {
                json_equals(run.var_value(*left), run.var_value(*right))
            }
            Operator::EqualsVarHeader { var, header } => match run.var_value(*var) {
                Value::String(s) => {
                    run.has_header_value(header.direction, header.header)
                        && *s == run.header_value_joined(header.direction, header.header)
                }
                _ => false,
            },
            Operator::EqualsVarQueryParam { var, param } => match run.var_value(*var) {
                Value::String(s) => run.query_param_value(*param) == Some(s.as_str()),
                _ => false,
            },
            Operator::EqualsVarApiName { var } => match run.var_value(*var) {
                Value::String(s) => s == run.api_name(),
                _ => false,
            },
            Operator::EqualsHeaderConst { header, konst } => {
                run.has_header_value(header.direction, header.header)
                    && const_str(root, *konst)
                        == run.header_value_joined(header.direction, header.header)
            }
            Operator::EqualsHeaderHeader { left, right } => {
                run.has_header_value(left.direction, left.header)
                    && run.has_header_value(right.direction, right.header)
                    && run.header_value_joined(left.direction, left.header)
                        == run.header_value_joined(right.direction, right.header)
            }
            Operator::EqualsHeaderQueryParam { header, param } => {
                match run.query_param_value(*param) {
                    Some(value) => {
                        run.has_header_value(header.direction, header.header)
                            && value == run.header_value_joined(header.direction, header.header)
                    }
                    None => false,
                }
            }
            Operator::EqualsHeaderApiName { header } => {
                run.has_header_value(header.direction, header.header)
                    && run.header_value_joined(header.direction, header.header) == run.api_name()
            }
            Operator::EqualsQueryParamConst { param, konst } => {
                run.query_param_value(*param) == Some(const_str(root, *konst))
            }
            Operator::EqualsQueryParamQueryParam { left, right } => {
                match (run.query_param_value(*left), run.query_param_value(*right)) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            Operator::EqualsQueryParamApiName { param } => {
                run.query_param_value(*param) == Some(run.api_name())
            }
            Operator::EqualsApiNameConst { konst } => run.api_name() == const_str(root, *konst),

            Operator::CaseInsEqualsVarConst { var, konst } => match run.var_value(*var) {
                Value::String(s) => upper(s) == const_str(root, *konst),
                _ => false,
            },
            Operator::CaseInsEqualsVarVar { left, right } => {
                match (run.var_value(*left), run.var_value(*right)) {
                    (Value::String(a), Value::String(b)) => upper(a) == upper(b),
                    _ => false,
                }
            }
            Operator::CaseInsEqualsVarHeader { var, header } => match run.var_value(*var) {
                Value::String(s) => {
                    run.has_header_value(header.direction, header.header)
                        && upper(s)
                            == upper(&run.header_value_joined(header.direction, header.header))
                }
                _ => false,
            },
            Operator::CaseInsEqualsVarQueryParam { var, param } => match run.var_value(*var) {
                Value::String(s) => {
                    run.query_param_value(*param).is_some_and(|v| upper(v) == upper(s))
                }
                _ => false,
            },
            Operator::CaseInsEqualsVarApiName { var } => match run.var_value(*var) {
                Value::String(s) => upper(s) == upper(run.api_name()),
                _ => false,
            },
            Operator::CaseInsEqualsHeaderConst { header, konst } => {
                run.has_header_value(header.direction, header.header)
                    && upper(&run.header_value_joined(header.direction, header.header))
                        == const_str(root, *konst)
            }
            Operator::CaseInsEqualsHeaderHeader { left, right } => {
                let a = run.header_value(left.direction, left.header);
                let b = run.header_value(right.direction, right.header);
                run.has_header_value(left.direction, left.header)
                    && run.has_header_value(right.direction, right.header)
                    && a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
            }
            Operator::CaseInsEqualsHeaderQueryParam { header, param } => {
                match run.query_param_value(*param) {
                    Some(value) => {
                        run.has_header_value(header.direction, header.header)
                            && upper(value)
                                == upper(&run.header_value_joined(header.direction, header.header))
                    }
                    None => false,
                }
            }
            Operator::CaseInsEqualsHeaderApiName { header } => {
                run.has_header_value(header.direction, header.header)
                    && upper(&run.header_value_joined(header.direction, header.header))
                        == upper(run.api_name())
            }
            Operator::CaseInsEqualsQueryParamConst { param, konst } => run
                .query_param_value(*param)
                .is_some_and(|v| upper(v) == const_str(root, *konst)),
            Operator::CaseInsEqualsQueryParamQueryParam { left, right } => {
                match (run.query_param_value(*left), run.query_param_value(*right)) {
                    (Some(a), Some(b)) => upper(a) == upper(b),
                    _ => false,
                }
            }
            Operator::CaseInsEqualsQueryParamApiName { param } => run
                .query_param_value(*param)
                .is_some_and(|v| upper(v) == upper(run.api_name())),
            Operator::CaseInsEqualsApiNameConst { konst } => {
                upper(run.api_name()) == const_str(root, *konst)
            }

            Operator::ExistsVar { var } => {
                run.var_is_set(*var)
                    && match run.var_value(*var) {
                        Value::String(s) => !s.is_empty(),
                        _ => true,
                    }
            }
            Operator::ExistsHeader { header } => {
                run.has_header_value(header.direction, header.header)
            }
            Operator::ExistsQueryParam { param } => run.has_query_param_value(*param),
            Operator::ExistsApiName => !run.api_name().is_empty(),

            Operator::IsEmptyVar { var } => run.var_is_empty(*var),
            Operator::IsEmptyHeader { header } => {
                run.header_value_is_empty(header.direction, header.header)
            }
            Operator::IsEmptyQueryParam { param } => {
                run.query_param_value(*param).map_or(true, |v| v.is_empty())
            }
            Operator::IsEmptyApiName => run.api_name().is_empty(),

            Operator::IsInSubnetVar { var, net } => match run.var_value(*var) {
                Value::String(s) => addr_in_net(s, net),
                _ => false,
            },
            Operator::IsInSubnetHeader { header, net } => run
                .header_value(header.direction, header.header)
                .iter()
                .any(|v| addr_in_net(v, net)),
            Operator::IsInSubnetQueryParam { param, net } => {
                run.query_param_value(*param).is_some_and(|v| addr_in_net(v, net))
            }

            Operator::IsValidJson { direction } => exchange.body(*direction).as_json().is_ok(),
        }
    }
}

fn const_str(root: &RootConfig, konst: ValueIndex) -> &str {
    match root.const_value(konst) {
        Value::String(s) => s.as_str(),
        // The compiler only pairs string constants with string-valued
        // operands; anything else is a broken compile invariant.
        other => panic!("non-string constant in string comparison: {other:?}"),
    }
}

fn upper(s: &str) -> String {
    s.to_uppercase()
}

/// Unparsable address or mismatched address family is `false`, never an
/// error.
fn addr_in_net(candidate: &str, net: &IpNet) -> bool {
    match candidate.trim().parse::<IpAddr>() {
        Ok(addr) => match (addr, net) {
            (IpAddr::V4(_), IpNet::V4(_)) | (IpAddr::V6(_), IpNet::V6(_)) => net.contains(&addr),
            _ => false,
        },
        Err(_) => false,
    }
}

/// Numeric equality with a relative epsilon, tolerating representation
/// differences from config parsing. Non-numbers compare structurally.
pub(crate) fn json_equals(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => almost_equal(x, y),
        _ => a == b,
    }
}

fn almost_equal(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    let largest = a.abs().max(b.abs());
    diff <= largest * f64::EPSILON * 4.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_almost_equal() {
        assert!(almost_equal(0.1 + 0.2, 0.3));
        assert!(almost_equal(1e9, 1e9));
        assert!(!almost_equal(1.0, 1.0001));
        assert!(almost_equal(0.0, 0.0));
    }

    #[test]
    fn test_json_equals_mixed() {
        assert!(json_equals(&json!(1.0), &json!(1)));
        assert!(!json_equals(&json!("1"), &json!(1)));
        assert!(json_equals(&json!("x"), &json!("x")));
        assert!(!json_equals(&json!(null), &json!("262")));
    }

    #[test]
    fn test_addr_in_net() {
        let net: IpNet = "10.0.0.0/8".parse().unwrap();
        assert!(addr_in_net("10.2.3.4", &net));
        assert!(addr_in_net(" 10.2.3.4", &net));
        assert!(!addr_in_net("33.1.1.1", &net));
        assert!(!addr_in_net("not-an-ip", &net));
        // family mismatch
        assert!(!addr_in_net("::1", &net));
        let net6: IpNet = "fd00::/8".parse().unwrap();
        assert!(!addr_in_net("10.2.3.4", &net6));
        assert!(addr_in_net("fd00::1", &net6));
    }
}
