//! Guard expressions.
//!
//! A guard `test` is a small boolean expression over the job document, the step
//! being claimed and its resolved params:
//!
//! ```text
//! params.deploy && job.params.env == 'prod'
//! !(step.retry > 0) || params.force
//! ```
//!
//! Values are compared as JSON: numbers numerically, strings lexically, other
//! types only by (in)equality. A missing path is `null`.
//! Truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are false.

pub mod lexer;
pub mod parser;

use serde_json::Value;
use std::cmp::Ordering;

use crate::params::get_path;
use crate::ports::{GuardError, GuardEvaluator, GuardScope};
use parser::{CompareOp, Expr, Parser};

/// Default [`GuardEvaluator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionEvaluator;

impl GuardEvaluator for ExpressionEvaluator {
    fn evaluate(&self, test: &str, scope: &GuardScope<'_>) -> Result<bool, GuardError> {
        let expr = Parser::parse(test)?;
        Ok(truthy(&eval(&expr, scope)))
    }
}

fn eval(expr: &Expr, scope: &GuardScope<'_>) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path { root, path } => {
            let base = match root.as_str() {
                "job" => scope.job,
                "step" => scope.step,
                _ => scope.params,
            };
            get_path(base, path).cloned().unwrap_or(Value::Null)
        }
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, scope))),
        Expr::And(l, r) => Value::Bool(truthy(&eval(l, scope)) && truthy(&eval(r, scope))),
        Expr::Or(l, r) => Value::Bool(truthy(&eval(l, scope)) || truthy(&eval(r, scope))),
        Expr::Compare(op, l, r) => Value::Bool(compare(*op, &eval(l, scope), &eval(r, scope))),
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> bool {
    let ord = ordering(left, right);
    match op {
        CompareOp::Eq => ord.map_or_else(|| left == right, Ordering::is_eq),
        CompareOp::Ne => ord.map_or_else(|| left != right, Ordering::is_ne),
        CompareOp::Lt => ord.is_some_and(Ordering::is_lt),
        CompareOp::Le => ord.is_some_and(Ordering::is_le),
        CompareOp::Gt => ord.is_some_and(Ordering::is_gt),
        CompareOp::Ge => ord.is_some_and(Ordering::is_ge),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("true", true)]
    #[case("false", false)]
    #[case("params.deploy", true)]
    #[case("params.missing", false)]
    #[case("!params.missing", true)]
    #[case("params.count == 3", true)]
    #[case("params.count == 3.0", true)]
    #[case("params.count >= 4", false)]
    #[case("params.count < 10 && job.owner == 'acme'", true)]
    #[case("job.owner == \"other\" || step.retry > 0", true)]
    #[case("params.tags", true)]
    #[case("params.empty", false)]
    #[case("params.count > 'x'", false)]
    #[case("params.missing == null", true)]
    #[case("step.name != 'build'", false)]
    fn evaluates(#[case] test: &str, #[case] expected: bool) {
        let job = json!({"owner": "acme", "params": {"env": "prod"}});
        let step = json!({"name": "build", "retry": 1});
        let params = json!({"deploy": true, "count": 3, "tags": ["a"], "empty": ""});
        let scope = GuardScope {
            job: &job,
            step: &step,
            params: &params,
        };
        assert_eq!(ExpressionEvaluator.evaluate(test, &scope), Ok(expected), "{test}");
    }

    #[test]
    fn parse_errors_are_reported() {
        let v = json!({});
        let scope = GuardScope {
            job: &v,
            step: &v,
            params: &v,
        };
        assert!(ExpressionEvaluator.evaluate("params.a ==", &scope).is_err());
    }
}
