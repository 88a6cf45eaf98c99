//! Loop stop conditions: a closed comparator set over fields of the
//! aggregated iteration result, plus bare-field presence checks.

use maestro_core::{CoreError, CoreResult};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl CompareOp {
    fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "==",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoopCondition {
    Compare {
        field: String,
        op: CompareOp,
        value: Value,
    },
    /// A bare field name: satisfied when the field exists.
    Present { field: String },
}

impl LoopCondition {
    /// Parse expressions like `accuracy > 0.9`, `status == "done"`, or a
    /// bare field name.
    pub fn parse(input: &str) -> CoreResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(CoreError::InvalidRequest("empty loop condition".into()));
        }

        // Two-character operators first so `>=` is not read as `>`.
        for (token, op) in [
            ("<=", CompareOp::Le),
            (">=", CompareOp::Ge),
            ("==", CompareOp::Eq),
            ("<", CompareOp::Lt),
            (">", CompareOp::Gt),
        ] {
            if let Some((lhs, rhs)) = input.split_once(token) {
                let field = lhs.trim();
                let rhs = rhs.trim();
                if field.is_empty() || rhs.is_empty() {
                    return Err(CoreError::InvalidRequest(format!(
                        "malformed loop condition '{input}'"
                    )));
                }
                return Ok(LoopCondition::Compare {
                    field: field.to_string(),
                    op,
                    value: parse_literal(rhs),
                });
            }
        }

        if input.split_whitespace().count() != 1 {
            return Err(CoreError::InvalidRequest(format!(
                "loop condition '{input}' is neither a comparison nor a field name"
            )));
        }
        Ok(LoopCondition::Present {
            field: input.to_string(),
        })
    }

    /// Evaluate against one result document. `None` means the field is
    /// absent and the condition cannot be decided.
    pub fn evaluate(&self, document: &Value) -> Option<bool> {
        match self {
            LoopCondition::Present { field } => Some(lookup(document, field).is_some()),
            LoopCondition::Compare { field, op, value } => {
                let actual = lookup(document, field)?;
                compare(actual, *op, value)
            }
        }
    }
}

impl std::fmt::Display for LoopCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopCondition::Compare { field, op, value } => {
                write!(f, "{field} {} {value}", op.as_str())
            }
            LoopCondition::Present { field } => write!(f, "{field}"),
        }
    }
}

fn parse_literal(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<f64>() {
        if let Some(num) = serde_json::Number::from_f64(n) {
            return Value::Number(num);
        }
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    let unquoted = raw.trim_matches(|c| c == '"' || c == '\'');
    Value::String(unquoted.to_string())
}

/// Dotted-path lookup into nested objects.
fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> Option<bool> {
    if let (Some(a), Some(e)) = (actual.as_f64(), expected.as_f64()) {
        return Some(match op {
            CompareOp::Lt => a < e,
            CompareOp::Le => a <= e,
            CompareOp::Gt => a > e,
            CompareOp::Ge => a >= e,
            CompareOp::Eq => a == e,
        });
    }
    if let (Some(a), Some(e)) = (actual.as_str(), expected.as_str()) {
        return Some(match op {
            CompareOp::Lt => a < e,
            CompareOp::Le => a <= e,
            CompareOp::Gt => a > e,
            CompareOp::Ge => a >= e,
            CompareOp::Eq => a == e,
        });
    }
    if let (Some(a), Some(e)) = (actual.as_bool(), expected.as_bool()) {
        if op == CompareOp::Eq {
            return Some(a == e);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_numeric_comparison() {
        let cond = LoopCondition::parse("accuracy > 0.9").unwrap();
        assert_eq!(cond.evaluate(&json!({"accuracy": 0.92})), Some(true));
        assert_eq!(cond.evaluate(&json!({"accuracy": 0.85})), Some(false));
    }

    #[test]
    fn two_char_operators_win_over_one_char() {
        let cond = LoopCondition::parse("score >= 10").unwrap();
        assert!(matches!(
            cond,
            LoopCondition::Compare {
                op: CompareOp::Ge,
                ..
            }
        ));
        assert_eq!(cond.evaluate(&json!({"score": 10})), Some(true));
    }

    #[test]
    fn string_equality() {
        let cond = LoopCondition::parse("status == \"done\"").unwrap();
        assert_eq!(cond.evaluate(&json!({"status": "done"})), Some(true));
        assert_eq!(cond.evaluate(&json!({"status": "running"})), Some(false));
    }

    #[test]
    fn bare_field_is_presence() {
        let cond = LoopCondition::parse("summary").unwrap();
        assert_eq!(cond.evaluate(&json!({"summary": "ok"})), Some(true));
        assert_eq!(cond.evaluate(&json!({"other": 1})), Some(false));
    }

    #[test]
    fn dotted_path_navigates_nested_objects() {
        let cond = LoopCondition::parse("metrics.accuracy >= 0.5").unwrap();
        assert_eq!(
            cond.evaluate(&json!({"metrics": {"accuracy": 0.7}})),
            Some(true)
        );
    }

    #[test]
    fn missing_field_is_undecidable() {
        let cond = LoopCondition::parse("accuracy > 0.9").unwrap();
        assert_eq!(cond.evaluate(&json!({"precision": 0.95})), None);
    }

    #[test]
    fn type_mismatch_is_undecidable() {
        let cond = LoopCondition::parse("accuracy > 0.9").unwrap();
        assert_eq!(cond.evaluate(&json!({"accuracy": "high"})), None);
    }

    #[test]
    fn malformed_conditions_are_rejected() {
        assert!(LoopCondition::parse("").is_err());
        assert!(LoopCondition::parse("> 0.9").is_err());
        assert!(LoopCondition::parse("accuracy >").is_err());
        assert!(LoopCondition::parse("not a condition").is_err());
    }
}
