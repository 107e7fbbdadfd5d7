use crate::{ContextMap, Outcome};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Comparison {
    Eq,
    Ne,
    Truthy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Clause<'a> {
    key: &'a str,
    comparison: Comparison,
    expected: &'a str,
}

/// Evaluate an edge condition against the just-produced outcome and a
/// context snapshot. Pure: no I/O, no mutation, total over its inputs.
///
/// Clauses are `&&`-joined; each is `key=value`, `key!=value`, or a bare
/// key checked for truthiness. An empty condition is true.
pub fn evaluate_condition(condition: &str, outcome: &Outcome, context: &ContextMap) -> bool {
    for clause in parse_clauses(condition) {
        let actual = resolve_key(clause.key, outcome, context);
        let passed = match clause.comparison {
            Comparison::Truthy => is_truthy(actual.as_ref()),
            Comparison::Eq => stringify(actual.as_ref()) == clause.expected,
            Comparison::Ne => stringify(actual.as_ref()) != clause.expected,
        };
        if !passed {
            return false;
        }
    }
    true
}

/// Structural check used by the lint pass. Accepts anything the
/// evaluator accepts; rejects clauses with an empty key or an empty
/// comparison value.
pub fn validate_condition(condition: &str) -> Result<(), String> {
    for raw in condition.split("&&") {
        let clause = raw.trim();
        if clause.is_empty() {
            continue;
        }
        let (key, value) = if let Some((left, right)) = clause.split_once("!=") {
            (left.trim(), Some(right.trim()))
        } else if let Some((left, right)) = clause.split_once('=') {
            (left.trim(), Some(right.trim()))
        } else {
            (clause, None)
        };
        if key.is_empty() {
            return Err(format!("condition clause '{clause}' has an empty key"));
        }
        if let Some(value) = value {
            if value.is_empty() {
                return Err(format!("condition clause '{clause}' has an empty value"));
            }
        }
    }
    Ok(())
}

fn parse_clauses(condition: &str) -> Vec<Clause<'_>> {
    let mut clauses = Vec::new();
    for raw in condition.split("&&") {
        let clause = raw.trim();
        if clause.is_empty() {
            continue;
        }
        if let Some((left, right)) = clause.split_once("!=") {
            clauses.push(Clause {
                key: left.trim(),
                comparison: Comparison::Ne,
                expected: right.trim(),
            });
        } else if let Some((left, right)) = clause.split_once('=') {
            clauses.push(Clause {
                key: left.trim(),
                comparison: Comparison::Eq,
                expected: right.trim(),
            });
        } else {
            clauses.push(Clause {
                key: clause,
                comparison: Comparison::Truthy,
                expected: "",
            });
        }
    }
    clauses
}

/// `outcome` and `preferred_label` bind to the outcome. A `context.`
/// prefix looks up the full key first, then the suffix after the dot.
/// Any other key looks up in the context directly.
fn resolve_key(key: &str, outcome: &Outcome, context: &ContextMap) -> Option<Value> {
    match key {
        "outcome" => Some(Value::String(outcome.status.as_str().to_string())),
        "preferred_label" => outcome.preferred_label.clone().map(Value::String),
        _ => {
            if let Some(suffix) = key.strip_prefix("context.") {
                context
                    .get(key)
                    .or_else(|| context.get(suffix))
                    .cloned()
            } else {
                context.get(key).cloned()
            }
        }
    }
}

/// Missing keys coerce to the empty string; booleans to `true`/`false`.
fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(inner)) => inner.clone(),
        Some(Value::Bool(inner)) => inner.to_string(),
        Some(Value::Number(inner)) => inner.to_string(),
        Some(other) => other.to_string(),
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(inner)) => *inner,
        Some(Value::String(inner)) => !inner.is_empty(),
        Some(Value::Number(inner)) => inner.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::Array(inner)) => !inner.is_empty(),
        Some(Value::Object(inner)) => !inner.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StageStatus;
    use serde_json::json;

    fn outcome_with(status: StageStatus, label: Option<&str>) -> Outcome {
        let mut outcome = Outcome::success();
        outcome.status = status;
        outcome.preferred_label = label.map(ToOwned::to_owned);
        outcome
    }

    #[test]
    fn evaluate_condition_empty_expected_true() {
        let context = ContextMap::new();
        assert!(evaluate_condition(
            "",
            &outcome_with(StageStatus::Success, None),
            &context
        ));
        assert!(evaluate_condition(
            "   ",
            &outcome_with(StageStatus::Fail, None),
            &context
        ));
    }

    #[test]
    fn evaluate_condition_outcome_key_expected_status_string() {
        let context = ContextMap::new();
        assert!(evaluate_condition(
            "outcome=success",
            &outcome_with(StageStatus::Success, None),
            &context
        ));
        assert!(evaluate_condition(
            "outcome!=success",
            &outcome_with(StageStatus::PartialSuccess, None),
            &context
        ));
    }

    #[test]
    fn evaluate_condition_conjunction_expected_all_clauses_required() {
        let mut context = ContextMap::new();
        context.insert("ready".to_string(), json!(true));
        let outcome = outcome_with(StageStatus::Success, Some("Yes"));

        assert!(evaluate_condition(
            "outcome=success && preferred_label=Yes && ready=true",
            &outcome,
            &context
        ));
        assert!(!evaluate_condition(
            "outcome=success && ready=false",
            &outcome,
            &context
        ));
    }

    #[test]
    fn evaluate_condition_context_prefix_expected_two_step_lookup() {
        let mut context = ContextMap::new();
        context.insert("context.phase".to_string(), json!("full-key"));
        context.insert("phase".to_string(), json!("suffix"));
        let outcome = outcome_with(StageStatus::Success, None);

        // Full key wins when both are present.
        assert!(evaluate_condition("context.phase=full-key", &outcome, &context));

        context.shift_remove("context.phase");
        assert!(evaluate_condition("context.phase=suffix", &outcome, &context));
    }

    #[test]
    fn evaluate_condition_bare_key_expected_context_lookup() {
        let mut context = ContextMap::new();
        context.insert("tries".to_string(), json!(2));
        let outcome = outcome_with(StageStatus::Success, None);

        assert!(evaluate_condition("tries=2", &outcome, &context));
        assert!(evaluate_condition("tries", &outcome, &context));
    }

    #[test]
    fn evaluate_condition_missing_key_expected_empty_string() {
        let context = ContextMap::new();
        let outcome = outcome_with(StageStatus::Success, None);

        assert!(!evaluate_condition("absent=anything", &outcome, &context));
        assert!(evaluate_condition("absent!=anything", &outcome, &context));
        assert!(!evaluate_condition("absent", &outcome, &context));
    }

    #[test]
    fn evaluate_condition_truthiness_expected_per_type() {
        let mut context = ContextMap::new();
        context.insert("empty_str".to_string(), json!(""));
        context.insert("zero".to_string(), json!(0));
        context.insert("list".to_string(), json!([1]));
        context.insert("empty_list".to_string(), json!([]));
        context.insert("flag".to_string(), json!(false));
        let outcome = outcome_with(StageStatus::Success, None);

        assert!(!evaluate_condition("empty_str", &outcome, &context));
        assert!(!evaluate_condition("zero", &outcome, &context));
        assert!(evaluate_condition("list", &outcome, &context));
        assert!(!evaluate_condition("empty_list", &outcome, &context));
        assert!(!evaluate_condition("flag", &outcome, &context));
    }

    #[test]
    fn evaluate_condition_boolean_comparison_expected_string_forms() {
        let mut context = ContextMap::new();
        context.insert("enabled".to_string(), json!(true));
        let outcome = outcome_with(StageStatus::Success, None);

        assert!(evaluate_condition("enabled=true", &outcome, &context));
        assert!(evaluate_condition("enabled!=false", &outcome, &context));
    }

    #[test]
    fn evaluate_condition_is_pure_expected_same_verdict_on_repeat() {
        let mut context = ContextMap::new();
        context.insert("phase".to_string(), json!("build"));
        let outcome = outcome_with(StageStatus::Success, None);
        let before = context.clone();

        let first = evaluate_condition("phase=build && outcome=success", &outcome, &context);
        let second = evaluate_condition("phase=build && outcome=success", &outcome, &context);
        assert!(first && second);
        assert_eq!(context, before);
    }

    #[test]
    fn validate_condition_malformed_expected_err() {
        assert!(validate_condition("outcome=").is_err());
        assert!(validate_condition("=success").is_err());
        assert!(validate_condition("outcome=success && ok").is_ok());
    }
}
