//! JEXL evaluation shared by job bodies and edge conditions.
//!
//! Context values are always passed as a context object, never spliced into
//! expression text.

use serde_json::{json, Value};

/// Build an evaluator with the standard transforms registered.
///
/// `jexl_eval::Evaluator` holds boxed transforms that are not `Send`, so a
/// fresh one is built for every evaluation instead of being stored.
pub fn evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("not", |args: &[Value]| {
            let val = args.first().cloned().unwrap_or(Value::Null);
            Ok(json!(!truthy(&val)))
        })
        // `state|hasError('job-id')`
        .with_transform("hasError", |args: &[Value]| {
            let state = args.first().cloned().unwrap_or(Value::Null);
            let job_id = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
            let found = state
                .get("errors")
                .and_then(|errors| errors.get(job_id))
                .is_some_and(|report| !report.is_null());
            Ok(json!(found))
        })
        .with_transform("length", |args: &[Value]| {
            let val = args.first().cloned().unwrap_or(Value::Null);
            let len = match &val {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
        .with_transform("keys", |args: &[Value]| {
            let keys: Vec<String> = args
                .first()
                .and_then(|v| v.as_object())
                .map(|o| o.keys().cloned().collect())
                .unwrap_or_default();
            Ok(json!(keys))
        })
}

/// Check that `source` parses, without evaluating it.
pub fn check_syntax(source: &str) -> Result<(), String> {
    jexl_parser::Parser::parse(source)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_error_checks_the_errors_map() {
        let ctx = json!({ "state": { "errors": { "a": { "type": "JobError" } } } });
        let ev = evaluator();
        assert_eq!(ev.eval_in_context("state|hasError('a')", &ctx).unwrap(), json!(true));
        assert_eq!(ev.eval_in_context("state|hasError('b')", &ctx).unwrap(), json!(false));
        assert_eq!(
            ev.eval_in_context("state|hasError('b')|not", &ctx).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn has_error_tolerates_missing_errors() {
        let ctx = json!({ "state": { "data": {} } });
        let ev = evaluator();
        assert_eq!(ev.eval_in_context("state|hasError('a')", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(check_syntax("state.data.x > 1").is_ok());
        assert!(check_syntax("state.data.x >").is_err());
    }

    #[test]
    fn truthiness_matches_javascript() {
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
        assert!(truthy(&json!({})));
        assert!(truthy(&json!([])));
    }
}
