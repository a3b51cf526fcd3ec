//! Prompt templates: `{path}` substitution against inputs + state.
//!
//! Paths are dotted (`profile.name` descends object values). Inputs are
//! consulted before state, so an input binding overrides a state field of the
//! same name. `{{` and `}}` escape literal braces (prompts often contain JSON
//! examples). An unresolved placeholder is an error listing the available
//! paths with a closest-match suggestion.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::EngineError;
use crate::state::State;
use crate::suggest::closest;

/// Extracts every `{path}` placeholder, in order, unescaping `{{`/`}}`.
/// Malformed spans (unclosed brace, non-path content) are returned verbatim so
/// validation can report them.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
            }
            '{' => {
                let mut path = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    path.push(c);
                }
                if closed {
                    out.push(path);
                } else {
                    out.push(format!("{{{}", path));
                }
            }
            _ => {}
        }
    }
    out
}

/// Looks up a dotted path: inputs first, then state; descends into object
/// values for the remaining segments.
pub fn resolve_path(path: &str, inputs: &BTreeMap<String, Value>, state: &State) -> Option<Value> {
    let mut segments = path.split('.');
    let root = segments.next()?;
    let mut current = inputs.get(root).or_else(|| state.get(root))?.clone();
    for segment in segments {
        current = current.get(segment)?.clone();
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitutes every placeholder in `template`. When substituted values
/// contain no braces the result is a fixed point: resolving it again returns
/// it unchanged.
pub fn resolve(
    template: &str,
    inputs: &BTreeMap<String, Value>,
    state: &State,
) -> Result<String, EngineError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut path = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    path.push(c);
                }
                if !closed {
                    return Err(EngineError::TemplateResolution(format!(
                        "unclosed placeholder `{{{}`",
                        path
                    )));
                }
                match resolve_path(&path, inputs, state) {
                    Some(value) => out.push_str(&render(&value)),
                    None => return Err(unresolved(&path, inputs, state)),
                }
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

fn unresolved(path: &str, inputs: &BTreeMap<String, Value>, state: &State) -> EngineError {
    let mut available: Vec<&str> = inputs
        .keys()
        .chain(state.keys())
        .map(|s| s.as_str())
        .collect();
    available.sort_unstable();
    available.dedup();
    let root = path.split('.').next().unwrap_or(path);
    let mut message = format!(
        "placeholder `{{{}}}` did not resolve; available: [{}]",
        path,
        available.join(", ")
    );
    if let Some(suggestion) = closest(root, available.iter().copied()) {
        message.push_str(&format!("; did you mean `{}`?", suggestion));
    }
    EngineError::TemplateResolution(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn substitutes_input_and_state() {
        let i = inputs(&[("message", json!("hi"))]);
        let mut s = State::new();
        s.insert("tone".to_string(), json!("calm"));
        let out = resolve("Echo: {message} in a {tone} voice", &i, &s).unwrap();
        assert_eq!(out, "Echo: hi in a calm voice");
    }

    #[test]
    fn inputs_override_state() {
        let i = inputs(&[("topic", json!("from-input"))]);
        let mut s = State::new();
        s.insert("topic".to_string(), json!("from-state"));
        assert_eq!(resolve("{topic}", &i, &s).unwrap(), "from-input");
    }

    #[test]
    fn dotted_path_descends_objects() {
        let i = inputs(&[("profile", json!({"name": "Ada", "langs": ["rust"]}))]);
        let s = State::new();
        assert_eq!(resolve("Hello {profile.name}", &i, &s).unwrap(), "Hello Ada");
    }

    #[test]
    fn non_string_values_render_as_json() {
        let i = inputs(&[("count", json!(3)), ("tags", json!(["a", "b"]))]);
        let s = State::new();
        assert_eq!(
            resolve("{count} items: {tags}", &i, &s).unwrap(),
            "3 items: [\"a\",\"b\"]"
        );
    }

    #[test]
    fn unresolved_lists_available_and_suggests() {
        let i = inputs(&[("message", json!("hi"))]);
        let err = resolve("Echo: {mesage}", &i, &State::new()).unwrap_err();
        let s = err.to_string();
        assert!(s.contains("available: [message]"), "{}", s);
        assert!(s.contains("did you mean `message`"), "{}", s);
    }

    #[test]
    fn escaped_braces_stay_literal() {
        let out = resolve("schema: {{\"x\": 1}}", &BTreeMap::new(), &State::new()).unwrap();
        assert_eq!(out, "schema: {\"x\": 1}");
    }

    #[test]
    fn resolution_is_idempotent_for_brace_free_values() {
        let i = inputs(&[("name", json!("world"))]);
        let s = State::new();
        let once = resolve("hello {name}", &i, &s).unwrap();
        let twice = resolve(&once, &i, &s).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn placeholders_extraction() {
        assert_eq!(
            placeholders("a {x} b {{literal}} c {y.z}"),
            vec!["x".to_string(), "y.z".to_string()]
        );
    }

    #[test]
    fn unclosed_placeholder_errors() {
        let err = resolve("broken {oops", &BTreeMap::new(), &State::new()).unwrap_err();
        assert!(err.to_string().contains("unclosed placeholder"), "{}", err);
    }
}
