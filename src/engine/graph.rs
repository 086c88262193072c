//! Parameter substitution for opaque workflow graphs.
//!
//! A string that is exactly `{{name}}` is replaced by the parameter value
//! with its JSON type preserved, so numeric knobs stay numeric. Placeholders
//! embedded in longer strings are replaced textually.

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while rendering a workflow graph.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GraphError {
    /// The graph root must be a JSON object of nodes.
    #[error("workflow graph must be a JSON object, got {found}")]
    NotAnObject {
        /// JSON type found at the root.
        found: String,
    },
    /// A placeholder referenced a parameter that was not supplied.
    #[error("workflow graph references unknown parameter `{name}`")]
    UnresolvedPlaceholder {
        /// Placeholder name.
        name: String,
    },
}

pub(super) fn render(graph: &Value, params: &Map<String, Value>) -> Result<Value, GraphError> {
    if !graph.is_object() {
        return Err(GraphError::NotAnObject {
            found: json_type(graph).to_owned(),
        });
    }
    substitute(graph, params)
}

fn substitute(value: &Value, params: &Map<String, Value>) -> Result<Value, GraphError> {
    match value {
        Value::String(text) => substitute_text(text, params),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, params))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, item)| substitute(item, params).map(|rendered| (key.clone(), rendered)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn substitute_text(text: &str, params: &Map<String, Value>) -> Result<Value, GraphError> {
    if let Some(name) = whole_placeholder(text) {
        return params
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnresolvedPlaceholder {
                name: name.to_owned(),
            });
    }

    let mut rendered = text.to_owned();
    for (name, value) in params {
        let marker = format!("{{{{{name}}}}}");
        if rendered.contains(&marker) {
            rendered = rendered.replace(&marker, &inline_text(value));
        }
    }

    if let Some(name) = first_placeholder(&rendered) {
        return Err(GraphError::UnresolvedPlaceholder {
            name: name.to_owned(),
        });
    }
    Ok(Value::String(rendered))
}

fn whole_placeholder(text: &str) -> Option<&str> {
    let name = text.strip_prefix("{{")?.strip_suffix("}}")?;
    is_identifier(name).then_some(name)
}

pub(crate) fn first_placeholder(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some((_, after_open)) = rest.split_once("{{") {
        let (name, after_close) = after_open.split_once("}}")?;
        if is_identifier(name) {
            return Some(name);
        }
        rest = after_close;
    }
    None
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.')
}

fn inline_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::engine::JobSpec;

    fn spec() -> JobSpec {
        JobSpec::new(
            json!({
                "3": {"class_type": "KSampler", "inputs": {"seed": "{{seed}}", "cfg": 7.5}},
                "10": {"class_type": "LoadImage", "inputs": {"image": "{{input}}"}},
                "12": {"inputs": {"filename_prefix": "run-{{seed}}/frame"}}
            }),
            "key-1",
        )
        .with_input("uploads/cat.png")
        .with_param("seed", 42)
    }

    #[test]
    fn whole_placeholders_keep_parameter_type() {
        let rendered = spec().render().expect("graph renders");

        assert_eq!(rendered.pointer("/3/inputs/seed"), Some(&json!(42)));
        assert_eq!(
            rendered.pointer("/10/inputs/image"),
            Some(&json!("uploads/cat.png"))
        );
        assert_eq!(rendered.pointer("/3/inputs/cfg"), Some(&json!(7.5)));
    }

    #[test]
    fn embedded_placeholders_are_replaced_textually() {
        let rendered = spec().render().expect("graph renders");

        assert_eq!(
            rendered.pointer("/12/inputs/filename_prefix"),
            Some(&json!("run-42/frame"))
        );
    }

    #[rstest]
    #[case(json!({"1": {"inputs": {"steps": "{{steps}}"}}}))]
    #[case(json!({"1": {"inputs": {"prefix": "out-{{steps}}"}}}))]
    #[case(json!({"1": {"inputs": {"list": ["{{steps}}"]}}}))]
    fn missing_parameters_are_rejected(#[case] graph: Value) {
        let err = JobSpec::new(graph, "k").render().expect_err("should fail");

        assert_eq!(
            err,
            GraphError::UnresolvedPlaceholder {
                name: String::from("steps")
            }
        );
    }

    #[rstest]
    #[case(json!([1, 2]), "array")]
    #[case(json!("graph"), "string")]
    #[case(Value::Null, "null")]
    fn non_object_graphs_are_malformed(#[case] graph: Value, #[case] found: &str) {
        let err = JobSpec::new(graph, "k").render().expect_err("should fail");

        assert_eq!(
            err,
            GraphError::NotAnObject {
                found: found.to_owned()
            }
        );
    }

    #[test]
    fn braces_that_are_not_placeholders_pass_through() {
        let graph = json!({"1": {"inputs": {"text": "a {{ not a name }} b"}}});

        let rendered = JobSpec::new(graph.clone(), "k")
            .render()
            .expect("graph renders");

        assert_eq!(rendered, graph);
    }
}
