//! `{{path}}` placeholder rendering for webhook payloads and headers.

use serde_json::Value;

use crate::predicate::lookup;

/// Replaces every `{{ path }}` in `template` with the value found at `path`
/// in `context`. Strings are inserted raw, other values as JSON, missing
/// paths as the empty string.
pub fn render_str(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let path = after[..close].trim();
                match lookup(context, path) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(Value::Null) | None => {}
                    Some(other) => out.push_str(&other.to_string()),
                }
                rest = &after[close + 2..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Renders every string inside a JSON value. A string that is exactly one
/// placeholder is replaced by the referenced value, keeping its JSON type.
pub fn render_value(template: &Value, context: &Value) -> Value {
    match template {
        Value::String(s) => match sole_placeholder(s) {
            Some(path) => lookup(context, path).cloned().unwrap_or(Value::Null),
            None => Value::String(render_str(s, context)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn sole_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "contact": {"id": "c-1", "fields": {"first_name": "Ada", "seats": 2}},
            "automation": {"name": "Welcome"}
        })
    }

    #[test]
    fn test_render_str() {
        assert_eq!(
            render_str("Hi {{ contact.fields.first_name }}, {{contact.fields.seats}} seats", &ctx()),
            "Hi Ada, 2 seats"
        );
        assert_eq!(render_str("{{ missing.path }}!", &ctx()), "!");
        assert_eq!(render_str("unterminated {{ oops", &ctx()), "unterminated {{ oops");
    }

    #[test]
    fn test_render_value_keeps_types() {
        let template = json!({
            "contact": "{{contact.id}}",
            "seats": "{{ contact.fields.seats }}",
            "label": "{{automation.name}} journey",
            "static": [1, true]
        });
        let rendered = render_value(&template, &ctx());
        assert_eq!(
            rendered,
            json!({"contact": "c-1", "seats": 2, "label": "Welcome journey", "static": [1, true]})
        );
    }
}
