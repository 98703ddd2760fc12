//! Typed predicates evaluated against JSON documents.
//!
//! Trigger configs evaluate them against the domain event payload; condition
//! steps evaluate them against the contact snapshot merged with the
//! enrollment's trigger payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JourneyError, JourneyResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Predicate {
    Always,
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Exists { field: String },
    GreaterThan { field: String, value: f64 },
    LessThan { field: String, value: f64 },
    /// True when the document's top-level `tags` array contains `tag`.
    HasTag { tag: String },
    All { predicates: Vec<Predicate> },
    Any { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    /// Authoring-time shape check.
    pub fn validate(&self) -> JourneyResult<()> {
        match self {
            Predicate::Always => Ok(()),
            Predicate::Equals { field, .. }
            | Predicate::NotEquals { field, .. }
            | Predicate::Exists { field } => check_field(field),
            Predicate::GreaterThan { field, value } | Predicate::LessThan { field, value } => {
                check_field(field)?;
                if !value.is_finite() {
                    return Err(JourneyError::validation(format!(
                        "comparison value for '{field}' must be finite"
                    )));
                }
                Ok(())
            }
            Predicate::In { field, values } => {
                check_field(field)?;
                if values.is_empty() {
                    return Err(JourneyError::validation(format!(
                        "'in' predicate on '{field}' needs at least one value"
                    )));
                }
                Ok(())
            }
            Predicate::HasTag { tag } => {
                if tag.trim().is_empty() {
                    return Err(JourneyError::validation("has_tag needs a non-empty tag"));
                }
                Ok(())
            }
            Predicate::All { predicates } | Predicate::Any { predicates } => {
                if predicates.is_empty() {
                    return Err(JourneyError::validation(
                        "all/any predicate needs at least one operand",
                    ));
                }
                predicates.iter().try_for_each(Predicate::validate)
            }
            Predicate::Not { predicate } => predicate.validate(),
        }
    }

    /// Evaluates the predicate. Comparing a non-numeric value numerically,
    /// or reading tags from a non-array, is an error rather than `false`.
    pub fn evaluate(&self, doc: &Value) -> JourneyResult<bool> {
        match self {
            Predicate::Always => Ok(true),
            Predicate::Equals { field, value } => Ok(lookup(doc, field) == Some(value)),
            Predicate::NotEquals { field, value } => Ok(lookup(doc, field) != Some(value)),
            Predicate::In { field, values } => Ok(lookup(doc, field)
                .map(|v| values.contains(v))
                .unwrap_or(false)),
            Predicate::Exists { field } => {
                Ok(lookup(doc, field).map(|v| !v.is_null()).unwrap_or(false))
            }
            Predicate::GreaterThan { field, value } => {
                Ok(numeric(doc, field)?.map(|n| n > *value).unwrap_or(false))
            }
            Predicate::LessThan { field, value } => {
                Ok(numeric(doc, field)?.map(|n| n < *value).unwrap_or(false))
            }
            Predicate::HasTag { tag } => match doc.get("tags") {
                None | Some(Value::Null) => Ok(false),
                Some(Value::Array(tags)) => Ok(tags.iter().any(|t| t.as_str() == Some(tag))),
                Some(other) => Err(JourneyError::Predicate(format!(
                    "'tags' is not an array: {other}"
                ))),
            },
            Predicate::All { predicates } => {
                for p in predicates {
                    if !p.evaluate(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Any { predicates } => {
                for p in predicates {
                    if p.evaluate(doc)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not { predicate } => Ok(!predicate.evaluate(doc)?),
        }
    }
}

/// Resolves a dot-separated path (`fields.company.size`) inside `doc`.
/// Numeric segments index into arrays.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn numeric(doc: &Value, field: &str) -> JourneyResult<Option<f64>> {
    match lookup(doc, field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => Err(JourneyError::Predicate(format!(
            "field '{field}' is not numeric: {other}"
        ))),
    }
}

fn check_field(field: &str) -> JourneyResult<()> {
    if field.is_empty() || field.split('.').any(|s| s.is_empty()) {
        return Err(JourneyError::validation(format!(
            "invalid field path '{field}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "tags": ["vip", "speaker"],
            "fields": {"company": "Acme", "talks": 3},
            "trigger": {"ticket_type": "early_bird", "amount": "free"}
        })
    }

    #[test]
    fn test_field_predicates() {
        let d = doc();
        let eq = Predicate::Equals {
            field: "fields.company".into(),
            value: json!("Acme"),
        };
        assert!(eq.evaluate(&d).unwrap());

        let within = Predicate::In {
            field: "trigger.ticket_type".into(),
            values: vec![json!("vip"), json!("early_bird")],
        };
        assert!(within.evaluate(&d).unwrap());

        let missing = Predicate::Exists {
            field: "fields.phone".into(),
        };
        assert!(!missing.evaluate(&d).unwrap());

        let gt = Predicate::GreaterThan {
            field: "fields.talks".into(),
            value: 2.0,
        };
        assert!(gt.evaluate(&d).unwrap());
    }

    #[test]
    fn test_has_tag_and_combinators() {
        let d = doc();
        let p = Predicate::All {
            predicates: vec![
                Predicate::HasTag { tag: "vip".into() },
                Predicate::Not {
                    predicate: Box::new(Predicate::HasTag {
                        tag: "sponsor".into(),
                    }),
                },
            ],
        };
        assert!(p.evaluate(&d).unwrap());
        assert!(!Predicate::HasTag { tag: "vip".into() }
            .evaluate(&json!({}))
            .unwrap());
    }

    #[test]
    fn test_numeric_comparison_on_string_is_error() {
        let p = Predicate::LessThan {
            field: "trigger.amount".into(),
            value: 10.0,
        };
        assert!(matches!(
            p.evaluate(&doc()),
            Err(JourneyError::Predicate(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        assert!(Predicate::In {
            field: "a".into(),
            values: vec![]
        }
        .validate()
        .is_err());
        assert!(Predicate::Exists {
            field: "a..b".into()
        }
        .validate()
        .is_err());
        assert!(Predicate::Any { predicates: vec![] }.validate().is_err());
        assert!(Predicate::Always.validate().is_ok());
    }

    #[test]
    fn test_deserializes_tagged_shape() {
        let p: Predicate = serde_json::from_value(json!({
            "op": "any",
            "predicates": [
                {"op": "has_tag", "tag": "vip"},
                {"op": "equals", "field": "fields.company", "value": "Acme"}
            ]
        }))
        .unwrap();
        assert!(p.evaluate(&doc()).unwrap());
    }
}
