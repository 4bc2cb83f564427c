//! Label and field selectors

use crate::error::{HelmsmanError, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector as K8sLabelSelector;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let value = labels.and_then(|l| l.get(&self.key));
        match self.operator {
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
            Operator::Equals | Operator::In => {
                value.map(|v| self.values.contains(v)).unwrap_or(false)
            }
            Operator::NotEquals | Operator::NotIn => {
                value.map(|v| !self.values.contains(v)).unwrap_or(true)
            }
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
            Operator::Equals => write!(f, "{}={}", self.key, self.values.join("")),
            Operator::NotEquals => write!(f, "{}!={}", self.key, self.values.join("")),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
        }
    }
}

/// A conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let requirements = map
            .iter()
            .map(|(k, v)| Requirement {
                key: k.clone(),
                operator: Operator::Equals,
                values: vec![v.clone()],
            })
            .collect();
        Self { requirements }
    }

    /// Converts a workload `spec.selector`
    pub fn from_k8s(selector: &K8sLabelSelector) -> Result<Self> {
        let mut out = selector
            .match_labels
            .as_ref()
            .map(Self::from_map)
            .unwrap_or_default();

        for expr in selector.match_expressions.iter().flatten() {
            let values = expr.values.clone().unwrap_or_default();
            let operator = match expr.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => {
                    return Err(HelmsmanError::invalid(
                        format!("unknown selector operator '{}'", other),
                        "Use one of In, NotIn, Exists, DoesNotExist",
                    ))
                }
            };
            let needs_values = matches!(operator, Operator::In | Operator::NotIn);
            if needs_values == values.is_empty() {
                return Err(HelmsmanError::invalid(
                    format!("selector requirement on '{}' has wrong number of values", expr.key),
                    "In/NotIn need values, Exists/DoesNotExist must have none",
                ));
            }
            out.requirements.push(Requirement {
                key: expr.key.clone(),
                operator,
                values,
            });
        }
        Ok(out)
    }

    /// Parses the string form: `a=b,c!=d,e in (x,y),f notin (z),g,!h`
    pub fn parse(s: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for term in split_terms(s) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            requirements.push(parse_term(term)?);
        }
        Ok(Self { requirements })
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join(","))
    }
}

// Commas inside parentheses belong to a value list, not the term list
fn split_terms(s: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&s[start..]);
    terms
}

fn parse_term(term: &str) -> Result<Requirement> {
    let invalid = || {
        HelmsmanError::invalid(
            format!("cannot parse selector term '{}'", term),
            "Use key=value, key!=value, key in (a,b), key notin (a,b), key or !key",
        )
    };

    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement {
            key: key.trim().to_string(),
            operator: Operator::DoesNotExist,
            values: vec![],
        });
    }
    if let Some((key, value)) = term.split_once("!=") {
        return Ok(Requirement {
            key: key.trim().to_string(),
            operator: Operator::NotEquals,
            values: vec![value.trim().to_string()],
        });
    }
    if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Ok(Requirement {
            key: key.trim().to_string(),
            operator: Operator::Equals,
            values: vec![value.trim().to_string()],
        });
    }
    for (word, operator) in [(" notin ", Operator::NotIn), (" in ", Operator::In)] {
        if let Some((key, rest)) = term.split_once(word) {
            let list = rest
                .trim()
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(invalid)?;
            let values = list
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            return Ok(Requirement {
                key: key.trim().to_string(),
                operator,
                values,
            });
        }
    }
    if term.contains(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(Requirement {
        key: term.to_string(),
        operator: Operator::Exists,
        values: vec![],
    })
}

/// Equality constraints on well-known object fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    terms: Vec<(String, bool, String)>,
}

const SUPPORTED_FIELDS: &[&str] = &[
    "metadata.name",
    "metadata.namespace",
    "spec.nodeName",
    "status.phase",
];

impl FieldSelector {
    pub fn equals(field: &str, value: impl Into<String>) -> Self {
        Self {
            terms: vec![(field.to_string(), true, value.into())],
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut terms = Vec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (field, equal, value) = if let Some((f, v)) = term.split_once("!=") {
                (f, false, v)
            } else if let Some((f, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                (f, true, v)
            } else {
                return Err(HelmsmanError::invalid(
                    format!("cannot parse field selector term '{}'", term),
                    "Use field=value or field!=value",
                ));
            };
            let field = field.trim();
            if !SUPPORTED_FIELDS.contains(&field) {
                return Err(HelmsmanError::invalid(
                    format!("field '{}' is not supported in selectors", field),
                    format!("Supported fields: {}", SUPPORTED_FIELDS.join(", ")),
                ));
            }
            terms.push((field.to_string(), equal, value.trim().to_string()));
        }
        Ok(Self { terms })
    }

    /// Matches against the serialized object; absent fields compare as ""
    pub fn matches(&self, object: &serde_json::Value) -> bool {
        self.terms.iter().all(|(field, equal, value)| {
            let pointer = format!("/{}", field.replace('.', "/"));
            let actual = object
                .pointer(&pointer)
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            (actual == value) == *equal
        })
    }
}
