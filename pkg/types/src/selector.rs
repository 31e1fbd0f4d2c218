use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::labels::LabelSet;

/// Errors produced while building a selector from its textual or
/// structured form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty requirement in selector '{0}'")]
    EmptyRequirement(String),
    #[error("invalid label key '{0}'")]
    InvalidKey(String),
    #[error("unknown set operator '{0}' (expected 'in' or 'notin')")]
    UnknownOperator(String),
    #[error("unbalanced parentheses in '{0}'")]
    Unbalanced(String),
    #[error("operator '{operator}' on key '{key}' needs at least one value")]
    EmptyValueSet { key: String, operator: String },
    #[error("operator '{operator}' on key '{key}' does not take values")]
    UnexpectedValues { key: String, operator: String },
}

/// One match requirement of a selector term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals { key: String, value: String },
    In { key: String, values: BTreeSet<String> },
    NotIn { key: String, values: BTreeSet<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl Requirement {
    pub fn key(&self) -> &str {
        match self {
            Requirement::Equals { key, .. }
            | Requirement::In { key, .. }
            | Requirement::NotIn { key, .. }
            | Requirement::Exists { key }
            | Requirement::DoesNotExist { key } => key,
        }
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        match self {
            Requirement::Equals { key, value } => labels.get(key).is_some_and(|v| v == value),
            Requirement::In { key, values } => labels.get(key).is_some_and(|v| values.contains(v)),
            Requirement::NotIn { key, values } => {
                labels.get(key).is_none_or(|v| !values.contains(v))
            }
            Requirement::Exists { key } => labels.contains_key(key),
            Requirement::DoesNotExist { key } => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Requirement::Equals { key, value } => write!(f, "{}={}", key, value),
            Requirement::In { key, values } => write!(f, "{} in ({})", key, join(values)),
            Requirement::NotIn { key, values } => write!(f, "{} notin ({})", key, join(values)),
            Requirement::Exists { key } => write!(f, "{}", key),
            Requirement::DoesNotExist { key } => write!(f, "!{}", key),
        }
    }
}

/// A single selector term: every requirement must hold.
///
/// Deserializes from any of:
/// - the structured form `{ match_labels: {...}, match_expressions: [...] }`
/// - a plain label map `{ app: web }` (equality on every pair)
/// - the textual form `"app=web,tier in (frontend,edge)"`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SelectorRepr", into = "LabelSelector")]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn new(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    /// Equality requirements for every pair, in key order.
    pub fn from_labels<K, V, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let sorted: BTreeMap<String, String> = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            requirements: sorted
                .into_iter()
                .map(|(key, value)| Requirement::Equals { key, value })
                .collect(),
        }
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        matches(self, labels)
    }
}

/// Evaluate one selector term against a label set. An empty term matches
/// every label set.
pub fn matches(selector: &Selector, labels: &LabelSet) -> bool {
    selector.requirements.iter().all(|r| r.matches(labels))
}

/// Evaluate OR-ed selector terms. Zero terms match nothing.
pub fn matches_any(terms: &[Selector], labels: &LabelSet) -> bool {
    terms.iter().any(|t| matches(t, labels))
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    /// Parse the `kubectl -l` selector syntax.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.trim().is_empty() {
            return Ok(Selector::default());
        }
        let requirements = split_top_level(input)?
            .into_iter()
            .map(|fragment| parse_requirement(fragment, input))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Selector { requirements })
    }
}

/// Split on commas that are not inside a parenthesized value list.
fn split_top_level(input: &str) -> Result<Vec<&str>, SelectorError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SelectorError::Unbalanced(input.to_string()))?;
            }
            ',' if depth == 0 => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced(input.to_string()));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn parse_requirement(fragment: &str, whole: &str) -> Result<Requirement, SelectorError> {
    let fragment = fragment.trim();
    if fragment.is_empty() {
        return Err(SelectorError::EmptyRequirement(whole.to_string()));
    }

    if let Some(open) = fragment.find('(') {
        let Some(inner) = fragment[open + 1..].strip_suffix(')') else {
            return Err(SelectorError::Unbalanced(fragment.to_string()));
        };
        let mut head = fragment[..open].split_whitespace();
        let (Some(key), Some(op), None) = (head.next(), head.next(), head.next()) else {
            return Err(SelectorError::UnknownOperator(fragment.to_string()));
        };
        let key = checked_key(key)?;
        let values: BTreeSet<String> = inner
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        if values.is_empty() {
            return Err(SelectorError::EmptyValueSet {
                key,
                operator: op.to_string(),
            });
        }
        return match op {
            "in" => Ok(Requirement::In { key, values }),
            "notin" => Ok(Requirement::NotIn { key, values }),
            other => Err(SelectorError::UnknownOperator(other.to_string())),
        };
    }

    if let Some(key) = fragment.strip_prefix('!') {
        return Ok(Requirement::DoesNotExist {
            key: checked_key(key)?,
        });
    }
    if let Some((key, value)) = fragment.split_once("!=") {
        return Ok(Requirement::NotIn {
            key: checked_key(key)?,
            values: BTreeSet::from([value.trim().to_string()]),
        });
    }
    if let Some((key, value)) = fragment
        .split_once("==")
        .or_else(|| fragment.split_once('='))
    {
        return Ok(Requirement::Equals {
            key: checked_key(key)?,
            value: value.trim().to_string(),
        });
    }
    Ok(Requirement::Exists {
        key: checked_key(fragment)?,
    })
}

fn checked_key(key: &str) -> Result<String, SelectorError> {
    let key = key.trim();
    if key.is_empty() || key.chars().any(|c| c.is_whitespace() || "=!(),".contains(c)) {
        return Err(SelectorError::InvalidKey(key.to_string()));
    }
    Ok(key.to_string())
}

// --- Serialized forms ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl fmt::Display for SelectorOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorOperator::In => write!(f, "In"),
            SelectorOperator::NotIn => write!(f, "NotIn"),
            SelectorOperator::Exists => write!(f, "Exists"),
            SelectorOperator::DoesNotExist => write!(f, "DoesNotExist"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Kubernetes-shaped selector: equality map plus set-based expressions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LabelSelector {
    #[serde(
        default,
        alias = "matchLabels",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub match_labels: BTreeMap<String, String>,
    #[serde(
        default,
        alias = "matchExpressions",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl TryFrom<LabelSelector> for Selector {
    type Error = SelectorError;

    fn try_from(ls: LabelSelector) -> Result<Self, Self::Error> {
        let mut requirements: Vec<Requirement> = ls
            .match_labels
            .into_iter()
            .map(|(key, value)| Requirement::Equals { key, value })
            .collect();
        for expr in ls.match_expressions {
            let key = checked_key(&expr.key)?;
            let values: BTreeSet<String> = expr.values.into_iter().collect();
            let operator = expr.operator.to_string();
            let req = match expr.operator {
                SelectorOperator::In | SelectorOperator::NotIn if values.is_empty() => {
                    return Err(SelectorError::EmptyValueSet { key, operator });
                }
                SelectorOperator::Exists | SelectorOperator::DoesNotExist
                    if !values.is_empty() =>
                {
                    return Err(SelectorError::UnexpectedValues { key, operator });
                }
                SelectorOperator::In => Requirement::In { key, values },
                SelectorOperator::NotIn => Requirement::NotIn { key, values },
                SelectorOperator::Exists => Requirement::Exists { key },
                SelectorOperator::DoesNotExist => Requirement::DoesNotExist { key },
            };
            requirements.push(req);
        }
        Ok(Selector { requirements })
    }
}

impl From<Selector> for LabelSelector {
    fn from(selector: Selector) -> Self {
        let mut ls = LabelSelector::default();
        for req in selector.requirements {
            let (key, operator, values) = match req {
                Requirement::Equals { key, value } => {
                    if ls.match_labels.contains_key(&key) {
                        (key, SelectorOperator::In, vec![value])
                    } else {
                        ls.match_labels.insert(key, value);
                        continue;
                    }
                }
                Requirement::In { key, values } => {
                    (key, SelectorOperator::In, values.into_iter().collect())
                }
                Requirement::NotIn { key, values } => {
                    (key, SelectorOperator::NotIn, values.into_iter().collect())
                }
                Requirement::Exists { key } => (key, SelectorOperator::Exists, vec![]),
                Requirement::DoesNotExist { key } => {
                    (key, SelectorOperator::DoesNotExist, vec![])
                }
            };
            ls.match_expressions.push(LabelSelectorRequirement {
                key,
                operator,
                values,
            });
        }
        ls
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SelectorRepr {
    Text(String),
    Structured(LabelSelector),
    Labels(BTreeMap<String, String>),
}

impl TryFrom<SelectorRepr> for Selector {
    type Error = SelectorError;

    fn try_from(repr: SelectorRepr) -> Result<Self, Self::Error> {
        match repr {
            SelectorRepr::Text(s) => s.parse(),
            SelectorRepr::Structured(ls) => Selector::try_from(ls),
            SelectorRepr::Labels(labels) => Ok(Selector::from_labels(labels)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector(s: &str) -> Selector {
        s.parse().unwrap()
    }

    #[test]
    fn equality_requires_exact_value() {
        let sel = selector("app=web");
        assert!(sel.matches(&labels(&[("app", "web")])));
        assert!(!sel.matches(&labels(&[("app", "Web")])));
        assert!(!sel.matches(&labels(&[("tier", "web")])));
    }

    #[test]
    fn set_requirements_and_missing_keys() {
        let in_sel = selector("tier in (frontend,edge)");
        let notin_sel = selector("tier notin (frontend,edge)");
        let none = labels(&[("app", "web")]);
        let backend = labels(&[("tier", "backend")]);
        let edge = labels(&[("tier", "edge")]);

        assert!(!in_sel.matches(&none));
        assert!(notin_sel.matches(&none));
        assert!(in_sel.matches(&edge));
        assert!(!notin_sel.matches(&edge));
        assert!(!in_sel.matches(&backend));
        assert!(notin_sel.matches(&backend));
    }

    #[test]
    fn existence_ignores_value() {
        let exists = selector("canary");
        let absent = selector("!canary");
        let with = labels(&[("canary", "")]);
        let without = labels(&[("app", "web")]);
        assert!(exists.matches(&with));
        assert!(!exists.matches(&without));
        assert!(!absent.matches(&with));
        assert!(absent.matches(&without));
    }

    #[test]
    fn requirements_are_anded() {
        let sel = selector("app=web, tier in (frontend,edge)");
        assert!(sel.matches(&labels(&[("app", "web"), ("tier", "frontend")])));
        assert!(!sel.matches(&labels(&[("app", "web"), ("tier", "backend")])));
        assert!(!sel.matches(&labels(&[("tier", "edge")])));
    }

    #[test]
    fn matches_is_deterministic() {
        let sel = selector("app=web,tier notin (backend),!legacy");
        let l = labels(&[("app", "web"), ("tier", "edge")]);
        let first = matches(&sel, &l);
        for _ in 0..100 {
            assert_eq!(matches(&sel, &l), first);
        }
        assert!(first);
    }

    #[test]
    fn empty_term_matches_everything_and_no_terms_match_nothing() {
        let l = labels(&[("app", "web")]);
        assert!(Selector::default().matches(&l));
        assert!(!matches_any(&[], &l));
    }

    #[test]
    fn matches_any_ors_terms() {
        let terms = vec![selector("role=db"), selector("app=web,tier=edge")];
        assert!(matches_any(&terms, &labels(&[("role", "db")])));
        assert!(matches_any(&terms, &labels(&[("app", "web"), ("tier", "edge")])));
        assert!(!matches_any(&terms, &labels(&[("app", "web")])));
    }

    #[test]
    fn parses_inequality_as_notin() {
        let sel = selector("env!=prod");
        assert_eq!(
            sel.requirements(),
            &[Requirement::NotIn {
                key: "env".to_string(),
                values: BTreeSet::from(["prod".to_string()]),
            }]
        );
        assert!(sel.matches(&labels(&[])));
    }

    #[test]
    fn rejects_malformed_selectors() {
        assert!(matches!(
            "app=web,".parse::<Selector>(),
            Err(SelectorError::EmptyRequirement(_))
        ));
        assert!(matches!(
            "tier in (a,b".parse::<Selector>(),
            Err(SelectorError::Unbalanced(_))
        ));
        assert!(matches!(
            "tier among (a)".parse::<Selector>(),
            Err(SelectorError::UnknownOperator(_))
        ));
        assert!(matches!(
            "tier in ()".parse::<Selector>(),
            Err(SelectorError::EmptyValueSet { .. })
        ));
    }

    #[test]
    fn display_parses_back() {
        let sel = selector("app=web,tier in (edge,frontend),!legacy,canary");
        assert_eq!(sel.to_string(), "app=web,tier in (edge,frontend),!legacy,canary");
        assert_eq!(selector(&sel.to_string()), sel);
    }

    #[test]
    fn deserializes_all_forms() {
        let text: Selector = serde_yaml::from_str("\"app=web,tier in (frontend,edge)\"").unwrap();
        let map: Selector = serde_yaml::from_str("app: web").unwrap();
        let structured: Selector = serde_yaml::from_str(
            "matchLabels:\n  app: web\nmatchExpressions:\n  - key: tier\n    operator: In\n    values: [frontend, edge]\n",
        )
        .unwrap();

        assert_eq!(text, structured);
        assert_eq!(map, selector("app=web"));
    }

    #[test]
    fn structured_form_validates_values() {
        let res: Result<Selector, _> =
            serde_yaml::from_str("match_expressions:\n  - key: tier\n    operator: In\n");
        assert!(res.is_err());
        let res: Result<Selector, _> = serde_yaml::from_str(
            "match_expressions:\n  - key: tier\n    operator: Exists\n    values: [a]\n",
        );
        assert!(res.is_err());
    }

    #[test]
    fn serializes_to_label_selector() {
        let sel = selector("app=web,app=api,tier notin (backend)");
        let ls = LabelSelector::from(sel.clone());
        assert_eq!(ls.match_labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(ls.match_expressions.len(), 2);
        let json = serde_json::to_string(&sel).unwrap();
        let back: Selector = serde_json::from_str(&json).unwrap();
        assert_eq!(back.requirements().len(), 3);
        // app=web AND app in (api) can never hold
        assert!(!back.matches(&labels(&[("app", "web")])));
        assert!(!back.matches(&labels(&[("app", "api")])));
    }
}
