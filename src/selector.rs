//! # Label Selectors
//!
//! Parses a `PodSelector` from the resource spec into a validated selector
//! that can be rendered for the API server and matched against pod labels
//! locally (by the watch adapter and the in-memory store).

use crate::crd::{PodSelector, SelectorRequirement};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Reasons a selector cannot be used
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("selector requirement on {key:?} has unknown operator {operator:?}")]
    UnknownOperator { key: String, operator: String },
    #[error("selector requirement on {key:?} with operator {operator} needs at least one value")]
    MissingValues { key: String, operator: &'static str },
    #[error("selector requirement on {key:?} with operator {operator} must not list values")]
    UnexpectedValues { key: String, operator: &'static str },
    #[error("selector key must not be empty")]
    EmptyKey,
    #[error("selector matches every pod in the namespace; at least one label is required")]
    SelectsAll,
}

/// A single selector expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Equal(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Expression {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::In(key, values) => labels.get(key).is_some_and(|v| values.contains(v)),
            Expression::NotIn(key, values) => labels.get(key).is_none_or(|v| !values.contains(v)),
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match self {
            Expression::Equal(key, value) => write!(f, "{key}={value}"),
            Expression::In(key, values) => write!(f, "{key} in ({})", join(values)),
            Expression::NotIn(key, values) => write!(f, "{key} notin ({})", join(values)),
            Expression::Exists(key) => write!(f, "{key}"),
            Expression::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

/// Validated label selector; every expression must match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(Vec<Expression>);

impl Selector {
    /// Parse and validate a selector from the resource spec
    ///
    /// An empty selector is rejected: refreshing every pod in a namespace is
    /// never what a certificate consumer selector means.
    pub fn parse(selector: &PodSelector) -> Result<Self, SelectorError> {
        let mut expressions = Vec::new();

        for (key, value) in selector.match_labels.iter().flatten() {
            if key.is_empty() {
                return Err(SelectorError::EmptyKey);
            }
            expressions.push(Expression::Equal(key.clone(), value.clone()));
        }

        for requirement in selector.match_expressions.iter().flatten() {
            expressions.push(parse_requirement(requirement)?);
        }

        if expressions.is_empty() {
            return Err(SelectorError::SelectsAll);
        }
        Ok(Self(expressions))
    }

    /// Selector built from plain `key=value` pairs
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            labels
                .into_iter()
                .map(|(k, v)| Expression::Equal(k.into(), v.into()))
                .collect(),
        )
    }

    /// Whether the given labels satisfy every expression
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0.iter().all(|e| e.matches(labels))
    }

    /// Whether the optional label map of an object satisfies the selector
    #[must_use]
    pub fn matches_opt(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        match labels {
            Some(labels) => self.matches(labels),
            None => self.matches(&BTreeMap::new()),
        }
    }

    /// Selector string in the API server's `labelSelector` syntax
    #[must_use]
    pub fn to_selector_string(&self) -> String {
        self.0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn parse_requirement(requirement: &SelectorRequirement) -> Result<Expression, SelectorError> {
    let key = requirement.key.clone();
    if key.is_empty() {
        return Err(SelectorError::EmptyKey);
    }
    let values: BTreeSet<String> = requirement.values.iter().flatten().cloned().collect();

    match requirement.operator.as_str() {
        "In" | "NotIn" => {
            let operator = if requirement.operator == "In" { "In" } else { "NotIn" };
            if values.is_empty() {
                return Err(SelectorError::MissingValues { key, operator });
            }
            Ok(if operator == "In" {
                Expression::In(key, values)
            } else {
                Expression::NotIn(key, values)
            })
        }
        "Exists" | "DoesNotExist" => {
            let operator = if requirement.operator == "Exists" { "Exists" } else { "DoesNotExist" };
            if !values.is_empty() {
                return Err(SelectorError::UnexpectedValues { key, operator });
            }
            Ok(if operator == "Exists" {
                Expression::Exists(key)
            } else {
                Expression::DoesNotExist(key)
            })
        }
        other => Err(SelectorError::UnknownOperator {
            key,
            operator: other.to_string(),
        }),
    }
}
