//! Expression and expression-set types.
//!
//! An expression is a single pattern rule in the matching engine's syntax.
//! Identity is the exact string value; nothing is normalized.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CompileError;

/// A single pattern rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression(String);

impl Expression {
    /// Creates an expression, rejecting values that cannot live in the active set.
    ///
    /// The empty string is never a valid member, and line breaks are refused
    /// because the persisted set is newline-delimited.
    pub fn new(value: impl Into<String>) -> Result<Self, CompileError> {
        let value = value.into();
        if value.is_empty() {
            return Err(CompileError::InvalidExpression {
                expression: value,
                reason: "expression cannot be empty".to_string(),
            });
        }
        if value.contains(['\n', '\r']) {
            return Err(CompileError::InvalidExpression {
                expression: value,
                reason: "expression cannot contain line breaks".to_string(),
            });
        }
        Ok(Self(value))
    }

    /// The raw pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Expression {
    type Error = CompileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Expression> for String {
    fn from(value: Expression) -> Self {
        value.0
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The full collection of active rules.
///
/// Backed by an ordered set so the text written to disk is deterministic;
/// the order itself carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpressionSet(BTreeSet<Expression>);

impl ExpressionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from raw strings, validating each one.
    pub fn from_strs<I, S>(values: I) -> Result<Self, CompileError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        values
            .into_iter()
            .map(Expression::new)
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    /// Parses the newline-delimited on-disk form. Blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self, CompileError> {
        Self::from_strs(text.lines().filter(|line| !line.is_empty()))
    }

    /// Renders the newline-delimited on-disk form.
    #[must_use]
    pub fn to_text(&self) -> String {
        self.0
            .iter()
            .map(Expression::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Stable digest of the canonical text, used to pair a matcher blob with its set.
    #[must_use]
    pub fn digest(&self) -> String {
        blake3::hash(self.to_text().as_bytes()).to_hex().to_string()
    }

    /// Computes `(self ∪ add) − remove` without touching `self`.
    #[must_use]
    pub fn apply(&self, add: &Self, remove: &Self) -> Self {
        Self(
            self.0
                .union(&add.0)
                .filter(|e| !remove.0.contains(*e))
                .cloned()
                .collect(),
        )
    }

    /// Adds one expression. Returns false if it was already present.
    pub fn insert(&mut self, expression: Expression) -> bool {
        self.0.insert(expression)
    }

    #[must_use]
    pub fn contains(&self, expression: &Expression) -> bool {
        self.0.contains(expression)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates in canonical (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = &Expression> {
        self.0.iter()
    }

    /// Owned pattern strings in canonical order.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(|e| e.0.clone()).collect()
    }
}

impl FromIterator<Expression> for ExpressionSet {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ExpressionSet {
    type Item = &'a Expression;
    type IntoIter = std::collections::btree_set::Iter<'a, Expression>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
