//! Compiled matcher over an expression set.
//!
//! Binds the multi-pattern engine to `regex::bytes::RegexSet` (linear time,
//! RE2 semantics). A `Matcher` is immutable once built; updates produce a new
//! one that is swapped in by reference.

use regex::bytes::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::expression::ExpressionSet;

/// Built-in rule used when no persisted state exists: chat-invite URLs.
pub const DEFAULT_EXPRESSION: &str =
    r"(?i)(discord\.(?:gg|io|me|li)|discord(?:app)?\.com/invite)/(\S+)";

/// Current version of the serialized matcher record.
pub const MATCHER_RECORD_VERSION: u16 = 1;

/// Options that shape compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Upper bound on compiled program size (bytes).
    pub size_limit: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            size_limit: 64 * 1024 * 1024,
        }
    }
}

/// One match callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchEvent {
    /// Index of the matching expression in canonical set order.
    pub pattern_index: usize,
}

/// Opaque compiled form of an expression set.
#[derive(Debug)]
pub struct Matcher {
    set: RegexSet,
    expressions: ExpressionSet,
    options: CompileOptions,
}

/// Serializable record of a matcher: everything needed to rebuild it, plus
/// the digest of the set it was compiled from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherRecord {
    pub version: u16,
    pub options: CompileOptions,
    pub expressions: Vec<String>,
    pub set_digest: String,
}

impl Matcher {
    /// Compiles a non-empty expression set.
    ///
    /// # Errors
    /// Returns `CompileError::Build` for an empty set, or the first expression
    /// that fails to compile when the set as a whole is rejected.
    pub fn compile(expressions: &ExpressionSet, options: CompileOptions) -> Result<Self, CompileError> {
        if expressions.is_empty() {
            return Err(CompileError::Build {
                reason: "cannot compile an empty expression set".to_string(),
            });
        }

        let patterns: Vec<&str> = expressions.iter().map(|e| e.as_str()).collect();
        let set = RegexSetBuilder::new(&patterns)
            .size_limit(options.size_limit)
            .build()
            .map_err(|e| attribute_error(&patterns, options, &e))?;

        Ok(Self {
            set,
            expressions: expressions.clone(),
            options,
        })
    }

    /// Scans `haystack`, invoking `on_match` once per matching expression.
    ///
    /// Returns the number of callback invocations. The first callback error
    /// stops the scan and is returned.
    pub fn scan<F, E>(&self, haystack: &[u8], mut on_match: F) -> Result<usize, E>
    where
        F: FnMut(MatchEvent) -> Result<(), E>,
    {
        let mut invoked = 0;
        for pattern_index in self.set.matches(haystack).iter() {
            on_match(MatchEvent { pattern_index })?;
            invoked += 1;
        }
        Ok(invoked)
    }

    /// True if any expression matches `haystack`.
    #[must_use]
    pub fn is_match(&self, haystack: &[u8]) -> bool {
        self.set.is_match(haystack)
    }

    /// The expression set this matcher was compiled from.
    #[must_use]
    pub fn expressions(&self) -> &ExpressionSet {
        &self.expressions
    }

    #[must_use]
    pub const fn options(&self) -> CompileOptions {
        self.options
    }

    /// Serializable record for persistence.
    #[must_use]
    pub fn to_record(&self) -> MatcherRecord {
        MatcherRecord {
            version: MATCHER_RECORD_VERSION,
            options: self.options,
            expressions: self.expressions.to_strings(),
            set_digest: self.expressions.digest(),
        }
    }

    /// Rebuilds a matcher from a persisted record.
    ///
    /// # Errors
    /// Rejects unknown record versions, records whose expression list does not
    /// hash to the recorded digest, and records that no longer compile.
    pub fn from_record(record: &MatcherRecord) -> Result<Self, CompileError> {
        if record.version != MATCHER_RECORD_VERSION {
            return Err(CompileError::Build {
                reason: format!(
                    "unsupported matcher record version {} (expected {})",
                    record.version, MATCHER_RECORD_VERSION
                ),
            });
        }

        let expressions = ExpressionSet::from_strs(record.expressions.iter().cloned())?;
        if expressions.digest() != record.set_digest {
            return Err(CompileError::Build {
                reason: "matcher record digest does not match its expressions".to_string(),
            });
        }

        Self::compile(&expressions, record.options)
    }
}

/// Compiles the built-in default set.
///
/// # Errors
/// Only fails if the configured size limit is too small for the default rule.
pub fn default_matcher(options: CompileOptions) -> Result<(Matcher, ExpressionSet), CompileError> {
    let expressions = ExpressionSet::from_strs([DEFAULT_EXPRESSION])?;
    let matcher = Matcher::compile(&expressions, options)?;
    Ok((matcher, expressions))
}

fn attribute_error(patterns: &[&str], options: CompileOptions, err: &regex::Error) -> CompileError {
    for pattern in patterns {
        let single: Result<Regex, _> = RegexBuilder::new(pattern)
            .size_limit(options.size_limit)
            .build();
        if let Err(e) = single {
            return CompileError::InvalidExpression {
                expression: (*pattern).to_string(),
                reason: e.to_string(),
            };
        }
    }
    CompileError::Build {
        reason: err.to_string(),
    }
}
