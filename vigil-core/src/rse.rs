//! Storage element descriptors and the `--rses` selection expression.
//!
//! The expression is a conjunction of attribute terms, parsed once at
//! configuration time into a typed predicate; nothing is re-parsed per item.
//! Grammar: terms joined by `&`, each `attr=value`, `attr!=value`, or a bare
//! RSE name (shorthand for `rse=<name>`). `*` selects every RSE.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VigilError};
use crate::types::RseId;

/// Catalog-side view of one storage element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RseInfo {
    pub id: RseId,
    pub name: String,
    /// Free-form attributes (`tier`, `site`, `disk`, ...) selection
    /// expressions match against. The RSE name is always matchable under the
    /// reserved attribute `rse`.
    pub attributes: HashMap<String, String>,
}

impl RseInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: RseId::new(),
            name: name.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    fn attribute(&self, key: &str) -> Option<&str> {
        if key == "rse" {
            Some(self.name.as_str())
        } else {
            self.attributes.get(key).map(String::as_str)
        }
    }
}

/// One parsed term of a selection expression.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterTerm {
    attribute: String,
    value: String,
    negated: bool,
}

impl FilterTerm {
    fn matches(&self, rse: &RseInfo) -> bool {
        let equal = rse.attribute(&self.attribute) == Some(self.value.as_str());
        equal != self.negated
    }
}

/// Typed predicate over RSE attributes: the conjunction of all terms.
///
/// An empty filter (no expression, or `*`) matches every RSE.
#[derive(Debug, Clone, Default)]
pub struct RseFilter {
    terms: Vec<FilterTerm>,
}

impl RseFilter {
    /// Filter that selects all RSEs.
    pub fn all() -> Self {
        Self::default()
    }

    /// Parse a selection expression. Fails fast on syntax errors so a typo'd
    /// expression is caught at startup, not mid-cycle.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        if expression.is_empty() || expression == "*" {
            return Ok(Self::all());
        }

        let mut terms = Vec::new();
        for raw in expression.split('&') {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(invalid(expression, "empty term"));
            }

            let term = if let Some((attr, value)) = raw.split_once("!=") {
                FilterTerm {
                    attribute: attr.trim().to_string(),
                    value: value.trim().to_string(),
                    negated: true,
                }
            } else if let Some((attr, value)) = raw.split_once('=') {
                FilterTerm {
                    attribute: attr.trim().to_string(),
                    value: value.trim().to_string(),
                    negated: false,
                }
            } else {
                // Bare word selects by RSE name.
                FilterTerm {
                    attribute: "rse".to_string(),
                    value: raw.to_string(),
                    negated: false,
                }
            };

            if term.attribute.is_empty() {
                return Err(invalid(expression, "missing attribute name"));
            }
            if term.value.is_empty() {
                return Err(invalid(expression, "missing attribute value"));
            }
            if !is_word(&term.attribute) || !is_word(&term.value) {
                return Err(invalid(
                    expression,
                    "terms must be alphanumeric (plus '_', '-', '.')",
                ));
            }
            terms.push(term);
        }

        Ok(Self { terms })
    }

    pub fn matches(&self, rse: &RseInfo) -> bool {
        self.terms.iter().all(|term| term.matches(rse))
    }

    /// Apply the filter to a catalog listing, preserving its order.
    pub fn select<'a>(&self, rses: &'a [RseInfo]) -> Vec<&'a RseInfo> {
        rses.iter().filter(|rse| self.matches(rse)).collect()
    }

    pub fn is_match_all(&self) -> bool {
        self.terms.is_empty()
    }
}

fn invalid(expression: &str, detail: &str) -> VigilError {
    VigilError::Expression {
        expression: expression.to_string(),
        detail: detail.to_string(),
    }
}

fn is_word(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
