//! URL rewrite rules applied before a request is sent to a backend service.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// A single rewrite: a regular expression over the whole path and query, and a
/// replacement that may refer to capture groups as `$1`, `$2`, ...
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteRule {
    /// Pattern matched against the full path and query.
    pub url_pattern: String,
    /// Replacement text.
    pub replacement: String,
}

impl RewriteRule {
    /// Create a rewrite rule.
    pub fn new(url_pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            url_pattern: url_pattern.into(),
            replacement: replacement.into(),
        }
    }

    fn compile(&self) -> Result<Regex> {
        Regex::new(&format!("^(?:{})$", self.url_pattern)).map_err(|e| {
            ProxyError::MalformedBackendService(format!(
                "invalid rewrite pattern '{}': {}",
                self.url_pattern, e
            ))
        })
    }
}

/// Compiled, ordered set of rewrite rules. The first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct RewriteRuleset {
    rules: Vec<(Regex, String)>,
}

impl RewriteRuleset {
    /// Compile the given rules.
    pub fn new(rules: &[RewriteRule]) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|rule| Ok((rule.compile()?, rule.replacement.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Returns the rewritten path and query, or `None` when no rule matches.
    pub fn rewrite(&self, path_and_query: &str) -> Option<String> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(path_and_query))
            .map(|(pattern, replacement)| {
                pattern
                    .replace(path_and_query, replacement.as_str())
                    .into_owned()
            })
    }

    /// Whether the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Checks that every pattern compiles.
pub(crate) fn validate(rules: &[RewriteRule]) -> Result<()> {
    rules.iter().try_for_each(|rule| rule.compile().map(|_| ()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_using_capture_groups() {
        let rules = RewriteRuleset::new(&[RewriteRule::new("/foo/(.*)", "/bar/$1")]).unwrap();

        assert_eq!(rules.rewrite("/foo/a/b?x=1").as_deref(), Some("/bar/a/b?x=1"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = RewriteRuleset::new(&[
            RewriteRule::new("/foo/(.*)", "/first/$1"),
            RewriteRule::new("/foo/bar", "/second"),
        ])
        .unwrap();

        assert_eq!(rules.rewrite("/foo/bar").as_deref(), Some("/first/bar"));
    }

    #[test]
    fn patterns_match_whole_url() {
        let rules = RewriteRuleset::new(&[RewriteRule::new("/foo", "/bar")]).unwrap();

        assert_eq!(rules.rewrite("/foo/x"), None);
        assert_eq!(rules.rewrite("/foo").as_deref(), Some("/bar"));
    }

    #[test]
    fn invalid_pattern_is_a_malformed_declaration() {
        let err = RewriteRuleset::new(&[RewriteRule::new("(", "/x")]).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedBackendService(_)));
    }
}
