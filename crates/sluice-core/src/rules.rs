//! Capture rules.
//!
//! The proxy only ever asks one question of the rule layer: does this
//! `(host, uri, user_agent)` match? The answer is combined with the task's
//! [`DefaultStrategy`] to decide whether an exchange is ignored.
//!
//! ## Host patterns
//!
//! - `example.com` matches exactly
//! - `*.example.com` matches `example.com` and one subdomain level
//! - `**.example.com` matches `example.com` and any subdomain depth

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Boolean predicate consulted for every exchange.
pub trait RulePredicate: Send + Sync {
    /// Returns true if the rule set matches this exchange.
    fn matches(&self, host: &str, uri: &str, user_agent: &str) -> bool;
}

impl<F> RulePredicate for F
where
    F: Fn(&str, &str, &str) -> bool + Send + Sync,
{
    fn matches(&self, host: &str, uri: &str, user_agent: &str) -> bool {
        self(host, uri, user_agent)
    }
}

/// What a rule match means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultStrategy {
    /// Capture everything; matching exchanges are passed through untouched.
    #[default]
    Direct,
    /// Pass everything through; only matching exchanges are captured.
    Copy,
}

impl DefaultStrategy {
    /// Returns a human-readable name for this strategy.
    pub fn name(&self) -> &'static str {
        match self {
            DefaultStrategy::Direct => "direct",
            DefaultStrategy::Copy => "copy",
        }
    }

    /// Turns a predicate result into the session's `ignore` flag.
    pub fn resolve_ignore(self, matched: bool) -> bool {
        matched ^ (self == DefaultStrategy::Copy)
    }

    /// Evaluates `predicate` and resolves the `ignore` flag in one step.
    pub fn ignore(
        self,
        predicate: &dyn RulePredicate,
        host: &str,
        uri: &str,
        user_agent: &str,
    ) -> bool {
        self.resolve_ignore(predicate.matches(host, uri, user_agent))
    }
}

impl fmt::Display for DefaultStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DefaultStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(DefaultStrategy::Direct),
            "copy" => Ok(DefaultStrategy::Copy),
            other => Err(CoreError::Config(format!("unknown strategy {other:?}"))),
        }
    }
}

/// A single host rule with optional path and user-agent constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRule {
    /// Host pattern, see module docs.
    pub pattern: String,
    /// Request path prefix; `None` matches any path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    /// Case-insensitive user-agent substring; `None` matches any client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Disabled rules never match.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl HostRule {
    /// Creates an enabled rule for a host pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into().to_ascii_lowercase(),
            path_prefix: None,
            user_agent: None,
            enabled: true,
        }
    }

    /// Restricts the rule to paths starting with `prefix`.
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    /// Restricts the rule to clients whose user agent contains `needle`.
    pub fn with_user_agent(mut self, needle: impl Into<String>) -> Self {
        self.user_agent = Some(needle.into().to_ascii_lowercase());
        self
    }

    /// Sets whether the rule is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn base_domain(&self) -> &str {
        self.pattern
            .strip_prefix("**.")
            .or_else(|| self.pattern.strip_prefix("*."))
            .unwrap_or(&self.pattern)
    }

    /// Checks if a host (optionally with `:port`) matches the host pattern.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = strip_port(host).to_ascii_lowercase();
        let base = self.base_domain();

        if self.pattern == "*" || self.pattern == "**" {
            return true;
        }

        if self.pattern.starts_with("**.") {
            host == base || host.ends_with(&format!(".{base}"))
        } else if self.pattern.starts_with("*.") {
            if host == base {
                return true;
            }
            host.strip_suffix(&format!(".{base}"))
                .is_some_and(|prefix| !prefix.contains('.'))
        } else {
            host == self.pattern
        }
    }

    fn matches_uri(&self, uri: &str) -> bool {
        let Some(prefix) = &self.path_prefix else {
            return true;
        };
        // CONNECT has no path yet; defer to the inner request.
        if uri.is_empty() {
            return false;
        }
        let path = match uri.split_once("://") {
            Some((_, rest)) => rest.find('/').map_or("/", |idx| &rest[idx..]),
            None => uri,
        };
        path.starts_with(prefix.as_str())
    }

    fn matches_user_agent(&self, user_agent: &str) -> bool {
        match &self.user_agent {
            Some(needle) => user_agent.to_ascii_lowercase().contains(needle.as_str()),
            None => true,
        }
    }
}

impl RulePredicate for HostRule {
    fn matches(&self, host: &str, uri: &str, user_agent: &str) -> bool {
        self.enabled
            && self.matches_host(host)
            && self.matches_uri(uri)
            && self.matches_user_agent(user_agent)
    }
}

impl FromStr for HostRule {
    type Err = CoreError;

    /// Parses `pattern[/path-prefix]`, the form accepted on the command line.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::Config("empty rule".into()));
        }
        match s.find('/') {
            Some(0) => Err(CoreError::Config(format!("rule {s:?} has no host pattern"))),
            Some(idx) => Ok(HostRule::new(&s[..idx]).with_path_prefix(&s[idx..])),
            None => Ok(HostRule::new(s)),
        }
    }
}

/// An ordered list of host rules; matches when any enabled rule matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostRuleSet {
    rules: Vec<HostRule>,
}

impl HostRuleSet {
    /// Creates an empty rule set, which matches nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule.
    pub fn push(&mut self, rule: HostRule) {
        self.rules.push(rule);
    }

    /// Returns the rules in order.
    pub fn rules(&self) -> &[HostRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

impl FromIterator<HostRule> for HostRuleSet {
    fn from_iter<I: IntoIterator<Item = HostRule>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

impl RulePredicate for HostRuleSet {
    fn matches(&self, host: &str, uri: &str, user_agent: &str) -> bool {
        self.rules.iter().any(|r| r.matches(host, uri, user_agent))
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((h, port)) if !h.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => h,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Strategy Tests ====================

    #[test]
    fn direct_match_is_ignored() {
        assert!(DefaultStrategy::Direct.resolve_ignore(true));
        assert!(!DefaultStrategy::Direct.resolve_ignore(false));
    }

    #[test]
    fn copy_inverts_match() {
        assert!(!DefaultStrategy::Copy.resolve_ignore(true));
        assert!(DefaultStrategy::Copy.resolve_ignore(false));
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Copy".parse::<DefaultStrategy>().unwrap(), DefaultStrategy::Copy);
        assert_eq!(" direct ".parse::<DefaultStrategy>().unwrap(), DefaultStrategy::Direct);
        assert!("mirror".parse::<DefaultStrategy>().is_err());
    }

    #[test]
    fn closure_is_a_predicate() {
        let pred = |host: &str, _uri: &str, _ua: &str| host == "example.com";
        assert!(DefaultStrategy::Direct.ignore(&pred, "example.com", "/", ""));
        assert!(!DefaultStrategy::Copy.ignore(&pred, "example.com", "/", ""));
        assert!(DefaultStrategy::Copy.ignore(&pred, "other.com", "/", ""));
    }

    // ==================== Host Pattern Tests ====================

    #[test]
    fn exact_pattern() {
        let rule = HostRule::new("api.example.com");
        assert!(rule.matches_host("api.example.com"));
        assert!(rule.matches_host("API.example.com:443"));
        assert!(!rule.matches_host("example.com"));
        assert!(!rule.matches_host("x.api.example.com"));
    }

    #[test]
    fn single_wildcard_matches_one_level() {
        let rule = HostRule::new("*.example.com");
        assert!(rule.matches_host("example.com"));
        assert!(rule.matches_host("www.example.com"));
        assert!(!rule.matches_host("a.b.example.com"));
        assert!(!rule.matches_host("badexample.com"));
    }

    #[test]
    fn double_wildcard_matches_any_depth() {
        let rule = HostRule::new("**.example.com");
        assert!(rule.matches_host("example.com"));
        assert!(rule.matches_host("a.b.c.example.com"));
        assert!(!rule.matches_host("example.org"));
    }

    #[test]
    fn ipv6_host_port_is_stripped() {
        let rule = HostRule::new("::1");
        assert!(rule.matches_host("[::1]:8443"));
        assert!(rule.matches_host("::1"));
    }

    // ==================== Constraint Tests ====================

    #[test]
    fn path_prefix_constraint() {
        let rule = HostRule::new("example.com").with_path_prefix("/api");
        assert!(rule.matches("example.com", "/api/v1", ""));
        assert!(rule.matches("example.com", "https://example.com/api/v1", ""));
        assert!(!rule.matches("example.com", "/static/app.js", ""));
        assert!(!rule.matches("example.com", "", ""));
    }

    #[test]
    fn user_agent_constraint() {
        let rule = HostRule::new("**.example.com").with_user_agent("Curl");
        assert!(rule.matches("www.example.com", "/", "curl/8.4.0"));
        assert!(!rule.matches("www.example.com", "/", "Mozilla/5.0"));
    }

    #[test]
    fn disabled_rule_never_matches() {
        let rule = HostRule::new("example.com").with_enabled(false);
        assert!(!rule.matches("example.com", "/", ""));
    }

    #[test]
    fn rule_from_cli_form() {
        let rule: HostRule = "*.Example.com/login".parse().unwrap();
        assert_eq!(rule.pattern, "*.example.com");
        assert_eq!(rule.path_prefix.as_deref(), Some("/login"));
        assert!("/nohost".parse::<HostRule>().is_err());
        assert!("".parse::<HostRule>().is_err());
    }

    // ==================== Rule Set Tests ====================

    #[test]
    fn empty_set_matches_nothing() {
        let set = HostRuleSet::new();
        assert!(!set.matches("example.com", "/", ""));
        assert!(DefaultStrategy::Copy.ignore(&set, "example.com", "/", ""));
    }

    #[test]
    fn set_matches_any_rule() {
        let set: HostRuleSet = [HostRule::new("a.test"), HostRule::new("*.b.test")]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
        assert!(set.matches("a.test", "/", ""));
        assert!(set.matches("x.b.test", "/", ""));
        assert!(!set.matches("c.test", "/", ""));
    }

    #[test]
    fn set_serializes_as_list() {
        let set: HostRuleSet = [HostRule::new("a.test")].into_iter().collect();
        let json = serde_json::to_string(&set).unwrap();
        assert!(json.starts_with('['));
        let back: HostRuleSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
