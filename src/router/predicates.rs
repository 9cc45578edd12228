// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Predicate implementations for route matching.
//!
//! Predicates are pure functions of the inbound request: no IO, no await,
//! no mutation.

use std::collections::HashMap;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Predicate;
use crate::core::{HttpMethod, InboundRequest, ProxyError};

/// Configuration for a path predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathPredicateConfig {
    /// The path pattern to match
    pub pattern: String,
}

/// A predicate that matches on request path.
///
/// `:name` matches exactly one segment, `*` matches the remainder
/// (including nothing).
#[derive(Debug)]
pub struct PathPredicate {
    config: PathPredicateConfig,
    regex: Regex,
    literal_segments: usize,
}

impl PathPredicate {
    /// Create a new path predicate with the given configuration.
    pub fn new(config: PathPredicateConfig) -> Result<Self, ProxyError> {
        if !config.pattern.starts_with('/') {
            return Err(ProxyError::Configuration(format!(
                "path pattern '{}' must start with '/'",
                config.pattern
            )));
        }

        let regex_pattern = Self::pattern_to_regex(&config.pattern);
        let regex = Regex::new(&regex_pattern).map_err(|e| {
            ProxyError::Configuration(format!(
                "invalid path pattern '{}': {}",
                config.pattern, e
            ))
        })?;
        let literal_segments = Self::count_literal_segments(&config.pattern);

        Ok(Self {
            config,
            regex,
            literal_segments,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.config.pattern
    }

    /// Convert a path pattern to a regex pattern.
    fn pattern_to_regex(pattern: &str) -> String {
        let mut regex_pattern = String::from("^");

        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                ':' => {
                    // swallow the parameter name
                    while chars
                        .peek()
                        .is_some_and(|next| next.is_alphanumeric() || *next == '_')
                    {
                        chars.next();
                    }
                    regex_pattern.push_str("([^/]+)");
                }
                '*' => regex_pattern.push_str("(.*)"),
                '.' | '^' | '$' | '|' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '\\' => {
                    regex_pattern.push('\\');
                    regex_pattern.push(c);
                }
                _ => regex_pattern.push(c),
            }
        }

        regex_pattern.push('$');
        regex_pattern
    }

    fn count_literal_segments(pattern: &str) -> usize {
        pattern
            .split('/')
            .filter(|segment| !segment.is_empty())
            .filter(|segment| !segment.contains(':') && !segment.contains('*'))
            .count()
    }
}

impl Predicate for PathPredicate {
    fn matches(&self, request: &InboundRequest) -> bool {
        self.regex.is_match(&request.path)
    }

    fn predicate_type(&self) -> &str {
        "path"
    }

    fn specificity(&self) -> usize {
        self.literal_segments
    }
}

/// Configuration for a method predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodPredicateConfig {
    /// The HTTP methods to match
    pub methods: Vec<HttpMethod>,
}

/// A predicate that matches on HTTP method.
#[derive(Debug)]
pub struct MethodPredicate {
    config: MethodPredicateConfig,
}

impl MethodPredicate {
    pub fn new(config: MethodPredicateConfig) -> Self {
        Self { config }
    }
}

impl Predicate for MethodPredicate {
    fn matches(&self, request: &InboundRequest) -> bool {
        self.config.methods.contains(&request.method)
    }

    fn predicate_type(&self) -> &str {
        "method"
    }
}

/// Configuration for a header predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderPredicateConfig {
    /// The headers to match (name and value)
    pub headers: HashMap<String, String>,
    /// Whether to require exact match for header values
    #[serde(default)]
    pub exact_match: bool,
}

/// A predicate that matches on request headers.
///
/// An empty expected value only asserts presence.
#[derive(Debug)]
pub struct HeaderPredicate {
    config: HeaderPredicateConfig,
}

impl HeaderPredicate {
    pub fn new(config: HeaderPredicateConfig) -> Self {
        Self { config }
    }
}

impl Predicate for HeaderPredicate {
    fn matches(&self, request: &InboundRequest) -> bool {
        self.config.headers.iter().all(|(name, expected)| {
            request
                .headers
                .get_all(name.as_str())
                .iter()
                .filter_map(|value| value.to_str().ok())
                .any(|actual| value_matches(actual, expected, self.config.exact_match))
        })
    }

    fn predicate_type(&self) -> &str {
        "header"
    }
}

/// Configuration for a query parameter predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPredicateConfig {
    /// The query parameters to match (name and value)
    pub params: HashMap<String, String>,
    /// Whether to require exact match for parameter values
    #[serde(default)]
    pub exact_match: bool,
}

/// A predicate that matches on query parameters.
#[derive(Debug)]
pub struct QueryPredicate {
    config: QueryPredicateConfig,
}

impl QueryPredicate {
    pub fn new(config: QueryPredicateConfig) -> Self {
        Self { config }
    }

    /// Parse and percent-decode `a=1&b=2`.  Repeated keys keep every value.
    pub(crate) fn parse_query_params(query: &str) -> Vec<(String, String)> {
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_component(key), decode_component(value))
            })
            .collect()
    }
}

fn decode_component(raw: &str) -> String {
    let raw = raw.replace('+', " ");
    urlencoding::decode(&raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(raw)
}

impl Predicate for QueryPredicate {
    fn matches(&self, request: &InboundRequest) -> bool {
        if self.config.params.is_empty() {
            return true;
        }

        let Some(query) = &request.query else {
            return false;
        };
        let params = Self::parse_query_params(query);

        self.config.params.iter().all(|(name, expected)| {
            params
                .iter()
                .filter(|(key, _)| key == name)
                .any(|(_, actual)| value_matches(actual, expected, self.config.exact_match))
        })
    }

    fn predicate_type(&self) -> &str {
        "query"
    }
}

fn value_matches(actual: &str, expected: &str, exact: bool) -> bool {
    if exact {
        actual == expected
    } else {
        actual.contains(expected)
    }
}

/// Configuration for a host predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPredicateConfig {
    /// Glob patterns such as `api.example.com` or `*.example.com`
    pub patterns: Vec<String>,
}

/// A predicate that matches the addressed host, case-insensitively.
#[derive(Debug)]
pub struct HostPredicate {
    config: HostPredicateConfig,
    globs: GlobSet,
}

impl HostPredicate {
    pub fn new(config: HostPredicateConfig) -> Result<Self, ProxyError> {
        if config.patterns.is_empty() {
            return Err(ProxyError::Configuration(
                "host predicate needs at least one pattern".into(),
            ));
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in &config.patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .literal_separator(false)
                .build()
                .map_err(|e| {
                    ProxyError::Configuration(format!("invalid host pattern '{pattern}': {e}"))
                })?;
            builder.add(glob);
        }
        let globs = builder
            .build()
            .map_err(|e| ProxyError::Configuration(format!("invalid host patterns: {e}")))?;

        Ok(Self { config, globs })
    }

    pub fn patterns(&self) -> &[String] {
        &self.config.patterns
    }
}

impl Predicate for HostPredicate {
    fn matches(&self, request: &InboundRequest) -> bool {
        request
            .host()
            .is_some_and(|host| self.globs.is_match(host))
    }

    fn predicate_type(&self) -> &str {
        "host"
    }
}
