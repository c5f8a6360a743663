use regex::Regex;
use std::collections::HashMap;

use super::{Filter, FilterError, FilteredSpan};

/// Service name that applies a rule to every service
pub const ALL_SERVICES: &str = "*";

/// Drops spans whose resource matches a blocked pattern for its service
#[derive(Debug, Default)]
pub struct CloseResource {
    rules: HashMap<String, Vec<Regex>>,
}

impl CloseResource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `service -> [pattern]` map, failing on the first invalid
    /// pattern
    pub fn try_from_rules(rules: &HashMap<String, Vec<String>>) -> Result<Self, FilterError> {
        let mut compiled = HashMap::with_capacity(rules.len());
        for (service, patterns) in rules {
            let mut list = Vec::with_capacity(patterns.len());
            for pattern in patterns {
                list.push(compile(pattern)?);
            }
            compiled.insert(service.clone(), list);
        }
        Ok(Self { rules: compiled })
    }

    /// Build from a `service -> [pattern]` map, skipping invalid patterns
    pub fn from_rules(rules: &HashMap<String, Vec<String>>) -> Self {
        let mut compiled: HashMap<String, Vec<Regex>> = HashMap::with_capacity(rules.len());
        for (service, patterns) in rules {
            let list = compiled.entry(service.clone()).or_default();
            for pattern in patterns {
                match compile(pattern) {
                    Ok(re) => list.push(re),
                    Err(e) => tracing::warn!(service = %service, "Skipping close-resource rule: {}", e),
                }
            }
        }
        Self { rules: compiled }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.values().all(Vec::is_empty)
    }

    fn is_closed(&self, service: &str, resource: &str) -> bool {
        let matches = |service: &str| {
            self.rules
                .get(service)
                .map(|patterns| patterns.iter().any(|re| re.is_match(resource)))
                .unwrap_or(false)
        };
        matches(service) || matches(ALL_SERVICES)
    }
}

/// Patterns are unanchored: a match anywhere in the resource name closes it
fn compile(pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(pattern).map_err(|e| FilterError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

impl Filter for CloseResource {
    fn name(&self) -> &str {
        "close_resource"
    }

    fn filter(&self, mut spans: Vec<FilteredSpan>) -> Vec<FilteredSpan> {
        let before = spans.len();
        spans.retain(|s| !self.is_closed(&s.span.service, &s.span.resource));
        let closed = before - spans.len();
        if closed > 0 {
            tracing::debug!(closed, "Dropped spans on closed resources");
        }
        spans
    }
}
