//! Host allow-list
//!
//! Glob patterns matched case-insensitively against the target host. An empty
//! list permits every host.

use glob::{MatchOptions, Pattern};

use crate::error::BrokerError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Default)]
pub struct HostAllowList {
    patterns: Vec<Pattern>,
}

impl HostAllowList {
    pub fn new(patterns: &[String]) -> Result<Self, BrokerError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p.trim()).map_err(|e| {
                    BrokerError::Config(format!("invalid allowed_hosts pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.patterns.is_empty()
            || self
                .patterns
                .iter()
                .any(|p| p.matches_with(host, MATCH_OPTIONS))
    }

    pub fn check(&self, host: &str) -> Result<(), BrokerError> {
        if self.is_allowed(host) {
            Ok(())
        } else {
            Err(BrokerError::HostNotAllowed(format!(
                "{} is not on the allow-list",
                host
            )))
        }
    }
}
