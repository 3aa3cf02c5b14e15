//! Fetch interval policy: per-name overrides and the change-rate heuristic.

use crate::config::UpdateIntervalRule;
use crate::gitserver::RepoUpdateResponse;
use chrono::Duration;
use regex::Regex;

// A year; anything longer is clamped by the schedule anyway.
const MAX_RULE_MINUTES: u64 = 60 * 24 * 365;

/// Compiled `pattern -> interval` overrides. The first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct IntervalRules {
    rules: Vec<(Regex, Duration)>,
}

impl IntervalRules {
    pub fn compile(rules: &[UpdateIntervalRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|rule| {
                let minutes = rule.interval_minutes.min(MAX_RULE_MINUTES) as i64;
                Ok((Regex::new(&rule.pattern)?, Duration::minutes(minutes)))
            })
            .collect::<Result<_, regex::Error>>()?;
        Ok(Self { rules })
    }

    /// Override for `repo_name`, if any rule with a positive interval
    /// matches it.
    pub fn custom_interval(&self, repo_name: &str) -> Option<Duration> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(repo_name))
            .map(|(_, interval)| *interval)
            .filter(|interval| *interval > Duration::zero())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Half the time since the repo last changed, as seen at its last fetch.
/// Repos that change often are fetched often. `None` when the response
/// lacks either timestamp.
pub fn interval_from_fetch(response: &RepoUpdateResponse) -> Option<Duration> {
    let fetched = response.last_fetched?;
    let changed = response.last_changed?;
    Some((fetched - changed) / 2)
}
