//! `--priority` expressions.
//!
//! A comma separated rule list, first match wins:
//!
//! ```text
//! symbol:^SPY$=1,strategy:momentum.*=3,param.window:^(5|10)$=4,default=5
//! ```
//!
//! A bare integer (`"2"`) gives every job the same priority. Patterns cannot
//! contain commas.

use crate::orchestrator::JobSpec;
use regex::Regex;
use serde_json::Value;
use std::str::FromStr;

#[derive(Debug, Clone)]
enum RuleField {
    Symbol,
    Strategy,
    Param(String),
}

#[derive(Debug, Clone)]
struct PriorityRule {
    field: RuleField,
    pattern: Regex,
    priority: i32,
}

#[derive(Debug, Clone, Default)]
pub struct PriorityRules {
    rules: Vec<PriorityRule>,
    default: i32,
}

impl PriorityRules {
    pub fn constant(priority: i32) -> Self {
        Self {
            rules: Vec::new(),
            default: priority,
        }
    }

    pub fn priority_for(&self, spec: &JobSpec) -> i32 {
        for rule in &self.rules {
            let matched = match &rule.field {
                RuleField::Symbol => rule.pattern.is_match(&spec.symbol),
                RuleField::Strategy => rule.pattern.is_match(&spec.strategy_id),
                RuleField::Param(name) => spec
                    .parameters
                    .get(name)
                    .map(|v| rule.pattern.is_match(&param_text(v)))
                    .unwrap_or(false),
            };
            if matched {
                return rule.priority;
            }
        }
        self.default
    }
}

fn param_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl FromStr for PriorityRules {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }
        if let Ok(n) = s.parse::<i32>() {
            return Ok(Self::constant(n));
        }

        let mut out = Self::default();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some(v) = token.strip_prefix("default=") {
                out.default = v
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid default priority: {}", v))?;
                continue;
            }

            let (lhs, rhs) = token
                .rsplit_once('=')
                .ok_or_else(|| format!("rule without '=<priority>': {}", token))?;
            let priority: i32 = rhs
                .trim()
                .parse()
                .map_err(|_| format!("invalid priority in rule: {}", token))?;
            let (field, pattern) = lhs
                .split_once(':')
                .ok_or_else(|| format!("rule without '<field>:<regex>': {}", token))?;

            let field = match field.trim() {
                "symbol" => RuleField::Symbol,
                "strategy" => RuleField::Strategy,
                f => match f.strip_prefix("param.") {
                    Some(name) if !name.is_empty() => RuleField::Param(name.to_string()),
                    _ => return Err(format!("unknown rule field: {}", f)),
                },
            };
            let pattern =
                Regex::new(pattern).map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;

            out.rules.push(PriorityRule {
                field,
                pattern,
                priority,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(symbol: &str, strategy: &str, window: i64) -> JobSpec {
        let mut parameters = BTreeMap::new();
        parameters.insert("window".to_string(), Value::from(window));
        JobSpec {
            symbol: symbol.to_string(),
            strategy_id: strategy.to_string(),
            parameters,
        }
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules: PriorityRules = "symbol:^SPY$=1,strategy:^mom=3,param.window:^(5|10)$=4,default=9"
            .parse()
            .unwrap();

        assert_eq!(rules.priority_for(&spec("SPY", "momentum", 5)), 1);
        assert_eq!(rules.priority_for(&spec("QQQ", "momentum", 5)), 3);
        assert_eq!(rules.priority_for(&spec("QQQ", "mean_rev", 10)), 4);
        assert_eq!(rules.priority_for(&spec("QQQ", "mean_rev", 20)), 9);
    }

    #[test]
    fn test_constant_and_empty_expressions() {
        let rules: PriorityRules = "7".parse().unwrap();
        assert_eq!(rules.priority_for(&spec("SPY", "x", 1)), 7);

        let rules: PriorityRules = "".parse().unwrap();
        assert_eq!(rules.priority_for(&spec("SPY", "x", 1)), 0);
    }

    #[test]
    fn test_rejects_malformed_rules() {
        assert!("symbol:SPY".parse::<PriorityRules>().is_err());
        assert!("symbol=1".parse::<PriorityRules>().is_err());
        assert!("venue:X=1".parse::<PriorityRules>().is_err());
        assert!("symbol:(=1".parse::<PriorityRules>().is_err());
        assert!("default=high".parse::<PriorityRules>().is_err());
    }
}
