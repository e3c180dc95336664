use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::context::{Context, USER_KIND};

// Flag definition as kept by the in-process backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagDefinition {
    pub key: String,
    #[serde(default)]
    pub enabled: bool,
    /// Share of contexts, 0 to 100, that get the flag when no rule matched.
    /// `None` serves the flag to everyone.
    #[serde(default)]
    pub rollout_percentage: Option<i32>,
    /// Served when the flag is on for a context.
    #[serde(default = "default_on_value")]
    pub value: Value,
    /// Served when the flag is off for a context.
    #[serde(default = "default_off_value")]
    pub off_value: Value,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

fn default_on_value() -> Value {
    Value::Bool(true)
}

fn default_off_value() -> Value {
    Value::Bool(false)
}

// Targeting rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// `user_key`, `user_email`, `email_domain` or `context:<kind>`.
    pub rule_type: String,
    pub rule_value: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

fn enabled_by_default() -> bool {
    true
}

// Flag evaluation result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub value: Value,
    pub reason: String,
}

/// Evaluate a flag definition for a given context
pub fn evaluate_flag(flag: &FlagDefinition, context: &Context) -> Evaluation {
    let on = |reason: String| Evaluation { value: flag.value.clone(), reason };
    let off = |reason: String| Evaluation { value: flag.off_value.clone(), reason };

    // Step 1: If flag is globally disabled, serve the off value
    if !flag.enabled {
        return off("Flag is globally disabled".to_string());
    }

    let user = context.get(USER_KIND);
    let user_key = user.and_then(|u| u.key.as_deref());
    let user_email = user.and_then(|u| u.email.as_deref());

    // Step 2: Highest priority rules first
    let mut sorted_rules: Vec<&Rule> = flag.rules.iter().filter(|r| r.enabled).collect();
    sorted_rules.sort_by(|a, b| b.priority.cmp(&a.priority));

    for rule in sorted_rules {
        let matched = match rule.rule_type.as_str() {
            "user_key" => user_key == Some(rule.rule_value.as_str()),
            "user_email" => user_email == Some(rule.rule_value.as_str()),
            "email_domain" => user_email.is_some_and(|email| email.ends_with(&rule.rule_value)),
            other => match other.strip_prefix("context:") {
                Some(kind) => context.key_of(kind) == Some(rule.rule_value.as_str()),
                None => false, // Unknown rule type, skip
            },
        };

        if matched {
            return on(format!("Matched {} rule: {}", rule.rule_type, rule.rule_value));
        }
    }

    // Step 3: Percentage rollout, bucketed on the user key
    if let Some(percentage) = flag.rollout_percentage {
        let identifier = user_key.or(user_email).unwrap_or("anonymous");

        if should_enable_for_percentage(&flag.key, identifier, percentage) {
            return on(format!("Context in {}% rollout", percentage));
        }
        return off(format!("Context not in {}% rollout", percentage));
    }

    on("Flag enabled globally, no specific rules applied".to_string())
}

/// The same identifier always lands in the same bucket for a given flag.
fn should_enable_for_percentage(flag_key: &str, identifier: &str, percentage: i32) -> bool {
    if percentage <= 0 {
        return false;
    }
    if percentage >= 100 {
        return true;
    }

    let mut hasher = DefaultHasher::new();
    format!("{}:{}", flag_key, identifier).hash(&mut hasher);
    let bucket = (hasher.finish() % 100) as i32;

    bucket < percentage
}
