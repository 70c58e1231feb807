//! Validation of the optimize handler's structured output.
//!
//! The completion is checked rule by rule against the JSON value before it
//! is deserialised, so a rejected output lists every problem at once rather
//! than only the first one serde trips over.

use crate::models::OptimizationReport;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("output is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("output violates {} rule(s): {}", .0.len(), .0.join("; "))]
    RuleViolations(Vec<String>),
}

impl ValidationError {
    pub fn violations(&self) -> Vec<String> {
        match self {
            Self::MalformedJson(message) => vec![message.clone()],
            Self::RuleViolations(violations) => violations.clone(),
        }
    }
}

/// Remove a surrounding Markdown code fence (```json ... ```), if any
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string (`json`) on the opening line
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parse and validate a raw completion
pub fn parse_report(raw: &str) -> Result<OptimizationReport, ValidationError> {
    let value: Value = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| ValidationError::MalformedJson(e.to_string()))?;

    let violations = check_report(&value);
    if !violations.is_empty() {
        return Err(ValidationError::RuleViolations(violations));
    }
    serde_json::from_value(value).map_err(|e| ValidationError::RuleViolations(vec![e.to_string()]))
}

/// Every rule `value` violates; empty when the report is valid
pub fn check_report(value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(object) = value.as_object() else {
        violations.push("top level must be a JSON object".to_string());
        return violations;
    };

    match object.get("score") {
        None => violations.push("score is required".to_string()),
        Some(score) => match score.as_i64() {
            Some(score) if (0..=100).contains(&score) => {}
            Some(score) => violations.push(format!("score must be within 0..=100, got {score}")),
            None => violations.push("score must be an integer".to_string()),
        },
    }

    for field in ["matched", "missing", "weak"] {
        check_findings(object, field, &mut violations);
    }

    match object.get("change_log") {
        None => violations.push("change_log is required".to_string()),
        Some(Value::Array(entries)) => {
            for (idx, entry) in entries.iter().enumerate() {
                if !entry.is_string() {
                    violations.push(format!("change_log[{idx}] must be a string"));
                }
            }
        }
        Some(_) => violations.push("change_log must be an array of strings".to_string()),
    }

    match object.get("preview_markdown") {
        None => violations.push("preview_markdown is required".to_string()),
        Some(Value::String(preview)) if preview.trim().is_empty() => {
            violations.push("preview_markdown must not be empty".to_string())
        }
        Some(Value::String(_)) => {}
        Some(_) => violations.push("preview_markdown must be a string".to_string()),
    }

    violations
}

fn check_findings(object: &Map<String, Value>, field: &str, violations: &mut Vec<String>) {
    let findings = match object.get(field) {
        None => {
            violations.push(format!("{field} is required"));
            return;
        }
        Some(Value::Array(findings)) => findings,
        Some(_) => {
            violations.push(format!("{field} must be an array"));
            return;
        }
    };

    for (idx, finding) in findings.iter().enumerate() {
        let path = format!("{field}[{idx}]");
        let Some(finding) = finding.as_object() else {
            violations.push(format!("{path} must be an object"));
            continue;
        };
        match finding.get("skill").and_then(Value::as_str) {
            Some(skill) if !skill.trim().is_empty() => {}
            _ => violations.push(format!("{path}.skill must be a non-empty string")),
        }
        match finding.get("evidence") {
            Some(Value::Array(evidence)) => {
                for (e_idx, item) in evidence.iter().enumerate() {
                    check_evidence(item, &format!("{path}.evidence[{e_idx}]"), violations);
                }
            }
            _ => violations.push(format!("{path}.evidence must be an array")),
        }
    }
}

fn check_evidence(item: &Value, path: &str, violations: &mut Vec<String>) {
    let Some(item) = item.as_object() else {
        violations.push(format!("{path} must be an object"));
        return;
    };
    match item.get("source").and_then(Value::as_str) {
        Some("resume" | "job") => {}
        _ => violations.push(format!("{path}.source must be \"resume\" or \"job\"")),
    }
    match item.get("excerpt").and_then(Value::as_str) {
        Some(excerpt) if !excerpt.trim().is_empty() => {}
        _ => violations.push(format!("{path}.excerpt must be a non-empty string")),
    }
    match item.get("chunk_index") {
        None | Some(Value::Null) => {}
        Some(index) if index.as_u64().is_some_and(|i| i <= u64::from(u32::MAX)) => {}
        Some(_) => violations.push(format!("{path}.chunk_index must be a non-negative integer")),
    }
}
