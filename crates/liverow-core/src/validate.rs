//! Validation rules applied before a save.

use crate::error::ValidationFailure;
use crate::value::Value;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// Custom validation closure: `None` passes, `Some(message)` rejects.
pub type CustomCheck = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// One validation rule.
#[derive(Clone)]
pub enum Rule {
    /// Value must be non-null
    Required,
    /// Text value must match the pattern
    Pattern(Regex),
    /// Numeric value must fall in the closed range
    Range { min: Option<f64>, max: Option<f64> },
    /// Text length must fall in the closed range
    Length {
        min: Option<usize>,
        max: Option<usize>,
    },
    /// Arbitrary check
    Custom { name: String, check: CustomCheck },
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Required => write!(f, "Required"),
            Rule::Pattern(re) => write!(f, "Pattern({})", re.as_str()),
            Rule::Range { min, max } => write!(f, "Range {{ min: {min:?}, max: {max:?} }}"),
            Rule::Length { min, max } => write!(f, "Length {{ min: {min:?}, max: {max:?} }}"),
            Rule::Custom { name, .. } => write!(f, "Custom({name})"),
        }
    }
}

impl Rule {
    /// Rule name recorded on failures.
    pub fn name(&self) -> &str {
        match self {
            Rule::Required => "required",
            Rule::Pattern(_) => "pattern",
            Rule::Range { .. } => "range",
            Rule::Length { .. } => "length",
            Rule::Custom { name, .. } => name,
        }
    }

    /// Check a value, returning a rejection message on failure.
    pub fn check(&self, value: &Value) -> Option<String> {
        match self {
            Rule::Required => {
                if value.is_null() {
                    Some("is required".to_string())
                } else {
                    None
                }
            }
            Rule::Pattern(pattern) => match value.as_str() {
                Some(text) if pattern.is_match(text) => None,
                Some(_) => Some(format!("must match pattern '{}'", pattern.as_str())),
                None => Some("must be text".to_string()),
            },
            Rule::Range { min, max } => {
                let Some(number) = value.as_f64() else {
                    return Some("must be a number".to_string());
                };
                if let Some(min) = min {
                    if number < *min {
                        return Some(format!("must be at least {min}"));
                    }
                }
                if let Some(max) = max {
                    if number > *max {
                        return Some(format!("must be at most {max}"));
                    }
                }
                None
            }
            Rule::Length { min, max } => {
                let Some(text) = value.as_str() else {
                    return Some("must be text".to_string());
                };
                let len = text.chars().count();
                if let Some(min) = min {
                    if len < *min {
                        return Some(format!("must be at least {min} characters"));
                    }
                }
                if let Some(max) = max {
                    if len > *max {
                        return Some(format!("must be at most {max} characters"));
                    }
                }
                None
            }
            Rule::Custom { check, .. } => check(value),
        }
    }
}

/// A rule bound to a property name.
#[derive(Debug, Clone)]
pub struct Validation {
    pub property: String,
    pub rule: Rule,
}

impl Validation {
    pub fn new(property: impl Into<String>, rule: Rule) -> Self {
        Self {
            property: property.into(),
            rule,
        }
    }

    /// Run the rule against a value, producing a failure record on rejection.
    pub fn check(&self, value: &Value) -> Option<ValidationFailure> {
        self.rule
            .check(value)
            .map(|message| ValidationFailure::new(&self.property, self.rule.name(), message))
    }
}
