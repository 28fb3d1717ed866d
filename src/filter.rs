use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::metadata_store::Tags;

/// One `key = value` equality constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagConstraint {
    pub key: String,
    pub value: Value,
}

impl TagConstraint {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    fn matches(&self, tags: &Tags) -> bool {
        let Some(actual) = tags.get(&self.key) else {
            return false;
        };
        if actual == &self.value {
            return true;
        }
        // A string constraint also matches scalars with the same textual form,
        // so `visit_year=2021` finds both 2021 and "2021".
        match (&self.value, actual) {
            (Value::String(expected), Value::Number(n)) => expected == &n.to_string(),
            (Value::String(expected), Value::Bool(b)) => expected == &b.to_string(),
            (Value::Number(n), Value::String(actual)) => actual == &n.to_string(),
            _ => false,
        }
    }
}

impl FromStr for TagConstraint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected key=value, got '{s}'"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("Empty tag key in '{s}'"));
        }
        Ok(Self::new(key, value.trim()))
    }
}

impl fmt::Display for TagConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::String(s) => write!(f, "{}={}", self.key, s),
            other => write!(f, "{}={}", self.key, other),
        }
    }
}

/// Conjunction of equality constraints over a chunk's tags.
/// An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagFilter {
    constraints: Vec<TagConstraint>,
}

impl TagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().and(key, value)
    }

    /// Filter for `condition == name`.
    pub fn condition(name: &str) -> Self {
        Self::where_eq("condition", name)
    }

    pub fn and(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.push(TagConstraint::new(key, value));
        self
    }

    /// Parse `key=value` arguments into one filter.
    pub fn parse_all<I, S>(args: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let constraints = args
            .into_iter()
            .map(|arg| arg.as_ref().parse())
            .collect::<anyhow::Result<Vec<TagConstraint>>>()?;
        Ok(Self { constraints })
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn constraints(&self) -> &[TagConstraint] {
        &self.constraints
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        self.constraints.iter().all(|c| c.matches(tags))
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", parts.join(" AND "))
    }
}
