//! Servant categories and invocation modes

use std::fmt;
use std::str::FromStr;

use super::error::MwError;

/// Category tag; selects the dispatch table of a servant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Scope,
    Registry,
    Query,
    QueryCtrl,
    Reply,
    State,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Scope,
        Category::Registry,
        Category::Query,
        Category::QueryCtrl,
        Category::Reply,
        Category::State,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Scope => "Scope",
            Category::Registry => "Registry",
            Category::Query => "Query",
            Category::QueryCtrl => "QueryCtrl",
            Category::Reply => "Reply",
            Category::State => "State",
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Scope
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = MwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| MwError::InvalidArgument(format!("unknown category: \"{}\"", s)))
    }
}

/// Invocation mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum InvocationMode {
    /// Fire-and-forget; no response leg
    Oneway,
    /// Request-response; the caller blocks for the result
    #[default]
    Twoway,
}

impl InvocationMode {
    /// Single-letter code used in proxy strings
    pub fn code(self) -> &'static str {
        match self {
            InvocationMode::Oneway => "o",
            InvocationMode::Twoway => "t",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "o" => Some(InvocationMode::Oneway),
            "t" => Some(InvocationMode::Twoway),
            _ => None,
        }
    }
}
