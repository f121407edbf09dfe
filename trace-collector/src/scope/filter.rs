use std::{fmt, str::FromStr};

use super::ScopeError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    /// `prefix.**`, the package and every nested package.
    Recursive(String),
    /// `prefix.*`, types directly in the package.
    Package(String),
    Exact(String),
}

impl Pattern {
    fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Recursive(prefix) => prefix.is_empty() || name.starts_with(prefix.as_str()),
            Pattern::Package(prefix) => name
                .strip_prefix(prefix.as_str())
                .map_or(false, |rest| !rest.contains('.')),
            Pattern::Exact(exact) => name == exact,
        }
    }

    // rules are ranked by how much of the name they pin down
    fn weight(&self) -> (usize, u8) {
        match self {
            Pattern::Recursive(p) => (p.len(), 0),
            Pattern::Package(p) => (p.len(), 1),
            Pattern::Exact(p) => (p.len(), 2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    include: bool,
    pattern: Pattern,
}

/// Decides which types are the target of tracing. Rules look like
/// `+com.example.**:-com.example.internal.*:+Main`, the most specific
/// matching rule wins, types matched by no rule are out of scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    rules: Vec<Rule>,
    source: String,
}

impl FromStr for ScopeFilter {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rules = vec![];
        for item in s.split(|c: char| c == ':' || c == ',').map(str::trim) {
            if item.is_empty() {
                continue;
            }
            let (include, pattern) = if let Some(rest) = item.strip_prefix('+') {
                (true, rest)
            } else if let Some(rest) = item.strip_prefix('-') {
                (false, rest)
            } else {
                return Err(ScopeError::Filter(item.to_owned()));
            };
            let pattern = if pattern == "**" || pattern == "*" {
                Pattern::Recursive(String::new())
            } else if let Some(prefix) = pattern.strip_suffix("**") {
                Pattern::Recursive(prefix.to_owned())
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                Pattern::Package(prefix.to_owned())
            } else if pattern.is_empty() || pattern.contains('*') {
                return Err(ScopeError::Filter(item.to_owned()));
            } else {
                Pattern::Exact(pattern.to_owned())
            };
            rules.push(Rule { include, pattern });
        }
        Ok(ScopeFilter {
            rules,
            source: s.to_owned(),
        })
    }
}

impl fmt::Display for ScopeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl ScopeFilter {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn in_scope(&self, type_name: &str) -> bool {
        self.rules
            .iter()
            .filter(|rule| rule.pattern.matches(type_name))
            .max_by_key(|rule| rule.pattern.weight())
            .map_or(false, |rule| rule.include)
    }
}
