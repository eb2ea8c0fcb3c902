//! Ordered substitution rules applied to workflow-engine output paths.

use crate::error::{BidsError, Result};
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::borrow::Cow;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone)]
pub enum Rule {
    Literal {
        from: String,
        to: String,
    },
    Pattern {
        regex: Regex,
        /// Replacement in the regex crate's `${N}` syntax.
        replacement: String,
    },
}

impl Rule {
    pub fn literal(from: &str, to: &str) -> Result<Self> {
        if from.is_empty() {
            return Err(BidsError::EmptyLiteral {
                replacement: to.to_string(),
            });
        }
        Ok(Rule::Literal {
            from: from.to_string(),
            to: to.to_string(),
        })
    }

    /// `replacement` uses `\1` / `\g<name>` back-references; `$` is literal.
    pub fn pattern(pattern: &str, replacement: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|source| BidsError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Rule::Pattern {
            regex,
            replacement: translate_backrefs(replacement),
        })
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Rule::Literal { .. })
    }

    fn apply<'a>(&self, path: &'a str) -> Cow<'a, str> {
        match self {
            Rule::Literal { from, to } => {
                if path.contains(from.as_str()) {
                    Cow::Owned(path.replace(from.as_str(), to))
                } else {
                    Cow::Borrowed(path)
                }
            }
            Rule::Pattern { regex, replacement } => {
                regex.replace_all(path, replacement.as_str())
            }
        }
    }
}

/// Rewrites `\N` and `\g<name>` into `${N}` / `${name}` and escapes `$`.
/// `\\` yields a single backslash.
fn translate_backrefs(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '$' => out.push_str("$$"),
            '\\' => match chars.peek().copied() {
                Some(d) if d.is_ascii_digit() => {
                    let mut group = String::new();
                    while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                        group.push(d);
                        chars.next();
                    }
                    out.push_str(&format!("${{{}}}", group));
                }
                Some('g') => {
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    if lookahead.next() == Some('<') {
                        let name: String = lookahead.by_ref().take_while(|&n| n != '>').collect();
                        out.push_str(&format!("${{{}}}", name));
                        chars = lookahead;
                    } else {
                        out.push('\\');
                    }
                }
                Some('\\') => {
                    chars.next();
                    out.push('\\');
                }
                _ => out.push('\\'),
            },
            other => out.push(other),
        }
    }
    out
}

/// Literal rules followed by pattern rules, applied in one pass.
///
/// The list is kept partitioned: literals pushed after patterns are
/// inserted at the end of the literal phase.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    literal_count: usize,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rule: Rule) {
        if rule.is_literal() {
            self.rules.insert(self.literal_count, rule);
            self.literal_count += 1;
        } else {
            self.rules.push(rule);
        }
    }

    pub fn push_literal(&mut self, from: &str, to: &str) -> Result<()> {
        self.push(Rule::literal(from, to)?);
        Ok(())
    }

    pub fn push_pattern(&mut self, pattern: &str, replacement: &str) -> Result<()> {
        self.push(Rule::pattern(pattern, replacement)?);
        Ok(())
    }

    pub fn extend_literals(&mut self, table: &RuleTable) -> Result<()> {
        for (from, to) in table.iter() {
            self.push_literal(from, to)?;
        }
        Ok(())
    }

    pub fn extend_patterns(&mut self, table: &RuleTable) -> Result<()> {
        for (pattern, replacement) in table.iter() {
            self.push_pattern(pattern, replacement)?;
        }
        Ok(())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn literals(&self) -> &[Rule] {
        &self.rules[..self.literal_count]
    }

    pub fn patterns(&self) -> &[Rule] {
        &self.rules[self.literal_count..]
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every rule in order. A borrowed result means no rule matched.
    pub fn apply<'a>(&self, path: &'a str) -> Cow<'a, str> {
        let mut current = Cow::Borrowed(path);
        for rule in &self.rules {
            let next = match rule.apply(&current) {
                Cow::Owned(s) => Some(s),
                Cow::Borrowed(_) => None,
            };
            if let Some(s) = next {
                current = Cow::Owned(s);
            }
        }
        current
    }
}

/// Ordered `(key, value)` pairs read from a JSON or YAML mapping in
/// document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable(Vec<(String, String)>);

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        let mut table = Self::new();
        for (k, v) in pairs {
            table.insert(k.into(), v.into());
        }
        table
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Replaces the value of an existing key in place, otherwise appends.
    pub fn insert(&mut self, key: String, value: String) {
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    /// `other` wins on key collisions.
    pub fn merged(&self, other: &RuleTable) -> RuleTable {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.insert(k.to_string(), v.to_string());
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for RuleTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct TableVisitor;

        impl<'de> Visitor<'de> for TableVisitor {
            type Value = RuleTable;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of match text to replacement")
            }

            fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<RuleTable, E> {
                Ok(RuleTable::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<RuleTable, A::Error> {
                let mut table = RuleTable::new();
                while let Some((k, v)) = map.next_entry::<String, String>()? {
                    table.insert(k, v);
                }
                Ok(table)
            }
        }

        deserializer.deserialize_any(TableVisitor)
    }
}
